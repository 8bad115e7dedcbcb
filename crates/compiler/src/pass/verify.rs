//! Verification of the invariants that the IR must satisfy between passes.
//!
//! Verification happens at one of a number of [`Legality`] levels. Every level
//! checks the structural invariants of the IR:
//!
//! - Every value is defined exactly once, by either a block argument or an
//!   operation result, and every use refers to a defined value.
//! - Every block ends in exactly one terminator, and nested regions end in
//!   `scf.yield`.
//! - Every operation matches the arity schema of its opcode, and its affine
//!   payload is well formed.
//! - Branches target top-level blocks of their function with matching
//!   arguments.
//! - Every slice refers to a buffer in the allocation table.
//!
//! Each subsequent level additionally restricts the types and operations that
//! may appear, reflecting how far the module has progressed through the
//! pipeline.

use std::{
    collections::{HashMap, HashSet},
    fmt::{Display, Formatter},
};

use klo_errors::compile::{Error, Result};
use klo_ir::{
    affine::Leaf,
    module::{Block, Function, Location, Module, Operation, Region},
    op::{FuncOp, LlvmOp, Opcode, ScfOp},
    types::{SliceOffset, Type},
    BlockId,
    ScalarType,
    ValueId,
};

/// The levels of legality that a module can be verified at, from least to
/// most restrictive.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Legality {
    /// Only the structural invariants are checked.
    Structure,

    /// Tensors and structured control flow are permitted, but LLVM
    /// instructions and pointers are not.
    Tensor,

    /// No tensors remain, and every slice refers to a buffer.
    Buffer,

    /// Additionally, the offset of every slice has been computed.
    Indexed,

    /// Only LLVM instructions on scalars and pointers remain, organised into
    /// basic blocks.
    LowLevel,
}

impl Display for Legality {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Structure => "structure",
            Self::Tensor => "tensor",
            Self::Buffer => "buffer",
            Self::Indexed => "indexed",
            Self::LowLevel => "low-level",
        };
        write!(f, "{name}")
    }
}

/// Checks that the input to the pipeline is structurally sound.
///
/// # Errors
///
/// - [`Error::MalformedModule`] if the module violates a structural invariant.
pub fn verify_input(module: &Module) -> Result<()> {
    check(module, Legality::Structure).map_err(|v| Error::MalformedModule {
        location: v.location,
        message:  v.message,
    })
}

/// Checks that `module` satisfies the invariants of the `legality` level.
///
/// # Errors
///
/// - [`Error::VerificationFailed`] naming the first violation found.
pub fn verify(module: &Module, legality: Legality) -> Result<()> {
    check(module, legality).map_err(|v| Error::VerificationFailed {
        stage:    legality.to_string(),
        location: v.location,
        message:  v.message,
    })
}

/// A violated invariant.
#[derive(Clone, Debug, PartialEq)]
struct Violation {
    location: String,
    message:  String,
}

type Check = std::result::Result<(), Violation>;

fn violation(location: impl ToString, message: impl Into<String>) -> Violation {
    Violation {
        location: location.to_string(),
        message:  message.into(),
    }
}

fn check(module: &Module, legality: Legality) -> Check {
    for function in &module.functions {
        FunctionVerifier::new(module, function, legality).check()?;
    }
    Ok(())
}

/// Verifies a single function.
struct FunctionVerifier<'m> {
    module:    &'m Module,
    function:  &'m Function,
    legality:  Legality,
    top_level: HashMap<BlockId, usize>,
}

impl<'m> FunctionVerifier<'m> {
    fn new(module: &'m Module, function: &'m Function, legality: Legality) -> Self {
        let top_level = function
            .body
            .blocks
            .iter()
            .map(|b| (b.id, b.arguments.len()))
            .collect();
        Self {
            module,
            function,
            legality,
            top_level,
        }
    }

    fn here(&self) -> String {
        format!("@{}", self.function.name)
    }

    fn check(&self) -> Check {
        if self.function.body.blocks.is_empty() {
            return Err(violation(self.here(), "function has no body"));
        }

        let mut block_ids = HashSet::new();
        let mut duplicate = None;
        self.function.body.walk_blocks(&mut |b| {
            if !block_ids.insert(b.id) {
                duplicate = Some(b.id);
            }
        });
        if let Some(id) = duplicate {
            return Err(violation(self.here(), format!("block {id} is defined twice")));
        }

        let defined = self.check_single_assignment()?;
        self.check_region(&self.function.body, true, &defined)?;
        self.check_value_types(&defined)
    }

    /// Checks that every value is defined exactly once, returning the set of
    /// defined values.
    fn check_single_assignment(&self) -> std::result::Result<HashSet<ValueId>, Violation> {
        let mut defined = HashSet::new();
        let mut error = None;
        let mut define = |value: ValueId, location: &Location| {
            if error.is_some() {
                return;
            }
            if self.function.values.get(value).is_none() {
                error = Some(violation(location, format!("value {value} has no type")));
            } else if !defined.insert(value) {
                error = Some(violation(location, format!("value {value} is defined twice")));
            }
        };

        let unknown = Location::unknown();
        self.function.body.walk_blocks(&mut |b| {
            for arg in &b.arguments {
                define(*arg, &unknown);
            }
            for op in &b.operations {
                for result in &op.results {
                    define(*result, &op.location);
                }
            }
        });

        match error {
            Some(error) => Err(error),
            None => Ok(defined),
        }
    }

    fn check_region(&self, region: &Region, top_level: bool, defined: &HashSet<ValueId>) -> Check {
        for block in &region.blocks {
            self.check_block(block, top_level, defined)?;
        }
        Ok(())
    }

    fn check_block(&self, block: &Block, top_level: bool, defined: &HashSet<ValueId>) -> Check {
        let Some(last) = block.operations.last() else {
            return Err(violation(self.here(), format!("block {} is empty", block.id)));
        };
        if !last.opcode.is_terminator() {
            return Err(violation(
                &last.location,
                format!("block {} does not end in a terminator", block.id),
            ));
        }
        let ends_in_yield = last.opcode == Opcode::Scf(ScfOp::Yield);
        if top_level && ends_in_yield {
            return Err(violation(&last.location, "scf.yield outside of a region"));
        }

        for (i, op) in block.operations.iter().enumerate() {
            if op.opcode.is_terminator() && i + 1 != block.operations.len() {
                return Err(violation(
                    &op.location,
                    format!("terminator {} is not at the end of block {}", op.opcode, block.id),
                ));
            }
            self.check_operation(op, top_level, defined)?;
        }
        Ok(())
    }

    fn check_operation(&self, op: &Operation, top_level: bool, defined: &HashSet<ValueId>) -> Check {
        let schema = op.opcode.schema();
        let location = &op.location;

        if let Some(value) = op.uses().find(|v| !defined.contains(v)) {
            return Err(violation(location, format!("use of undefined value {value}")));
        }
        if !schema.operands.admits(op.operands.len()) {
            return Err(violation(
                location,
                format!("{} expects {} operands but has {}", op.opcode, schema.operands, op.operands.len()),
            ));
        }
        if !schema.results.admits(op.results.len()) {
            return Err(violation(
                location,
                format!("{} expects {} results but has {}", op.opcode, schema.results, op.results.len()),
            ));
        }
        let is_unregistered = matches!(op.opcode, Opcode::Unregistered(_));
        if !is_unregistered && op.regions.len() != schema.regions {
            return Err(violation(
                location,
                format!("{} expects {} regions but has {}", op.opcode, schema.regions, op.regions.len()),
            ));
        }
        if op.successors.len() != schema.successors {
            return Err(violation(
                location,
                format!("{} expects {} successors", op.opcode, schema.successors),
            ));
        }
        if !op.successors.is_empty() && !top_level {
            return Err(violation(location, "branches may not appear inside regions"));
        }
        for successor in &op.successors {
            match self.top_level.get(&successor.block) {
                None => {
                    return Err(violation(
                        location,
                        format!("branch to unknown block {}", successor.block),
                    ));
                }
                Some(count) if *count != successor.args.len() => {
                    return Err(violation(
                        location,
                        format!("branch to {} passes the wrong number of arguments", successor.block),
                    ));
                }
                _ => (),
            }
        }

        let index_operands = op.index_operands().len();
        for expr in op.opcode.affine_exprs() {
            if !expr.is_well_formed() {
                return Err(violation(location, format!("affine expression {expr} is malformed")));
            }
            let mut out_of_range = false;
            expr.visit_leaves(&mut |leaf| {
                if let Leaf::Dim(d) = leaf {
                    out_of_range |= usize::try_from(d).map_or(true, |d| d >= index_operands);
                }
            });
            if out_of_range {
                return Err(violation(
                    location,
                    format!("affine expression {expr} refers to a missing index operand"),
                ));
            }
        }

        let is_return = matches!(
            op.opcode,
            Opcode::Func(FuncOp::Return) | Opcode::Llvm(LlvmOp::Return)
        );
        if is_return && op.operands.len() != self.function.result_types.len()
        {
            return Err(violation(location, "return does not match the function results"));
        }

        self.check_structured(op)?;
        self.check_opcode_legality(op)?;

        for region in &op.regions {
            self.check_region(region, false, defined)?;
        }
        Ok(())
    }

    /// Checks the shape of the regions of structured control flow.
    fn check_structured(&self, op: &Operation) -> Check {
        let location = &op.location;
        let yields = |region: &Region| -> std::result::Result<usize, Violation> {
            match region.blocks.as_slice() {
                [block] => block
                    .terminator()
                    .filter(|t| t.opcode == Opcode::Scf(ScfOp::Yield))
                    .map(|t| t.operands.len())
                    .ok_or_else(|| violation(location, "region does not end in scf.yield")),
                _ => Err(violation(location, "region must consist of a single block")),
            }
        };

        match &op.opcode {
            Opcode::Scf(ScfOp::For(bounds)) => {
                let bound_count = usize::try_from(bounds.bound_operands).unwrap_or(usize::MAX);
                if bound_count > op.operands.len() {
                    return Err(violation(location, "scf.for has too few bound operands"));
                }
                if bounds.step <= 0 {
                    return Err(violation(location, "scf.for must have a positive step"));
                }
                let carried = op.loop_inits().len();
                if op.results.len() != carried {
                    return Err(violation(location, "scf.for results do not match its inits"));
                }
                let body_args = op.body().map_or(0, |b| b.arguments.len());
                if body_args != carried + 1 || yields(&op.regions[0])? != carried {
                    return Err(violation(
                        location,
                        "scf.for body does not match its loop-carried values",
                    ));
                }
            }
            Opcode::Scf(ScfOp::If) => {
                for region in &op.regions {
                    if yields(region)? != op.results.len() {
                        return Err(violation(location, "scf.if branch yields the wrong values"));
                    }
                    if region.blocks.iter().any(|b| !b.arguments.is_empty()) {
                        return Err(violation(location, "scf.if regions take no arguments"));
                    }
                }
            }
            _ => (),
        }
        Ok(())
    }

    fn check_opcode_legality(&self, op: &Operation) -> Check {
        let location = &op.location;
        let illegal = || {
            Err(violation(
                location,
                format!("{} is not legal at the {} stage", op.opcode, self.legality),
            ))
        };
        match self.legality {
            Legality::Structure => Ok(()),
            Legality::Tensor if op.opcode.is_llvm() => illegal(),
            Legality::Buffer | Legality::Indexed if op.opcode.is_llvm() || op.opcode.is_tensor() => {
                illegal()
            }
            Legality::LowLevel if !op.opcode.is_llvm() || !op.regions.is_empty() => illegal(),
            _ => Ok(()),
        }
    }

    fn check_value_types(&self, defined: &HashSet<ValueId>) -> Check {
        let mut values: Vec<_> = defined.iter().copied().collect();
        values.sort();
        for value in values {
            let ty = self.function.value_type(value);
            if let Type::Slice(slice) = ty {
                if !self.module.allocations.contains(slice.buffer) {
                    return Err(violation(
                        self.here(),
                        format!("{value} refers to unknown buffer {}", slice.buffer),
                    ));
                }
            }

            let legal = match (self.legality, ty) {
                (Legality::Structure, _) => true,
                (Legality::Tensor, ty) => *ty != Type::Ptr,
                (Legality::Buffer, ty) => !ty.is_tensor() && *ty != Type::Ptr,
                (Legality::Indexed, Type::Slice(slice)) => slice.offset != SliceOffset::Pending,
                (Legality::Indexed, ty) => !ty.is_tensor() && *ty != Type::Ptr,
                (Legality::LowLevel, Type::Scalar(s)) => *s != ScalarType::Index,
                (Legality::LowLevel, ty) => *ty == Type::Ptr,
            };
            if !legal {
                return Err(violation(
                    self.here(),
                    format!("{value} has type {ty}, which is not legal at the {} stage", self.legality),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use klo_errors::compile::Error;
    use klo_ir::{
        builder::FunctionBuilder,
        module::{Module, Operation},
        op::{ArithOp, Opcode},
        types::{ScalarType, Type},
        ValueId,
    };

    use crate::pass::verify::{verify, verify_input, Legality};

    fn tensor_module() -> Module {
        let ty = Type::tensor(&[4], ScalarType::F32);
        let mut builder = FunctionBuilder::new("f", &[ty.clone()], &[Type::scalar(ScalarType::F32)]);
        let t = builder.params()[0];
        let i = builder.index(1);
        let x = builder.extract(t, &[i]);
        builder.ret(&[x]);
        Module::new("m").with_function(builder.finish())
    }

    #[test]
    fn tensors_are_only_legal_before_lowering() {
        let module = tensor_module();
        assert!(verify(&module, Legality::Tensor).is_ok());
        assert!(matches!(
            verify(&module, Legality::Buffer),
            Err(Error::VerificationFailed { stage, .. }) if stage == "buffer"
        ));
    }

    #[test]
    fn double_definitions_are_malformed() {
        let mut module = tensor_module();
        let function = &mut module.functions[0];
        let first = function.body.blocks[0].operations[0].clone();
        function.body.blocks[0].operations.insert(0, first);

        let result = verify_input(&module);
        assert!(matches!(result, Err(Error::MalformedModule { message, .. }) if message.contains("defined twice")));
    }

    #[test]
    fn missing_terminators_are_malformed() {
        let mut module = tensor_module();
        module.functions[0].body.blocks[0].operations.pop();
        assert!(matches!(verify_input(&module), Err(Error::MalformedModule { .. })));
    }

    #[test]
    fn undefined_uses_are_malformed() {
        let mut module = tensor_module();
        let bogus = Operation::new(
            Opcode::Arith(ArithOp::NegF),
            vec![ValueId::new(99)],
            vec![],
        );
        module.functions[0].body.blocks[0].operations.insert(0, bogus);
        assert!(verify_input(&module).is_err());
    }
}
