//! This pass is the final step of the pipeline, rewriting every operation into
//! the LLVM instruction vocabulary understood by the code generator.
//!
//! # Types
//!
//! Slices become opaque pointers to the first byte they describe, and `index`
//! values become `i64`. Memory operations become a `getelementptr` computing
//! the accessed address followed by the access itself, and allocations become
//! `alloca`s of the full size of their buffer.
//!
//! # Affine Expressions
//!
//! Offsets, `index.apply` maps and loop bounds are materialized as integer
//! arithmetic. LLVM's `sdiv` and `srem` round towards zero rather than towards
//! negative infinity, so floor-division and modulo are corrected for negative
//! operands unless the known ranges of the index values prove the operand is
//! non-negative.
//!
//! # Control Flow
//!
//! Structured control flow is flattened into basic blocks. An `scf.for`
//! becomes a header block (taking the induction variable and loop-carried
//! values as arguments, and branching on `iv < upper`), the body, and an exit
//! block whose arguments are the results of the loop. An `scf.if` becomes a
//! conditional branch to the two branch bodies, both of which branch to a merge
//! block whose arguments are the results of the `scf.if`.

use std::collections::HashMap;

use klo_errors::compile::{Error, Result};
use klo_ir::{
    module::{AllocationTable, Block, Location, Operation, ValueTable},
    op::{ArithOp, Attribute, CfOp, FuncOp, IndexOp, IntPredicate, LlvmOp, MemOp, Opcode, ScfOp},
    range::IndexRanges,
    types::{ScalarType, Type},
    AffineExpr,
    BlockId,
    Function,
    Module,
    ValueId,
};

use crate::{
    constant::{INDEX_BIT_WIDTH, THREAD_ID_INTRINSICS},
    llvm::LoweringMap,
    pass::{
        data::{ConcretePassData, DynPassDataMap, PassDataOps},
        lower_tensors::LowerTensors,
        slice_indices::PropagateSliceIndices,
        verify::Legality,
        ConcretePass,
        DynPassReturnData,
        Pass,
        PassKey,
        PassOps,
    },
};

/// Lowers the module to the LLVM instruction vocabulary.
#[derive(Clone, Debug, PartialEq)]
pub struct LowerToLLVM {
    /// The passes that this pass depends upon the results of for its execution.
    depends: Vec<PassKey>,

    /// The passes that this pass invalidates the results of by executing.
    invalidates: Vec<PassKey>,

    /// The correspondence between arith operations and LLVM instructions.
    map: LoweringMap,
}

impl LowerToLLVM {
    /// Creates a new instance of the LLVM lowering pass.
    #[must_use]
    pub fn new() -> Self {
        // Tensors must be gone and slice offsets must be known.
        let depends = vec![LowerTensors::key(), PropagateSliceIndices::key()];

        // This is the last pass, so there is nothing left to invalidate.
        let invalidates = vec![];

        let map = LoweringMap::default();

        Self {
            depends,
            invalidates,
            map,
        }
    }

    /// Creates a new trait object of the LLVM lowering pass.
    #[must_use]
    pub fn new_dyn() -> Pass {
        Box::new(Self::new())
    }

    /// Sets the lowering map used to translate arith operations.
    ///
    /// # API Style
    ///
    /// Please note that the API for the pass consumes `self` and is hence
    /// designed to have calls chained in the "fluent" API style.
    #[must_use]
    pub fn with_map(mut self, map: LoweringMap) -> Self {
        self.map = map;
        self
    }

    /// Lowers `function` in place.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedOperation`] if the function contains an operation
    ///   without a lowering.
    pub fn lower_function(
        &self,
        function: &mut Function,
        allocations: &AllocationTable,
    ) -> Result<LowerToLLVMData> {
        let ranges = IndexRanges::compute(function);
        let mut next_block = 0;
        function.body.walk_blocks(&mut |b| {
            next_block = next_block.max(u32::try_from(b.id.index() + 1).unwrap_or(u32::MAX));
        });
        let body = std::mem::take(&mut function.body.blocks);

        let mut flattener = Flattener {
            map: &self.map,
            ranges: &ranges,
            allocations,
            values: &mut function.values,
            blocks: Vec::new(),
            current: None,
            next_block,
            aliases: HashMap::new(),
            lowered: 0,
        };
        for block in body {
            flattener.start(Block::new(block.id, block.arguments));
            flattener.lower_ops(block.operations)?;
        }
        flattener.finish_current();

        let Flattener {
            blocks,
            aliases,
            lowered,
            ..
        } = flattener;
        function.body.blocks = blocks;

        let mut replaced: Vec<_> = aliases.keys().copied().collect();
        replaced.sort();
        for value in replaced {
            let mut target = value;
            while let Some(next) = aliases.get(&target) {
                target = *next;
            }
            function.replace_all_uses(value, target);
        }

        for (_, data) in function.values.iter_mut() {
            data.ty = lower_type(&data.ty);
        }
        for ty in &mut function.result_types {
            *ty = lower_type(ty);
        }

        Ok(LowerToLLVMData {
            lowered,
            blocks: function.body.blocks.len(),
        })
    }
}

impl Default for LowerToLLVM {
    fn default() -> Self {
        Self::new()
    }
}

impl PassOps for LowerToLLVM {
    #[tracing::instrument(name = "lower-to-llvm", skip_all)]
    fn run(&mut self, mut module: Module, _pass_data: &DynPassDataMap) -> Result<DynPassReturnData> {
        let mut data = LowerToLLVMData::default();
        for function in &mut module.functions {
            let lowered = self.lower_function(function, &module.allocations)?;
            tracing::debug!(
                function = %function.name,
                lowered = lowered.lowered,
                blocks = lowered.blocks,
                "Lowered function"
            );
            data.lowered += lowered.lowered;
            data.blocks += lowered.blocks;
        }

        Ok(DynPassReturnData::new(module, Box::new(data)))
    }

    fn depends(&self) -> &[PassKey] {
        self.depends.as_slice()
    }

    fn invalidates(&self) -> &[PassKey] {
        self.invalidates.as_slice()
    }

    fn dupe(&self) -> Pass {
        Box::new(self.clone())
    }

    fn name(&self) -> &'static str {
        "lower-to-llvm"
    }

    fn legality(&self) -> Option<Legality> {
        Some(Legality::LowLevel)
    }
}

impl ConcretePass for LowerToLLVM {
    type Data = LowerToLLVMData;
}

/// The data returned by the LLVM lowering pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LowerToLLVMData {
    /// The number of operations that were lowered.
    pub lowered: usize,

    /// The number of basic blocks in the lowered module.
    pub blocks: usize,
}

impl PassDataOps for LowerToLLVMData {}

impl ConcretePassData for LowerToLLVMData {
    type Pass = LowerToLLVM;
}

/// Gets the type that values of type `ty` have once lowered.
fn lower_type(ty: &Type) -> Type {
    match ty {
        Type::Slice(_) => Type::Ptr,
        Type::Scalar(ScalarType::Index) => Type::scalar(ScalarType::I64),
        other => other.clone(),
    }
}

fn unsupported(op: &Operation) -> Error {
    Error::UnsupportedOperation {
        location: op.location.to_string(),
        opcode:   op.opcode.to_string(),
    }
}

/// Splits the trailing `scf.yield` off the operations of a region, returning
/// the yielded values and the remaining operations.
fn split_yield(mut operations: Vec<Operation>) -> (Vec<ValueId>, Vec<Operation>) {
    match operations.last() {
        Some(op) if op.opcode == Opcode::Scf(ScfOp::Yield) => {
            let yielded = operations.pop().map(|y| y.operands).unwrap_or_default();
            (yielded, operations)
        }
        _ => (vec![], operations),
    }
}

/// Emits the lowered operations of a function into a flat list of blocks.
struct Flattener<'a> {
    map:         &'a LoweringMap,
    ranges:      &'a IndexRanges,
    allocations: &'a AllocationTable,
    values:      &'a mut ValueTable,

    /// The finished blocks, in order.
    blocks: Vec<Block>,

    /// The block being emitted into.
    current: Option<Block>,

    next_block: u32,

    /// Results that are replaced by an existing value, such as those of
    /// `index.apply`.
    aliases: HashMap<ValueId, ValueId>,
    lowered: usize,
}

impl Flattener<'_> {
    fn new_block_id(&mut self) -> BlockId {
        self.next_block += 1;
        BlockId::new(self.next_block - 1)
    }

    fn finish_current(&mut self) {
        if let Some(block) = self.current.take() {
            self.blocks.push(block);
        }
    }

    /// Finishes the current block, and continues emitting into `block`.
    fn start(&mut self, block: Block) {
        self.finish_current();
        self.current = Some(block);
    }

    fn emit(&mut self, op: Operation) {
        if let Some(block) = &mut self.current {
            block.operations.push(op);
        }
    }

    fn emit_one(&mut self, instruction: LlvmOp, operands: Vec<ValueId>, ty: ScalarType, location: &Location) -> ValueId {
        let result = self.values.add(ty.into());
        self.emit(Operation::new(Opcode::Llvm(instruction), operands, vec![result]).at(location.clone()));
        result
    }

    fn constant(&mut self, value: i64, location: &Location) -> ValueId {
        let result = self.values.add(Type::scalar(ScalarType::I64));
        let op = Operation::new(Opcode::Llvm(LlvmOp::Constant), vec![], vec![result])
            .with_attribute("value", Attribute::Int(value))
            .at(location.clone());
        self.emit(op);
        result
    }

    fn branch(&mut self, target: BlockId, args: Vec<ValueId>, location: &Location) {
        let op = Operation::new(Opcode::Llvm(LlvmOp::Br), vec![], vec![])
            .with_successor(target, args)
            .at(location.clone());
        self.emit(op);
    }

    fn lower_ops(&mut self, operations: Vec<Operation>) -> Result<()> {
        for op in operations {
            self.lower_op(op)?;
        }
        Ok(())
    }

    fn lower_op(&mut self, op: Operation) -> Result<()> {
        self.lowered += 1;
        match op.opcode {
            Opcode::Llvm(_) => {
                self.emit(op);
                return Ok(());
            }
            Opcode::Scf(ScfOp::For(_)) => return self.lower_for(op),
            Opcode::Scf(ScfOp::If) => return self.lower_if(op),
            _ => (),
        }

        let location = op.location.clone();
        let instruction = match &op.opcode {
            Opcode::Func(FuncOp::Return) => LlvmOp::Return,
            Opcode::Cf(CfOp::Br) => LlvmOp::Br,
            Opcode::Cf(CfOp::CondBr) => LlvmOp::CondBr,
            Opcode::Arith(ArithOp::IndexCast) => return self.lower_index_cast(&op),
            Opcode::Arith(arith) => self.map.lower(*arith).ok_or_else(|| unsupported(&op))?,
            Opcode::Index(IndexOp::Apply { map }) => {
                let value = self.materialize(map, &op.operands, &location)?;
                if let Some(result) = op.results.first() {
                    self.aliases.insert(*result, value);
                }
                return Ok(());
            }
            Opcode::Index(IndexOp::ThreadId { dim, .. }) => {
                let intrinsic = usize::try_from(*dim)
                    .ok()
                    .and_then(|d| THREAD_ID_INTRINSICS.get(d))
                    .ok_or_else(|| unsupported(&op))?;
                let Some(result) = op.results.first() else {
                    return Err(unsupported(&op));
                };
                let id = self.emit_one(LlvmOp::Call((*intrinsic).to_string()), vec![], ScalarType::I32, &location);
                let widen = Operation::new(Opcode::Llvm(LlvmOp::SExt), vec![id], vec![*result]);
                self.emit(widen.at(location));
                return Ok(());
            }
            Opcode::Mem(mem) => return self.lower_mem(mem.clone(), &op),
            Opcode::Llvm(_) | Opcode::Scf(_) | Opcode::Tensor(_) | Opcode::Unregistered(_) => {
                return Err(unsupported(&op));
            }
        };

        let mut lowered = Operation::new(Opcode::Llvm(instruction), op.operands, op.results).at(location);
        lowered.attributes = op.attributes;
        lowered.successors = op.successors;
        self.emit(lowered);
        Ok(())
    }

    fn lower_index_cast(&mut self, op: &Operation) -> Result<()> {
        let (Some(operand), Some(result)) = (op.operands.first(), op.results.first()) else {
            return Err(unsupported(op));
        };
        let width = |value: ValueId| {
            self.values
                .ty(value)
                .as_scalar()
                .map(|s| if s == ScalarType::Index { INDEX_BIT_WIDTH } else { s.bit_width() })
        };
        let (Some(from), Some(to)) = (width(*operand), width(*result)) else {
            return Err(unsupported(op));
        };

        let instruction = match from.cmp(&to) {
            std::cmp::Ordering::Equal => {
                self.aliases.insert(*result, *operand);
                return Ok(());
            }
            std::cmp::Ordering::Less => LlvmOp::SExt,
            std::cmp::Ordering::Greater => LlvmOp::Trunc,
        };
        let cast = Operation::new(Opcode::Llvm(instruction), vec![*operand], vec![*result]);
        self.emit(cast.at(op.location.clone()));
        Ok(())
    }

    fn lower_mem(&mut self, mem: MemOp, op: &Operation) -> Result<()> {
        let location = &op.location;
        let dims = op.index_operands();
        match mem {
            MemOp::Alloc => {
                let result = *op.results.first().ok_or_else(|| unsupported(op))?;
                let bytes = self
                    .values
                    .ty(result)
                    .as_slice()
                    .and_then(|s| self.allocations.get(s.buffer))
                    .map(|b| b.size)
                    .ok_or_else(|| unsupported(op))?;
                let alloca = Operation::new(Opcode::Llvm(LlvmOp::Alloca { bytes }), vec![], vec![result]);
                self.emit(alloca.at(location.clone()));
            }
            MemOp::Subslice { offset } => {
                let source = *op.operands.first().ok_or_else(|| unsupported(op))?;
                let offset = self.materialize(&offset, dims, location)?;
                let gep = Operation::new(Opcode::Llvm(LlvmOp::Gep), vec![source, offset], op.results.clone());
                self.emit(gep.at(location.clone()));
            }
            MemOp::Load { offset } => {
                let source = *op.operands.first().ok_or_else(|| unsupported(op))?;
                let address = self.address(source, &offset, dims, location)?;
                let load = Operation::new(Opcode::Llvm(LlvmOp::Load), vec![address], op.results.clone());
                self.emit(load.at(location.clone()));
            }
            MemOp::Store { offset } => {
                let (Some(value), Some(dest)) = (op.operands.first(), op.operands.get(1)) else {
                    return Err(unsupported(op));
                };
                let address = self.address(*dest, &offset, dims, location)?;
                let store = Operation::new(Opcode::Llvm(LlvmOp::Store), vec![*value, address], vec![]);
                self.emit(store.at(location.clone()));
            }
        }
        Ok(())
    }

    /// Computes the address `offset` bytes into the slice `base`.
    fn address(&mut self, base: ValueId, offset: &AffineExpr, dims: &[ValueId], location: &Location) -> Result<ValueId> {
        if offset.as_constant() == Some(0) {
            return Ok(base);
        }
        let offset = self.materialize(offset, dims, location)?;
        let address = self.values.add(Type::Ptr);
        let gep = Operation::new(Opcode::Llvm(LlvmOp::Gep), vec![base, offset], vec![address]);
        self.emit(gep.at(location.clone()));
        Ok(address)
    }

    /// Emits the computation of `expr`, whose dims refer to `dims`, returning
    /// the `i64` value holding its result.
    fn materialize(&mut self, expr: &AffineExpr, dims: &[ValueId], location: &Location) -> Result<ValueId> {
        let value = match expr {
            AffineExpr::Const(c) => self.constant(*c, location),
            AffineExpr::Dim(d) => *usize::try_from(*d)
                .ok()
                .and_then(|d| dims.get(d))
                .ok_or_else(|| Error::MalformedModule {
                    location: location.to_string(),
                    message:  format!("{expr} refers to a missing index operand"),
                })?,
            AffineExpr::Value(v) => *v,
            AffineExpr::Symbol(s) => {
                return Err(Error::CompilationFailure(format!(
                    "Join symbol {s} at {location} cannot be materialized"
                )));
            }
            AffineExpr::Add(lhs, rhs) => {
                let lhs = self.materialize(lhs, dims, location)?;
                let rhs = self.materialize(rhs, dims, location)?;
                self.emit_one(LlvmOp::Add, vec![lhs, rhs], ScalarType::I64, location)
            }
            AffineExpr::Mul(inner, factor) => {
                let inner = self.materialize(inner, dims, location)?;
                let factor = self.constant(*factor, location);
                self.emit_one(LlvmOp::Mul, vec![inner, factor], ScalarType::I64, location)
            }
            AffineExpr::FloorDiv(inner, divisor) => {
                let non_negative = self.is_non_negative(inner, dims);
                let numerator = self.materialize(inner, dims, location)?;
                let numerator = if non_negative {
                    numerator
                } else {
                    // Rounding towards zero is only correct for non-negative
                    // numerators, so shift negative ones down by `divisor - 1`.
                    let zero = self.constant(0, location);
                    let negative = self.emit_one(
                        LlvmOp::ICmp(IntPredicate::Slt),
                        vec![numerator, zero],
                        ScalarType::I1,
                        location,
                    );
                    let adjustment = self.constant(divisor - 1, location);
                    let shifted = self.emit_one(LlvmOp::Sub, vec![numerator, adjustment], ScalarType::I64, location);
                    self.emit_one(
                        LlvmOp::Select,
                        vec![negative, shifted, numerator],
                        ScalarType::I64,
                        location,
                    )
                };
                let divisor = self.constant(*divisor, location);
                self.emit_one(LlvmOp::SDiv, vec![numerator, divisor], ScalarType::I64, location)
            }
            AffineExpr::Mod(inner, divisor) => {
                let non_negative = self.is_non_negative(inner, dims);
                let numerator = self.materialize(inner, dims, location)?;
                let divisor = self.constant(*divisor, location);
                let remainder = self.emit_one(LlvmOp::SRem, vec![numerator, divisor], ScalarType::I64, location);
                if non_negative {
                    remainder
                } else {
                    let zero = self.constant(0, location);
                    let negative = self.emit_one(
                        LlvmOp::ICmp(IntPredicate::Slt),
                        vec![remainder, zero],
                        ScalarType::I1,
                        location,
                    );
                    let wrapped = self.emit_one(LlvmOp::Add, vec![remainder, divisor], ScalarType::I64, location);
                    self.emit_one(
                        LlvmOp::Select,
                        vec![negative, wrapped, remainder],
                        ScalarType::I64,
                        location,
                    )
                }
            }
        };
        Ok(value)
    }

    fn is_non_negative(&self, expr: &AffineExpr, dims: &[ValueId]) -> bool {
        self.ranges.range_of(expr, dims).is_some_and(|r| r.is_non_negative())
    }

    fn lower_for(&mut self, op: Operation) -> Result<()> {
        let location = op.location.clone();
        let Opcode::Scf(ScfOp::For(bounds)) = &op.opcode else {
            return Err(unsupported(&op));
        };
        let bound_operands = op.bound_operands().to_vec();
        let inits = op.loop_inits().to_vec();
        let lower = self.materialize(&bounds.lower, &bound_operands, &location)?;
        let upper = self.materialize(&bounds.upper, &bound_operands, &location)?;
        let step = bounds.step;

        let Some(body) = op.regions.into_iter().next().and_then(|r| r.blocks.into_iter().next()) else {
            return Err(Error::MalformedModule {
                location: location.to_string(),
                message:  "scf.for has no body".to_string(),
            });
        };
        let Some((induction_var, carried)) = body.arguments.split_first() else {
            return Err(Error::MalformedModule {
                location: location.to_string(),
                message:  "scf.for body has no induction variable".to_string(),
            });
        };
        let carried = carried.to_vec();
        let induction_var = *induction_var;
        let header = self.new_block_id();
        let exit = self.new_block_id();

        let entry_args = std::iter::once(lower).chain(inits).collect();
        self.branch(header, entry_args, &location);

        self.start(Block::new(header, body.arguments.clone()));
        let in_bounds = self.emit_one(
            LlvmOp::ICmp(IntPredicate::Slt),
            vec![induction_var, upper],
            ScalarType::I1,
            &location,
        );
        let cond_br = Operation::new(Opcode::Llvm(LlvmOp::CondBr), vec![in_bounds], vec![])
            .with_successor(body.id, vec![])
            .with_successor(exit, carried)
            .at(location.clone());
        self.emit(cond_br);

        self.start(Block::new(body.id, vec![]));
        let (yielded, operations) = split_yield(body.operations);
        self.lower_ops(operations)?;
        let step = self.constant(step, &location);
        let next = self.emit_one(LlvmOp::Add, vec![induction_var, step], ScalarType::I64, &location);
        let back_edge = std::iter::once(next).chain(yielded).collect();
        self.branch(header, back_edge, &location);

        self.start(Block::new(exit, op.results));
        Ok(())
    }

    fn lower_if(&mut self, op: Operation) -> Result<()> {
        let location = op.location.clone();
        let condition = *op.operands.first().ok_or_else(|| unsupported(&op))?;
        let mut branches = op.regions.into_iter().filter_map(|r| r.blocks.into_iter().next());
        let (Some(then_block), Some(else_block)) = (branches.next(), branches.next()) else {
            return Err(Error::MalformedModule {
                location: location.to_string(),
                message:  "scf.if must have two branches".to_string(),
            });
        };
        let merge = self.new_block_id();

        let cond_br = Operation::new(Opcode::Llvm(LlvmOp::CondBr), vec![condition], vec![])
            .with_successor(then_block.id, vec![])
            .with_successor(else_block.id, vec![])
            .at(location.clone());
        self.emit(cond_br);

        for branch in [then_block, else_block] {
            self.start(Block::new(branch.id, vec![]));
            let (yielded, operations) = split_yield(branch.operations);
            self.lower_ops(operations)?;
            self.branch(merge, yielded, &location);
        }

        self.start(Block::new(merge, op.results));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use klo_errors::compile::Error;
    use klo_ir::{
        affine::AffineExpr,
        builder::FunctionBuilder,
        eval::{evaluate, from_bits, to_bits},
        module::BufferKind,
        op::{ArithOp, IntPredicate, LlvmOp, Opcode},
        range::Interval,
        types::{ScalarType, SliceType, Type},
        Function,
        Module,
    };
    use proptest::prelude::*;

    use crate::pass::{
        data::DynPassDataMap,
        lower_to_llvm::{LowerToLLVM, LowerToLLVMData},
        verify::{verify, Legality},
        PassOps,
    };

    fn lower(function: Function) -> anyhow::Result<(Module, LowerToLLVMData)> {
        let module = Module::new("m").with_function(function);
        let result = LowerToLLVM::new().run(module, &DynPassDataMap::new())?;
        let data = result.unwrap_data_as::<LowerToLLVMData>().clone();
        Ok((result.module, data))
    }

    fn instructions(module: &Module) -> Vec<String> {
        let mut names = Vec::new();
        module.functions[0].walk_ops(&mut |op| names.push(op.opcode.to_string()));
        names
    }

    fn sum_below(with_if: bool) -> Function {
        let mut builder = FunctionBuilder::new("sum", &[Type::INDEX], &[Type::INDEX]);
        let n = builder.params()[0];
        let zero = builder.index(0);
        let results = builder.for_loop(
            AffineExpr::constant(0),
            AffineExpr::dim(0),
            1,
            &[n],
            &[zero],
            |b, iv, carried| {
                let added = b.arith(ArithOp::AddI, &[carried[0], iv]);
                if with_if {
                    let three = b.index(3);
                    let small = b.cmpi(IntPredicate::Slt, iv, three);
                    b.if_else(small, &[Type::INDEX], |_| vec![added], |_| vec![carried[0]])
                } else {
                    vec![added]
                }
            },
        );
        builder.ret(&results);
        builder.finish()
    }

    #[test]
    fn loops_become_basic_blocks() -> anyhow::Result<()> {
        let function = sum_below(false);
        let expected = evaluate(&function, &[to_bits(10)])?;
        let (module, data) = lower(function)?;

        verify(&module, Legality::LowLevel)?;
        assert_eq!(data.blocks, 4);
        assert_eq!(evaluate(&module.functions[0], &[to_bits(10)])?, expected);
        assert_eq!(expected, vec![to_bits(45)]);

        Ok(())
    }

    #[test]
    fn conditionals_inside_loops_are_flattened() -> anyhow::Result<()> {
        let function = sum_below(true);
        let expected = evaluate(&function, &[to_bits(10)])?;
        let (module, _) = lower(function)?;

        verify(&module, Legality::LowLevel)?;
        assert_eq!(evaluate(&module.functions[0], &[to_bits(10)])?, expected);
        assert_eq!(expected, vec![to_bits(3)]);

        Ok(())
    }

    #[test]
    fn slices_become_pointer_arithmetic() -> anyhow::Result<()> {
        let mut module = Module::new("m");
        let buffer = module.allocations.add("k.alloc0", 64, BufferKind::Local {
            function: "k".into(),
        });
        let slice = Type::Slice(SliceType::new(buffer, 64, ScalarType::F32));
        let mut builder = FunctionBuilder::new("k", &[], &[]);
        let tid = builder.thread_id(1, 16);
        let alloc = builder.push_one(Opcode::Mem(klo_ir::op::MemOp::Alloc), &[], slice);
        let one = builder.constant_float(1.0, ScalarType::F32);
        builder.store(one, alloc, AffineExpr::dim(0) * 4, &[tid]);
        builder.ret(&[]);
        let module = module.with_function(builder.finish());

        let result = LowerToLLVM::new().run(module, &DynPassDataMap::new())?;
        verify(&result.module, Legality::LowLevel)?;
        assert_eq!(instructions(&result.module), vec![
            "llvm.call",
            "llvm.sext",
            "llvm.alloca",
            "llvm.constant",
            "llvm.constant",
            "llvm.mul",
            "llvm.getelementptr",
            "llvm.store",
            "llvm.ret",
        ]);

        let mut alloca_bytes = None;
        let mut intrinsic = None;
        result.module.functions[0].walk_ops(&mut |op| match &op.opcode {
            Opcode::Llvm(LlvmOp::Alloca { bytes }) => alloca_bytes = Some(*bytes),
            Opcode::Llvm(LlvmOp::Call(name)) => intrinsic = Some(name.clone()),
            _ => (),
        });
        assert_eq!(alloca_bytes, Some(64));
        assert_eq!(intrinsic.as_deref(), Some("llvm.nvvm.read.ptx.sreg.tid.y"));

        Ok(())
    }

    #[test]
    fn thread_ids_are_widened_from_i32() -> anyhow::Result<()> {
        let mut builder = FunctionBuilder::new("f", &[], &[Type::INDEX]);
        let tid = builder.thread_id(0, 256);
        builder.ret(&[tid]);
        let (module, _) = lower(builder.finish())?;

        assert_eq!(instructions(&module), vec!["llvm.call", "llvm.sext", "llvm.ret"]);
        let function = &module.functions[0];
        let ops = &function.body.blocks[0].operations;
        let id = ops[0].results[0];
        assert_eq!(function.value_type(id), &Type::scalar(ScalarType::I32));
        assert_eq!(ops[1].operands, vec![id]);
        assert_eq!(ops[1].results, vec![tid]);
        assert_eq!(function.value_type(tid), &Type::scalar(ScalarType::I64));

        Ok(())
    }

    #[test]
    fn ranged_operands_skip_sign_correction() -> anyhow::Result<()> {
        let mut builder = FunctionBuilder::new("f", &[Type::INDEX], &[Type::INDEX]);
        let i = builder.params()[0];
        builder.declare_range(i, Interval::new(0, 100));
        let q = builder.apply(AffineExpr::dim(0).floor_div(4), &[i]);
        builder.ret(&[q]);
        let (module, _) = lower(builder.finish())?;

        assert_eq!(instructions(&module), vec!["llvm.constant", "llvm.sdiv", "llvm.ret"]);

        Ok(())
    }

    #[test]
    fn tensor_operations_are_unsupported() {
        let ty = Type::tensor(&[4], ScalarType::F32);
        let mut builder = FunctionBuilder::new("f", &[], &[]);
        builder.tensor_empty(ty);
        builder.ret(&[]);

        let result = LowerToLLVM::new().run(
            Module::new("m").with_function(builder.finish()),
            &DynPassDataMap::new(),
        );
        assert!(matches!(
            result,
            Err(Error::UnsupportedOperation { opcode, .. }) if opcode == "tensor.empty"
        ));
    }

    #[test]
    fn index_casts_to_narrower_types_truncate() -> anyhow::Result<()> {
        let mut builder = FunctionBuilder::new("f", &[Type::INDEX], &[Type::scalar(ScalarType::I32)]);
        let i = builder.params()[0];
        let wide = builder.cast(ArithOp::IndexCast, i, ScalarType::I64);
        let narrow = builder.cast(ArithOp::IndexCast, wide, ScalarType::I32);
        builder.ret(&[narrow]);
        let (module, _) = lower(builder.finish())?;

        verify(&module, Legality::LowLevel)?;
        assert_eq!(instructions(&module), vec!["llvm.trunc", "llvm.ret"]);
        assert_eq!(module.functions[0].body.blocks[0].operations[0].operands, vec![i]);

        Ok(())
    }

    proptest! {
        #[test]
        fn floor_division_and_modulo_match_their_definition(i in -100i64..100, c in 1i64..9) {
            let map = AffineExpr::dim(0).floor_div(c) * 1000 + AffineExpr::dim(0).modulo(c);
            let mut builder = FunctionBuilder::new("f", &[Type::INDEX], &[Type::INDEX]);
            let param = builder.params()[0];
            let result = builder.apply(map, &[param]);
            builder.ret(&[result]);
            let function = builder.finish();

            let lowered = lower(function.clone()).map_err(|e| TestCaseError::fail(e.to_string()))?.0;
            let expected = i.div_euclid(c) * 1000 + i.rem_euclid(c);
            let evaluated = evaluate(&lowered.functions[0], &[to_bits(i)])
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(evaluated.iter().map(|b| from_bits(*b)).collect::<Vec<_>>(), vec![expected]);
            prop_assert_eq!(evaluate(&function, &[to_bits(i)]), Ok(vec![to_bits(expected)]));
        }
    }
}
