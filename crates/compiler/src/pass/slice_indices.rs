//! This pass computes a closed-form byte offset for every slice value in the
//! module, and records it in the value's type.
//!
//! # Propagation
//!
//! Parameter slices and fresh allocations start at offset `0`, and the offset
//! of a `mem.subslice` is the offset of its source plus its own offset map,
//! with the map's dims replaced by whatever the corresponding index operands
//! decode to. Decoding looks through constants, `index.apply`, `arith.addi`,
//! `arith.subi`, `arith.muli` by a constant, `arith.divsi` and `arith.remsi` by
//! a positive constant on a provably non-negative numerator, and
//! `arith.index_cast`. Anything else must be an index value with a known range,
//! which then appears in the offset as-is.
//!
//! Slices that meet at block arguments, loop-carried values and the results of
//! `scf.if` take the shared offset if every incoming offset agrees after
//! canonicalization, and a fresh join symbol otherwise. Propagation is iterated
//! until nothing changes.
//!
//! # Opaque Slices
//!
//! A slice whose offset cannot be expressed is marked as opaque, and a
//! diagnostic is recorded in the pass data. This is never fatal: opaque slices
//! are simply excluded from any reasoning about aliasing.

use std::collections::HashMap;

use klo_errors::compile::{Error, Result};
use klo_ir::{
    affine::{canonicalize, canonical::range_of, Leaf},
    op::{ArithOp, IndexOp, MemOp, Opcode, ScfOp},
    range::IndexRanges,
    types::SliceOffset,
    AffineExpr,
    Function,
    Module,
    Operation,
    Region,
    SymbolId,
    ValueId,
};

use crate::pass::{
    data::{ConcretePassData, DynPassDataMap, PassDataOps},
    lower_tensors::LowerTensors,
    verify::Legality,
    ConcretePass,
    DynPassReturnData,
    Pass,
    PassKey,
    PassOps,
};

/// Propagates the offsets of slices through the module.
#[derive(Clone, Debug, PartialEq)]
pub struct PropagateSliceIndices {
    /// The passes that this pass depends upon the results of for its execution.
    depends: Vec<PassKey>,

    /// The passes that this pass invalidates the results of by executing.
    invalidates: Vec<PassKey>,
}

impl PropagateSliceIndices {
    /// Creates a new instance of the slice index propagation pass.
    #[must_use]
    pub fn new() -> Self {
        // There are no slices until tensors have been lowered.
        let depends = vec![LowerTensors::key()];

        // Offsets are only ever recorded, never used to rewrite anything.
        let invalidates = vec![];

        Self {
            depends,
            invalidates,
        }
    }

    /// Creates a new trait object of the slice index propagation pass.
    #[must_use]
    pub fn new_dyn() -> Pass {
        Box::new(Self::new())
    }

    /// Computes and records the offset of every slice in `function`.
    pub fn propagate_function(function: &mut Function) -> SliceIndicesData {
        let ranges = IndexRanges::compute(function);
        let mut propagation = Propagation::new(function, &ranges);
        propagation.run();

        let Propagation {
            states,
            definitions,
            placeholders,
            ..
        } = propagation;
        let definitions: Vec<_> = definitions
            .into_iter()
            .map(|d| (d.value, d.location))
            .collect();

        // Join symbols are only allocated now that the analysis no longer
        // borrows the function.
        let mut symbols = HashMap::new();
        for placeholder in placeholders.values() {
            symbols.insert(*placeholder, function.new_symbol());
        }
        let mut rename = |leaf: Leaf| match leaf {
            Leaf::Symbol(s) => symbols.get(&s).map(|s| AffineExpr::symbol(*s)),
            _ => None,
        };

        let mut data = SliceIndicesData {
            symbols: placeholders.len(),
            ..SliceIndicesData::default()
        };
        for (value, location) in definitions {
            let offset = match states.get(&value) {
                Some(State::Known(expr)) => {
                    data.resolved += 1;
                    SliceOffset::Affine(expr.substitute(&mut rename))
                }
                opaque => {
                    let reason = match opaque {
                        Some(State::Opaque(reason)) => reason.clone(),
                        _ => "the definition is unreachable".to_string(),
                    };
                    tracing::warn!(
                        function = %function.name,
                        value = %value,
                        location,
                        reason,
                        "Slice offset could not be resolved"
                    );
                    data.opaque += 1;
                    data.diagnostics.push(Error::UnresolvedSliceIndex {
                        location,
                        value: value.to_string(),
                        reason,
                    });
                    SliceOffset::Opaque
                }
            };
            if let Some(slice) = function
                .values
                .get_mut(value)
                .and_then(|d| d.ty.as_slice_mut())
            {
                slice.offset = offset;
            }
        }

        data
    }
}

impl Default for PropagateSliceIndices {
    fn default() -> Self {
        Self::new()
    }
}

impl PassOps for PropagateSliceIndices {
    #[tracing::instrument(name = "propagate-slice-indices", skip_all)]
    fn run(&mut self, mut module: Module, _pass_data: &DynPassDataMap) -> Result<DynPassReturnData> {
        let mut data = SliceIndicesData::default();
        for function in &mut module.functions {
            data.absorb(Self::propagate_function(function));
        }
        tracing::debug!(
            resolved = data.resolved,
            opaque = data.opaque,
            "Propagated slice offsets"
        );

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
        "propagate-slice-indices"
    }

    fn legality(&self) -> Option<Legality> {
        Some(Legality::Indexed)
    }
}

impl ConcretePass for PropagateSliceIndices {
    type Data = SliceIndicesData;
}

/// The data returned by the slice index propagation pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SliceIndicesData {
    /// The number of slices that were given an affine offset.
    pub resolved: usize,

    /// The number of slices that were marked as opaque.
    pub opaque: usize,

    /// The number of join symbols that were introduced.
    pub symbols: usize,

    /// An [`Error::UnresolvedSliceIndex`] for each opaque slice.
    pub diagnostics: Vec<Error>,
}

impl SliceIndicesData {
    fn absorb(&mut self, other: Self) {
        self.resolved += other.resolved;
        self.opaque += other.opaque;
        self.symbols += other.symbols;
        self.diagnostics.extend(other.diagnostics);
    }
}

impl PassDataOps for SliceIndicesData {}

impl ConcretePassData for SliceIndicesData {
    type Pass = PropagateSliceIndices;
}

/// Where the offset of a slice comes from.
#[derive(Clone, Debug)]
enum Source<'f> {
    /// The start of a buffer.
    Root,

    /// An offset into another slice.
    Subslice {
        source: ValueId,
        map:    &'f AffineExpr,
        dims:   &'f [ValueId],
    },

    /// Whichever of the incoming slices flowed in.
    Join(Vec<ValueId>),

    /// A producer that nothing is known about.
    Unknown(String),
}

#[derive(Clone, Debug)]
struct Definition<'f> {
    value:    ValueId,
    source:   Source<'f>,
    location: String,
}

#[derive(Clone, Debug, PartialEq)]
enum State {
    Known(AffineExpr),
    Opaque(String),
}

/// The analysis of the slice offsets of a single function.
struct Propagation<'f> {
    ranges:       &'f IndexRanges,
    definitions:  Vec<Definition<'f>>,
    producers:    HashMap<ValueId, &'f Operation>,
    decoded:      HashMap<ValueId, std::result::Result<AffineExpr, String>>,
    states:       HashMap<ValueId, State>,
    placeholders: HashMap<ValueId, SymbolId>,
}

impl<'f> Propagation<'f> {
    fn new(function: &'f Function, ranges: &'f IndexRanges) -> Self {
        let mut propagation = Self {
            ranges,
            definitions: Vec::new(),
            producers: HashMap::new(),
            decoded: HashMap::new(),
            states: HashMap::new(),
            placeholders: HashMap::new(),
        };
        let is_slice = |v: &ValueId| function.value_type(*v).as_slice().is_some();
        let here = format!("@{}", function.name);

        // Block arguments at the top level receive the values forwarded by
        // branches.
        let mut incoming: HashMap<ValueId, Vec<ValueId>> = HashMap::new();
        for block in &function.body.blocks {
            for successor in block.operations.iter().flat_map(|op| op.successors.iter()) {
                let Some(target) = function.body.blocks.iter().find(|b| b.id == successor.block) else {
                    continue;
                };
                for (arg, value) in target.arguments.iter().zip(&successor.args) {
                    incoming.entry(*arg).or_default().push(*value);
                }
            }
        }
        for (i, block) in function.body.blocks.iter().enumerate() {
            for arg in block.arguments.iter().filter(|v| is_slice(v)) {
                let source = if i == 0 {
                    Source::Root
                } else {
                    Source::Join(incoming.remove(arg).unwrap_or_default())
                };
                propagation.define(*arg, source, &here);
            }
        }

        function.walk_ops(&mut |op| {
            for result in &op.results {
                propagation.producers.insert(*result, op);
            }
            propagation.define_results(op, &is_slice);
        });

        propagation
    }

    fn define(&mut self, value: ValueId, source: Source<'f>, location: &str) {
        self.definitions.push(Definition {
            value,
            source,
            location: location.to_string(),
        });
    }

    fn define_results(&mut self, op: &'f Operation, is_slice: &impl Fn(&ValueId) -> bool) {
        let location = op.location.to_string();
        match &op.opcode {
            Opcode::Mem(MemOp::Alloc) => {
                for result in op.results.iter().filter(|v| is_slice(v)) {
                    self.define(*result, Source::Root, &location);
                }
            }
            Opcode::Mem(MemOp::Subslice { offset }) => {
                if let (Some(result), Some(source)) = (op.results.first(), op.operands.first()) {
                    let source = Source::Subslice {
                        source: *source,
                        map:    offset,
                        dims:   op.index_operands(),
                    };
                    self.define(*result, source, &location);
                }
            }
            Opcode::Scf(ScfOp::For(_)) => {
                let carried = op.body().map(|b| &b.arguments[1.min(b.arguments.len())..]);
                for (i, init) in op.loop_inits().iter().enumerate() {
                    let incoming = std::iter::once(*init)
                        .chain(yielded(&op.regions[0], i))
                        .collect::<Vec<_>>();
                    if let Some(arg) = carried.and_then(|c| c.get(i)).filter(|v| is_slice(v)) {
                        self.define(*arg, Source::Join(incoming.clone()), &location);
                    }
                    if let Some(result) = op.results.get(i).filter(|v| is_slice(v)) {
                        self.define(*result, Source::Join(incoming), &location);
                    }
                }
            }
            Opcode::Scf(ScfOp::If) => {
                for (i, result) in op.results.iter().enumerate().filter(|(_, v)| is_slice(v)) {
                    let incoming = op.regions.iter().filter_map(|r| yielded(r, i)).collect();
                    self.define(*result, Source::Join(incoming), &location);
                }
            }
            opcode => {
                for result in op.results.iter().filter(|v| is_slice(v)) {
                    let source = Source::Unknown(format!("the slice is produced by {opcode}"));
                    self.define(*result, source, &location);
                }
            }
        }
    }

    /// Iterates the transfer functions of every definition to a fixed point.
    fn run(&mut self) {
        let definitions = self.definitions.clone();
        loop {
            let mut changed = false;
            for definition in &definitions {
                let Some(state) = self.transfer(definition) else {
                    continue;
                };
                changed |= self.update(definition.value, state);
            }
            if !changed {
                break;
            }
        }
    }

    /// Records the new `state` of `value`, returning `true` if it changed.
    ///
    /// Opaque slices stay opaque, and slices that were given a join symbol
    /// keep it.
    fn update(&mut self, value: ValueId, state: State) -> bool {
        let current = self.states.get(&value);
        let keep = match current {
            Some(State::Opaque(_)) => true,
            Some(State::Known(AffineExpr::Symbol(s))) => {
                self.placeholders.get(&value) == Some(s) && matches!(state, State::Known(_))
            }
            _ => false,
        };
        if keep || current == Some(&state) {
            return false;
        }
        self.states.insert(value, state);
        true
    }

    fn transfer(&mut self, definition: &Definition<'f>) -> Option<State> {
        match &definition.source {
            Source::Root => Some(State::Known(AffineExpr::constant(0))),
            Source::Unknown(reason) => Some(State::Opaque(reason.clone())),
            Source::Subslice { source, map, dims } => match self.states.get(source)? {
                State::Opaque(_) => Some(State::Opaque(format!("{source} has an opaque offset"))),
                State::Known(base) => {
                    let base = base.clone();
                    Some(match self.compose(map, dims) {
                        Ok(offset) => State::Known(base + offset),
                        Err(reason) => State::Opaque(reason),
                    })
                }
            },
            Source::Join(incoming) => self.join(definition.value, incoming),
        }
    }

    fn join(&mut self, value: ValueId, incoming: &[ValueId]) -> Option<State> {
        let mut known = Vec::new();
        for state in incoming.iter().filter_map(|v| self.states.get(v)) {
            match state {
                State::Opaque(_) => {
                    return Some(State::Opaque("an incoming slice has an opaque offset".into()));
                }
                State::Known(expr) => known.push(expr),
            }
        }
        let (first, rest) = known.split_first()?;

        let ranges = |leaf| self.ranges.leaf_range(leaf, &[]);
        let canonical = canonicalize(first, &ranges);
        if rest.iter().all(|e| canonicalize(e, &ranges) == canonical) {
            return Some(State::Known((*first).clone()));
        }

        let next = SymbolId::from(self.placeholders.len());
        let symbol = *self.placeholders.entry(value).or_insert(next);
        Some(State::Known(AffineExpr::symbol(symbol)))
    }

    /// Replaces the dims of `map` with the decoded `dims`.
    fn compose(&mut self, map: &AffineExpr, dims: &[ValueId]) -> std::result::Result<AffineExpr, String> {
        let decoded = dims
            .iter()
            .map(|d| self.decode(*d))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut missing = None;
        let composed = map.substitute(&mut |leaf| match leaf {
            Leaf::Dim(d) => {
                let expr = usize::try_from(d).ok().and_then(|d| decoded.get(d)).cloned();
                if expr.is_none() {
                    missing = Some(d);
                }
                expr
            }
            _ => None,
        });
        match missing {
            Some(d) => Err(format!("the offset refers to missing operand d{d}")),
            None => Ok(composed),
        }
    }

    /// Decodes the index `value` into an affine expression over ranged index
    /// values.
    fn decode(&mut self, value: ValueId) -> std::result::Result<AffineExpr, String> {
        if let Some(result) = self.decoded.get(&value) {
            return result.clone();
        }
        let result = match self.producers.get(&value).copied() {
            Some(op) => self.decode_op(op).transpose(),
            None => None,
        };
        let result = result.unwrap_or_else(|| {
            if self.ranges.is_ranged(value) {
                Ok(AffineExpr::value(value))
            } else {
                Err(format!("{value} is not an index value with a known range"))
            }
        });
        self.decoded.insert(value, result.clone());
        result
    }

    /// Decodes the result of `op`, returning [`None`] if `op` is not one of the
    /// operations that can be looked through.
    fn decode_op(&mut self, op: &'f Operation) -> std::result::Result<Option<AffineExpr>, String> {
        let operand = |this: &mut Self, i: usize| -> std::result::Result<AffineExpr, String> {
            let value = op.operands.get(i).copied().ok_or("missing operand")?;
            this.decode(value)
        };
        let expr = match &op.opcode {
            Opcode::Arith(ArithOp::Constant) => match op.int_attribute("value") {
                Some(value) => AffineExpr::constant(value),
                None => return Ok(None),
            },
            Opcode::Arith(ArithOp::IndexCast) => operand(self, 0)?,
            Opcode::Index(IndexOp::Apply { map }) => {
                let dims = op.operands.clone();
                self.compose(map, &dims)?
            }
            Opcode::Arith(ArithOp::AddI) => operand(self, 0)? + operand(self, 1)?,
            Opcode::Arith(ArithOp::SubI) => operand(self, 0)? + operand(self, 1)? * -1,
            Opcode::Arith(ArithOp::MulI) => {
                let (lhs, rhs) = (operand(self, 0)?, operand(self, 1)?);
                match (lhs.as_constant(), rhs.as_constant()) {
                    (_, Some(factor)) => lhs * factor,
                    (Some(factor), _) => rhs * factor,
                    _ => return Err(format!("{} multiplies two index values", op.opcode)),
                }
            }
            Opcode::Arith(arith @ (ArithOp::DivSI | ArithOp::RemSI)) => {
                let (lhs, rhs) = (operand(self, 0)?, operand(self, 1)?);
                let divisor = rhs
                    .as_constant()
                    .filter(|d| *d > 0)
                    .ok_or_else(|| format!("{} does not divide by a positive constant", op.opcode))?;
                let non_negative = range_of(&lhs, &|leaf| self.ranges.leaf_range(leaf, &[]))
                    .is_some_and(|r| r.is_non_negative());
                if !non_negative {
                    return Err(format!("the numerator of {} may be negative", op.opcode));
                }
                if *arith == ArithOp::DivSI {
                    lhs.floor_div(divisor)
                } else {
                    lhs.modulo(divisor)
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(expr))
    }
}

/// Gets the `index`th value yielded by the single block of `region`.
fn yielded(region: &Region, index: usize) -> Option<ValueId> {
    region
        .blocks
        .first()?
        .terminator()
        .filter(|t| t.opcode == Opcode::Scf(ScfOp::Yield))?
        .operands
        .get(index)
        .copied()
}

#[cfg(test)]
mod test {
    use klo_errors::compile::Error;
    use klo_ir::{
        affine::AffineExpr,
        builder::FunctionBuilder,
        module::BufferKind,
        op::{ArithOp, Opcode},
        range::Interval,
        types::{ScalarType, SliceOffset, SliceType, Type},
        Module,
    };

    use crate::pass::{
        data::DynPassDataMap,
        slice_indices::{PropagateSliceIndices, SliceIndicesData},
        PassOps,
    };

    /// A module with one function taking a 256 byte parameter slice followed by
    /// the provided extra parameters.
    fn with_buffer(extra: &[Type]) -> (Module, FunctionBuilder, Type) {
        let mut module = Module::new("m");
        let buffer = module.allocations.add("f.arg0", 256, BufferKind::Parameter {
            function: "f".into(),
            index:    0,
        });
        let slice = Type::Slice(SliceType::new(buffer, 256, ScalarType::F32));
        let params: Vec<_> = std::iter::once(slice.clone()).chain(extra.iter().cloned()).collect();
        let builder = FunctionBuilder::new("f", &params, &[]);
        (module, builder, slice)
    }

    fn sub_type(slice: &Type, length: u64) -> Type {
        let mut ty = slice.clone();
        if let Type::Slice(s) = &mut ty {
            s.length = length;
        }
        ty
    }

    fn offset(module: &Module, value: klo_ir::ValueId) -> Option<SliceOffset> {
        module.functions[0]
            .value_type(value)
            .as_slice()
            .map(|s| s.offset.clone())
    }

    fn propagate(module: Module) -> anyhow::Result<(Module, SliceIndicesData)> {
        let result = PropagateSliceIndices::new().run(module, &DynPassDataMap::new())?;
        let data = result.unwrap_data_as::<SliceIndicesData>().clone();
        Ok((result.module, data))
    }

    #[test]
    fn offsets_compose_through_subslices() -> anyhow::Result<()> {
        let (module, mut builder, slice) = with_buffer(&[]);
        let base = builder.params()[0];
        let tid = builder.thread_id(0, 16);
        let four = builder.index(4);
        let scaled = builder.arith(ArithOp::MulI, &[tid, four]);
        let row = builder.subslice(base, AffineExpr::dim(0), &[scaled], sub_type(&slice, 64));
        let elem = builder.subslice(row, AffineExpr::constant(8), &[], sub_type(&slice, 4));
        builder.ret(&[]);
        let (module, data) = propagate(module.with_function(builder.finish()))?;

        assert_eq!(data.resolved, 3);
        assert_eq!(offset(&module, base), Some(SliceOffset::Affine(AffineExpr::constant(0))));
        let row_offset = AffineExpr::constant(0) + AffineExpr::value(tid) * 4;
        assert_eq!(offset(&module, row), Some(SliceOffset::Affine(row_offset.clone())));
        assert_eq!(
            offset(&module, elem),
            Some(SliceOffset::Affine(row_offset + AffineExpr::constant(8)))
        );

        Ok(())
    }

    #[test]
    fn unranged_indices_make_slices_opaque() -> anyhow::Result<()> {
        let (module, mut builder, slice) = with_buffer(&[Type::INDEX]);
        let [base, i] = [builder.params()[0], builder.params()[1]];
        let sub = builder.subslice(base, AffineExpr::dim(0), &[i], sub_type(&slice, 4));
        builder.ret(&[]);
        let (module, data) = propagate(module.with_function(builder.finish()))?;

        assert_eq!(offset(&module, sub), Some(SliceOffset::Opaque));
        assert_eq!(data.opaque, 1);
        assert!(matches!(
            data.diagnostics.as_slice(),
            [Error::UnresolvedSliceIndex { value, .. }] if *value == sub.to_string()
        ));

        Ok(())
    }

    #[test]
    fn division_requires_a_non_negative_numerator() -> anyhow::Result<()> {
        let (module, mut builder, slice) = with_buffer(&[Type::INDEX, Type::INDEX]);
        let params = builder.params();
        let (base, i, j) = (params[0], params[1], params[2]);
        builder.declare_range(i, Interval::new(0, 63));
        builder.declare_range(j, Interval::new(-8, 8));
        let four = builder.index(4);
        let good = builder.arith(ArithOp::DivSI, &[i, four]);
        let bad = builder.arith(ArithOp::RemSI, &[j, four]);
        let a = builder.subslice(base, AffineExpr::dim(0), &[good], sub_type(&slice, 4));
        let b = builder.subslice(base, AffineExpr::dim(0), &[bad], sub_type(&slice, 4));
        builder.ret(&[]);
        let (module, _) = propagate(module.with_function(builder.finish()))?;

        let expected = AffineExpr::constant(0) + AffineExpr::value(i).floor_div(4);
        assert_eq!(offset(&module, a), Some(SliceOffset::Affine(expected)));
        assert_eq!(offset(&module, b), Some(SliceOffset::Opaque));

        Ok(())
    }

    #[test]
    fn agreeing_branches_share_their_offset() -> anyhow::Result<()> {
        let (module, mut builder, slice) = with_buffer(&[Type::I1]);
        let [base, cond] = [builder.params()[0], builder.params()[1]];
        let tid = builder.thread_id(0, 8);
        let sub_ty = sub_type(&slice, 4);
        let results = builder.if_else(
            cond,
            &[sub_ty.clone()],
            |b| {
                let map = AffineExpr::dim(0) * 4 + AffineExpr::constant(0);
                vec![b.subslice(base, map, &[tid], sub_ty.clone())]
            },
            |b| {
                let map = AffineExpr::constant(0) + AffineExpr::dim(0) * 4;
                vec![b.subslice(base, map, &[tid], sub_ty.clone())]
            },
        );
        builder.ret(&[]);
        let (module, data) = propagate(module.with_function(builder.finish()))?;

        assert_eq!(data.symbols, 0);
        let expected = AffineExpr::constant(0) + (AffineExpr::value(tid) * 4 + AffineExpr::constant(0));
        assert_eq!(offset(&module, results[0]), Some(SliceOffset::Affine(expected)));

        Ok(())
    }

    #[test]
    fn differing_loop_offsets_get_a_join_symbol() -> anyhow::Result<()> {
        let (module, mut builder, slice) = with_buffer(&[]);
        let base = builder.params()[0];
        let mut carried = None;
        let results = builder.for_loop(
            AffineExpr::constant(0),
            AffineExpr::constant(4),
            1,
            &[],
            &[base],
            |b, _, args| {
                carried = Some(args[0]);
                vec![b.subslice(args[0], AffineExpr::constant(4), &[], slice.clone())]
            },
        );
        builder.ret(&[]);
        let (module, data) = propagate(module.with_function(builder.finish()))?;

        // The loop result and the carried value are distinct unknowns.
        assert_eq!(data.symbols, 2);
        assert_eq!(data.opaque, 0);
        let symbol = |v| match offset(&module, v) {
            Some(SliceOffset::Affine(AffineExpr::Symbol(s))) => Some(s),
            _ => None,
        };
        assert!(symbol(results[0]).is_some());
        assert!(carried.and_then(symbol).is_some());

        Ok(())
    }

    #[test]
    fn slices_from_unknown_producers_are_opaque() -> anyhow::Result<()> {
        let (module, mut builder, slice) = with_buffer(&[]);
        let base = builder.params()[0];
        let mystery = builder.push_one(
            Opcode::Unregistered("vendor.reinterpret".into()),
            &[base],
            slice,
        );
        builder.ret(&[]);
        let (module, data) = propagate(module.with_function(builder.finish()))?;

        assert_eq!(offset(&module, mystery), Some(SliceOffset::Opaque));
        assert_eq!(data.resolved, 1);

        Ok(())
    }
}
