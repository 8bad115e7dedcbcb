//! This pass replaces every tensor in a module with a slice of a buffer, and
//! every tensor operation with explicit memory operations on those slices.
//!
//! # Buffer Assignment
//!
//! Tensor parameters of a function are backed by `Parameter` buffers, and
//! tensors produced by `tensor.empty` (or by any other operation that creates
//! a new tensor) by fresh `Local` buffers. Every other tensor is a _view_ of an
//! existing one and shares its buffer:
//!
//! - The result of `tensor.insert` is its destination, as destination-passing
//!   style is assumed. Where the destination is still used after the insert,
//!   or the insert sits in a loop that the destination is defined outside of,
//!   the destination is first copied into a fresh `Local` buffer instead.
//! - A contiguous `tensor.extract_slice` is a sub-range of its source.
//! - Loop-carried values, results of `scf.for` and `scf.if`, and block
//!   arguments take the buffer of the values that flow into them.
//!
//! Buffers are assigned by propagating to a fixed point, as block arguments can
//! be reached by back edges. Should the values flowing into a merge point end
//! up in different buffers, lowering fails with
//! [`Error::ConflictingBufferAssignment`].
//!
//! # Layout
//!
//! Tensors are laid out in row-major order. Dynamic dimensions must carry a
//! static bound, which is used as their extent, as otherwise no buffer size can
//! be determined. A non-contiguous `tensor.extract_slice` is materialized into
//! a fresh buffer by a nest of `scf.for` loops copying each element.

use std::collections::{HashMap, HashSet};

use klo_errors::compile::{Error, Result};
use klo_ir::{
    affine::AffineExpr,
    module::{AllocationTable, Block, BufferKind, Location, Operation, Region, ValueTable},
    op::{FuncOp, LoopBounds, MemOp, Opcode, ScfOp, TensorOp},
    types::{SliceType, TensorType, Type},
    Function,
    Module,
    ValueId,
};

use crate::pass::{
    data::{ConcretePassData, DynPassDataMap, PassDataOps},
    merge_pointers::MergePointersToSameSlice,
    slice_indices::PropagateSliceIndices,
    verify::Legality,
    ConcretePass,
    DynPassReturnData,
    Pass,
    PassKey,
    PassOps,
};

/// Lowers tensors to slices of buffers.
#[derive(Clone, Debug, PartialEq)]
pub struct LowerTensors {
    /// The passes that this pass depends upon the results of for its execution.
    depends: Vec<PassKey>,

    /// The passes that this pass invalidates the results of by executing.
    invalidates: Vec<PassKey>,
}

impl LowerTensors {
    /// Creates a new instance of the tensor lowering pass.
    #[must_use]
    pub fn new() -> Self {
        let depends = vec![];

        // Any slice information computed before is stale once new slices exist.
        let invalidates = vec![PropagateSliceIndices::key(), MergePointersToSameSlice::key()];

        Self {
            depends,
            invalidates,
        }
    }

    /// Creates a new trait object of the tensor lowering pass.
    #[must_use]
    pub fn new_dyn() -> Pass {
        Box::new(Self::new())
    }

    /// Lowers the tensors of every function in `module`.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalTensorShape`] if a tensor cannot be given a size.
    /// - [`Error::ConflictingBufferAssignment`] if differing buffers meet at a
    ///   merge point.
    pub fn lower_module(module: &mut Module) -> Result<LowerTensorsData> {
        let mut data = LowerTensorsData::default();
        for function in &mut module.functions {
            let mut lowering = TensorLowering::new(function, &mut module.allocations);
            lowering.assign(function)?;
            lowering.lower(function)?;

            data.parameters += lowering.parameters;
            data.locals += lowering.locals;
            data.copies += lowering.copies;
            tracing::debug!(
                function = %function.name,
                parameters = lowering.parameters,
                locals = lowering.locals,
                "Assigned buffers"
            );
        }
        Ok(data)
    }
}

impl Default for LowerTensors {
    fn default() -> Self {
        Self::new()
    }
}

impl PassOps for LowerTensors {
    #[tracing::instrument(name = "lower-tensors", skip_all)]
    fn run(&mut self, mut module: Module, _pass_data: &DynPassDataMap) -> Result<DynPassReturnData> {
        let data = Self::lower_module(&mut module)?;
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
        "lower-tensors"
    }

    fn legality(&self) -> Option<Legality> {
        Some(Legality::Buffer)
    }
}

impl ConcretePass for LowerTensors {
    type Data = LowerTensorsData;
}

/// The data returned by the tensor lowering pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LowerTensorsData {
    /// The number of buffers created for tensor parameters.
    pub parameters: usize,

    /// The number of buffers allocated within functions.
    pub locals: usize,

    /// The number of non-contiguous slices that were materialized by copying.
    pub copies: usize,
}

impl PassDataOps for LowerTensorsData {}

impl ConcretePassData for LowerTensorsData {
    type Pass = LowerTensors;
}

/// The lowering of the tensors in a single function.
struct TensorLowering<'a> {
    function:    String,
    allocations: &'a mut AllocationTable,

    /// The original type of every tensor value.
    tensors: HashMap<ValueId, TensorType>,

    /// The slice assigned to each tensor value.
    slices: HashMap<ValueId, SliceType>,

    /// Values to be replaced by the value they alias once lowering is done.
    aliases: HashMap<ValueId, ValueId>,

    /// The results of inserts that cannot write into their destination.
    copied_inserts: HashSet<ValueId>,

    next_block: u32,
    parameters: usize,
    locals:     usize,
    copies:     usize,
}

impl<'a> TensorLowering<'a> {
    fn new(function: &Function, allocations: &'a mut AllocationTable) -> Self {
        let mut tensors = HashMap::new();
        let mut next_block = 0;
        function.body.walk_blocks(&mut |block| {
            let id = u32::try_from(block.id.index()).unwrap_or(u32::MAX);
            next_block = next_block.max(id.saturating_add(1));

            let defined = block
                .arguments
                .iter()
                .chain(block.operations.iter().flat_map(|op| op.results.iter()));
            for value in defined {
                if let Some(tensor) = function.value_type(*value).as_tensor() {
                    tensors.insert(*value, tensor.clone());
                }
            }
        });

        let liveness = Liveness::of(&function.body);
        let copied_inserts = liveness
            .inserts
            .iter()
            .filter(|(_, dest, at)| !liveness.writes_in_place(*dest, at))
            .map(|(result, ..)| *result)
            .collect();

        Self {
            function: function.name.clone(),
            allocations,
            tensors,
            slices: HashMap::new(),
            aliases: HashMap::new(),
            copied_inserts,
            next_block,
            parameters: 0,
            locals: 0,
            copies: 0,
        }
    }

    fn here(&self) -> String {
        format!("@{}", self.function)
    }

    fn tensor(&self, value: ValueId, location: &str) -> Result<&TensorType> {
        self.tensors.get(&value).ok_or_else(|| Error::MalformedModule {
            location: location.to_string(),
            message:  format!("{value} is not a tensor"),
        })
    }

    fn byte_size(&self, value: ValueId, location: &str) -> Result<u64> {
        let tensor = self.tensor(value, location)?;
        tensor.byte_size().ok_or_else(|| Error::IllegalTensorShape {
            location: location.to_string(),
            ty:       tensor.to_string(),
        })
    }

    /// Gives `value` a fresh buffer of the provided `kind`, returning `true` if
    /// it did not have one already.
    fn allocate(&mut self, value: ValueId, location: &str, kind: BufferKind) -> Result<bool> {
        if !self.tensors.contains_key(&value) || self.slices.contains_key(&value) {
            return Ok(false);
        }
        let size = self.byte_size(value, location)?;
        let name = match &kind {
            BufferKind::Parameter { index, .. } => format!("{}.arg{index}", self.function),
            BufferKind::Local { .. } => format!("{}.alloc{}", self.function, self.locals),
        };
        match kind {
            BufferKind::Parameter { .. } => self.parameters += 1,
            BufferKind::Local { .. } => self.locals += 1,
        }
        let element = self.tensor(value, location)?.element;
        let buffer = self.allocations.add(name, size, kind);
        self.slices.insert(value, SliceType::new(buffer, size, element));
        Ok(true)
    }

    fn allocate_local(&mut self, value: ValueId, location: &str) -> Result<bool> {
        let kind = BufferKind::Local {
            function: self.function.clone(),
        };
        self.allocate(value, location, kind)
    }

    /// Makes `value` share the slice of `source`, returning `true` if this
    /// assigned `value` a slice for the first time.
    fn adopt(&mut self, value: ValueId, source: ValueId) -> bool {
        if !self.tensors.contains_key(&value) || self.slices.contains_key(&value) {
            return false;
        }
        match self.slices.get(&source).cloned() {
            Some(slice) => {
                self.slices.insert(value, slice);
                true
            }
            None => false,
        }
    }

    /// Assigns a slice to every tensor value of `function`.
    fn assign(&mut self, function: &Function) -> Result<()> {
        let here = self.here();
        for (index, param) in function.params().iter().enumerate() {
            let kind = BufferKind::Parameter {
                function: self.function.clone(),
                index:    u32::try_from(index).unwrap_or(u32::MAX),
            };
            self.allocate(*param, &here, kind)?;
        }

        loop {
            while self.assign_region(&function.body)? {}

            // Whatever is left is only reachable from itself, such as the
            // arguments of a block without predecessors.
            let mut unassigned: Vec<_> = self
                .tensors
                .keys()
                .filter(|v| !self.slices.contains_key(v))
                .copied()
                .collect();
            unassigned.sort();
            match unassigned.first() {
                Some(value) => {
                    self.allocate_local(*value, &here)?;
                }
                None => break,
            }
        }

        self.check_merges(&function.body)
    }

    fn assign_region(&mut self, region: &Region) -> Result<bool> {
        let mut changed = false;
        for block in &region.blocks {
            for op in &block.operations {
                changed |= self.assign_op(op)?;
                for nested in &op.regions {
                    changed |= self.assign_region(nested)?;
                }
                changed |= self.assign_op(op)?;

                for successor in &op.successors {
                    let Some(target) = region.blocks.iter().find(|b| b.id == successor.block) else {
                        continue;
                    };
                    for (arg, incoming) in target.arguments.iter().zip(&successor.args) {
                        changed |= self.adopt(*arg, *incoming);
                    }
                }
            }
        }
        Ok(changed)
    }

    fn assign_op(&mut self, op: &Operation) -> Result<bool> {
        let location = op.location.to_string();
        let mut changed = false;
        match &op.opcode {
            Opcode::Tensor(TensorOp::Insert) => {
                if let (Some(result), Some(dest)) = (op.results.first(), op.operands.get(1)) {
                    changed |= if self.copied_inserts.contains(result) {
                        self.allocate_local(*result, &location)?
                    } else {
                        self.adopt(*result, *dest)
                    };
                }
            }
            Opcode::Tensor(TensorOp::ExtractSlice { .. }) => {
                if let (Some(result), Some(source)) = (op.results.first(), op.operands.first()) {
                    changed |= self.assign_extract_slice(*result, *source, &location)?;
                }
            }
            Opcode::Scf(ScfOp::For(_)) => {
                let arguments = op.body().map(|b| b.arguments.as_slice()).unwrap_or_default();
                for (i, init) in op.loop_inits().iter().enumerate() {
                    if let Some(arg) = arguments.get(i + 1) {
                        changed |= self.adopt(*arg, *init);
                    }
                    if let Some(result) = op.results.get(i) {
                        changed |= self.adopt(*result, *init);
                    }
                }
            }
            Opcode::Scf(ScfOp::If) => {
                for (i, result) in op.results.iter().enumerate() {
                    for region in &op.regions {
                        if let Some(yielded) = yielded(region, i) {
                            changed |= self.adopt(*result, yielded);
                        }
                    }
                }
            }
            _ => {
                for result in &op.results {
                    changed |= self.allocate_local(*result, &location)?;
                }
            }
        }
        Ok(changed)
    }

    fn assign_extract_slice(&mut self, result: ValueId, source: ValueId, location: &str) -> Result<bool> {
        if self.slices.contains_key(&result) {
            return Ok(false);
        }
        if !self.is_contiguous(source, result, location)? {
            return self.allocate_local(result, location);
        }
        let Some(buffer) = self.slices.get(&source).map(|s| s.buffer) else {
            return Ok(false);
        };
        let length = self.byte_size(result, location)?;
        let element = self.tensor(result, location)?.element;
        self.slices.insert(result, SliceType::new(buffer, length, element));
        Ok(true)
    }

    /// Returns `true` if the elements of `result`, as a unit-stride slice of
    /// `source`, are adjacent in memory.
    fn is_contiguous(&self, source: ValueId, result: ValueId, location: &str) -> Result<bool> {
        let extents = |value: ValueId| -> Result<Vec<u64>> {
            let tensor = self.tensor(value, location)?;
            tensor.extents().ok_or_else(|| Error::IllegalTensorShape {
                location: location.to_string(),
                ty:       tensor.to_string(),
            })
        };
        let (outer, inner) = (extents(source)?, extents(result)?);
        if outer.len() != inner.len() {
            return Err(Error::CompilationFailure(format!(
                "Rank-changing tensor.extract_slice at {location} is not supported"
            )));
        }

        // Leading unit dimensions, then one partial dimension, then only full
        // dimensions.
        let Some(partial) = inner.iter().position(|e| *e != 1) else {
            return Ok(true);
        };
        Ok(inner[partial + 1..] == outer[partial + 1..])
    }

    /// Checks that the values meeting at every merge point share storage.
    fn check_merges(&self, region: &Region) -> Result<()> {
        for block in &region.blocks {
            for op in &block.operations {
                let location = op.location.to_string();
                match &op.opcode {
                    Opcode::Scf(ScfOp::For(_)) => {
                        if let Some(body) = op.body() {
                            let carried = body.arguments.iter().skip(1);
                            for (i, arg) in carried.enumerate() {
                                if let Some(yielded) = yielded(&op.regions[0], i) {
                                    self.check_merge(*arg, yielded, &location)?;
                                }
                            }
                        }
                    }
                    Opcode::Scf(ScfOp::If) => {
                        for (i, result) in op.results.iter().enumerate() {
                            for region in &op.regions {
                                if let Some(yielded) = yielded(region, i) {
                                    self.check_merge(*result, yielded, &location)?;
                                }
                            }
                        }
                    }
                    _ => (),
                }
                for successor in &op.successors {
                    if let Some(target) = region.blocks.iter().find(|b| b.id == successor.block) {
                        for (arg, incoming) in target.arguments.iter().zip(&successor.args) {
                            self.check_merge(*arg, *incoming, &location)?;
                        }
                    }
                }
                for nested in &op.regions {
                    self.check_merges(nested)?;
                }
            }
        }
        Ok(())
    }

    fn check_merge(&self, target: ValueId, incoming: ValueId, location: &str) -> Result<()> {
        let (Some(expected), Some(actual)) = (self.slices.get(&target), self.slices.get(&incoming)) else {
            return Ok(());
        };
        if expected.same_storage(actual) {
            Ok(())
        } else {
            Err(Error::ConflictingBufferAssignment {
                location: location.to_string(),
                message:  format!(
                    "{incoming} is stored in {} but flows into {target}, which is stored in {}",
                    actual.buffer, expected.buffer
                ),
            })
        }
    }

    /// Rewrites the tensor operations of `function` and retypes its values.
    fn lower(&mut self, function: &mut Function) -> Result<()> {
        self.lower_region(&mut function.body, &mut function.values)?;

        for (value, slice) in &self.slices {
            function.values.set_type(*value, Type::Slice(slice.clone()));
        }

        let mut aliases: Vec<_> = self.aliases.keys().copied().collect();
        aliases.sort();
        for alias in aliases {
            let target = self.resolve(alias);
            function.replace_all_uses(alias, target);
        }

        let mut returned = Vec::new();
        for block in &function.body.blocks {
            if let Some(ret) = block.terminator() {
                if ret.opcode == Opcode::Func(FuncOp::Return) {
                    returned.extend(ret.operands.iter().copied().enumerate());
                }
            }
        }
        for (index, value) in returned {
            let is_tensor = function.result_types.get(index).is_some_and(Type::is_tensor);
            if let (true, Some(slice)) = (is_tensor, self.slices.get(&value)) {
                function.result_types[index] = Type::Slice(slice.clone());
            }
        }
        Ok(())
    }

    fn resolve(&self, mut value: ValueId) -> ValueId {
        while let Some(target) = self.aliases.get(&value) {
            value = *target;
        }
        value
    }

    fn lower_region(&mut self, region: &mut Region, values: &mut ValueTable) -> Result<()> {
        for block in &mut region.blocks {
            let operations = std::mem::take(&mut block.operations);
            let mut lowered = Vec::with_capacity(operations.len());
            for mut op in operations {
                for nested in &mut op.regions {
                    self.lower_region(nested, values)?;
                }
                match &op.opcode {
                    Opcode::Tensor(tensor_op) => {
                        let tensor_op = tensor_op.clone();
                        lowered.extend(self.lower_op(&tensor_op, op, values)?);
                    }
                    _ => lowered.push(op),
                }
            }
            block.operations = lowered;
        }
        Ok(())
    }

    fn lower_op(&mut self, tensor_op: &TensorOp, op: Operation, values: &mut ValueTable) -> Result<Vec<Operation>> {
        let location = op.location.to_string();
        let operand = |i: usize| {
            op.operands.get(i).copied().ok_or_else(|| Error::MalformedModule {
                location: location.clone(),
                message:  format!("{} is missing operands", op.opcode),
            })
        };

        let lowered = match tensor_op {
            TensorOp::Empty => {
                let alloc = Operation::new(Opcode::Mem(MemOp::Alloc), vec![], op.results.clone());
                vec![alloc.at(op.location.clone())]
            }
            TensorOp::Extract => {
                let tensor = self.tensor(operand(0)?, &location)?;
                let indices = (0..tensor.shape.len()).map(dim).collect::<Result<Vec<_>>>()?;
                let offset = row_major_offset(tensor, indices, &location)?;
                let load = Operation::new(
                    Opcode::Mem(MemOp::Load { offset }),
                    op.operands.clone(),
                    op.results.clone(),
                );
                vec![load.at(op.location.clone())]
            }
            TensorOp::Insert => {
                let dest = operand(1)?;
                let tensor = self.tensor(dest, &location)?;
                let rank = tensor.shape.len();
                let indices = (0..rank).map(dim).collect::<Result<Vec<_>>>()?;
                let offset = row_major_offset(tensor, indices, &location)?;

                let mut lowered = Vec::new();
                let mut operands = op.operands.clone();
                match op.results.first() {
                    Some(result) if self.copied_inserts.contains(result) => {
                        self.copies += 1;
                        let origin = vec![AffineExpr::constant(0); rank];
                        lowered = self.copy_nest(&op.location, dest, *result, &origin, &[], values)?;
                        operands[1] = *result;
                    }
                    Some(result) => {
                        self.aliases.insert(*result, dest);
                    }
                    None => (),
                }
                let store = Operation::new(Opcode::Mem(MemOp::Store { offset }), operands, vec![]);
                lowered.push(store.at(op.location.clone()));
                lowered
            }
            TensorOp::ExtractSlice { offsets } => {
                let source = operand(0)?;
                let result = op.results.first().copied().ok_or_else(|| Error::MalformedModule {
                    location: location.clone(),
                    message:  "tensor.extract_slice has no result".to_string(),
                })?;
                if self.is_contiguous(source, result, &location)? {
                    let tensor = self.tensor(source, &location)?;
                    let offset = row_major_offset(tensor, offsets.clone(), &location)?;
                    let subslice = Operation::new(
                        Opcode::Mem(MemOp::Subslice { offset }),
                        op.operands.clone(),
                        op.results.clone(),
                    );
                    vec![subslice.at(op.location.clone())]
                } else {
                    self.copies += 1;
                    self.copy_nest(&op.location, source, result, offsets, &op.operands[1..], values)?
                }
            }
        };
        Ok(lowered)
    }

    /// Materializes the slice `result` of `source`, starting at `offsets`
    /// over the `outer` index operands, into the buffer of `result` one
    /// element at a time.
    fn copy_nest(
        &mut self,
        at: &Location,
        source: ValueId,
        result: ValueId,
        offsets: &[AffineExpr],
        outer: &[ValueId],
        values: &mut ValueTable,
    ) -> Result<Vec<Operation>> {
        let location = at.to_string();
        let source_type = self.tensor(source, &location)?.clone();
        let result_type = self.tensor(result, &location)?.clone();
        let extents = result_type.extents().ok_or_else(|| Error::IllegalTensorShape {
            location: location.clone(),
            ty:       result_type.to_string(),
        })?;

        // The induction variables follow the outer index operands.
        let index_count = outer.len();
        let induction_vars: Vec<_> = extents.iter().map(|_| values.add(Type::INDEX)).collect();
        let iv_dims = (0..extents.len())
            .map(|k| dim(index_count + k))
            .collect::<Result<Vec<_>>>()?;

        let read_at = offsets.iter().zip(&iv_dims).map(|(o, d)| o.clone() + d.clone()).collect();
        let read_offset = row_major_offset(&source_type, read_at, &location)?;
        let write_offset = row_major_offset(&result_type, iv_dims, &location)?;

        let indices: Vec<_> = outer.iter().chain(&induction_vars).copied().collect();
        let element = values.add(source_type.element.into());
        let load = Operation::new(
            Opcode::Mem(MemOp::Load {
                offset: read_offset,
            }),
            std::iter::once(source).chain(indices.iter().copied()).collect(),
            vec![element],
        );
        let store = Operation::new(
            Opcode::Mem(MemOp::Store {
                offset: write_offset,
            }),
            [element, result].into_iter().chain(indices.iter().copied()).collect(),
            vec![],
        );

        let mut body = vec![load.at(at.clone()), store.at(at.clone())];
        for (extent, iv) in extents.iter().zip(&induction_vars).rev() {
            body.push(Operation::new(Opcode::Scf(ScfOp::Yield), vec![], vec![]).at(at.clone()));
            let mut block = Block::new(self.new_block_id(), vec![*iv]);
            block.operations = body;

            let bounds = LoopBounds {
                lower:          AffineExpr::constant(0),
                upper:          AffineExpr::constant(i64::try_from(*extent).unwrap_or(i64::MAX)),
                step:           1,
                bound_operands: 0,
            };
            let for_op = Operation::new(Opcode::Scf(ScfOp::For(bounds)), vec![], vec![])
                .with_region(Region::single(block))
                .at(at.clone());
            body = vec![for_op];
        }

        let alloc = Operation::new(Opcode::Mem(MemOp::Alloc), vec![], vec![result]).at(at.clone());
        Ok(std::iter::once(alloc).chain(body).collect())
    }

    fn new_block_id(&mut self) -> klo_ir::BlockId {
        self.next_block += 1;
        klo_ir::BlockId::new(self.next_block - 1)
    }
}

/// One level of nesting: the block of a region, and the position within it.
///
/// Block arguments sit at position zero and the `i`th operation at `i + 1`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct Step {
    region:   usize,
    block:    usize,
    position: usize,
}

impl Step {
    fn same_block(self, other: Self) -> bool {
        self.region == other.region && self.block == other.block
    }
}

type Path = Vec<Step>;

/// Where the values of a function are defined and used.
#[derive(Debug, Default)]
struct Liveness {
    definitions: HashMap<ValueId, Path>,
    uses:        HashMap<ValueId, Vec<Path>>,
    loops:       HashSet<Path>,

    /// The result, destination, and path of every `tensor.insert`.
    inserts: Vec<(ValueId, ValueId, Path)>,
}

impl Liveness {
    fn of(body: &Region) -> Self {
        let mut liveness = Self::default();
        liveness.visit(body, 0, &mut Vec::new());
        liveness
    }

    fn visit(&mut self, region: &Region, index: usize, path: &mut Path) {
        for (b, block) in region.blocks.iter().enumerate() {
            path.push(Step {
                region:   index,
                block:    b,
                position: 0,
            });
            for arg in &block.arguments {
                self.definitions.insert(*arg, path.clone());
            }
            for (i, op) in block.operations.iter().enumerate() {
                if let Some(step) = path.last_mut() {
                    step.position = i + 1;
                }
                for result in &op.results {
                    self.definitions.insert(*result, path.clone());
                }
                for value in op.uses() {
                    self.uses.entry(value).or_default().push(path.clone());
                }
                match op.opcode {
                    Opcode::Scf(ScfOp::For(_)) => {
                        self.loops.insert(path.clone());
                    }
                    Opcode::Tensor(TensorOp::Insert) => {
                        if let (Some(result), Some(dest)) = (op.results.first(), op.operands.get(1)) {
                            self.inserts.push((*result, *dest, path.clone()));
                        }
                    }
                    _ => (),
                }
                for (r, nested) in op.regions.iter().enumerate() {
                    self.visit(nested, r, path);
                }
            }
            path.pop();
        }
    }

    /// Returns `true` if the insert at `at` may store into the buffer of
    /// `dest` without any later reader observing the change.
    fn writes_in_place(&self, dest: ValueId, at: &[Step]) -> bool {
        let Some(definition) = self.definitions.get(&dest) else {
            return false;
        };

        // The destination must be defined earlier in a block enclosing the
        // insert, with no loop in between.
        let shared = common_prefix(definition, at);
        let (Some(defined), Some(inserted)) = (definition.get(shared), at.get(shared)) else {
            return false;
        };
        if shared + 1 != definition.len() || !defined.same_block(*inserted) || defined.position >= inserted.position {
            return false;
        }
        if (shared..at.len() - 1).any(|level| self.loops.contains(&at[..=level])) {
            return false;
        }

        self.uses
            .get(&dest)
            .into_iter()
            .flatten()
            .filter(|path| path.as_slice() != at)
            .all(|path| precedes(path, at))
    }
}

fn common_prefix(a: &[Step], b: &[Step]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Returns `true` if the operation at `path` always runs before the one at
/// `at`, or encloses it.
fn precedes(path: &[Step], at: &[Step]) -> bool {
    let shared = common_prefix(path, at);
    match (path.get(shared), at.get(shared)) {
        (None, Some(_)) => true,
        (Some(step), Some(other)) => step.same_block(*other) && step.position < other.position,
        _ => false,
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

fn dim(position: usize) -> Result<AffineExpr> {
    let position = u32::try_from(position)
        .map_err(|_| Error::CompilationFailure(format!("Too many index operands: {position}")))?;
    Ok(AffineExpr::dim(position))
}

/// Computes the byte offset of the element of `tensor` at `indices` in its
/// row-major layout.
fn row_major_offset(tensor: &TensorType, indices: Vec<AffineExpr>, location: &str) -> Result<AffineExpr> {
    let illegal = || Error::IllegalTensorShape {
        location: location.to_string(),
        ty:       tensor.to_string(),
    };
    let strides = tensor.strides().ok_or_else(illegal)?;
    let element = tensor.element.byte_size();

    let mut offset: Option<AffineExpr> = None;
    for (index, stride) in indices.into_iter().zip(strides) {
        let scale = stride
            .checked_mul(element)
            .and_then(|s| i64::try_from(s).ok())
            .ok_or_else(illegal)?;
        let term = index * scale;
        offset = Some(match offset {
            None => term,
            Some(acc) => acc + term,
        });
    }
    Ok(offset.unwrap_or(AffineExpr::constant(0)))
}

#[cfg(test)]
mod test {
    use klo_errors::compile::Error;
    use klo_ir::{
        affine::AffineExpr,
        builder::FunctionBuilder,
        module::BufferKind,
        op::{MemOp, Opcode, ScfOp},
        types::{Dim, ScalarType, TensorType, Type},
        Module,
    };

    use crate::pass::{
        data::DynPassDataMap,
        lower_tensors::{LowerTensors, LowerTensorsData},
        verify::{verify, Legality},
        PassOps,
    };

    fn lower(module: Module) -> anyhow::Result<(Module, LowerTensorsData)> {
        let result = LowerTensors::new().run(module, &DynPassDataMap::new())?;
        let data = result.unwrap_data_as::<LowerTensorsData>().clone();
        Ok((result.module, data))
    }

    fn opcodes(module: &Module) -> Vec<String> {
        let mut opcodes = Vec::new();
        module.functions[0].walk_ops(&mut |op| opcodes.push(op.opcode.to_string()));
        opcodes
    }

    #[test]
    fn extracts_become_loads_from_parameter_buffers() -> anyhow::Result<()> {
        let ty = Type::tensor(&[4, 8], ScalarType::F32);
        let mut builder = FunctionBuilder::new("kernel", &[ty], &[Type::scalar(ScalarType::F32)]);
        let t = builder.params()[0];
        let i = builder.index(1);
        let j = builder.index(2);
        let x = builder.extract(t, &[i, j]);
        builder.ret(&[x]);
        let (module, data) = lower(Module::new("m").with_function(builder.finish()))?;

        verify(&module, Legality::Buffer)?;
        assert_eq!(data.parameters, 1);

        let buffer = module.allocations.iter().next().cloned();
        assert_eq!(buffer.as_ref().map(|b| b.name.as_str()), Some("kernel.arg0"));
        assert_eq!(buffer.as_ref().map(|b| b.size), Some(128));
        assert!(matches!(
            buffer.map(|b| b.kind),
            Some(BufferKind::Parameter { index: 0, .. })
        ));

        let mut offset = None;
        module.functions[0].walk_ops(&mut |op| {
            if let Opcode::Mem(MemOp::Load { offset: o }) = &op.opcode {
                offset = Some(o.clone());
            }
        });
        assert_eq!(offset, Some(AffineExpr::dim(0) * 32 + AffineExpr::dim(1) * 4));

        Ok(())
    }

    #[test]
    fn inserts_write_through_to_their_destination() -> anyhow::Result<()> {
        let ty = Type::tensor(&[4], ScalarType::F32);
        let f32 = Type::scalar(ScalarType::F32);
        let mut builder = FunctionBuilder::new("fill", &[ty.clone(), f32], &[ty]);
        let params = builder.params();
        let (t, x) = (params[0], params[1]);
        let i = builder.index(0);
        let j = builder.index(1);
        let first = builder.insert(x, t, &[i]);
        let second = builder.insert(x, first, &[j]);
        builder.ret(&[second]);
        let (module, _) = lower(Module::new("m").with_function(builder.finish()))?;

        verify(&module, Legality::Buffer)?;
        let function = &module.functions[0];
        let mut stored_into = Vec::new();
        function.walk_ops(&mut |op| {
            if matches!(op.opcode, Opcode::Mem(MemOp::Store { .. })) {
                stored_into.push(op.operands[1]);
            }
        });
        assert_eq!(stored_into, vec![t, t]);

        let ret = function.body.blocks[0].terminator().map(|r| r.operands.clone());
        assert_eq!(ret, Some(vec![t]));
        assert!(function.result_types[0].as_slice().is_some());

        Ok(())
    }

    #[test]
    fn inserts_copy_destinations_that_are_read_afterwards() -> anyhow::Result<()> {
        let ty = Type::tensor(&[4], ScalarType::F32);
        let f32 = Type::scalar(ScalarType::F32);
        let mut builder = FunctionBuilder::new("update", &[ty, f32.clone()], &[f32.clone(), f32]);
        let params = builder.params();
        let (t, x) = (params[0], params[1]);
        let i = builder.index(1);
        let updated = builder.insert(x, t, &[i]);
        let before = builder.extract(t, &[i]);
        let after = builder.extract(updated, &[i]);
        builder.ret(&[before, after]);
        let (module, data) = lower(Module::new("m").with_function(builder.finish()))?;

        verify(&module, Legality::Buffer)?;
        assert_eq!(data.copies, 1);
        assert_eq!(data.locals, 1);

        let function = &module.functions[0];
        let buffer = |v| function.value_type(v).as_slice().map(|s| s.buffer);
        assert_ne!(buffer(updated), buffer(t));

        let mut loaded_from = Vec::new();
        let mut stored_into = Vec::new();
        function.walk_ops(&mut |op| match op.opcode {
            Opcode::Mem(MemOp::Load { .. }) => loaded_from.push(op.operands[0]),
            Opcode::Mem(MemOp::Store { .. }) => stored_into.push(op.operands[1]),
            _ => (),
        });
        assert_eq!(loaded_from, vec![t, t, updated]);
        assert_eq!(stored_into, vec![updated, updated]);

        Ok(())
    }

    #[test]
    fn inserts_after_the_last_read_stay_in_place() -> anyhow::Result<()> {
        let ty = Type::tensor(&[4], ScalarType::F32);
        let f32 = Type::scalar(ScalarType::F32);
        let mut builder = FunctionBuilder::new("swap", &[ty.clone()], &[ty]);
        let t = builder.params()[0];
        let (i, j) = (builder.index(0), builder.index(3));
        let first = builder.extract(t, &[i]);
        let last = builder.extract(t, &[j]);
        let partial = builder.insert(last, t, &[i]);
        let swapped = builder.insert(first, partial, &[j]);
        builder.ret(&[swapped]);
        let (module, data) = lower(Module::new("m").with_function(builder.finish()))?;

        verify(&module, Legality::Buffer)?;
        assert_eq!(data.copies, 0);
        assert_eq!(data.locals, 0);
        assert_eq!(module.functions[0].value_type(first), &f32);

        Ok(())
    }

    #[test]
    fn inserts_in_loops_copy_destinations_defined_outside() -> anyhow::Result<()> {
        let ty = Type::tensor(&[8], ScalarType::F32);
        let mut builder = FunctionBuilder::new("scatter", &[ty, Type::scalar(ScalarType::F32)], &[]);
        let params = builder.params();
        let (t, x) = (params[0], params[1]);
        builder.for_loop(
            AffineExpr::constant(0),
            AffineExpr::constant(8),
            1,
            &[],
            &[],
            |b, iv, _| {
                b.insert(x, t, &[iv]);
                vec![]
            },
        );
        builder.ret(&[]);
        let (module, data) = lower(Module::new("m").with_function(builder.finish()))?;

        verify(&module, Legality::Buffer)?;
        assert_eq!(data.copies, 1);
        let mut stored_into_parameter = false;
        module.functions[0].walk_ops(&mut |op| {
            if matches!(op.opcode, Opcode::Mem(MemOp::Store { .. })) {
                stored_into_parameter |= op.operands[1] == t;
            }
        });
        assert!(!stored_into_parameter);

        Ok(())
    }

    #[test]
    fn unbounded_dimensions_are_illegal() {
        let ty = Type::Tensor(TensorType {
            shape:   vec![Dim::Static(4), Dim::Dynamic { bound: None }],
            element: ScalarType::F32,
        });
        let mut builder = FunctionBuilder::new("f", &[ty], &[]);
        builder.ret(&[]);

        let result = LowerTensors::new().run(
            Module::new("m").with_function(builder.finish()),
            &DynPassDataMap::new(),
        );
        assert!(matches!(result, Err(Error::IllegalTensorShape { .. })));
    }

    #[test]
    fn bounded_dimensions_are_padded() -> anyhow::Result<()> {
        let ty = Type::Tensor(TensorType {
            shape:   vec![Dim::Dynamic { bound: Some(16) }],
            element: ScalarType::I32,
        });
        let mut builder = FunctionBuilder::new("f", &[], &[]);
        builder.tensor_empty(ty);
        builder.ret(&[]);
        let (module, data) = lower(Module::new("m").with_function(builder.finish()))?;

        assert_eq!(data.locals, 1);
        assert_eq!(module.allocations.iter().next().map(|b| b.size), Some(64));
        assert_eq!(opcodes(&module), vec!["mem.alloc", "func.return"]);

        Ok(())
    }

    #[test]
    fn contiguous_slices_share_their_buffer() -> anyhow::Result<()> {
        let ty = Type::tensor(&[4, 4], ScalarType::F32);
        let mut builder = FunctionBuilder::new("rows", &[ty, Type::INDEX], &[]);
        let params = builder.params();
        let (t, i) = (params[0], params[1]);
        let offsets = vec![AffineExpr::dim(0), AffineExpr::constant(0)];
        let row = builder.extract_slice(t, offsets, &[i], Type::tensor(&[1, 4], ScalarType::F32));
        builder.ret(&[]);
        let (module, data) = lower(Module::new("m").with_function(builder.finish()))?;

        assert_eq!(data.copies, 0);
        assert_eq!(module.allocations.len(), 1);
        let function = &module.functions[0];
        let (source, slice) = (function.value_type(t), function.value_type(row));
        assert_eq!(source.as_slice().map(|s| s.buffer), slice.as_slice().map(|s| s.buffer));
        assert_eq!(slice.as_slice().map(|s| s.length), Some(16));
        assert_eq!(opcodes(&module), vec!["mem.subslice", "func.return"]);

        Ok(())
    }

    #[test]
    fn strided_slices_are_copied() -> anyhow::Result<()> {
        let ty = Type::tensor(&[4, 4], ScalarType::F32);
        let mut builder = FunctionBuilder::new("tile", &[ty], &[]);
        let t = builder.params()[0];
        let offsets = vec![AffineExpr::constant(1), AffineExpr::constant(1)];
        builder.extract_slice(t, offsets, &[], Type::tensor(&[2, 2], ScalarType::F32));
        builder.ret(&[]);
        let (module, data) = lower(Module::new("m").with_function(builder.finish()))?;

        verify(&module, Legality::Buffer)?;
        assert_eq!(data.copies, 1);
        assert_eq!(data.locals, 1);
        assert_eq!(opcodes(&module), vec![
            "mem.alloc",
            "scf.for",
            "scf.for",
            "mem.load",
            "mem.store",
            "scf.yield",
            "scf.yield",
            "func.return",
        ]);

        Ok(())
    }

    #[test]
    fn loop_carried_tensors_keep_their_buffer() -> anyhow::Result<()> {
        let ty = Type::tensor(&[8], ScalarType::F32);
        let mut builder = FunctionBuilder::new("fill", &[], &[]);
        let empty = builder.tensor_empty(ty);
        let one = builder.constant_float(1.0, ScalarType::F32);
        let results = builder.for_loop(
            AffineExpr::constant(0),
            AffineExpr::constant(8),
            1,
            &[],
            &[empty],
            |b, iv, carried| vec![b.insert(one, carried[0], &[iv])],
        );
        builder.ret(&[]);
        let (module, data) = lower(Module::new("m").with_function(builder.finish()))?;

        verify(&module, Legality::Buffer)?;
        assert_eq!(data.locals, 1);
        let function = &module.functions[0];
        let buffer = |v| function.value_type(v).as_slice().map(|s| s.buffer);
        assert_eq!(buffer(results[0]), buffer(empty));

        let mut yields = Vec::new();
        function.walk_ops(&mut |op| {
            if op.opcode == Opcode::Scf(ScfOp::Yield) {
                yields.push(op.operands.clone());
            }
        });
        let body_arg = function.body.blocks[0].operations[2].body().map(|b| b.arguments[1]);
        assert_eq!(yields, vec![body_arg.into_iter().collect::<Vec<_>>()]);

        Ok(())
    }

    #[test]
    fn branches_yielding_different_buffers_conflict() {
        let ty = Type::tensor(&[8], ScalarType::F32);
        let mut builder = FunctionBuilder::new("pick", &[Type::I1], &[]);
        let cond = builder.params()[0];
        builder.if_else(
            cond,
            &[ty.clone()],
            |b| vec![b.tensor_empty(ty.clone())],
            |b| vec![b.tensor_empty(ty.clone())],
        );
        builder.ret(&[]);

        let result = LowerTensors::new().run(
            Module::new("m").with_function(builder.finish()),
            &DynPassDataMap::new(),
        );
        assert!(matches!(result, Err(Error::ConflictingBufferAssignment { .. })));
    }
}
