//! The containers that make up the IR: modules, functions, regions, blocks and
//! operations.
//!
//! # Ownership
//!
//! A [`Module`] owns its functions and its allocation table outright, and a
//! [`Function`] owns both its body and the table of every value defined within
//! it. Operations and types refer to values, blocks and buffers only by their
//! identifiers (see [`crate::ids`]), which keeps the structure trivially
//! cloneable and serializable, and allows passes to take ownership of a module
//! and hand back a new one.

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};

use serde::{Deserialize, Serialize};

use crate::{
    ids::{BlockId, BufferId, SymbolId, ValueId},
    op::{Attribute, Opcode, ScfOp},
    range::Interval,
    types::{SliceOffset, Type},
};

/// A position in the source that an operation was produced from.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub source: String,
    pub line:   u32,
    pub column: u32,
}

impl Location {
    /// Creates a new location.
    #[must_use]
    pub fn new(source: impl Into<String>, line: u32, column: u32) -> Self {
        let source = source.into();
        Self {
            source,
            line,
            column,
        }
    }

    /// The location used for operations whose origin is unknown, such as those
    /// synthesized from nothing by a pass.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new("", 0, 0)
    }

    /// Returns `true` if this is the unknown location.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.source.is_empty()
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::unknown()
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_unknown() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}:{}:{}", self.source, self.line, self.column)
        }
    }
}

/// A branch target along with the values forwarded to its arguments.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Successor {
    pub block: BlockId,
    pub args:  Vec<ValueId>,
}

/// A single operation in the IR.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub opcode:     Opcode,
    pub operands:   Vec<ValueId>,
    pub results:    Vec<ValueId>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    #[serde(default)]
    pub regions:    Vec<Region>,
    #[serde(default)]
    pub successors: Vec<Successor>,
    #[serde(default)]
    pub location:   Location,
}

impl Operation {
    /// Creates an operation without attributes, regions or successors at an
    /// unknown location.
    #[must_use]
    pub fn new(opcode: Opcode, operands: Vec<ValueId>, results: Vec<ValueId>) -> Self {
        Self {
            opcode,
            operands,
            results,
            attributes: BTreeMap::new(),
            regions: Vec::new(),
            successors: Vec::new(),
            location: Location::unknown(),
        }
    }

    /// Attaches the attribute `name` to the operation.
    #[must_use]
    pub fn with_attribute(mut self, name: &str, attribute: Attribute) -> Self {
        self.attributes.insert(name.to_string(), attribute);
        self
    }

    /// Appends a region to the operation.
    #[must_use]
    pub fn with_region(mut self, region: Region) -> Self {
        self.regions.push(region);
        self
    }

    /// Appends a successor to the operation.
    #[must_use]
    pub fn with_successor(mut self, block: BlockId, args: Vec<ValueId>) -> Self {
        self.successors.push(Successor { block, args });
        self
    }

    /// Sets the location of the operation.
    #[must_use]
    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    /// Gets the attribute `name` if present.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Gets the attribute `name` if present and an integer.
    #[must_use]
    pub fn int_attribute(&self, name: &str) -> Option<i64> {
        self.attribute(name)?.as_int()
    }

    /// Gets the operands that the dims of the opcode's affine payload refer
    /// to.
    #[must_use]
    pub fn index_operands(&self) -> &[ValueId] {
        match (&self.opcode, self.opcode.index_operand_base()) {
            (Opcode::Scf(ScfOp::For(_)), _) => self.bound_operands(),
            (_, Some(base)) => self.operands.get(base..).unwrap_or(&[]),
            (_, None) => &[],
        }
    }

    /// Gets the operands referred to by the bounds of an `scf.for`, or
    /// nothing for any other operation.
    #[must_use]
    pub fn bound_operands(&self) -> &[ValueId] {
        match &self.opcode {
            Opcode::Scf(ScfOp::For(bounds)) => {
                let count = usize::try_from(bounds.bound_operands).unwrap_or(usize::MAX);
                &self.operands[..count.min(self.operands.len())]
            }
            _ => &[],
        }
    }

    /// Gets the initial values of the loop-carried values of an `scf.for`, or
    /// nothing for any other operation.
    #[must_use]
    pub fn loop_inits(&self) -> &[ValueId] {
        match &self.opcode {
            Opcode::Scf(ScfOp::For(_)) => &self.operands[self.bound_operands().len()..],
            _ => &[],
        }
    }

    /// Gets every value used by the operation itself, which includes the
    /// arguments forwarded to its successors but excludes uses within its
    /// regions.
    pub fn uses(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.operands
            .iter()
            .chain(self.successors.iter().flat_map(|s| s.args.iter()))
            .copied()
    }

    /// Replaces every use of `old` by the operation itself with `new`.
    pub fn replace_uses(&mut self, old: ValueId, new: ValueId) -> usize {
        let mut count = 0;
        let uses = self
            .operands
            .iter_mut()
            .chain(self.successors.iter_mut().flat_map(|s| s.args.iter_mut()));
        for value in uses.filter(|v| **v == old) {
            *value = new;
            count += 1;
        }
        count
    }

    /// Gets the body block of an operation with a single-block region, such as
    /// `scf.for`.
    #[must_use]
    pub fn body(&self) -> Option<&Block> {
        self.regions.first()?.blocks.first()
    }
}

/// A straight-line sequence of operations, terminated by exactly one
/// control-transfer operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id:         BlockId,
    pub arguments:  Vec<ValueId>,
    pub operations: Vec<Operation>,
}

impl Block {
    /// Creates an empty block.
    #[must_use]
    pub fn new(id: BlockId, arguments: Vec<ValueId>) -> Self {
        let operations = Vec::new();
        Self {
            id,
            arguments,
            operations,
        }
    }

    /// Gets the terminator of the block, if it has one.
    #[must_use]
    pub fn terminator(&self) -> Option<&Operation> {
        self.operations.last().filter(|op| op.opcode.is_terminator())
    }
}

/// An ordered list of blocks, the first of which is the entry block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub blocks: Vec<Block>,
}

impl Region {
    /// Creates a region consisting of the single `block`.
    #[must_use]
    pub fn single(block: Block) -> Self {
        Self {
            blocks: vec![block],
        }
    }

    /// Calls `visitor` on every operation in the region in program order,
    /// visiting each operation before the operations nested within it.
    pub fn walk_ops<'a>(&'a self, visitor: &mut impl FnMut(&'a Operation)) {
        for block in &self.blocks {
            for op in &block.operations {
                visitor(op);
                for region in &op.regions {
                    region.walk_ops(visitor);
                }
            }
        }
    }

    /// Calls `visitor` on every operation in the region in program order,
    /// allowing the operations to be modified.
    pub fn walk_ops_mut(&mut self, visitor: &mut impl FnMut(&mut Operation)) {
        for block in &mut self.blocks {
            for op in &mut block.operations {
                visitor(op);
                for region in &mut op.regions {
                    region.walk_ops_mut(visitor);
                }
            }
        }
    }

    /// Calls `visitor` on every block in the region and the regions nested
    /// within it.
    pub fn walk_blocks<'a>(&'a self, visitor: &mut impl FnMut(&'a Block)) {
        for block in &self.blocks {
            visitor(block);
            for op in &block.operations {
                for region in &op.regions {
                    region.walk_blocks(visitor);
                }
            }
        }
    }
}

/// The information stored about each value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueData {
    pub ty:   Type,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The arena of values defined by a function, indexed by [`ValueId`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueTable {
    values: Vec<ValueData>,
}

impl ValueTable {
    /// Adds a new value of type `ty` to the table.
    pub fn add(&mut self, ty: Type) -> ValueId {
        let id = ValueId::from(self.values.len());
        self.values.push(ValueData { ty, name: None });
        id
    }

    /// Gets the data for `value`, if it exists.
    #[must_use]
    pub fn get(&self, value: ValueId) -> Option<&ValueData> {
        self.values.get(value.index())
    }

    /// Gets the data for `value` mutably, if it exists.
    pub fn get_mut(&mut self, value: ValueId) -> Option<&mut ValueData> {
        self.values.get_mut(value.index())
    }

    /// Gets the type of `value`.
    ///
    /// # Panics
    ///
    /// If `value` is not part of the table. Values are only ever created by
    /// the table, and verification rejects modules referencing unknown values.
    #[must_use]
    pub fn ty(&self, value: ValueId) -> &Type {
        &self.values[value.index()].ty
    }

    /// Sets the type of `value`, returning `false` if it is not in the table.
    pub fn set_type(&mut self, value: ValueId, ty: Type) -> bool {
        match self.get_mut(value) {
            Some(data) => {
                data.ty = ty;
                true
            }
            None => false,
        }
    }

    /// Gets the number of values in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the table contains no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over every value in the table alongside its data.
    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &ValueData)> {
        self.values.iter().enumerate().map(|(i, d)| (ValueId::from(i), d))
    }

    /// Iterates mutably over every value in the table alongside its data.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ValueId, &mut ValueData)> {
        self.values.iter_mut().enumerate().map(|(i, d)| (ValueId::from(i), d))
    }
}

/// A function in the IR.
///
/// The parameters of the function are the arguments of the entry block of its
/// body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name:         String,
    pub result_types: Vec<Type>,
    pub body:         Region,
    pub values:       ValueTable,

    /// The declared ranges of index parameters.
    #[serde(default)]
    pub param_ranges: BTreeMap<ValueId, Interval>,

    #[serde(default)]
    next_block:  u32,
    #[serde(default)]
    next_symbol: u32,
}

impl Function {
    /// Creates a function with the provided parameter and result types, and an
    /// empty entry block.
    #[must_use]
    pub fn new(name: impl Into<String>, params: &[Type], results: &[Type]) -> Self {
        let mut values = ValueTable::default();
        let arguments = params.iter().map(|ty| values.add(ty.clone())).collect();
        let entry = Block::new(BlockId::new(0), arguments);
        Self {
            name: name.into(),
            result_types: results.to_vec(),
            body: Region::single(entry),
            values,
            param_ranges: BTreeMap::new(),
            next_block: 1,
            next_symbol: 0,
        }
    }

    /// Gets the parameters of the function.
    #[must_use]
    pub fn params(&self) -> &[ValueId] {
        self.body.blocks.first().map_or(&[], |b| b.arguments.as_slice())
    }

    /// Gets the type of `value`.
    ///
    /// # Panics
    ///
    /// If `value` is not defined in this function.
    #[must_use]
    pub fn value_type(&self, value: ValueId) -> &Type {
        self.values.ty(value)
    }

    /// Adds a new value of type `ty` to the function.
    pub fn new_value(&mut self, ty: Type) -> ValueId {
        self.values.add(ty)
    }

    /// Allocates an identifier for a new block of the function.
    pub fn new_block_id(&mut self) -> BlockId {
        self.bump_block_counter();
        BlockId::new(self.next_block - 1)
    }

    /// Allocates a new join symbol for use in affine expressions.
    pub fn new_symbol(&mut self) -> SymbolId {
        self.next_symbol += 1;
        SymbolId::new(self.next_symbol - 1)
    }

    /// Ensures that freshly allocated block identifiers do not collide with
    /// any block already present in the body.
    fn bump_block_counter(&mut self) {
        let mut max = self.next_block;
        self.body.walk_blocks(&mut |b| {
            let next = u32::try_from(b.id.index() + 1).unwrap_or(u32::MAX);
            max = max.max(next);
        });
        self.next_block = max + 1;
    }

    /// Calls `visitor` on every operation of the function in program order.
    pub fn walk_ops<'a>(&'a self, visitor: &mut impl FnMut(&'a Operation)) {
        self.body.walk_ops(visitor);
    }

    /// Calls `visitor` on every operation of the function in program order,
    /// allowing them to be modified.
    pub fn walk_ops_mut(&mut self, visitor: &mut impl FnMut(&mut Operation)) {
        self.body.walk_ops_mut(visitor);
    }

    /// Replaces every use of `old` in the function with `new`, including the
    /// appearance of `old` in the offsets of slice types, returning the number
    /// of operand uses replaced.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) -> usize {
        let mut count = 0;
        self.body.walk_ops_mut(&mut |op| count += op.replace_uses(old, new));
        for (_, data) in self.values.iter_mut() {
            if let Some(SliceOffset::Affine(expr)) = data.ty.as_slice_mut().map(|s| &mut s.offset) {
                expr.replace_value(old, new);
            }
        }
        count
    }

    /// Counts the operations in the function, including nested ones.
    #[must_use]
    pub fn op_count(&self) -> usize {
        let mut count = 0;
        self.walk_ops(&mut |_| count += 1);
        count
    }
}

/// The kind of a buffer.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum BufferKind {
    /// The buffer is provided by the caller through the parameter at `index`
    /// of `function`.
    Parameter { function: String, index: u32 },

    /// The buffer is allocated within `function`.
    Local { function: String },
}

/// A named allocation of a fixed number of bytes.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    pub id:   BufferId,
    pub name: String,
    pub size: u64,
    pub kind: BufferKind,
}

/// The table of every buffer known to a module.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationTable {
    buffers: Vec<Buffer>,
}

impl AllocationTable {
    /// Adds a new buffer to the table, returning its identifier.
    pub fn add(&mut self, name: impl Into<String>, size: u64, kind: BufferKind) -> BufferId {
        let id = BufferId::from(self.buffers.len());
        let name = name.into();
        self.buffers.push(Buffer {
            id,
            name,
            size,
            kind,
        });
        id
    }

    /// Gets the buffer with the provided `id`, if it exists.
    #[must_use]
    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(id.index())
    }

    /// Returns `true` if the buffer `id` exists in the table.
    #[must_use]
    pub fn contains(&self, id: BufferId) -> bool {
        self.get(id).is_some()
    }

    /// Iterates over the buffers in the table.
    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    /// Gets the number of buffers in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns `true` if the table contains no buffers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// The top-level unit handed through the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name:        String,
    pub functions:   Vec<Function>,
    #[serde(default)]
    pub allocations: AllocationTable,
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds `function` to the module.
    #[must_use]
    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    /// Gets the function called `name`, if it exists.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}
