//! Utilities for constructing IR.
//!
//! - [`OpBuilder`] accumulates a straight-line sequence of operations while
//!   allocating their results in a function's value table. Passes use it to
//!   build the replacement for an operation that they rewrite.
//! - [`FunctionBuilder`] constructs a whole function, including structured
//!   control flow and additional basic blocks.

use crate::{
    affine::AffineExpr,
    ids::{BlockId, ValueId},
    module::{Block, Function, Location, Operation, Region, ValueTable},
    op::{
        ArithOp,
        Attribute,
        CfOp,
        FloatPredicate,
        FuncOp,
        IndexOp,
        IntPredicate,
        LoopBounds,
        MemOp,
        Opcode,
        ScfOp,
        TensorOp,
    },
    range::Interval,
    types::{ScalarType, Type},
};

/// Builds a sequence of operations whose results live in the provided value
/// table.
#[derive(Debug)]
pub struct OpBuilder<'v> {
    values:   &'v mut ValueTable,
    ops:      Vec<Operation>,
    location: Location,
}

impl<'v> OpBuilder<'v> {
    /// Creates a builder whose operations will be placed at `location`.
    pub fn new(values: &'v mut ValueTable, location: Location) -> Self {
        let ops = Vec::new();
        Self {
            values,
            ops,
            location,
        }
    }

    /// Gets the type of `value`.
    #[must_use]
    pub fn value_type(&self, value: ValueId) -> &Type {
        self.values.ty(value)
    }

    /// Adds a new value of type `ty` without defining it.
    pub fn new_value(&mut self, ty: Type) -> ValueId {
        self.values.add(ty)
    }

    /// Appends an already-constructed operation, placing it at the builder's
    /// location if it does not have one of its own.
    pub fn push_op(&mut self, mut op: Operation) {
        if op.location.is_unknown() {
            op.location = self.location.clone();
        }
        self.ops.push(op);
    }

    /// Appends an operation with freshly created results of `result_types`,
    /// returning the results.
    pub fn push(
        &mut self,
        opcode: Opcode,
        operands: &[ValueId],
        result_types: &[Type],
    ) -> Vec<ValueId> {
        let results: Vec<_> = result_types.iter().map(|t| self.values.add(t.clone())).collect();
        self.push_into(opcode, operands, results.clone());
        results
    }

    /// Appends an operation with a single result of type `ty`.
    pub fn push_one(&mut self, opcode: Opcode, operands: &[ValueId], ty: Type) -> ValueId {
        let result = self.values.add(ty);
        self.push_into(opcode, operands, vec![result]);
        result
    }

    /// Appends an operation that defines the existing `results`.
    ///
    /// This is used when rewriting an operation in place, such that the users
    /// of its results do not have to be updated.
    pub fn push_into(&mut self, opcode: Opcode, operands: &[ValueId], results: Vec<ValueId>) {
        let op = Operation::new(opcode, operands.to_vec(), results);
        self.push_op(op);
    }

    /// Materializes the integer constant `value` of type `ty`.
    pub fn constant_int(&mut self, value: i64, ty: ScalarType) -> ValueId {
        let result = self.values.add(ty.into());
        let op = Operation::new(Opcode::Arith(ArithOp::Constant), vec![], vec![result])
            .with_attribute("value", Attribute::Int(value));
        self.push_op(op);
        result
    }

    /// Materializes the floating point constant `value` of type `ty`.
    pub fn constant_float(&mut self, value: f64, ty: ScalarType) -> ValueId {
        let result = self.values.add(ty.into());
        let op = Operation::new(Opcode::Arith(ArithOp::Constant), vec![], vec![result])
            .with_attribute("value", Attribute::Float(value));
        self.push_op(op);
        result
    }

    /// Appends the arithmetic operation `op`, inferring its result type from
    /// its operands.
    pub fn arith(&mut self, op: ArithOp, operands: &[ValueId]) -> ValueId {
        let ty = match op {
            ArithOp::CmpI(_) | ArithOp::CmpF(_) => Type::I1,
            ArithOp::Select => operands.get(1).map_or(Type::I1, |v| self.value_type(*v).clone()),
            _ => operands.first().map_or(Type::INDEX, |v| self.value_type(*v).clone()),
        };
        self.push_one(Opcode::Arith(op), operands, ty)
    }

    /// Appends the conversion `op` of `value` to the type `to`.
    pub fn cast(&mut self, op: ArithOp, value: ValueId, to: ScalarType) -> ValueId {
        self.push_one(Opcode::Arith(op), &[value], to.into())
    }

    /// Gets the operations built so far.
    #[must_use]
    pub fn finish(self) -> Vec<Operation> {
        self.ops
    }
}

/// Builds a function from scratch.
///
/// Operations are appended to the current insertion block. Structured control
/// flow is built by [`Self::for_loop`] and [`Self::if_else`], which take
/// closures that build the nested regions, while additional top-level blocks
/// are created with [`Self::block`] and selected with [`Self::switch_to`].
#[derive(Debug)]
pub struct FunctionBuilder {
    function: Function,
    top:      Vec<Block>,
    current:  usize,
    nested:   Vec<Block>,
    location: Location,
}

impl FunctionBuilder {
    /// Starts building a function with the provided signature.
    #[must_use]
    pub fn new(name: &str, params: &[Type], results: &[Type]) -> Self {
        let mut function = Function::new(name, params, results);
        let top = std::mem::take(&mut function.body.blocks);
        Self {
            function,
            top,
            current: 0,
            nested: Vec::new(),
            location: Location::unknown(),
        }
    }

    /// Gets the parameters of the function.
    #[must_use]
    pub fn params(&self) -> Vec<ValueId> {
        self.top.first().map(|b| b.arguments.clone()).unwrap_or_default()
    }

    /// Gets the type of `value`.
    #[must_use]
    pub fn value_type(&self, value: ValueId) -> &Type {
        self.function.value_type(value)
    }

    /// Sets the location of the operations built from now on.
    pub fn set_location(&mut self, location: Location) {
        self.location = location;
    }

    /// Declares that the index parameter `param` lies within `range`.
    pub fn declare_range(&mut self, param: ValueId, range: Interval) {
        self.function.param_ranges.insert(param, range);
    }

    fn insertion_block(&mut self) -> &mut Block {
        match self.nested.last_mut() {
            Some(block) => block,
            None => &mut self.top[self.current],
        }
    }

    /// Appends an already-constructed operation.
    pub fn push_op(&mut self, mut op: Operation) {
        if op.location.is_unknown() {
            op.location = self.location.clone();
        }
        self.insertion_block().operations.push(op);
    }

    /// Appends an operation with freshly created results of `result_types`.
    pub fn push(
        &mut self,
        opcode: Opcode,
        operands: &[ValueId],
        result_types: &[Type],
    ) -> Vec<ValueId> {
        let results: Vec<_> = result_types
            .iter()
            .map(|t| self.function.new_value(t.clone()))
            .collect();
        self.push_op(Operation::new(opcode, operands.to_vec(), results.clone()));
        results
    }

    /// Appends an operation with a single result of type `ty`.
    pub fn push_one(&mut self, opcode: Opcode, operands: &[ValueId], ty: Type) -> ValueId {
        let result = self.function.new_value(ty);
        self.push_op(Operation::new(opcode, operands.to_vec(), vec![result]));
        result
    }

    /// Runs `build` with an [`OpBuilder`] whose operations are appended to the
    /// insertion block.
    pub fn with_ops<T>(&mut self, build: impl FnOnce(&mut OpBuilder) -> T) -> T {
        let mut builder = OpBuilder::new(&mut self.function.values, self.location.clone());
        let result = build(&mut builder);
        let ops = builder.finish();
        self.insertion_block().operations.extend(ops);
        result
    }

    /// Materializes an integer constant.
    pub fn constant_int(&mut self, value: i64, ty: ScalarType) -> ValueId {
        self.with_ops(|b| b.constant_int(value, ty))
    }

    /// Materializes a floating point constant.
    pub fn constant_float(&mut self, value: f64, ty: ScalarType) -> ValueId {
        self.with_ops(|b| b.constant_float(value, ty))
    }

    /// Materializes an index constant.
    pub fn index(&mut self, value: i64) -> ValueId {
        self.constant_int(value, ScalarType::Index)
    }

    /// Appends the arithmetic operation `op`, inferring its result type from
    /// its operands.
    pub fn arith(&mut self, op: ArithOp, operands: &[ValueId]) -> ValueId {
        self.with_ops(|b| b.arith(op, operands))
    }

    /// Compares two integers.
    pub fn cmpi(&mut self, predicate: IntPredicate, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.arith(ArithOp::CmpI(predicate), &[lhs, rhs])
    }

    /// Compares two floats.
    pub fn cmpf(&mut self, predicate: FloatPredicate, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.arith(ArithOp::CmpF(predicate), &[lhs, rhs])
    }

    /// Converts `value` to the type `to` with the conversion `op`.
    pub fn cast(&mut self, op: ArithOp, value: ValueId, to: ScalarType) -> ValueId {
        self.with_ops(|b| b.cast(op, value, to))
    }

    /// Evaluates the affine `map` over the index `operands`.
    pub fn apply(&mut self, map: AffineExpr, operands: &[ValueId]) -> ValueId {
        self.push_one(Opcode::Index(IndexOp::Apply { map }), operands, Type::INDEX)
    }

    /// Gets the id of the executing thread along `dim`, which lies in
    /// `[0, upper)`.
    pub fn thread_id(&mut self, dim: u32, upper: u64) -> ValueId {
        self.push_one(Opcode::Index(IndexOp::ThreadId { dim, upper }), &[], Type::INDEX)
    }

    /// Creates an uninitialized tensor of type `ty`.
    pub fn tensor_empty(&mut self, ty: Type) -> ValueId {
        self.push_one(Opcode::Tensor(TensorOp::Empty), &[], ty)
    }

    /// Reads the element of `tensor` at `indices`.
    pub fn extract(&mut self, tensor: ValueId, indices: &[ValueId]) -> ValueId {
        let element = self
            .value_type(tensor)
            .as_tensor()
            .map_or(Type::INDEX, |t| t.element.into());
        let operands: Vec<_> = std::iter::once(tensor).chain(indices.iter().copied()).collect();
        self.push_one(Opcode::Tensor(TensorOp::Extract), &operands, element)
    }

    /// Writes `value` into `dest` at `indices`, returning the updated tensor.
    pub fn insert(&mut self, value: ValueId, dest: ValueId, indices: &[ValueId]) -> ValueId {
        let ty = self.value_type(dest).clone();
        let operands: Vec<_> = [value, dest].into_iter().chain(indices.iter().copied()).collect();
        self.push_one(Opcode::Tensor(TensorOp::Insert), &operands, ty)
    }

    /// Extracts the sub-tensor of type `ty` from `source` at `offsets`, whose
    /// dims refer to `indices`.
    pub fn extract_slice(
        &mut self,
        source: ValueId,
        offsets: Vec<AffineExpr>,
        indices: &[ValueId],
        ty: Type,
    ) -> ValueId {
        let operands: Vec<_> = std::iter::once(source).chain(indices.iter().copied()).collect();
        self.push_one(
            Opcode::Tensor(TensorOp::ExtractSlice { offsets }),
            &operands,
            ty,
        )
    }

    /// Creates a slice of `source` starting `offset` bytes into it.
    pub fn subslice(
        &mut self,
        source: ValueId,
        offset: AffineExpr,
        indices: &[ValueId],
        ty: Type,
    ) -> ValueId {
        let operands: Vec<_> = std::iter::once(source).chain(indices.iter().copied()).collect();
        self.push_one(Opcode::Mem(MemOp::Subslice { offset }), &operands, ty)
    }

    /// Loads a scalar of type `ty` from `offset` bytes into `slice`.
    pub fn load(
        &mut self,
        slice: ValueId,
        offset: AffineExpr,
        indices: &[ValueId],
        ty: ScalarType,
    ) -> ValueId {
        let operands: Vec<_> = std::iter::once(slice).chain(indices.iter().copied()).collect();
        self.push_one(Opcode::Mem(MemOp::Load { offset }), &operands, ty.into())
    }

    /// Stores `value` at `offset` bytes into `slice`.
    pub fn store(&mut self, value: ValueId, slice: ValueId, offset: AffineExpr, indices: &[ValueId]) {
        let operands: Vec<_> = [value, slice].into_iter().chain(indices.iter().copied()).collect();
        self.push(Opcode::Mem(MemOp::Store { offset }), &operands, &[]);
    }

    /// Builds an `scf.for` loop running from `lower` to `upper` (whose dims
    /// refer to `bound_operands`) with the loop-carried values initialized to
    /// `inits`.
    ///
    /// The `body` receives the induction variable and the loop-carried values,
    /// and returns the values to carry into the next iteration. The results of
    /// the loop are returned.
    pub fn for_loop(
        &mut self,
        lower: AffineExpr,
        upper: AffineExpr,
        step: i64,
        bound_operands: &[ValueId],
        inits: &[ValueId],
        body: impl FnOnce(&mut Self, ValueId, &[ValueId]) -> Vec<ValueId>,
    ) -> Vec<ValueId> {
        let carried_types: Vec<_> = inits.iter().map(|v| self.value_type(*v).clone()).collect();
        let block_id = self.function.new_block_id();
        let induction_var = self.function.new_value(Type::INDEX);
        let carried: Vec<_> = carried_types
            .iter()
            .map(|t| self.function.new_value(t.clone()))
            .collect();

        let arguments = std::iter::once(induction_var).chain(carried.iter().copied()).collect();
        self.nested.push(Block::new(block_id, arguments));
        let yielded = body(self, induction_var, &carried);
        self.push(Opcode::Scf(ScfOp::Yield), &yielded, &[]);
        let block = self.pop_nested();

        let bounds = LoopBounds {
            lower,
            upper,
            step,
            bound_operands: u32::try_from(bound_operands.len()).unwrap_or(u32::MAX),
        };
        let operands = bound_operands.iter().chain(inits).copied().collect();
        let results: Vec<_> = carried_types
            .into_iter()
            .map(|t| self.function.new_value(t))
            .collect();
        let op = Operation::new(Opcode::Scf(ScfOp::For(bounds)), operands, results.clone())
            .with_region(Region::single(block));
        self.push_op(op);
        results
    }

    /// Builds an `scf.if` on `condition` producing values of `result_types`.
    ///
    /// Each of the branch builders returns the values that it yields.
    pub fn if_else(
        &mut self,
        condition: ValueId,
        result_types: &[Type],
        then_branch: impl FnOnce(&mut Self) -> Vec<ValueId>,
        else_branch: impl FnOnce(&mut Self) -> Vec<ValueId>,
    ) -> Vec<ValueId> {
        let then_id = self.function.new_block_id();
        self.nested.push(Block::new(then_id, vec![]));
        let yielded = then_branch(self);
        self.push(Opcode::Scf(ScfOp::Yield), &yielded, &[]);
        let then_block = self.pop_nested();

        let else_id = self.function.new_block_id();
        self.nested.push(Block::new(else_id, vec![]));
        let yielded = else_branch(self);
        self.push(Opcode::Scf(ScfOp::Yield), &yielded, &[]);
        let else_block = self.pop_nested();

        let results: Vec<_> = result_types
            .iter()
            .map(|t| self.function.new_value(t.clone()))
            .collect();
        let op = Operation::new(Opcode::Scf(ScfOp::If), vec![condition], results.clone())
            .with_region(Region::single(then_block))
            .with_region(Region::single(else_block));
        self.push_op(op);
        results
    }

    fn pop_nested(&mut self) -> Block {
        // Only ever called after a matching push.
        self.nested
            .pop()
            .unwrap_or_else(|| Block::new(BlockId::default(), vec![]))
    }

    /// Creates a new top-level block with arguments of `arg_types`, returning
    /// its identifier and arguments.
    ///
    /// The insertion block is left unchanged.
    pub fn block(&mut self, arg_types: &[Type]) -> (BlockId, Vec<ValueId>) {
        let id = self.function.new_block_id();
        let args: Vec<_> = arg_types
            .iter()
            .map(|t| self.function.new_value(t.clone()))
            .collect();
        self.top.push(Block::new(id, args.clone()));
        (id, args)
    }

    /// Makes the top-level block `id` the insertion block.
    ///
    /// # Panics
    ///
    /// If called while building a nested region, or if `id` was not created by
    /// this builder.
    pub fn switch_to(&mut self, id: BlockId) {
        assert!(self.nested.is_empty(), "Cannot switch blocks inside a region");
        self.current = self
            .top
            .iter()
            .position(|b| b.id == id)
            .unwrap_or_else(|| panic!("Block {id} does not exist"));
    }

    /// Branches unconditionally to `target`.
    pub fn br(&mut self, target: BlockId, args: &[ValueId]) {
        let op = Operation::new(Opcode::Cf(CfOp::Br), vec![], vec![])
            .with_successor(target, args.to_vec());
        self.push_op(op);
    }

    /// Branches to `if_true` if `condition` is set, and to `if_false`
    /// otherwise.
    pub fn cond_br(
        &mut self,
        condition: ValueId,
        if_true: (BlockId, &[ValueId]),
        if_false: (BlockId, &[ValueId]),
    ) {
        let op = Operation::new(Opcode::Cf(CfOp::CondBr), vec![condition], vec![])
            .with_successor(if_true.0, if_true.1.to_vec())
            .with_successor(if_false.0, if_false.1.to_vec());
        self.push_op(op);
    }

    /// Returns `values` from the function.
    pub fn ret(&mut self, values: &[ValueId]) {
        self.push(Opcode::Func(FuncOp::Return), values, &[]);
    }

    /// Finishes building the function.
    #[must_use]
    pub fn finish(mut self) -> Function {
        self.function.body.blocks = self.top;
        self.function
    }
}

#[cfg(test)]
mod test {
    use crate::{
        affine::AffineExpr,
        builder::FunctionBuilder,
        op::{ArithOp, Opcode, ScfOp},
        types::{ScalarType, Type},
    };

    #[test]
    fn loops_carry_values_through_their_body() {
        let mut builder = FunctionBuilder::new("sum", &[], &[Type::INDEX]);
        let zero = builder.index(0);
        let results = builder.for_loop(
            AffineExpr::constant(0),
            AffineExpr::constant(4),
            1,
            &[],
            &[zero],
            |b, iv, carried| vec![b.arith(ArithOp::AddI, &[carried[0], iv])],
        );
        builder.ret(&results);
        let function = builder.finish();

        let entry = &function.body.blocks[0];
        let for_op = &entry.operations[1];
        assert!(matches!(for_op.opcode, Opcode::Scf(ScfOp::For(_))));
        assert_eq!(for_op.loop_inits(), &[zero]);

        let body = for_op.body().map(|b| b.arguments.len());
        assert_eq!(body, Some(2));
        assert_eq!(function.value_type(results[0]), &Type::INDEX);
    }

    #[test]
    fn branches_create_top_level_blocks() {
        let mut builder = FunctionBuilder::new("f", &[Type::I1], &[Type::scalar(ScalarType::F32)]);
        let cond = builder.params()[0];
        let (exit, args) = builder.block(&[Type::scalar(ScalarType::F32)]);
        let one = builder.constant_float(1.0, ScalarType::F32);
        let two = builder.constant_float(2.0, ScalarType::F32);
        builder.cond_br(cond, (exit, &[one]), (exit, &[two]));
        builder.switch_to(exit);
        builder.ret(&args);
        let function = builder.finish();

        assert_eq!(function.body.blocks.len(), 2);
        assert_eq!(function.body.blocks[1].arguments, args);
        assert!(function.body.blocks.iter().all(|b| b.terminator().is_some()));
    }
}
