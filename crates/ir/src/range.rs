//! Ranges of index values.
//!
//! Much of the affine simplification machinery relies on knowing the range of
//! values that an index can take. These come from a small set of sources:
//!
//! - The bounds of `scf.for` loops, which bound their induction variables.
//! - The `upper` attribute of `index.thread_id`.
//! - Ranges declared on function parameters.
//! - Index constants.
//! - Applications of affine maps to operands that are themselves ranged.
//!
//! An index value without a range is said to be _unranged_. Unranged values can
//! still take part in affine arithmetic, but no range-based rewrites can be
//! applied to them, and they cannot be the leaves of slice offsets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    affine::{canonical::range_of, AffineExpr, Leaf},
    ids::ValueId,
    module::{Function, Operation},
    op::{ArithOp, IndexOp, Opcode, ScfOp},
    types::ScalarType,
};

/// An inclusive range of integers `[lo, hi]`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lo: i64,
    pub hi: i64,
}

impl Interval {
    /// Creates the range `[lo, hi]`.
    #[must_use]
    pub fn new(lo: i64, hi: i64) -> Self {
        Self { lo, hi }
    }

    /// Creates the range containing only `value`.
    #[must_use]
    pub fn point(value: i64) -> Self {
        Self::new(value, value)
    }

    /// Returns `true` if `value` lies within the range.
    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        self.lo <= value && value <= self.hi
    }

    /// Returns `true` if no value in the range is negative.
    #[must_use]
    pub fn is_non_negative(&self) -> bool {
        self.lo >= 0
    }

    /// Computes the range of `a + b` for `a` in `self` and `b` in `other`,
    /// returning [`None`] if this overflows.
    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        Some(Self::new(
            self.lo.checked_add(other.lo)?,
            self.hi.checked_add(other.hi)?,
        ))
    }

    /// Computes the range of `a * factor` for `a` in `self`, returning [`None`]
    /// if this overflows.
    #[must_use]
    pub fn checked_scale(self, factor: i64) -> Option<Self> {
        let a = self.lo.checked_mul(factor)?;
        let b = self.hi.checked_mul(factor)?;
        Some(Self::new(a.min(b), a.max(b)))
    }

    /// Computes the smallest range containing both `self` and `other`.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self::new(self.lo.min(other.lo), self.hi.max(other.hi))
    }
}

/// The known ranges of the index values of a function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexRanges {
    ranges: HashMap<ValueId, Interval>,
}

impl IndexRanges {
    /// Computes the ranges of every ranged index value in `function`.
    ///
    /// Values are visited in program order, so the range of an operand is
    /// always known by the time the operation that uses it is visited.
    #[must_use]
    pub fn compute(function: &Function) -> Self {
        let mut ranges = Self {
            ranges: function.param_ranges.iter().map(|(v, r)| (*v, *r)).collect(),
        };
        function.walk_ops(&mut |op| ranges.visit(function, op));
        ranges
    }

    /// Gets the range of `value` if it is known.
    #[must_use]
    pub fn get(&self, value: ValueId) -> Option<Interval> {
        self.ranges.get(&value).copied()
    }

    /// Records that `value` lies within `range`.
    pub fn insert(&mut self, value: ValueId, range: Interval) {
        self.ranges.insert(value, range);
    }

    /// Returns `true` if the range of `value` is known.
    #[must_use]
    pub fn is_ranged(&self, value: ValueId) -> bool {
        self.ranges.contains_key(&value)
    }

    /// Looks up the range of an index variable, resolving dims through the
    /// provided `dims` operands.
    #[must_use]
    pub fn leaf_range(&self, leaf: Leaf, dims: &[ValueId]) -> Option<Interval> {
        match leaf {
            Leaf::Value(v) => self.get(v),
            Leaf::Dim(d) => self.get(*dims.get(usize::try_from(d).ok()?)?),
            Leaf::Symbol(_) => None,
        }
    }

    /// Computes the range of `expr` where dims refer to the provided `dims`
    /// operands.
    #[must_use]
    pub fn range_of(&self, expr: &AffineExpr, dims: &[ValueId]) -> Option<Interval> {
        range_of(expr, &|leaf| self.leaf_range(leaf, dims))
    }

    fn visit(&mut self, function: &Function, op: &Operation) {
        match &op.opcode {
            Opcode::Arith(ArithOp::Constant) => {
                let is_index = op
                    .results
                    .first()
                    .is_some_and(|r| function.value_type(*r).as_scalar() == Some(ScalarType::Index));
                if let (true, Some(value), Some(result)) =
                    (is_index, op.int_attribute("value"), op.results.first())
                {
                    self.insert(*result, Interval::point(value));
                }
            }
            Opcode::Index(IndexOp::ThreadId { upper, .. }) => {
                let upper = i64::try_from(*upper).unwrap_or(i64::MAX);
                if let (Some(result), true) = (op.results.first(), upper > 0) {
                    self.insert(*result, Interval::new(0, upper - 1));
                }
            }
            Opcode::Index(IndexOp::Apply { map }) => {
                if let (Some(result), Some(range)) =
                    (op.results.first(), self.range_of(map, &op.operands))
                {
                    self.insert(*result, range);
                }
            }
            Opcode::Scf(ScfOp::For(bounds)) => {
                let dims = op.bound_operands();
                let lower = self.range_of(&bounds.lower, dims);
                let upper = self.range_of(&bounds.upper, dims);
                let induction_var = op
                    .regions
                    .first()
                    .and_then(|r| r.blocks.first())
                    .and_then(|b| b.arguments.first());
                if let (Some(lower), Some(upper), Some(iv)) = (lower, upper, induction_var) {
                    if upper.hi > lower.lo {
                        self.insert(*iv, Interval::new(lower.lo, upper.hi - 1));
                    }
                }
            }
            _ => (),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        affine::AffineExpr,
        builder::FunctionBuilder,
        range::{IndexRanges, Interval},
        types::Type,
    };

    #[test]
    fn scaling_by_negative_factors_flips_ranges() {
        let range = Interval::new(-2, 5).checked_scale(-3);
        assert_eq!(range, Some(Interval::new(-15, 6)));
        assert_eq!(Interval::new(i64::MAX, i64::MAX).checked_scale(2), None);
    }

    #[test]
    fn loop_induction_variables_are_ranged() {
        let mut builder = FunctionBuilder::new("kernel", &[], &[]);
        let tid = builder.thread_id(0, 32);
        let mut iv = None;
        let mut applied = None;
        builder.for_loop(
            AffineExpr::constant(0),
            AffineExpr::constant(8),
            1,
            &[],
            &[],
            |b, i, _| {
                iv = Some(i);
                applied = Some(b.apply(AffineExpr::dim(0) * 32 + AffineExpr::dim(1), &[i, tid]));
                vec![]
            },
        );
        builder.ret(&[]);
        let function = builder.finish();

        let ranges = IndexRanges::compute(&function);
        assert_eq!(ranges.get(tid), Some(Interval::new(0, 31)));
        assert_eq!(iv.and_then(|v| ranges.get(v)), Some(Interval::new(0, 7)));
        assert_eq!(applied.and_then(|v| ranges.get(v)), Some(Interval::new(0, 255)));
    }

    #[test]
    fn unranged_parameters_stay_unranged() {
        let mut builder = FunctionBuilder::new("kernel", &[Type::INDEX, Type::INDEX], &[]);
        let params = builder.params();
        builder.declare_range(params[1], Interval::new(0, 9));
        builder.ret(&[]);
        let function = builder.finish();

        let ranges = IndexRanges::compute(&function);
        assert!(!ranges.is_ranged(params[0]));
        assert_eq!(ranges.get(params[1]), Some(Interval::new(0, 9)));
    }
}
