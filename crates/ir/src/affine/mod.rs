//! Affine expressions describe slice offsets, memory access offsets, index
//! computations and loop bounds.
//!
//! An affine expression is built from integer constants and index variables
//! using only addition, multiplication by a constant, and floor-division or
//! modulo by a positive constant. Index variables come in three flavors (see
//! [`Leaf`]):
//!
//! - **Dims** refer positionally to the index operands of the operation that
//!   carries the expression, in the style of MLIR affine maps.
//! - **Values** refer directly to SSA index values of the enclosing function.
//!   These are used once an expression has been composed across operations,
//!   such as the offset of a slice.
//! - **Symbols** stand for an unknown quantity that was introduced where
//!   differing offsets meet at a control-flow merge point.
//!
//! The [`canonical`] module provides the rewrite system that brings these
//! expressions into a canonical reduced form.

pub mod canonical;

use std::{
    fmt::{Display, Formatter},
    ops::{Add, Mul},
};

use serde::{Deserialize, Serialize};

pub use crate::affine::canonical::{canonicalize, simplify};
use crate::ids::{SymbolId, ValueId};

/// An index variable that can appear in an affine expression.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Leaf {
    /// The index operand at the given position of the carrying operation.
    Dim(u32),

    /// An SSA index value.
    Value(ValueId),

    /// An unknown introduced at a control-flow merge point.
    Symbol(SymbolId),
}

impl From<Leaf> for AffineExpr {
    fn from(value: Leaf) -> Self {
        match value {
            Leaf::Dim(d) => Self::Dim(d),
            Leaf::Value(v) => Self::Value(v),
            Leaf::Symbol(s) => Self::Symbol(s),
        }
    }
}

/// A symbolic integer expression restricted to affine arithmetic.
///
/// Floor-division and modulo round towards negative infinity, and their
/// divisors must be strictly positive for the expression to be well formed.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum AffineExpr {
    /// An integer constant.
    Const(i64),

    /// A positional index operand of the carrying operation.
    Dim(u32),

    /// An SSA index value of the enclosing function.
    Value(ValueId),

    /// An unknown introduced at a control-flow merge point.
    Symbol(SymbolId),

    /// The sum of two expressions.
    Add(Box<AffineExpr>, Box<AffineExpr>),

    /// An expression scaled by a constant.
    Mul(Box<AffineExpr>, i64),

    /// An expression divided by a positive constant, rounding down.
    FloorDiv(Box<AffineExpr>, i64),

    /// The non-negative remainder of dividing an expression by a positive
    /// constant.
    Mod(Box<AffineExpr>, i64),
}

impl AffineExpr {
    /// Creates a constant expression.
    #[must_use]
    pub fn constant(value: i64) -> Self {
        Self::Const(value)
    }

    /// Creates an expression referring to the index operand at `position`.
    #[must_use]
    pub fn dim(position: u32) -> Self {
        Self::Dim(position)
    }

    /// Creates an expression referring to the SSA index `value`.
    #[must_use]
    pub fn value(value: ValueId) -> Self {
        Self::Value(value)
    }

    /// Creates an expression referring to the join `symbol`.
    #[must_use]
    pub fn symbol(symbol: SymbolId) -> Self {
        Self::Symbol(symbol)
    }

    /// Creates the floor-division of `self` by `divisor`.
    #[must_use]
    pub fn floor_div(self, divisor: i64) -> Self {
        Self::FloorDiv(Box::new(self), divisor)
    }

    /// Creates the modulo of `self` by `divisor`.
    #[must_use]
    pub fn modulo(self, divisor: i64) -> Self {
        Self::Mod(Box::new(self), divisor)
    }

    /// Gets the value of the expression if it is a constant.
    #[must_use]
    pub fn as_constant(&self) -> Option<i64> {
        match self {
            Self::Const(c) => Some(*c),
            _ => None,
        }
    }

    /// Gets the index variable if the expression is exactly one.
    #[must_use]
    pub fn as_leaf(&self) -> Option<Leaf> {
        match self {
            Self::Dim(d) => Some(Leaf::Dim(*d)),
            Self::Value(v) => Some(Leaf::Value(*v)),
            Self::Symbol(s) => Some(Leaf::Symbol(*s)),
            _ => None,
        }
    }

    /// Counts the nodes in the expression tree, which is the measure of size
    /// used when simplifying.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Const(_) | Self::Dim(_) | Self::Value(_) | Self::Symbol(_) => 1,
            Self::Add(l, r) => 1 + l.size() + r.size(),
            Self::Mul(e, _) | Self::FloorDiv(e, _) | Self::Mod(e, _) => 1 + e.size(),
        }
    }

    /// Returns `true` if every divisor in the expression is strictly positive.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self {
            Self::Const(_) | Self::Dim(_) | Self::Value(_) | Self::Symbol(_) => true,
            Self::Add(l, r) => l.is_well_formed() && r.is_well_formed(),
            Self::Mul(e, _) => e.is_well_formed(),
            Self::FloorDiv(e, d) | Self::Mod(e, d) => *d > 0 && e.is_well_formed(),
        }
    }

    /// Gets every index variable occurring in the expression, in order of
    /// first occurrence.
    #[must_use]
    pub fn leaves(&self) -> Vec<Leaf> {
        let mut leaves = Vec::new();
        self.visit_leaves(&mut |leaf| {
            if !leaves.contains(&leaf) {
                leaves.push(leaf);
            }
        });
        leaves
    }

    /// Calls `visitor` on every index variable occurrence in the expression.
    pub fn visit_leaves(&self, visitor: &mut impl FnMut(Leaf)) {
        match self {
            Self::Const(_) => (),
            Self::Dim(_) | Self::Value(_) | Self::Symbol(_) => {
                if let Some(leaf) = self.as_leaf() {
                    visitor(leaf);
                }
            }
            Self::Add(l, r) => {
                l.visit_leaves(visitor);
                r.visit_leaves(visitor);
            }
            Self::Mul(e, _) | Self::FloorDiv(e, _) | Self::Mod(e, _) => e.visit_leaves(visitor),
        }
    }

    /// Evaluates the expression, looking up the value of each index variable
    /// with `env`.
    ///
    /// Returns [`None`] if some variable has no value, a divisor is not
    /// positive, or the computation overflows.
    pub fn evaluate(&self, env: &mut impl FnMut(Leaf) -> Option<i64>) -> Option<i64> {
        match self {
            Self::Const(c) => Some(*c),
            Self::Dim(_) | Self::Value(_) | Self::Symbol(_) => env(self.as_leaf()?),
            Self::Add(l, r) => l.evaluate(env)?.checked_add(r.evaluate(env)?),
            Self::Mul(e, k) => e.evaluate(env)?.checked_mul(*k),
            Self::FloorDiv(e, d) if *d > 0 => Some(e.evaluate(env)?.div_euclid(*d)),
            Self::Mod(e, d) if *d > 0 => Some(e.evaluate(env)?.rem_euclid(*d)),
            Self::FloorDiv(..) | Self::Mod(..) => None,
        }
    }

    /// Replaces every index variable for which `replacement` returns an
    /// expression, leaving the others in place.
    #[must_use]
    pub fn substitute(&self, replacement: &mut impl FnMut(Leaf) -> Option<AffineExpr>) -> Self {
        match self {
            Self::Const(_) => self.clone(),
            Self::Dim(_) | Self::Value(_) | Self::Symbol(_) => self
                .as_leaf()
                .and_then(&mut *replacement)
                .unwrap_or_else(|| self.clone()),
            Self::Add(l, r) => Self::Add(
                Box::new(l.substitute(replacement)),
                Box::new(r.substitute(replacement)),
            ),
            Self::Mul(e, k) => Self::Mul(Box::new(e.substitute(replacement)), *k),
            Self::FloorDiv(e, d) => Self::FloorDiv(Box::new(e.substitute(replacement)), *d),
            Self::Mod(e, d) => Self::Mod(Box::new(e.substitute(replacement)), *d),
        }
    }

    /// Replaces every occurrence of the SSA value `old` with `new`.
    pub fn replace_value(&mut self, old: ValueId, new: ValueId) {
        match self {
            Self::Value(v) if *v == old => *v = new,
            Self::Const(_) | Self::Dim(_) | Self::Value(_) | Self::Symbol(_) => (),
            Self::Add(l, r) => {
                l.replace_value(old, new);
                r.replace_value(old, new);
            }
            Self::Mul(e, _) | Self::FloorDiv(e, _) | Self::Mod(e, _) => e.replace_value(old, new),
        }
    }

    /// Returns `true` if the expression only consists of constants and dims.
    #[must_use]
    pub fn is_dim_only(&self) -> bool {
        self.leaves().iter().all(|l| matches!(l, Leaf::Dim(_)))
    }
}

impl Add for AffineExpr {
    type Output = AffineExpr;

    fn add(self, rhs: Self) -> Self::Output {
        Self::Add(Box::new(self), Box::new(rhs))
    }
}

impl Mul<i64> for AffineExpr {
    type Output = AffineExpr;

    fn mul(self, rhs: i64) -> Self::Output {
        Self::Mul(Box::new(self), rhs)
    }
}

impl Display for Leaf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dim(d) => write!(f, "d{d}"),
            Self::Value(v) => write!(f, "{v}"),
            Self::Symbol(s) => write!(f, "{s}"),
        }
    }
}

impl Display for AffineExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Const(c) => write!(f, "{c}"),
            Self::Dim(_) | Self::Value(_) | Self::Symbol(_) => match self.as_leaf() {
                Some(leaf) => write!(f, "{leaf}"),
                None => Ok(()),
            },
            Self::Add(l, r) => write!(f, "({l} + {r})"),
            Self::Mul(e, k) => write!(f, "{e} * {k}"),
            Self::FloorDiv(e, d) => write!(f, "({e} floordiv {d})"),
            Self::Mod(e, d) => write!(f, "({e} mod {d})"),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        affine::{AffineExpr, Leaf},
        ids::ValueId,
    };

    #[test]
    fn evaluation_rounds_towards_negative_infinity() {
        let expr = AffineExpr::dim(0).floor_div(4);
        let modulo = AffineExpr::dim(0).modulo(4);

        assert_eq!(expr.evaluate(&mut |_| Some(-1)), Some(-1));
        assert_eq!(modulo.evaluate(&mut |_| Some(-1)), Some(3));
        assert_eq!(expr.evaluate(&mut |_| Some(7)), Some(1));
    }

    #[test]
    fn evaluation_rejects_non_positive_divisors() {
        let expr = AffineExpr::dim(0).modulo(0);
        assert!(!expr.is_well_formed());
        assert_eq!(expr.evaluate(&mut |_| Some(3)), None);
    }

    #[test]
    fn substitution_composes_expressions() {
        let outer = AffineExpr::dim(0) * 4 + AffineExpr::dim(1);
        let composed = outer.substitute(&mut |leaf| match leaf {
            Leaf::Dim(0) => Some(AffineExpr::value(ValueId::new(3)) + AffineExpr::constant(1)),
            Leaf::Dim(1) => Some(AffineExpr::constant(2)),
            _ => None,
        });

        assert_eq!(composed.to_string(), "((%3 + 1) * 4 + 2)");
        assert_eq!(composed.leaves(), vec![Leaf::Value(ValueId::new(3))]);
    }

    #[test]
    fn values_can_be_replaced() {
        let mut expr = AffineExpr::value(ValueId::new(1)) * 2 + AffineExpr::value(ValueId::new(1));
        expr.replace_value(ValueId::new(1), ValueId::new(9));
        assert_eq!(expr.leaves(), vec![Leaf::Value(ValueId::new(9))]);
        assert_eq!(expr.size(), 4);
    }
}
