//! The rewrite system that brings affine expressions into canonical form.
//!
//! Expressions are first translated into a [`LinearForm`]: a constant plus a
//! sum of atoms scaled by non-zero coefficients, where an atom is an index
//! variable or a floor-division/modulo of a nested linear form. Building the
//! linear form already performs constant folding, distribution of
//! multiplication over addition, and collection of like terms. On top of that
//! we apply the following rules when building floor-divisions and modulos by a
//! constant `c`:
//!
//! 1. Multiples of `c` are pulled out, so `(c*q + r) floordiv c` becomes
//!    `q + r floordiv c` and `(c*q + r) mod c` becomes `r mod c`.
//! 2. A common factor `g` of `c` and every remaining coefficient is divided
//!    out.
//! 3. Nested operations are fused: `(e floordiv a) floordiv b` becomes
//!    `e floordiv (a*b)`, and `(e mod (k*b)) mod b` becomes `e mod b`.
//! 4. If the range of the operand is known to lie within a single multiple of
//!    `c`, the floor-division becomes a constant and the modulo an offset of
//!    its operand.
//!
//! Finally, the sums `c*(e floordiv c) + (e mod c)` are recombined into `e`.
//!
//! Since atoms are kept in a sorted map, two expressions that are equal under
//! these rules produce identical canonical expressions, which is what allows
//! slices to be compared for merging.
//!
//! All arithmetic is checked. Should any rewrite overflow, the expression is
//! returned untouched.

use std::collections::BTreeMap;

use crate::{
    affine::{AffineExpr, Leaf},
    range::Interval,
};

/// Brings `expr` into canonical form, using `ranges` to look up the known range
/// of each index variable.
///
/// The canonical form may be larger than the input (for example when a
/// multiplication is distributed over a sum). If the expression cannot be
/// canonicalized, it is returned unchanged.
#[must_use]
pub fn canonicalize(expr: &AffineExpr, ranges: &impl Fn(Leaf) -> Option<Interval>) -> AffineExpr {
    let canonicalizer = Canonicalizer { ranges };
    canonicalizer
        .linear(expr)
        .map_or_else(|| expr.clone(), |form| form.to_expr())
}

/// Simplifies `expr` into its canonical form, as long as that form is not
/// larger than `expr` itself.
///
/// Simplification never fails. An expression that cannot be simplified is
/// returned unchanged.
#[must_use]
pub fn simplify(expr: &AffineExpr, ranges: &impl Fn(Leaf) -> Option<Interval>) -> AffineExpr {
    let canonical = canonicalize(expr, ranges);
    if canonical.size() <= expr.size() {
        canonical
    } else {
        expr.clone()
    }
}

/// Computes the range of values that `expr` can take, given the `ranges` of
/// its index variables, if it is bounded.
#[must_use]
pub fn range_of(expr: &AffineExpr, ranges: &impl Fn(Leaf) -> Option<Interval>) -> Option<Interval> {
    let canonicalizer = Canonicalizer { ranges };
    canonicalizer.range(&canonicalizer.linear(expr)?)
}

/// A term of a linear form that is not itself linear.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum Atom {
    Leaf(Leaf),
    FloorDiv(LinearForm, i64),
    Mod(LinearForm, i64),
}

impl Atom {
    fn to_expr(&self) -> AffineExpr {
        match self {
            Self::Leaf(leaf) => AffineExpr::from(*leaf),
            Self::FloorDiv(form, c) => form.to_expr().floor_div(*c),
            Self::Mod(form, c) => form.to_expr().modulo(*c),
        }
    }
}

/// A constant plus a sum of atoms with non-zero coefficients.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct LinearForm {
    terms:    BTreeMap<Atom, i64>,
    constant: i64,
}

impl LinearForm {
    fn constant(constant: i64) -> Self {
        Self {
            terms: BTreeMap::new(),
            constant,
        }
    }

    fn atom(atom: Atom) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(atom, 1);
        Self { terms, constant: 0 }
    }

    fn as_constant(&self) -> Option<i64> {
        self.terms.is_empty().then_some(self.constant)
    }

    /// Gets the atom if the form is exactly that atom with coefficient one.
    fn as_single_atom(&self) -> Option<&Atom> {
        match (self.terms.len(), self.terms.iter().next()) {
            (1, Some((atom, 1))) if self.constant == 0 => Some(atom),
            _ => None,
        }
    }

    fn add_term(&mut self, atom: Atom, coefficient: i64) -> Option<()> {
        let existing = self.terms.get(&atom).copied().unwrap_or(0);
        let sum = existing.checked_add(coefficient)?;
        if sum == 0 {
            self.terms.remove(&atom);
        } else {
            self.terms.insert(atom, sum);
        }
        Some(())
    }

    fn add(mut self, other: &Self) -> Option<Self> {
        for (atom, coefficient) in &other.terms {
            self.add_term(atom.clone(), *coefficient)?;
        }
        self.constant = self.constant.checked_add(other.constant)?;
        Some(self)
    }

    fn scale(self, factor: i64) -> Option<Self> {
        if factor == 0 {
            return Some(Self::default());
        }
        let terms = self
            .terms
            .into_iter()
            .map(|(atom, c)| Some((atom, c.checked_mul(factor)?)))
            .collect::<Option<BTreeMap<_, _>>>()?;
        let constant = self.constant.checked_mul(factor)?;
        Some(Self { terms, constant })
    }

    /// Splits `self` into `(q, r)` such that `self = c*q + r`, where every
    /// coefficient and the constant of `r` lie in `[0, c)`.
    fn split(&self, c: i64) -> (Self, Self) {
        let mut quotient = Self::constant(self.constant.div_euclid(c));
        let mut rest = Self::constant(self.constant.rem_euclid(c));
        for (atom, coefficient) in &self.terms {
            let q = coefficient.div_euclid(c);
            let r = coefficient.rem_euclid(c);
            if q != 0 {
                quotient.terms.insert(atom.clone(), q);
            }
            if r != 0 {
                rest.terms.insert(atom.clone(), r);
            }
        }
        (quotient, rest)
    }

    /// The greatest common divisor of `c` and every coefficient of the form.
    fn coefficient_gcd(&self, c: i64) -> i64 {
        self.terms.values().fold(c, |acc, coefficient| gcd(acc, *coefficient))
    }

    fn to_expr(&self) -> AffineExpr {
        let mut result: Option<AffineExpr> = None;
        for (atom, coefficient) in &self.terms {
            let term = match coefficient {
                1 => atom.to_expr(),
                c => atom.to_expr() * *c,
            };
            result = Some(match result {
                None => term,
                Some(acc) => acc + term,
            });
        }
        match result {
            None => AffineExpr::Const(self.constant),
            Some(expr) if self.constant == 0 => expr,
            Some(expr) => expr + AffineExpr::Const(self.constant),
        }
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    i64::try_from(a).unwrap_or(1)
}

/// Performs canonicalization with respect to a particular set of index ranges.
struct Canonicalizer<'r, R> {
    ranges: &'r R,
}

impl<R> Canonicalizer<'_, R>
where
    R: Fn(Leaf) -> Option<Interval>,
{
    fn linear(&self, expr: &AffineExpr) -> Option<LinearForm> {
        match expr {
            AffineExpr::Const(c) => Some(LinearForm::constant(*c)),
            AffineExpr::Dim(_) | AffineExpr::Value(_) | AffineExpr::Symbol(_) => {
                Some(LinearForm::atom(Atom::Leaf(expr.as_leaf()?)))
            }
            AffineExpr::Add(l, r) => {
                let sum = self.linear(l)?.add(&self.linear(r)?)?;
                self.recombine(sum)
            }
            AffineExpr::Mul(e, k) => {
                let product = self.linear(e)?.scale(*k)?;
                self.recombine(product)
            }
            AffineExpr::FloorDiv(e, c) if *c > 0 => self.floor_div(self.linear(e)?, *c),
            AffineExpr::Mod(e, c) if *c > 0 => self.modulo(self.linear(e)?, *c),
            AffineExpr::FloorDiv(..) | AffineExpr::Mod(..) => None,
        }
    }

    fn floor_div(&self, form: LinearForm, c: i64) -> Option<LinearForm> {
        if c == 1 {
            return Some(form);
        }

        let (quotient, rest) = form.split(c);
        let rest_div = self.floor_div_residual(rest, c)?;
        self.recombine(quotient.add(&rest_div)?)
    }

    /// Computes `rest floordiv c` where every coefficient of `rest` already
    /// lies in `[0, c)`.
    fn floor_div_residual(&self, rest: LinearForm, c: i64) -> Option<LinearForm> {
        if let Some(k) = rest.as_constant() {
            return Some(LinearForm::constant(k.div_euclid(c)));
        }

        if let Some(range) = self.range(&rest) {
            let (lo, hi) = (range.lo.div_euclid(c), range.hi.div_euclid(c));
            if lo == hi {
                return Some(LinearForm::constant(lo));
            }
        }

        let g = rest.coefficient_gcd(c);
        if g > 1 {
            let mut reduced = LinearForm::constant(rest.constant.div_euclid(g));
            for (atom, coefficient) in rest.terms {
                reduced.terms.insert(atom, coefficient / g);
            }
            return self.floor_div(reduced, c / g);
        }

        let single = rest.terms.len() == 1 && rest.terms.values().all(|c| *c == 1);
        if let (true, Some((Atom::FloorDiv(inner, d), _))) = (single, rest.terms.iter().next()) {
            // (inner floordiv d + k) floordiv c == (inner + k*d) floordiv (d*c)
            let shifted = inner
                .clone()
                .add(&LinearForm::constant(rest.constant.checked_mul(*d)?))?;
            return self.floor_div(shifted, d.checked_mul(c)?);
        }

        Some(LinearForm::atom(Atom::FloorDiv(rest, c)))
    }

    fn modulo(&self, form: LinearForm, c: i64) -> Option<LinearForm> {
        if c == 1 {
            return Some(LinearForm::default());
        }

        let (_, rest) = form.split(c);
        if let Some(k) = rest.as_constant() {
            return Some(LinearForm::constant(k.rem_euclid(c)));
        }

        if let Some(range) = self.range(&rest) {
            let k = range.lo.div_euclid(c);
            if k == range.hi.div_euclid(c) {
                return rest.add(&LinearForm::constant(k.checked_mul(c)?.checked_neg()?));
            }
        }

        let g = rest.coefficient_gcd(c);
        if g > 1 {
            // (g*x + r) mod (g*c') == g*((x + r floordiv g) mod c') + r mod g
            let mut reduced = LinearForm::constant(rest.constant.div_euclid(g));
            for (atom, coefficient) in rest.terms {
                reduced.terms.insert(atom, coefficient / g);
            }
            let inner = self.modulo(reduced, c / g)?.scale(g)?;
            return inner.add(&LinearForm::constant(rest.constant.rem_euclid(g)));
        }

        if let Some(Atom::Mod(inner, m)) = rest.as_single_atom() {
            if m % c == 0 {
                return self.modulo(inner.clone(), c);
            }
        }

        Some(LinearForm::atom(Atom::Mod(rest, c)))
    }

    /// Rewrites every `c*k*(e floordiv c) + k*(e mod c)` in `form` into `k*e`.
    fn recombine(&self, mut form: LinearForm) -> Option<LinearForm> {
        loop {
            let pair = form.terms.iter().find_map(|(atom, coefficient)| match atom {
                Atom::Mod(inner, c) => {
                    let div = Atom::FloorDiv(inner.clone(), *c);
                    let expected = coefficient.checked_mul(*c)?;
                    (form.terms.get(&div) == Some(&expected))
                        .then(|| (atom.clone(), div, inner.clone(), *coefficient))
                }
                _ => None,
            });

            let Some((modulo, div, inner, coefficient)) = pair else {
                return Some(form);
            };
            form.terms.remove(&modulo);
            form.terms.remove(&div);
            form = form.add(&inner.scale(coefficient)?)?;
        }
    }

    fn range(&self, form: &LinearForm) -> Option<Interval> {
        form.terms
            .iter()
            .try_fold(Interval::point(form.constant), |acc, (atom, coefficient)| {
                acc.checked_add(self.atom_range(atom)?.checked_scale(*coefficient)?)
            })
    }

    fn atom_range(&self, atom: &Atom) -> Option<Interval> {
        match atom {
            Atom::Leaf(leaf) => (self.ranges)(*leaf),
            Atom::FloorDiv(inner, c) => {
                let range = self.range(inner)?;
                Some(Interval::new(range.lo.div_euclid(*c), range.hi.div_euclid(*c)))
            }
            Atom::Mod(inner, c) => match self.range(inner) {
                Some(range) if range.lo.div_euclid(*c) == range.hi.div_euclid(*c) => Some(
                    Interval::new(range.lo.rem_euclid(*c), range.hi.rem_euclid(*c)),
                ),
                _ => Some(Interval::new(0, c - 1)),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use crate::{
        affine::{
            canonical::{canonicalize, range_of, simplify},
            AffineExpr,
            Leaf,
        },
        ids::ValueId,
        range::Interval,
    };

    fn no_ranges(_: Leaf) -> Option<Interval> {
        None
    }

    fn i() -> AffineExpr {
        AffineExpr::value(ValueId::new(0))
    }

    fn j() -> AffineExpr {
        AffineExpr::value(ValueId::new(1))
    }

    /// `i` is in `[0, 15]` and `j` is in `[0, 3]`.
    fn loop_ranges(leaf: Leaf) -> Option<Interval> {
        match leaf {
            Leaf::Value(v) if v == ValueId::new(0) => Some(Interval::new(0, 15)),
            Leaf::Value(v) if v == ValueId::new(1) => Some(Interval::new(0, 3)),
            _ => None,
        }
    }

    #[test]
    fn operand_order_does_not_matter() {
        let a = i() * 4 + AffineExpr::constant(0);
        let b = AffineExpr::constant(0) + i() * 4;

        assert_eq!(canonicalize(&a, &no_ranges), canonicalize(&b, &no_ranges));
        assert_eq!(canonicalize(&a, &no_ranges), i() * 4);
    }

    #[test]
    fn constants_fold() {
        let expr = (AffineExpr::constant(7) + AffineExpr::constant(5)).floor_div(4) * 3;
        assert_eq!(canonicalize(&expr, &no_ranges), AffineExpr::constant(9));
    }

    #[test]
    fn multiplication_distributes_over_addition() {
        let expr = (i() + j() * 2 + AffineExpr::constant(1)) * 4 + i() * -4;
        assert_eq!(
            canonicalize(&expr, &no_ranges),
            j() * 8 + AffineExpr::constant(4)
        );
    }

    #[test]
    fn multiples_are_pulled_out_of_division() {
        let expr = (i() * 8 + j()).floor_div(8);
        assert_eq!(canonicalize(&expr, &no_ranges), i() + j().floor_div(8));

        let modulo = (i() * 8 + j()).modulo(8);
        assert_eq!(canonicalize(&modulo, &no_ranges), j().modulo(8));
    }

    #[test]
    fn ranges_eliminate_division_and_modulo() {
        let div = (i() * 4 + j()).floor_div(4);
        assert_eq!(canonicalize(&div, &loop_ranges), i());

        let modulo = (i() * 4 + j()).modulo(4);
        assert_eq!(canonicalize(&modulo, &loop_ranges), j());

        let bounded = i().modulo(16);
        assert_eq!(canonicalize(&bounded, &loop_ranges), i());
    }

    #[test]
    fn ranges_are_not_assumed_without_evidence() {
        let modulo = i().modulo(16);
        assert_eq!(canonicalize(&modulo, &no_ranges), i().modulo(16));
    }

    #[test]
    fn division_and_modulo_recombine() {
        let expr = i().floor_div(4) * 4 + i().modulo(4);
        assert_eq!(canonicalize(&expr, &no_ranges), i());

        let scaled = i().floor_div(8) * 24 + i().modulo(8) * 3;
        assert_eq!(canonicalize(&scaled, &no_ranges), i() * 3);
    }

    #[test]
    fn nested_divisions_fuse() {
        let expr = i().floor_div(4).floor_div(8);
        assert_eq!(canonicalize(&expr, &no_ranges), i().floor_div(32));

        let modulo = i().modulo(32).modulo(8);
        assert_eq!(canonicalize(&modulo, &no_ranges), i().modulo(8));
    }

    #[test]
    fn common_factors_are_divided_out() {
        let expr = (i() * 2).floor_div(4);
        assert_eq!(canonicalize(&expr, &no_ranges), i().floor_div(2));
    }

    #[test]
    fn simplification_never_grows_expressions() {
        let expr = (i() + j()) * 4;
        let simplified = simplify(&expr, &no_ranges);
        assert_eq!(simplified, expr);
        assert!(canonicalize(&expr, &no_ranges).size() > expr.size());
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let expr = (i() * 6 + j() * 3 + AffineExpr::constant(5)).floor_div(3).modulo(4);
        let once = canonicalize(&expr, &no_ranges);
        assert_eq!(canonicalize(&once, &no_ranges), once);
    }

    #[test]
    fn ranges_of_expressions_are_computed() {
        let expr = i() * 4 + j();
        assert_eq!(range_of(&expr, &loop_ranges), Some(Interval::new(0, 63)));
        assert_eq!(range_of(&expr.modulo(8), &loop_ranges), Some(Interval::new(0, 7)));
        assert_eq!(range_of(&i(), &no_ranges), None);
    }

    /// Generates random affine expressions over the index values `%0` and `%1`.
    fn arb_expr() -> impl Strategy<Value = AffineExpr> {
        let leaf = prop_oneof![
            (-20i64..20).prop_map(AffineExpr::constant),
            Just(i()),
            Just(j()),
        ];
        leaf.prop_recursive(4, 32, 2, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone()).prop_map(|(a, b)| a + b),
                (inner.clone(), -6i64..6).prop_map(|(a, k)| a * k),
                (inner.clone(), 1i64..9).prop_map(|(a, c)| a.floor_div(c)),
                (inner, 1i64..9).prop_map(|(a, c)| a.modulo(c)),
            ]
        })
    }

    proptest! {
        #[test]
        fn simplification_is_sound_within_ranges(
            expr in arb_expr(),
            iv in 0i64..=15,
            jv in 0i64..=3,
        ) {
            let mut env = |leaf: Leaf| match leaf {
                Leaf::Value(v) if v == ValueId::new(0) => Some(iv),
                Leaf::Value(v) if v == ValueId::new(1) => Some(jv),
                _ => None,
            };
            let original = expr.evaluate(&mut env);
            let simplified = simplify(&expr, &loop_ranges).evaluate(&mut env);
            let canonical = canonicalize(&expr, &loop_ranges).evaluate(&mut env);

            prop_assert_eq!(original, simplified);
            prop_assert_eq!(original, canonical);
        }

        #[test]
        fn simplification_is_sound_without_ranges(
            expr in arb_expr(),
            iv in -40i64..40,
            jv in -40i64..40,
        ) {
            let mut env = |leaf: Leaf| match leaf {
                Leaf::Value(v) if v == ValueId::new(0) => Some(iv),
                Leaf::Value(v) if v == ValueId::new(1) => Some(jv),
                _ => None,
            };
            let original = expr.evaluate(&mut env);
            let simplified = simplify(&expr, &no_ranges).evaluate(&mut env);

            prop_assert_eq!(original, simplified);
            prop_assert!(simplify(&expr, &no_ranges).size() <= expr.size());
        }
    }
}
