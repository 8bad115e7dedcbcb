//! This pass rewrites every affine expression in the module into its canonical
//! reduced form, as implemented by [`klo_ir::affine::simplify`].
//!
//! This covers the offsets carried by slice types, the offsets of memory
//! operations, the maps of `index.apply` and the bounds of `scf.for` loops. The
//! known ranges of index values are used to eliminate floor-divisions and
//! modulos where they are provably redundant, and an expression is never
//! replaced by a larger one.
//!
//! Functions are independent of one another, and are processed in parallel.

use klo_errors::compile::Result;
use klo_ir::{affine::simplify, range::IndexRanges, types::SliceOffset, Function, Module};
use rayon::prelude::*;

use crate::pass::{
    data::{ConcretePassData, DynPassDataMap, PassDataOps},
    slice_indices::PropagateSliceIndices,
    ConcretePass,
    DynPassReturnData,
    Pass,
    PassKey,
    PassOps,
};

/// Simplifies the affine expressions in a module.
#[derive(Clone, Debug, PartialEq)]
pub struct SimplifyAffine {
    /// The passes that this pass depends upon the results of for its execution.
    depends: Vec<PassKey>,

    /// The passes that this pass invalidates the results of by executing.
    invalidates: Vec<PassKey>,
}

impl SimplifyAffine {
    /// Creates a new instance of the affine simplification pass.
    #[must_use]
    pub fn new() -> Self {
        // Slice offsets only exist once they have been propagated.
        let depends = vec![PropagateSliceIndices::key()];

        // Simplification preserves the meaning of every expression.
        let invalidates = vec![];

        Self {
            depends,
            invalidates,
        }
    }

    /// Creates a new trait object of the affine simplification pass.
    #[must_use]
    pub fn new_dyn() -> Pass {
        Box::new(Self::new())
    }

    /// Simplifies every affine expression in `function`, returning the number
    /// of expressions that changed.
    #[must_use]
    pub fn simplify_function(function: &mut Function) -> usize {
        let ranges = IndexRanges::compute(function);
        let mut simplified = 0;

        function.walk_ops_mut(&mut |op| {
            let dims = op.index_operands().to_vec();
            for expr in op.opcode.affine_exprs_mut() {
                let result = simplify(expr, &|leaf| ranges.leaf_range(leaf, &dims));
                if result != *expr {
                    *expr = result;
                    simplified += 1;
                }
            }
        });

        for (_, data) in function.values.iter_mut() {
            let offset = data.ty.as_slice_mut().map(|s| &mut s.offset);
            if let Some(SliceOffset::Affine(expr)) = offset {
                let result = simplify(expr, &|leaf| ranges.leaf_range(leaf, &[]));
                if result != *expr {
                    *expr = result;
                    simplified += 1;
                }
            }
        }

        simplified
    }
}

impl Default for SimplifyAffine {
    fn default() -> Self {
        Self::new()
    }
}

impl PassOps for SimplifyAffine {
    #[tracing::instrument(name = "simplify-affine", skip_all)]
    fn run(&mut self, mut module: Module, _pass_data: &DynPassDataMap) -> Result<DynPassReturnData> {
        let simplified = module
            .functions
            .par_iter_mut()
            .map(Self::simplify_function)
            .sum();
        tracing::debug!(simplified, "Simplified affine expressions");

        Ok(DynPassReturnData::new(
            module,
            SimplifyAffineData::new_dyn(simplified),
        ))
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
        "simplify-affine"
    }
}

impl ConcretePass for SimplifyAffine {
    type Data = SimplifyAffineData;
}

/// The data returned by the affine simplification pass.
#[derive(Clone, Debug, PartialEq)]
pub struct SimplifyAffineData {
    /// The number of expressions that were rewritten.
    pub simplified: usize,
}

impl SimplifyAffineData {
    /// Creates the pass data.
    #[must_use]
    pub fn new(simplified: usize) -> Self {
        Self { simplified }
    }

    /// Creates the pass data as a trait object.
    #[must_use]
    pub fn new_dyn(simplified: usize) -> Box<dyn PassDataOps> {
        Box::new(Self::new(simplified))
    }
}

impl PassDataOps for SimplifyAffineData {}

impl ConcretePassData for SimplifyAffineData {
    type Pass = SimplifyAffine;
}

#[cfg(test)]
mod test {
    use klo_ir::{
        affine::AffineExpr,
        builder::FunctionBuilder,
        eval::evaluate,
        op::{IndexOp, Opcode},
        range::Interval,
        types::Type,
        Module,
    };
    use proptest::prelude::*;

    use crate::pass::{data::DynPassDataMap, simplify_affine::SimplifyAffine, PassOps};

    fn apply_map(module: &Module) -> Option<AffineExpr> {
        let mut map = None;
        module.functions[0].walk_ops(&mut |op| {
            if let Opcode::Index(IndexOp::Apply { map: m }) = &op.opcode {
                map = Some(m.clone());
            }
        });
        map
    }

    #[test]
    fn thread_ids_make_modulo_redundant() -> anyhow::Result<()> {
        let mut builder = FunctionBuilder::new("f", &[], &[Type::INDEX]);
        let tid = builder.thread_id(0, 16);
        let offset = builder.apply(AffineExpr::dim(0).modulo(16) + AffineExpr::constant(0), &[tid]);
        builder.ret(&[offset]);
        let module = Module::new("m").with_function(builder.finish());

        let result = SimplifyAffine::new().run(module, &DynPassDataMap::new())?;
        assert_eq!(apply_map(&result.module), Some(AffineExpr::dim(0)));
        assert_eq!(result.unwrap_data_as::<super::SimplifyAffineData>().simplified, 1);

        Ok(())
    }

    #[test]
    fn unranged_operands_keep_their_modulo() -> anyhow::Result<()> {
        let mut builder = FunctionBuilder::new("f", &[Type::INDEX], &[Type::INDEX]);
        let i = builder.params()[0];
        let map = AffineExpr::dim(0).modulo(16);
        let offset = builder.apply(map.clone(), &[i]);
        builder.ret(&[offset]);
        let module = Module::new("m").with_function(builder.finish());

        let result = SimplifyAffine::new().run(module, &DynPassDataMap::new())?;
        assert_eq!(apply_map(&result.module), Some(map));

        Ok(())
    }

    proptest! {
        #[test]
        fn simplification_preserves_values(i in 0i64..64, c in 1i64..9, k in -5i64..5) {
            let map = (AffineExpr::dim(0) * k + AffineExpr::constant(3)).floor_div(c) * c
                + (AffineExpr::dim(0) * k + AffineExpr::constant(3)).modulo(c);

            let mut builder = FunctionBuilder::new("f", &[Type::INDEX], &[Type::INDEX]);
            let param = builder.params()[0];
            builder.declare_range(param, Interval::new(0, 63));
            let result = builder.apply(map, &[param]);
            builder.ret(&[result]);
            let before = builder.finish();

            let mut after = before.clone();
            SimplifyAffine::simplify_function(&mut after);

            let arg = klo_ir::eval::to_bits(i);
            prop_assert_eq!(evaluate(&before, &[arg]), evaluate(&after, &[arg]));
        }
    }
}
