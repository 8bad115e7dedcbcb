//! This pass expands conversions to and from `bf16` into integer bit
//! manipulation and native `f32`/`f64` conversions, for targets that cannot
//! perform them natively.
//!
//! # Rounding
//!
//! Every expansion to `bf16` goes through `f32`, where rounding to nearest with
//! ties to even is implemented by adding a bias of `0x7fff` plus the lowest
//! retained bit before truncating the low sixteen bits. NaNs bypass the bias,
//! keeping their sign and upper payload while being quieted.
//!
//! Going from `f64` through `f32` would round twice, so the narrowing to `f32`
//! is performed with round-to-odd: the native conversion's result is moved
//! back towards zero if it rounded away, and its lowest bit is set if it was
//! inexact. Since `f32` has more than two bits of precision beyond `bf16`, the
//! subsequent rounding is then bit-identical to a single correct rounding.
//!
//! # Configuration
//!
//! If `bf16` is enabled and the target claims to convert natively, every
//! conversion is left untouched.

use klo_errors::compile::Result;
use klo_ir::{
    builder::OpBuilder,
    module::{Operation, Region, ValueTable},
    op::{ArithOp, FloatPredicate, IntPredicate, Opcode},
    Function,
    Module,
    ScalarType,
    ValueId,
};
use rayon::prelude::*;

use crate::{
    config::PipelineConfig,
    constant::{
        BF16_QUIET_NAN_BIT,
        BF16_ROUNDING_BIAS,
        BF16_SHIFT,
        F64_EXACT_INTEGER_LIMIT,
        STICKY_BIT,
        STICKY_MASK,
    },
    pass::{
        data::{ConcretePassData, DynPassDataMap, PassDataOps},
        ConcretePass,
        DynPassReturnData,
        Pass,
        PassKey,
        PassOps,
    },
};

/// Expands conversions involving `bf16`.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpandFloatConversions {
    /// The passes that this pass depends upon the results of for its execution.
    depends: Vec<PassKey>,

    /// The passes that this pass invalidates the results of by executing.
    invalidates: Vec<PassKey>,

    /// The configuration of the pipeline.
    config: PipelineConfig,
}

impl ExpandFloatConversions {
    /// Creates a new instance of the conversion expansion pass.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let depends = vec![];
        let invalidates = vec![];
        Self {
            depends,
            invalidates,
            config,
        }
    }

    /// Creates a new trait object of the conversion expansion pass.
    #[must_use]
    pub fn new_dyn(config: PipelineConfig) -> Pass {
        Box::new(Self::new(config))
    }

    /// Expands the conversions in `function`, returning the number of
    /// conversions that were expanded.
    pub fn expand_function(function: &mut Function) -> usize {
        expand_region(&mut function.body, &mut function.values)
    }

    /// Counts the conversions in `function` that involve `bf16`.
    #[must_use]
    pub fn count_conversions(function: &Function) -> usize {
        let mut count = 0;
        function.walk_ops(&mut |op| {
            if conversion(op, &function.values).is_some() {
                count += 1;
            }
        });
        count
    }
}

impl PassOps for ExpandFloatConversions {
    #[tracing::instrument(name = "expand-float-conversions", skip_all)]
    fn run(&mut self, mut module: Module, _pass_data: &DynPassDataMap) -> Result<DynPassReturnData> {
        let data = if self.config.keeps_bf16_conversions() {
            let retained = module.functions.iter().map(Self::count_conversions).sum();
            tracing::debug!(retained, "Leaving bf16 conversions to the target");
            ExpandFloatConversionsData::new(0, retained)
        } else {
            let expanded = module
                .functions
                .par_iter_mut()
                .map(Self::expand_function)
                .sum();
            tracing::debug!(expanded, "Expanded bf16 conversions");
            ExpandFloatConversionsData::new(expanded, 0)
        };

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
        "expand-float-conversions"
    }
}

impl ConcretePass for ExpandFloatConversions {
    type Data = ExpandFloatConversionsData;
}

/// The data returned by the conversion expansion pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpandFloatConversionsData {
    /// The number of conversions that were expanded.
    pub expanded: usize,

    /// The number of conversions left for the target to perform natively.
    pub retained: usize,
}

impl ExpandFloatConversionsData {
    /// Creates the pass data.
    #[must_use]
    pub fn new(expanded: usize, retained: usize) -> Self {
        Self { expanded, retained }
    }
}

impl PassDataOps for ExpandFloatConversionsData {}

impl ConcretePassData for ExpandFloatConversionsData {
    type Pass = ExpandFloatConversions;
}

/// A conversion that involves `bf16`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Conversion {
    op:     ArithOp,
    source: ScalarType,
    target: ScalarType,
}

fn conversion(op: &Operation, values: &ValueTable) -> Option<Conversion> {
    let Opcode::Arith(arith) = op.opcode else {
        return None;
    };
    if !matches!(
        arith,
        ArithOp::ExtF | ArithOp::TruncF | ArithOp::SIToFP | ArithOp::FPToSI
    ) {
        return None;
    }
    let source = values.get(*op.operands.first()?)?.ty.as_scalar()?;
    let target = values.get(*op.results.first()?)?.ty.as_scalar()?;
    let involves_bf16 = (source == ScalarType::BF16) != (target == ScalarType::BF16);
    involves_bf16.then_some(Conversion {
        op: arith,
        source,
        target,
    })
}

fn expand_region(region: &mut Region, values: &mut ValueTable) -> usize {
    let mut expanded = 0;
    for block in &mut region.blocks {
        let operations = std::mem::take(&mut block.operations);
        let mut rewritten = Vec::with_capacity(operations.len());
        for mut op in operations {
            for nested in &mut op.regions {
                expanded += expand_region(nested, values);
            }
            let (Some(conversion), Some(&input), Some(&result)) =
                (conversion(&op, values), op.operands.first(), op.results.first())
            else {
                rewritten.push(op);
                continue;
            };

            let mut builder = Expander {
                ops: OpBuilder::new(values, op.location.clone()),
            };
            if builder.expand(conversion, input, result) {
                rewritten.extend(builder.ops.finish());
                expanded += 1;
            } else {
                rewritten.push(op);
            }
        }
        block.operations = rewritten;
    }
    expanded
}

/// Builds the expansion of a single conversion.
struct Expander<'v> {
    ops: OpBuilder<'v>,
}

impl Expander<'_> {
    /// Expands `conversion` of `input` such that it defines `result`,
    /// returning `false` if there is no expansion for it.
    fn expand(&mut self, conversion: Conversion, input: ValueId, result: ValueId) -> bool {
        use ScalarType::{BF16, F16, F32, F64};

        let Conversion { op, source, target } = conversion;
        match (op, source, target) {
            (ArithOp::ExtF | ArithOp::TruncF, F32, BF16) => {
                self.f32_to_bf16(input, Some(result));
            }
            (ArithOp::ExtF | ArithOp::TruncF, F64, BF16) => {
                self.f64_to_bf16(input, Some(result));
            }
            (ArithOp::ExtF | ArithOp::TruncF, F16, BF16) => {
                let wide = self.ops.cast(ArithOp::ExtF, input, F32);
                self.f32_to_bf16(wide, Some(result));
            }
            (ArithOp::ExtF | ArithOp::TruncF, BF16, F32) => {
                self.bf16_to_f32(input, Some(result));
            }
            (ArithOp::ExtF, BF16, F64) => {
                let wide = self.bf16_to_f32(input, None);
                self.emit(ArithOp::ExtF, &[wide], F64, Some(result));
            }
            (ArithOp::ExtF | ArithOp::TruncF, BF16, F16) => {
                let wide = self.bf16_to_f32(input, None);
                self.emit(ArithOp::TruncF, &[wide], F16, Some(result));
            }
            (ArithOp::SIToFP, integer, BF16) if integer.is_integer() => {
                let exact = if integer.bit_width() > 32 {
                    self.collapse_low_bits(input, integer)
                } else {
                    input
                };
                let wide = self.ops.cast(ArithOp::SIToFP, exact, F64);
                self.f64_to_bf16(wide, Some(result));
            }
            (ArithOp::FPToSI, BF16, integer) if integer.is_integer() => {
                let wide = self.bf16_to_f32(input, None);
                self.emit(ArithOp::FPToSI, &[wide], integer, Some(result));
            }
            _ => return false,
        }
        true
    }

    fn emit(&mut self, op: ArithOp, operands: &[ValueId], ty: ScalarType, into: Option<ValueId>) -> ValueId {
        match into {
            Some(result) => {
                self.ops.push_into(Opcode::Arith(op), operands, vec![result]);
                result
            }
            None => self.ops.push_one(Opcode::Arith(op), operands, ty.into()),
        }
    }

    fn int(&mut self, value: i64) -> ValueId {
        self.ops.constant_int(value, ScalarType::I32)
    }

    /// Makes the 64-bit integer `input` exactly representable in `f64`
    /// without changing how it rounds to `bf16`.
    ///
    /// Outside of `±2^53` the low twelve bits sit far below the rounding
    /// position of `bf16`, so they are replaced by a single sticky bit.
    fn collapse_low_bits(&mut self, input: ValueId, ty: ScalarType) -> ValueId {
        let low_mask = self.ops.constant_int(STICKY_MASK, ty);
        let high_mask = self.ops.constant_int(!STICKY_MASK, ty);
        let low = self.ops.arith(ArithOp::AndI, &[input, low_mask]);
        let high = self.ops.arith(ArithOp::AndI, &[input, high_mask]);

        let zero = self.ops.constant_int(0, ty);
        let inexact = self.ops.arith(ArithOp::CmpI(IntPredicate::Ne), &[low, zero]);
        let bit = self.ops.constant_int(STICKY_BIT, ty);
        let sticky = self.ops.arith(ArithOp::Select, &[inexact, bit, zero]);
        let collapsed = self.ops.arith(ArithOp::OrI, &[high, sticky]);

        let limit = self.ops.constant_int(F64_EXACT_INTEGER_LIMIT, ty);
        let negative_limit = self.ops.constant_int(-F64_EXACT_INTEGER_LIMIT, ty);
        let above = self.ops.arith(ArithOp::CmpI(IntPredicate::Sgt), &[input, limit]);
        let below = self.ops.arith(ArithOp::CmpI(IntPredicate::Slt), &[input, negative_limit]);
        let large = self.ops.arith(ArithOp::OrI, &[above, below]);
        self.ops.arith(ArithOp::Select, &[large, collapsed, input])
    }

    /// Rounds the `f32` value `input` to `bf16`, ties to even.
    fn f32_to_bf16(&mut self, input: ValueId, into: Option<ValueId>) -> ValueId {
        let bits = self.ops.cast(ArithOp::Bitcast, input, ScalarType::I32);
        let shift = self.int(BF16_SHIFT);
        let upper = self.ops.arith(ArithOp::ShrUI, &[bits, shift]);

        let one = self.int(1);
        let lsb = self.ops.arith(ArithOp::AndI, &[upper, one]);
        let bias = self.int(BF16_ROUNDING_BIAS);
        let bias = self.ops.arith(ArithOp::AddI, &[lsb, bias]);
        let biased = self.ops.arith(ArithOp::AddI, &[bits, bias]);
        let rounded = self.ops.arith(ArithOp::ShrUI, &[biased, shift]);

        let quiet = self.int(BF16_QUIET_NAN_BIT);
        let nan = self.ops.arith(ArithOp::OrI, &[upper, quiet]);
        let is_nan = self.ops.arith(ArithOp::CmpF(FloatPredicate::Uno), &[input, input]);
        let selected = self.ops.arith(ArithOp::Select, &[is_nan, nan, rounded]);

        let half = self.ops.cast(ArithOp::TruncI, selected, ScalarType::I16);
        self.emit(ArithOp::Bitcast, &[half], ScalarType::BF16, into)
    }

    /// Narrows the `f64` value `input` to `f32` rounding to odd, and then
    /// rounds the result to `bf16`.
    fn f64_to_bf16(&mut self, input: ValueId, into: Option<ValueId>) -> ValueId {
        let narrow = self.ops.cast(ArithOp::TruncF, input, ScalarType::F32);
        let back = self.ops.cast(ArithOp::ExtF, narrow, ScalarType::F64);

        // Rounding away from zero means ending up below a negative input or
        // above a positive one.
        let zero = self.ops.constant_float(0.0, ScalarType::F64);
        let negative = self.ops.arith(ArithOp::CmpF(FloatPredicate::Olt), &[input, zero]);
        let below = self.ops.arith(ArithOp::CmpF(FloatPredicate::Olt), &[back, input]);
        let above = self.ops.arith(ArithOp::CmpF(FloatPredicate::Ogt), &[back, input]);
        let away = self.ops.arith(ArithOp::Select, &[negative, below, above]);

        let bits = self.ops.cast(ArithOp::Bitcast, narrow, ScalarType::I32);
        let away = self.ops.cast(ArithOp::ExtUI, away, ScalarType::I32);
        let truncated = self.ops.arith(ArithOp::SubI, &[bits, away]);

        let inexact = self.ops.arith(ArithOp::CmpF(FloatPredicate::One), &[back, input]);
        let sticky = self.ops.cast(ArithOp::ExtUI, inexact, ScalarType::I32);
        let odd = self.ops.arith(ArithOp::OrI, &[truncated, sticky]);

        let narrow = self.ops.cast(ArithOp::Bitcast, odd, ScalarType::F32);
        self.f32_to_bf16(narrow, into)
    }

    /// Widens the `bf16` value `input` to `f32`, which is exact.
    fn bf16_to_f32(&mut self, input: ValueId, into: Option<ValueId>) -> ValueId {
        let half = self.ops.cast(ArithOp::Bitcast, input, ScalarType::I16);
        let bits = self.ops.cast(ArithOp::ExtUI, half, ScalarType::I32);
        let shift = self.int(BF16_SHIFT);
        let bits = self.ops.arith(ArithOp::ShlI, &[bits, shift]);
        self.emit(ArithOp::Bitcast, &[bits], ScalarType::F32, into)
    }
}

#[cfg(test)]
mod test {
    use klo_ir::{
        builder::FunctionBuilder,
        eval::{bf16_from_f64, bf16_from_i64, evaluate, float_value},
        op::{ArithOp, Opcode},
        types::{ScalarType, Type},
        Function,
        Module,
    };
    use proptest::prelude::*;

    use crate::{
        config::PipelineConfig,
        pass::{
            data::DynPassDataMap,
            float_conversions::{ExpandFloatConversions, ExpandFloatConversionsData},
            PassOps,
        },
    };

    fn conversion(op: ArithOp, from: ScalarType, to: ScalarType) -> Function {
        let mut builder = FunctionBuilder::new("convert", &[Type::scalar(from)], &[Type::scalar(to)]);
        let input = builder.params()[0];
        let result = builder.cast(op, input, to);
        builder.ret(&[result]);
        builder.finish()
    }

    fn expanded(op: ArithOp, from: ScalarType, to: ScalarType) -> Function {
        let mut function = conversion(op, from, to);
        ExpandFloatConversions::expand_function(&mut function);
        function
    }

    fn is_bf16_nan(bits: u64) -> bool {
        bits & 0x7f80 == 0x7f80 && bits & 0x007f != 0
    }

    #[test]
    fn disabled_bf16_expands_conversions() -> anyhow::Result<()> {
        let function = conversion(ArithOp::TruncF, ScalarType::F32, ScalarType::BF16);
        let module = Module::new("m").with_function(function);

        let mut pass = ExpandFloatConversions::new(PipelineConfig::new());
        let result = pass.run(module, &DynPassDataMap::new())?;

        let function = &result.module.functions[0];
        assert!(function.op_count() > 2);
        let mut truncations = 0;
        function.walk_ops(&mut |op| {
            if op.opcode == Opcode::Arith(ArithOp::TruncF) {
                truncations += 1;
            }
        });
        assert_eq!(truncations, 0);
        assert_eq!(result.unwrap_data_as::<ExpandFloatConversionsData>().expanded, 1);

        Ok(())
    }

    #[test]
    fn enabled_bf16_keeps_conversions() -> anyhow::Result<()> {
        let function = conversion(ArithOp::TruncF, ScalarType::F32, ScalarType::BF16);
        let module = Module::new("m").with_function(function.clone());

        let mut pass = ExpandFloatConversions::new(PipelineConfig::new().with_bf16(true));
        let result = pass.run(module, &DynPassDataMap::new())?;

        assert_eq!(result.module.functions[0], function);
        assert_eq!(
            result.unwrap_data_as::<ExpandFloatConversionsData>(),
            &ExpandFloatConversionsData::new(0, 1)
        );

        Ok(())
    }

    #[test]
    fn conversions_without_bf16_are_untouched() {
        let function = conversion(ArithOp::TruncF, ScalarType::F64, ScalarType::F32);
        assert_eq!(expanded(ArithOp::TruncF, ScalarType::F64, ScalarType::F32), function);
    }

    #[test]
    fn known_values_round_to_nearest_even() -> anyhow::Result<()> {
        let function = expanded(ArithOp::TruncF, ScalarType::F32, ScalarType::BF16);
        let cases: [(f32, u64); 5] = [
            (1.0, 0x3f80),
            (f32::from_bits(0x3f80_8000), 0x3f80),
            (f32::from_bits(0x3f81_8000), 0x3f82),
            (-2.5, 0xc020),
            (f32::MAX, 0x7f80),
        ];
        for (input, expected) in cases {
            let result = evaluate(&function, &[u64::from(input.to_bits())])?;
            assert_eq!(result, vec![expected], "rounding {input}");
        }

        Ok(())
    }

    #[test]
    fn bf16_widens_exactly() -> anyhow::Result<()> {
        let to_f32 = expanded(ArithOp::ExtF, ScalarType::BF16, ScalarType::F32);
        assert_eq!(evaluate(&to_f32, &[0xc020])?, vec![u64::from((-2.5f32).to_bits())]);

        let to_f64 = expanded(ArithOp::ExtF, ScalarType::BF16, ScalarType::F64);
        assert_eq!(evaluate(&to_f64, &[0x3f80])?, vec![1.0f64.to_bits()]);

        let to_int = expanded(ArithOp::FPToSI, ScalarType::BF16, ScalarType::I32);
        assert_eq!(evaluate(&to_int, &[0xc020])?, vec![0xffff_fffe]);

        Ok(())
    }

    #[test]
    fn integers_convert_through_f64() -> anyhow::Result<()> {
        let function = expanded(ArithOp::SIToFP, ScalarType::I32, ScalarType::BF16);
        // 257 lies halfway between 256 and 258, and rounds to the even 256.
        assert_eq!(evaluate(&function, &[257])?, vec![0x4380]);
        assert_eq!(evaluate(&function, &[259])?, vec![0x4382]);

        Ok(())
    }

    #[test]
    fn wide_integers_round_once() -> anyhow::Result<()> {
        let function = expanded(ArithOp::SIToFP, ScalarType::I64, ScalarType::BF16);
        let cases: [(i64, u64); 5] = [
            ((1 << 60) + (1 << 52) + 1, 0x5d81),
            ((1 << 60) + (1 << 52), 0x5d80),
            (-(1 << 60) - (1 << 52) - 1, 0xdd81),
            (i64::MIN, 0xdf00),
            (i64::MAX, 0x5f00),
        ];
        for (input, expected) in cases {
            #[allow(clippy::cast_sign_loss)]
            let result = evaluate(&function, &[input as u64])?;
            assert_eq!(result, vec![expected], "converting {input}");
        }

        Ok(())
    }

    proptest! {
        #[test]
        fn i64_conversion_matches_reference(value in any::<i64>(), shift in 0u32..64) {
            // Shifting spreads the inputs over every magnitude.
            let value = value >> shift;
            let function = expanded(ArithOp::SIToFP, ScalarType::I64, ScalarType::BF16);
            #[allow(clippy::cast_sign_loss)]
            let result = evaluate(&function, &[value as u64]).map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(result[0], u64::from(bf16_from_i64(value)));
        }

        #[test]
        fn f32_rounding_matches_reference(bits in any::<u32>()) {
            let function = expanded(ArithOp::TruncF, ScalarType::F32, ScalarType::BF16);
            let result = evaluate(&function, &[u64::from(bits)]).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let expected = bf16_from_f64(f64::from(f32::from_bits(bits)));

            if is_bf16_nan(u64::from(expected)) {
                prop_assert!(is_bf16_nan(result[0]));
            } else {
                prop_assert_eq!(result[0], u64::from(expected));
            }
        }

        #[test]
        fn f64_rounding_matches_reference(bits in any::<u64>()) {
            let function = expanded(ArithOp::TruncF, ScalarType::F64, ScalarType::BF16);
            let result = evaluate(&function, &[bits]).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let expected = bf16_from_f64(f64::from_bits(bits));

            if is_bf16_nan(u64::from(expected)) {
                prop_assert!(is_bf16_nan(result[0]));
            } else {
                prop_assert_eq!(result[0], u64::from(expected));
            }
        }

        #[test]
        fn f16_widening_matches_reference(bits in any::<u16>()) {
            let function = expanded(ArithOp::ExtF, ScalarType::F16, ScalarType::BF16);
            let result = evaluate(&function, &[u64::from(bits)]).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let value = float_value(u64::from(bits), ScalarType::F16).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let expected = bf16_from_f64(value);

            if is_bf16_nan(u64::from(expected)) {
                prop_assert!(is_bf16_nan(result[0]));
            } else {
                prop_assert_eq!(result[0], u64::from(expected));
            }
        }
    }
}
