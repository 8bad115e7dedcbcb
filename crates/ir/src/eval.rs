//! A reference interpreter for the scalar subset of the IR.
//!
//! The interpreter executes the arithmetic, index, structured control flow and
//! branching operations of a function, as well as their LLVM counterparts. It
//! does not model memory, so any operation on tensors, slices or pointers is
//! rejected as unsupported.
//!
//! Values are represented by their bit patterns, zero-extended to 64 bits,
//! which allows the results of rewrites that reinterpret floats as integers to
//! be compared bit-for-bit with their originals.
//!
//! Native conversions to `bf16` round to nearest with ties to even, as
//! implemented by [`bf16_from_f64`].

use std::collections::HashMap;

use thiserror::Error;

use crate::{
    ids::{BlockId, ValueId},
    module::{Block, Function, Operation},
    op::{
        ArithOp,
        Attribute,
        CfOp,
        FloatPredicate,
        FuncOp,
        IndexOp,
        IntPredicate,
        LlvmOp,
        Opcode,
        ScfOp,
    },
    types::{ScalarType, Type},
};

/// Errors that can occur during evaluation.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("Expected {expected} arguments but found {found}")]
    ArgumentCount { expected: usize, found: usize },

    #[error("Value {_0} was used before being defined")]
    UndefinedValue(ValueId),

    #[error("Block {_0} does not exist")]
    UnknownBlock(BlockId),

    #[error("Cannot evaluate `{_0}`")]
    Unsupported(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Evaluation did not finish within the step limit")]
    OutOfFuel,

    #[error("Control reached the end of a region without a terminator")]
    MissingTerminator,
}

pub type Result<T> = std::result::Result<T, EvalError>;

/// The maximum number of operations executed in one evaluation.
const FUEL: usize = 1_000_000;

/// Evaluates `function` on the arguments given as bit patterns, returning the
/// bit patterns of its results.
///
/// # Errors
///
/// - [`EvalError`] if the function uses an operation that cannot be evaluated,
///   or misbehaves at runtime.
pub fn evaluate(function: &Function, args: &[u64]) -> Result<Vec<u64>> {
    let params = function.params();
    if params.len() != args.len() {
        return Err(EvalError::ArgumentCount {
            expected: params.len(),
            found:    args.len(),
        });
    }

    let mut interpreter = Interpreter {
        function,
        env: HashMap::new(),
        fuel: FUEL,
    };
    interpreter.bind(params, args)?;
    interpreter.run_function()
}

/// The result of executing a block.
enum Flow {
    Yield(Vec<u64>),
    Return(Vec<u64>),
    Branch(BlockId, Vec<u64>),
}

struct Interpreter<'f> {
    function: &'f Function,
    env:      HashMap<ValueId, u64>,
    fuel:     usize,
}

impl Interpreter<'_> {
    fn run_function(&mut self) -> Result<Vec<u64>> {
        let function = self.function;
        let blocks = &function.body.blocks;
        let mut block = blocks.first().ok_or(EvalError::MissingTerminator)?;
        loop {
            match self.run_block(block)? {
                Flow::Return(values) => return Ok(values),
                Flow::Branch(target, args) => {
                    block = blocks
                        .iter()
                        .find(|b| b.id == target)
                        .ok_or(EvalError::UnknownBlock(target))?;
                    self.bind(&block.arguments, &args)?;
                }
                Flow::Yield(_) => return Err(EvalError::Unsupported("scf.yield".into())),
            }
        }
    }

    fn bind(&mut self, values: &[ValueId], bits: &[u64]) -> Result<()> {
        if values.len() != bits.len() {
            return Err(EvalError::ArgumentCount {
                expected: values.len(),
                found:    bits.len(),
            });
        }
        for (value, bits) in values.iter().zip(bits) {
            let width = self.scalar(*value)?.bit_width();
            self.env.insert(*value, mask(*bits, width));
        }
        Ok(())
    }

    fn get(&self, value: ValueId) -> Result<u64> {
        self.env.get(&value).copied().ok_or(EvalError::UndefinedValue(value))
    }

    fn scalar(&self, value: ValueId) -> Result<ScalarType> {
        match self.function.values.get(value).map(|d| &d.ty) {
            Some(Type::Scalar(s)) => Ok(*s),
            Some(other) => Err(EvalError::Unsupported(other.to_string())),
            None => Err(EvalError::UndefinedValue(value)),
        }
    }

    fn run_block(&mut self, block: &Block) -> Result<Flow> {
        for op in &block.operations {
            self.fuel = self.fuel.checked_sub(1).ok_or(EvalError::OutOfFuel)?;
            if let Some(flow) = self.run_op(op)? {
                return Ok(flow);
            }
        }
        Err(EvalError::MissingTerminator)
    }

    fn operands(&self, op: &Operation) -> Result<Vec<u64>> {
        op.operands.iter().map(|v| self.get(*v)).collect()
    }

    fn run_op(&mut self, op: &Operation) -> Result<Option<Flow>> {
        let args = self.operands(op)?;
        match &op.opcode {
            Opcode::Func(FuncOp::Return) | Opcode::Llvm(LlvmOp::Return) => {
                return Ok(Some(Flow::Return(args)));
            }
            Opcode::Scf(ScfOp::Yield) => return Ok(Some(Flow::Yield(args))),
            Opcode::Cf(CfOp::Br) | Opcode::Llvm(LlvmOp::Br) => {
                return self.branch(op, 0).map(Some);
            }
            Opcode::Cf(CfOp::CondBr) | Opcode::Llvm(LlvmOp::CondBr) => {
                let taken = usize::from(args.first().copied().unwrap_or(0) == 0);
                return self.branch(op, taken).map(Some);
            }
            Opcode::Scf(ScfOp::For(bounds)) => {
                let dims = self.signed_operands(op.bound_operands())?;
                let mut env = |leaf| match leaf {
                    crate::affine::Leaf::Dim(d) => dims.get(usize::try_from(d).ok()?).copied(),
                    _ => None,
                };
                let unsupported = || EvalError::Unsupported("unbounded scf.for".into());
                let lower = bounds.lower.evaluate(&mut env).ok_or_else(unsupported)?;
                let upper = bounds.upper.evaluate(&mut env).ok_or_else(unsupported)?;
                if bounds.step <= 0 {
                    return Err(unsupported());
                }

                let body = op.body().ok_or(EvalError::MissingTerminator)?;
                let mut carried: Vec<u64> = op
                    .loop_inits()
                    .iter()
                    .map(|v| self.get(*v))
                    .collect::<Result<_>>()?;
                let mut iv = lower;
                while iv < upper {
                    let mut values = vec![to_bits(iv)];
                    values.extend(&carried);
                    self.bind(&body.arguments, &values)?;
                    match self.run_block(body)? {
                        Flow::Yield(next) => carried = next,
                        _ => return Err(EvalError::MissingTerminator),
                    }
                    iv = iv.checked_add(bounds.step).ok_or(EvalError::OutOfFuel)?;
                }
                self.bind(&op.results, &carried)?;
            }
            Opcode::Scf(ScfOp::If) => {
                let region = usize::from(args.first().copied().unwrap_or(0) == 0);
                let block = op
                    .regions
                    .get(region)
                    .and_then(|r| r.blocks.first())
                    .ok_or(EvalError::MissingTerminator)?;
                match self.run_block(block)? {
                    Flow::Yield(values) => self.bind(&op.results, &values)?,
                    _ => return Err(EvalError::MissingTerminator),
                }
            }
            Opcode::Index(IndexOp::Apply { map }) => {
                let dims = self.signed_operands(&op.operands)?;
                let value = map
                    .evaluate(&mut |leaf| match leaf {
                        crate::affine::Leaf::Dim(d) => dims.get(usize::try_from(d).ok()?).copied(),
                        _ => None,
                    })
                    .ok_or_else(|| EvalError::Unsupported(op.opcode.to_string()))?;
                self.bind(&op.results, &[to_bits(value)])?;
            }
            Opcode::Arith(arith) => {
                let value = self.run_scalar(op, *arith, &args)?;
                self.bind(&op.results, &[value])?;
            }
            Opcode::Llvm(llvm) => {
                let arith = llvm_equivalent(llvm)
                    .ok_or_else(|| EvalError::Unsupported(op.opcode.to_string()))?;
                let value = self.run_scalar(op, arith, &args)?;
                self.bind(&op.results, &[value])?;
            }
            other => return Err(EvalError::Unsupported(other.to_string())),
        }
        Ok(None)
    }

    fn branch(&mut self, op: &Operation, index: usize) -> Result<Flow> {
        let successor = op
            .successors
            .get(index)
            .ok_or_else(|| EvalError::Unsupported(op.opcode.to_string()))?;
        let args = successor
            .args
            .iter()
            .map(|v| self.get(*v))
            .collect::<Result<_>>()?;
        Ok(Flow::Branch(successor.block, args))
    }

    fn signed_operands(&self, values: &[ValueId]) -> Result<Vec<i64>> {
        values
            .iter()
            .map(|v| Ok(sign_extend(self.get(*v)?, self.scalar(*v)?.bit_width())))
            .collect()
    }

    fn run_scalar(&self, op: &Operation, arith: ArithOp, args: &[u64]) -> Result<u64> {
        let result = op
            .results
            .first()
            .ok_or_else(|| EvalError::Unsupported(op.opcode.to_string()))?;
        let result_ty = self.scalar(*result)?;
        let width = result_ty.bit_width();
        let operand_ty = match op.operands.first() {
            Some(v) => self.scalar(*v)?,
            None => result_ty,
        };
        let in_width = operand_ty.bit_width();
        let arg = |i: usize| {
            args.get(i)
                .copied()
                .ok_or_else(|| EvalError::Unsupported(op.opcode.to_string()))
        };
        let signed = |i: usize| arg(i).map(|a| sign_extend(a, in_width));

        let value = match arith {
            ArithOp::Constant => match op.attribute("value") {
                Some(Attribute::Float(f)) => float_bits(*f, result_ty)?,
                Some(attr) => attr
                    .as_int()
                    .map(to_bits)
                    .ok_or_else(|| EvalError::Unsupported(op.opcode.to_string()))?,
                None => return Err(EvalError::Unsupported(op.opcode.to_string())),
            },
            ArithOp::AddI => arg(0)?.wrapping_add(arg(1)?),
            ArithOp::SubI => arg(0)?.wrapping_sub(arg(1)?),
            ArithOp::MulI => arg(0)?.wrapping_mul(arg(1)?),
            ArithOp::DivSI | ArithOp::RemSI => {
                let (lhs, rhs) = (signed(0)?, signed(1)?);
                if rhs == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                let value = if arith == ArithOp::DivSI {
                    lhs.wrapping_div(rhs)
                } else {
                    lhs.wrapping_rem(rhs)
                };
                to_bits(value)
            }
            ArithOp::AndI => arg(0)? & arg(1)?,
            ArithOp::OrI => arg(0)? | arg(1)?,
            ArithOp::XOrI => arg(0)? ^ arg(1)?,
            ArithOp::ShlI | ArithOp::ShrUI | ArithOp::ShrSI => {
                let amount = arg(1)?;
                if amount >= u64::from(width) {
                    0
                } else {
                    // Guarded by the width check above.
                    #[allow(clippy::cast_possible_truncation)]
                    let amount = amount as u32;
                    match arith {
                        ArithOp::ShlI => arg(0)? << amount,
                        ArithOp::ShrUI => arg(0)? >> amount,
                        _ => to_bits(signed(0)? >> amount),
                    }
                }
            }
            ArithOp::AddF | ArithOp::SubF | ArithOp::MulF | ArithOp::DivF => {
                let lhs = float_value(arg(0)?, operand_ty)?;
                let rhs = float_value(arg(1)?, operand_ty)?;
                let value = match arith {
                    ArithOp::AddF => lhs + rhs,
                    ArithOp::SubF => lhs - rhs,
                    ArithOp::MulF => lhs * rhs,
                    _ => lhs / rhs,
                };
                float_bits(value, result_ty)?
            }
            ArithOp::NegF => arg(0)? ^ (1 << (width - 1)),
            ArithOp::CmpI(predicate) => {
                let (a, b) = (arg(0)?, arg(1)?);
                let (sa, sb) = (signed(0)?, signed(1)?);
                u64::from(match predicate {
                    IntPredicate::Eq => a == b,
                    IntPredicate::Ne => a != b,
                    IntPredicate::Slt => sa < sb,
                    IntPredicate::Sle => sa <= sb,
                    IntPredicate::Sgt => sa > sb,
                    IntPredicate::Sge => sa >= sb,
                    IntPredicate::Ult => a < b,
                    IntPredicate::Ule => a <= b,
                    IntPredicate::Ugt => a > b,
                    IntPredicate::Uge => a >= b,
                })
            }
            ArithOp::CmpF(predicate) => {
                let a = float_value(arg(0)?, operand_ty)?;
                let b = float_value(arg(1)?, operand_ty)?;
                u64::from(compare_floats(predicate, a, b))
            }
            ArithOp::Select => {
                if arg(0)? == 0 {
                    arg(2)?
                } else {
                    arg(1)?
                }
            }
            ArithOp::ExtUI | ArithOp::TruncI | ArithOp::Bitcast => arg(0)?,
            ArithOp::ExtSI | ArithOp::IndexCast => to_bits(signed(0)?),
            ArithOp::ExtF | ArithOp::TruncF => {
                float_bits(float_value(arg(0)?, operand_ty)?, result_ty)?
            }
            #[allow(clippy::cast_precision_loss)] // Rounds like the hardware does
            ArithOp::SIToFP => match result_ty {
                ScalarType::F32 => u64::from((signed(0)? as f32).to_bits()),
                ScalarType::BF16 => u64::from(bf16_from_i64(signed(0)?)),
                _ => float_bits(signed(0)? as f64, result_ty)?,
            },
            ArithOp::FPToSI => {
                let value = float_value(arg(0)?, operand_ty)?;
                to_bits(float_to_int(value, width))
            }
        };
        Ok(mask(value, width))
    }
}

/// Gets the arithmetic operation with the same semantics as an LLVM
/// instruction, if there is one.
fn llvm_equivalent(op: &LlvmOp) -> Option<ArithOp> {
    Some(match op {
        LlvmOp::Constant => ArithOp::Constant,
        LlvmOp::Add => ArithOp::AddI,
        LlvmOp::Sub => ArithOp::SubI,
        LlvmOp::Mul => ArithOp::MulI,
        LlvmOp::SDiv => ArithOp::DivSI,
        LlvmOp::SRem => ArithOp::RemSI,
        LlvmOp::And => ArithOp::AndI,
        LlvmOp::Or => ArithOp::OrI,
        LlvmOp::Xor => ArithOp::XOrI,
        LlvmOp::Shl => ArithOp::ShlI,
        LlvmOp::LShr => ArithOp::ShrUI,
        LlvmOp::AShr => ArithOp::ShrSI,
        LlvmOp::FAdd => ArithOp::AddF,
        LlvmOp::FSub => ArithOp::SubF,
        LlvmOp::FMul => ArithOp::MulF,
        LlvmOp::FDiv => ArithOp::DivF,
        LlvmOp::FNeg => ArithOp::NegF,
        LlvmOp::ICmp(p) => ArithOp::CmpI(*p),
        LlvmOp::FCmp(p) => ArithOp::CmpF(*p),
        LlvmOp::Select => ArithOp::Select,
        LlvmOp::ZExt => ArithOp::ExtUI,
        LlvmOp::SExt => ArithOp::ExtSI,
        LlvmOp::Trunc => ArithOp::TruncI,
        LlvmOp::FPExt => ArithOp::ExtF,
        LlvmOp::FPTrunc => ArithOp::TruncF,
        LlvmOp::SIToFP => ArithOp::SIToFP,
        LlvmOp::FPToSI => ArithOp::FPToSI,
        LlvmOp::Bitcast => ArithOp::Bitcast,
        _ => return None,
    })
}

fn compare_floats(predicate: FloatPredicate, a: f64, b: f64) -> bool {
    let unordered = a.is_nan() || b.is_nan();
    match predicate {
        FloatPredicate::Oeq => !unordered && a == b,
        FloatPredicate::One => !unordered && a != b,
        FloatPredicate::Olt => !unordered && a < b,
        FloatPredicate::Ole => !unordered && a <= b,
        FloatPredicate::Ogt => !unordered && a > b,
        FloatPredicate::Oge => !unordered && a >= b,
        FloatPredicate::Ord => !unordered,
        FloatPredicate::Uno => unordered,
        FloatPredicate::Ueq => unordered || a == b,
        FloatPredicate::Une => unordered || a != b,
    }
}

/// Keeps the low `width` bits of `bits`.
#[must_use]
pub fn mask(bits: u64, width: u32) -> u64 {
    if width >= 64 {
        bits
    } else {
        bits & ((1 << width) - 1)
    }
}

/// Interprets the low `width` bits of `bits` as a signed integer.
#[must_use]
pub fn sign_extend(bits: u64, width: u32) -> i64 {
    if width >= 64 {
        from_bits(bits)
    } else {
        let shift = 64 - width;
        from_bits(bits << shift) >> shift
    }
}

/// Reinterprets a signed integer as its two's complement bit pattern.
#[must_use]
pub fn to_bits(value: i64) -> u64 {
    u64::from_ne_bytes(value.to_ne_bytes())
}

/// Reinterprets a two's complement bit pattern as a signed integer.
#[must_use]
pub fn from_bits(bits: u64) -> i64 {
    i64::from_ne_bytes(bits.to_ne_bytes())
}

fn float_to_int(value: f64, width: u32) -> i64 {
    if value.is_nan() {
        return 0;
    }
    let max = if width >= 64 { i64::MAX } else { (1i64 << (width - 1)) - 1 };
    let min = if width >= 64 { i64::MIN } else { -(1i64 << (width - 1)) };
    #[allow(clippy::cast_possible_truncation)] // Saturating by definition
    let truncated = value.trunc() as i64;
    truncated.clamp(min, max)
}

/// Reads the bit pattern of a float of type `ty` as an `f64`, which is exact
/// for every floating point type.
///
/// # Errors
///
/// - [`EvalError::Unsupported`] if `ty` is not a float type.
pub fn float_value(bits: u64, ty: ScalarType) -> Result<f64> {
    #[allow(clippy::cast_possible_truncation)] // Masked to the type's width
    let value = match ty {
        ScalarType::F64 => f64::from_bits(bits),
        ScalarType::F32 => f64::from(f32::from_bits(bits as u32)),
        ScalarType::BF16 => f64::from(f32::from_bits((bits as u32) << 16)),
        ScalarType::F16 => f16_to_f64(bits as u16),
        other => return Err(EvalError::Unsupported(format!("float value of type {other}"))),
    };
    Ok(value)
}

/// Rounds `value` to the nearest float of type `ty`, ties to even, returning
/// its bit pattern.
///
/// # Errors
///
/// - [`EvalError::Unsupported`] if `ty` is not a float type other than `f16`.
pub fn float_bits(value: f64, ty: ScalarType) -> Result<u64> {
    #[allow(clippy::cast_possible_truncation)] // Rounding is the point
    let bits = match ty {
        ScalarType::F64 => value.to_bits(),
        ScalarType::F32 => u64::from((value as f32).to_bits()),
        ScalarType::BF16 => u64::from(bf16_from_f64(value)),
        other => return Err(EvalError::Unsupported(format!("rounding to {other}"))),
    };
    Ok(bits)
}

/// Rounds `value` to the nearest `bf16`, ties to even, returning its bit
/// pattern.
///
/// NaNs are quieted while keeping their sign.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // The upper half of an f32 is a bf16
pub fn bf16_from_f64(value: f64) -> u16 {
    if value.is_nan() {
        return if value.is_sign_negative() { 0xffc0 } else { 0x7fc0 };
    }
    if value.is_infinite() || value == 0.0 {
        return ((value as f32).to_bits() >> 16) as u16;
    }

    // The exponent of the value, clamped to the smallest normal exponent such
    // that subnormals round at the right position.
    let biased = i32::try_from((value.to_bits() >> 52) & 0x7ff).unwrap_or(0);
    let exponent = (biased - 1023).max(-126);
    let quantum = 2f64.powi(exponent - 7);
    let rounded = (value / quantum).round_ties_even() * quantum;
    ((rounded as f32).to_bits() >> 16) as u16
}

/// Rounds the integer `value` to the nearest `bf16` with ties to even,
/// returning its bit pattern.
///
/// Integers beyond `±2^53` are rounded directly, as going through `f64` would
/// round them twice.
#[must_use]
#[allow(clippy::cast_precision_loss)] // Both casts are exact
pub fn bf16_from_i64(value: i64) -> u16 {
    let magnitude = value.unsigned_abs();
    if magnitude <= 1 << 53 {
        return bf16_from_f64(value as f64);
    }

    let shift = (63 - magnitude.leading_zeros()) - 7;
    let kept = magnitude >> shift;
    let rest = magnitude & ((1 << shift) - 1);
    let half = 1 << (shift - 1);
    let kept = if rest > half || (rest == half && kept & 1 == 1) {
        kept + 1
    } else {
        kept
    };

    let rounded = kept as f64 * 2f64.powi(i32::try_from(shift).unwrap_or(i32::MAX));
    bf16_from_f64(if value < 0 { -rounded } else { rounded })
}

/// Converts the bit pattern of an IEEE-754 `binary16` to an `f64`.
#[must_use]
pub fn f16_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 == 0 { 1.0 } else { -1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let mantissa = f64::from(bits & 0x3ff);
    let magnitude = match exponent {
        0 => mantissa * 2f64.powi(-24),
        0x1f if mantissa == 0.0 => f64::INFINITY,
        0x1f => f64::NAN,
        _ => (1024.0 + mantissa) * 2f64.powi(exponent - 25),
    };
    sign * magnitude
}
