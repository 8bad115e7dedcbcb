//! The opcodes of the IR.
//!
//! Opcodes are grouped by the dialect that they belong to, mirroring the
//! dialects of MLIR that the kernel representation is modelled on. Every
//! opcode has an arity [`Schema`] that the verifier checks operations against.
//!
//! # Affine Payloads
//!
//! Opcodes that compute addresses or indices carry an affine expression as
//! part of the opcode itself. The dims of such an expression refer to the
//! _index operands_ of the operation, which start at the position given by
//! [`Opcode::index_operand_base`]. For example, the dims of a `mem.store`
//! refer to the operands following the stored value and the slice.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{affine::AffineExpr, types::Type};

/// The predicates of integer comparisons.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

/// The predicates of floating point comparisons.
///
/// Ordered predicates are false if either operand is NaN, while unordered
/// predicates are true in that case.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatPredicate {
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
    Ord,
    Uno,
    Ueq,
    Une,
}

/// The bounds of an `scf.for` loop.
///
/// The loop runs its induction variable from `lower` (inclusive) to `upper`
/// (exclusive) in increments of `step`. The dims of both bounds refer to the
/// first `bound_operands` operands of the loop, and the remaining operands are
/// the initial values of the loop-carried values.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct LoopBounds {
    pub lower:          AffineExpr,
    pub upper:          AffineExpr,
    pub step:           i64,
    pub bound_operands: u32,
}

/// The function dialect.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum FuncOp {
    /// Returns the operands from the function.
    Return,
}

/// The unstructured control flow dialect.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum CfOp {
    /// Branches to the single successor.
    Br,

    /// Branches to the first successor if the `i1` operand is set, and to the
    /// second otherwise.
    CondBr,
}

/// The structured control flow dialect.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ScfOp {
    /// A counted loop with a single-block body region.
    ///
    /// The body block takes the induction variable followed by the
    /// loop-carried values, and the results of the loop are the loop-carried
    /// values after the final iteration.
    For(LoopBounds),

    /// A conditional with a `then` and an `else` region, each consisting of a
    /// single block.
    If,

    /// Terminates the regions of [`Self::For`] and [`Self::If`], forwarding its
    /// operands to the parent.
    Yield,
}

/// The scalar arithmetic dialect.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ArithOp {
    /// Materializes the `value` attribute.
    Constant,
    AddI,
    SubI,
    MulI,
    DivSI,
    RemSI,
    AndI,
    OrI,
    XOrI,
    ShlI,
    ShrUI,
    ShrSI,
    AddF,
    SubF,
    MulF,
    DivF,
    NegF,
    CmpI(IntPredicate),
    CmpF(FloatPredicate),
    Select,
    ExtUI,
    ExtSI,
    TruncI,
    ExtF,
    TruncF,
    SIToFP,
    FPToSI,
    Bitcast,
    IndexCast,
}

impl ArithOp {
    /// Gets the name of the operation in the arith dialect.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::AddI => "addi",
            Self::SubI => "subi",
            Self::MulI => "muli",
            Self::DivSI => "divsi",
            Self::RemSI => "remsi",
            Self::AndI => "andi",
            Self::OrI => "ori",
            Self::XOrI => "xori",
            Self::ShlI => "shli",
            Self::ShrUI => "shrui",
            Self::ShrSI => "shrsi",
            Self::AddF => "addf",
            Self::SubF => "subf",
            Self::MulF => "mulf",
            Self::DivF => "divf",
            Self::NegF => "negf",
            Self::CmpI(_) => "cmpi",
            Self::CmpF(_) => "cmpf",
            Self::Select => "select",
            Self::ExtUI => "extui",
            Self::ExtSI => "extsi",
            Self::TruncI => "trunci",
            Self::ExtF => "extf",
            Self::TruncF => "truncf",
            Self::SIToFP => "sitofp",
            Self::FPToSI => "fptosi",
            Self::Bitcast => "bitcast",
            Self::IndexCast => "index_cast",
        }
    }

    /// Returns `true` for the operations that convert a value from one type
    /// to another.
    #[must_use]
    pub fn is_cast(self) -> bool {
        matches!(
            self,
            Self::ExtUI
                | Self::ExtSI
                | Self::TruncI
                | Self::ExtF
                | Self::TruncF
                | Self::SIToFP
                | Self::FPToSI
                | Self::Bitcast
                | Self::IndexCast
        )
    }

    /// Gets the number of operands the operation takes.
    #[must_use]
    pub fn operand_count(self) -> usize {
        match self {
            Self::Constant => 0,
            Self::Select => 3,
            Self::NegF => 1,
            op if op.is_cast() => 1,
            _ => 2,
        }
    }
}

/// The index dialect.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum IndexOp {
    /// Evaluates `map` over the index operands.
    Apply { map: AffineExpr },

    /// The id of the executing thread along dimension `dim`, which is known to
    /// lie in `[0, upper)`.
    ThreadId { dim: u32, upper: u64 },
}

/// The tensor dialect.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum TensorOp {
    /// Creates an uninitialized tensor of the result type.
    Empty,

    /// Reads the element of the tensor operand at the index operands.
    Extract,

    /// Produces the destination tensor (the second operand) with the scalar
    /// (the first operand) written at the index operands.
    Insert,

    /// Extracts the sub-tensor of the result type at `offsets` from the tensor
    /// operand, with unit strides. The dims of each offset refer to the index
    /// operands.
    ExtractSlice { offsets: Vec<AffineExpr> },
}

/// The memory dialect, operating on slices of buffers.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum MemOp {
    /// Allocates the buffer named by the slice result type.
    Alloc,

    /// Creates a slice of the source slice starting `offset` bytes into it.
    Subslice { offset: AffineExpr },

    /// Loads a scalar from `offset` bytes into the slice.
    Load { offset: AffineExpr },

    /// Stores the scalar operand at `offset` bytes into the slice.
    Store { offset: AffineExpr },
}

/// The LLVM instruction vocabulary accepted by the backend code generator.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum LlvmOp {
    Constant,
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FNeg,
    ICmp(IntPredicate),
    FCmp(FloatPredicate),
    Select,
    ZExt,
    SExt,
    Trunc,
    FPExt,
    FPTrunc,
    SIToFP,
    FPToSI,
    Bitcast,

    /// Offsets the pointer operand by the `i64` operand in bytes.
    Gep,
    Load,
    Store,

    /// Reserves `bytes` bytes of stack memory.
    Alloca { bytes: u64 },
    Br,
    CondBr,
    Return,

    /// Calls the named intrinsic.
    Call(String),
}

impl LlvmOp {
    /// Gets the name of the instruction.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Constant => "constant",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::SDiv => "sdiv",
            Self::SRem => "srem",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::LShr => "lshr",
            Self::AShr => "ashr",
            Self::FAdd => "fadd",
            Self::FSub => "fsub",
            Self::FMul => "fmul",
            Self::FDiv => "fdiv",
            Self::FNeg => "fneg",
            Self::ICmp(_) => "icmp",
            Self::FCmp(_) => "fcmp",
            Self::Select => "select",
            Self::ZExt => "zext",
            Self::SExt => "sext",
            Self::Trunc => "trunc",
            Self::FPExt => "fpext",
            Self::FPTrunc => "fptrunc",
            Self::SIToFP => "sitofp",
            Self::FPToSI => "fptosi",
            Self::Bitcast => "bitcast",
            Self::Gep => "getelementptr",
            Self::Load => "load",
            Self::Store => "store",
            Self::Alloca { .. } => "alloca",
            Self::Br => "br",
            Self::CondBr => "cond_br",
            Self::Return => "ret",
            Self::Call(_) => "call",
        }
    }
}

/// The number of operands or results that an opcode accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    /// Returns `true` if `count` satisfies the arity.
    #[must_use]
    pub fn admits(self, count: usize) -> bool {
        match self {
            Self::Exact(n) => count == n,
            Self::AtLeast(n) => count >= n,
        }
    }
}

impl Display for Arity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(n) => write!(f, "{n}"),
            Self::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// The shape that operations with a given opcode must have.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Schema {
    pub operands:   Arity,
    pub results:    Arity,
    pub regions:    usize,
    pub successors: usize,
    pub terminator: bool,
}

impl Schema {
    const fn new(operands: Arity, results: Arity) -> Self {
        Self {
            operands,
            results,
            regions: 0,
            successors: 0,
            terminator: false,
        }
    }

    const fn terminator(operands: Arity, successors: usize) -> Self {
        Self {
            operands,
            results: Arity::Exact(0),
            regions: 0,
            successors,
            terminator: true,
        }
    }
}

/// The opcode of an operation.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    Func(FuncOp),
    Cf(CfOp),
    Scf(ScfOp),
    Arith(ArithOp),
    Index(IndexOp),
    Tensor(TensorOp),
    Mem(MemOp),
    Llvm(LlvmOp),

    /// An operation from a dialect that the pipeline knows nothing about.
    Unregistered(String),
}

impl Opcode {
    /// Gets the arity schema of the opcode.
    #[must_use]
    pub fn schema(&self) -> Schema {
        use Arity::{AtLeast, Exact};
        match self {
            Self::Func(FuncOp::Return) => Schema::terminator(AtLeast(0), 0),
            Self::Cf(CfOp::Br) => Schema::terminator(Exact(0), 1),
            Self::Cf(CfOp::CondBr) => Schema::terminator(Exact(1), 2),
            Self::Scf(ScfOp::For(_)) => Schema {
                regions: 1,
                ..Schema::new(AtLeast(0), AtLeast(0))
            },
            Self::Scf(ScfOp::If) => Schema {
                regions: 2,
                ..Schema::new(Exact(1), AtLeast(0))
            },
            Self::Scf(ScfOp::Yield) => Schema::terminator(AtLeast(0), 0),
            Self::Arith(op) => Schema::new(Exact(op.operand_count()), Exact(1)),
            Self::Index(IndexOp::Apply { .. }) => Schema::new(AtLeast(0), Exact(1)),
            Self::Index(IndexOp::ThreadId { .. }) | Self::Tensor(TensorOp::Empty) => {
                Schema::new(Exact(0), Exact(1))
            }
            Self::Tensor(TensorOp::Extract | TensorOp::ExtractSlice { .. }) => {
                Schema::new(AtLeast(1), Exact(1))
            }
            Self::Tensor(TensorOp::Insert) => Schema::new(AtLeast(2), Exact(1)),
            Self::Mem(MemOp::Alloc) => Schema::new(Exact(0), Exact(1)),
            Self::Mem(MemOp::Subslice { .. } | MemOp::Load { .. }) => {
                Schema::new(AtLeast(1), Exact(1))
            }
            Self::Mem(MemOp::Store { .. }) => Schema::new(AtLeast(2), Exact(0)),
            Self::Llvm(op) => Self::llvm_schema(op),
            Self::Unregistered(_) => Schema::new(AtLeast(0), AtLeast(0)),
        }
    }

    fn llvm_schema(op: &LlvmOp) -> Schema {
        use Arity::{AtLeast, Exact};
        match op {
            LlvmOp::Constant | LlvmOp::Alloca { .. } => Schema::new(Exact(0), Exact(1)),
            LlvmOp::FNeg
            | LlvmOp::ZExt
            | LlvmOp::SExt
            | LlvmOp::Trunc
            | LlvmOp::FPExt
            | LlvmOp::FPTrunc
            | LlvmOp::SIToFP
            | LlvmOp::FPToSI
            | LlvmOp::Bitcast
            | LlvmOp::Load => Schema::new(Exact(1), Exact(1)),
            LlvmOp::Select => Schema::new(Exact(3), Exact(1)),
            LlvmOp::Store => Schema::new(Exact(2), Exact(0)),
            LlvmOp::Call(_) => Schema::new(AtLeast(0), AtLeast(0)),
            LlvmOp::Br => Schema::terminator(Exact(0), 1),
            LlvmOp::CondBr => Schema::terminator(Exact(1), 2),
            LlvmOp::Return => Schema::terminator(AtLeast(0), 0),
            _ => Schema::new(Exact(2), Exact(1)),
        }
    }

    /// Returns `true` if operations with this opcode must terminate their
    /// block.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        self.schema().terminator
    }

    /// Gets the position of the first index operand referred to by the dims of
    /// the affine payload of the opcode, if it has one.
    #[must_use]
    pub fn index_operand_base(&self) -> Option<usize> {
        match self {
            Self::Index(IndexOp::Apply { .. }) | Self::Scf(ScfOp::For(_)) => Some(0),
            Self::Tensor(TensorOp::Extract | TensorOp::ExtractSlice { .. })
            | Self::Mem(MemOp::Subslice { .. } | MemOp::Load { .. }) => Some(1),
            Self::Tensor(TensorOp::Insert) | Self::Mem(MemOp::Store { .. }) => Some(2),
            _ => None,
        }
    }

    /// Gets the affine expressions carried by the opcode.
    #[must_use]
    pub fn affine_exprs(&self) -> Vec<&AffineExpr> {
        match self {
            Self::Index(IndexOp::Apply { map }) => vec![map],
            Self::Scf(ScfOp::For(bounds)) => vec![&bounds.lower, &bounds.upper],
            Self::Tensor(TensorOp::ExtractSlice { offsets }) => offsets.iter().collect(),
            Self::Mem(
                MemOp::Subslice { offset } | MemOp::Load { offset } | MemOp::Store { offset },
            ) => vec![offset],
            _ => vec![],
        }
    }

    /// Gets the affine expressions carried by the opcode mutably.
    pub fn affine_exprs_mut(&mut self) -> Vec<&mut AffineExpr> {
        match self {
            Self::Index(IndexOp::Apply { map }) => vec![map],
            Self::Scf(ScfOp::For(bounds)) => vec![&mut bounds.lower, &mut bounds.upper],
            Self::Tensor(TensorOp::ExtractSlice { offsets }) => offsets.iter_mut().collect(),
            Self::Mem(
                MemOp::Subslice { offset } | MemOp::Load { offset } | MemOp::Store { offset },
            ) => vec![offset],
            _ => vec![],
        }
    }

    /// Returns `true` if the opcode belongs to the tensor dialect.
    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(self, Self::Tensor(_))
    }

    /// Returns `true` if the opcode belongs to the LLVM instruction
    /// vocabulary.
    #[must_use]
    pub fn is_llvm(&self) -> bool {
        matches!(self, Self::Llvm(_))
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Func(FuncOp::Return) => write!(f, "func.return"),
            Self::Cf(CfOp::Br) => write!(f, "cf.br"),
            Self::Cf(CfOp::CondBr) => write!(f, "cf.cond_br"),
            Self::Scf(ScfOp::For(_)) => write!(f, "scf.for"),
            Self::Scf(ScfOp::If) => write!(f, "scf.if"),
            Self::Scf(ScfOp::Yield) => write!(f, "scf.yield"),
            Self::Arith(op) => write!(f, "arith.{}", op.name()),
            Self::Index(IndexOp::Apply { .. }) => write!(f, "index.apply"),
            Self::Index(IndexOp::ThreadId { .. }) => write!(f, "index.thread_id"),
            Self::Tensor(TensorOp::Empty) => write!(f, "tensor.empty"),
            Self::Tensor(TensorOp::Extract) => write!(f, "tensor.extract"),
            Self::Tensor(TensorOp::Insert) => write!(f, "tensor.insert"),
            Self::Tensor(TensorOp::ExtractSlice { .. }) => write!(f, "tensor.extract_slice"),
            Self::Mem(MemOp::Alloc) => write!(f, "mem.alloc"),
            Self::Mem(MemOp::Subslice { .. }) => write!(f, "mem.subslice"),
            Self::Mem(MemOp::Load { .. }) => write!(f, "mem.load"),
            Self::Mem(MemOp::Store { .. }) => write!(f, "mem.store"),
            Self::Llvm(op) => write!(f, "llvm.{}", op.name()),
            Self::Unregistered(name) => write!(f, "{name}"),
        }
    }
}

/// A literal constant attached to an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Ints(Vec<i64>),
    Affine(AffineExpr),
    Type(Type),
}

impl Attribute {
    /// Gets the integer if the attribute is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Gets the float if the attribute is one.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}
