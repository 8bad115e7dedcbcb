//! Utilities for working with the LLVM instruction vocabulary that the
//! pipeline lowers to.
//!
//! Most operations of the arith dialect correspond one-to-one to an LLVM
//! instruction. That correspondence is kept as a bidirectional table of names
//! (see [`LoweringMap`]), so that it can be inspected and extended without
//! touching the lowering itself.
//!
//! The operations that need more than a renaming are not part of the table:
//! comparisons carry their predicate across, and `arith.index_cast` depends on
//! the widths of its operand and result.

pub mod mappings;

use bimap::{BiHashMap, BiMap};
use klo_ir::op::{ArithOp, LlvmOp};

use crate::llvm::mappings::{
    ARITH_ADDF,
    ARITH_ADDI,
    ARITH_ANDI,
    ARITH_BITCAST,
    ARITH_CONSTANT,
    ARITH_DIVF,
    ARITH_DIVSI,
    ARITH_EXTF,
    ARITH_EXTSI,
    ARITH_EXTUI,
    ARITH_FPTOSI,
    ARITH_MULF,
    ARITH_MULI,
    ARITH_NEGF,
    ARITH_ORI,
    ARITH_REMSI,
    ARITH_SELECT,
    ARITH_SHLI,
    ARITH_SHRSI,
    ARITH_SHRUI,
    ARITH_SITOFP,
    ARITH_SUBF,
    ARITH_SUBI,
    ARITH_TRUNCF,
    ARITH_TRUNCI,
    ARITH_XORI,
};

/// A bidirectional mapping from the names of arith operations to the names of
/// the LLVM instructions that they lower to.
#[derive(Clone, Debug, PartialEq)]
pub struct LoweringMap {
    /// A mapping from the arith-side names to the corresponding LLVM names.
    mapping: BiMap<String, String>,
}

impl LoweringMap {
    /// Constructs a new lowering map from the provided `mapping`.
    #[must_use]
    pub fn new(mapping: BiHashMap<String, String>) -> Self {
        Self { mapping }
    }

    /// Queries for the LLVM instruction name that corresponds to the provided
    /// `arith_name`, returning it if it exists or returning [`None`] otherwise.
    pub fn instruction(&self, arith_name: impl Into<String>) -> Option<&String> {
        self.mapping.get_by_left(&arith_name.into())
    }

    /// Queries for the arith operation name that corresponds to the provided
    /// `llvm_name`, returning it if it exists or returning [`None`] otherwise.
    pub fn arith(&self, llvm_name: impl Into<String>) -> Option<&String> {
        self.mapping.get_by_right(&llvm_name.into())
    }

    /// Gets the LLVM instruction that `op` lowers to.
    ///
    /// Returns [`None`] for `arith.index_cast`, whose lowering depends on the
    /// types involved, and for any operation missing from the map.
    #[must_use]
    pub fn lower(&self, op: ArithOp) -> Option<LlvmOp> {
        match op {
            ArithOp::CmpI(predicate) => Some(LlvmOp::ICmp(predicate)),
            ArithOp::CmpF(predicate) => Some(LlvmOp::FCmp(predicate)),
            ArithOp::IndexCast => None,
            other => Self::of_name(self.instruction(other.name())?),
        }
    }

    /// Gets the LLVM instruction without a payload called `name`.
    ///
    /// ```
    /// use klo_compiler::llvm::LoweringMap;
    /// use klo_ir::op::LlvmOp;
    ///
    /// assert_eq!(LoweringMap::of_name("fadd"), Some(LlvmOp::FAdd));
    /// assert_eq!(LoweringMap::of_name("alloca"), None);
    /// ```
    #[must_use]
    pub fn of_name(name: &str) -> Option<LlvmOp> {
        let instruction = match name {
            "constant" => LlvmOp::Constant,
            "add" => LlvmOp::Add,
            "sub" => LlvmOp::Sub,
            "mul" => LlvmOp::Mul,
            "sdiv" => LlvmOp::SDiv,
            "srem" => LlvmOp::SRem,
            "and" => LlvmOp::And,
            "or" => LlvmOp::Or,
            "xor" => LlvmOp::Xor,
            "shl" => LlvmOp::Shl,
            "lshr" => LlvmOp::LShr,
            "ashr" => LlvmOp::AShr,
            "fadd" => LlvmOp::FAdd,
            "fsub" => LlvmOp::FSub,
            "fmul" => LlvmOp::FMul,
            "fdiv" => LlvmOp::FDiv,
            "fneg" => LlvmOp::FNeg,
            "select" => LlvmOp::Select,
            "zext" => LlvmOp::ZExt,
            "sext" => LlvmOp::SExt,
            "trunc" => LlvmOp::Trunc,
            "fpext" => LlvmOp::FPExt,
            "fptrunc" => LlvmOp::FPTrunc,
            "sitofp" => LlvmOp::SIToFP,
            "fptosi" => LlvmOp::FPToSI,
            "bitcast" => LlvmOp::Bitcast,
            "getelementptr" => LlvmOp::Gep,
            "load" => LlvmOp::Load,
            "store" => LlvmOp::Store,
            _ => return None,
        };
        Some(instruction)
    }
}

impl Default for LoweringMap {
    /// Contains the default mapping from arith operations to LLVM instructions.
    fn default() -> Self {
        let defaults = [
            ARITH_CONSTANT,
            ARITH_ADDI,
            ARITH_SUBI,
            ARITH_MULI,
            ARITH_DIVSI,
            ARITH_REMSI,
            ARITH_ANDI,
            ARITH_ORI,
            ARITH_XORI,
            ARITH_SHLI,
            ARITH_SHRUI,
            ARITH_SHRSI,
            ARITH_ADDF,
            ARITH_SUBF,
            ARITH_MULF,
            ARITH_DIVF,
            ARITH_NEGF,
            ARITH_SELECT,
            ARITH_EXTUI,
            ARITH_EXTSI,
            ARITH_TRUNCI,
            ARITH_EXTF,
            ARITH_TRUNCF,
            ARITH_SITOFP,
            ARITH_FPTOSI,
            ARITH_BITCAST,
        ];

        Self::new(
            defaults
                .into_iter()
                .map(|(l, r)| (l.to_string(), r.to_string()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod test {
    use klo_ir::op::{ArithOp, IntPredicate, LlvmOp};

    use crate::llvm::LoweringMap;

    #[test]
    fn instruction_lookup_works() {
        let map = LoweringMap::default();

        assert_eq!(map.instruction("shrui").map(String::as_str), Some("lshr"));
        assert_eq!(map.arith("fptrunc").map(String::as_str), Some("truncf"));
    }

    #[test]
    fn every_mapped_name_is_an_instruction() {
        let map = LoweringMap::default();

        for (_, llvm) in &map.mapping {
            assert!(LoweringMap::of_name(llvm).is_some(), "{llvm} is not an instruction");
        }
    }

    #[test]
    fn comparisons_keep_their_predicate() {
        let map = LoweringMap::default();

        assert_eq!(
            map.lower(ArithOp::CmpI(IntPredicate::Sge)),
            Some(LlvmOp::ICmp(IntPredicate::Sge))
        );
        assert_eq!(map.lower(ArithOp::MulF), Some(LlvmOp::FMul));
        assert_eq!(map.lower(ArithOp::IndexCast), None);
    }
}
