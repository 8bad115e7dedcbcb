//! The default correspondence between the operations of the arith dialect and
//! the instructions of the LLVM vocabulary.
//!
//! These constants are left undocumented as they have extremely self-describing
//! names.

/// A pair where the left element is the arith-side name, and the right side is
/// the name of the LLVM instruction it lowers to.
type OpPair<'a> = (&'a str, &'a str);

pub const ARITH_CONSTANT: OpPair<'static> = ("constant", "constant");
pub const ARITH_ADDI: OpPair<'static> = ("addi", "add");
pub const ARITH_SUBI: OpPair<'static> = ("subi", "sub");
pub const ARITH_MULI: OpPair<'static> = ("muli", "mul");
pub const ARITH_DIVSI: OpPair<'static> = ("divsi", "sdiv");
pub const ARITH_REMSI: OpPair<'static> = ("remsi", "srem");
pub const ARITH_ANDI: OpPair<'static> = ("andi", "and");
pub const ARITH_ORI: OpPair<'static> = ("ori", "or");
pub const ARITH_XORI: OpPair<'static> = ("xori", "xor");
pub const ARITH_SHLI: OpPair<'static> = ("shli", "shl");
pub const ARITH_SHRUI: OpPair<'static> = ("shrui", "lshr");
pub const ARITH_SHRSI: OpPair<'static> = ("shrsi", "ashr");
pub const ARITH_ADDF: OpPair<'static> = ("addf", "fadd");
pub const ARITH_SUBF: OpPair<'static> = ("subf", "fsub");
pub const ARITH_MULF: OpPair<'static> = ("mulf", "fmul");
pub const ARITH_DIVF: OpPair<'static> = ("divf", "fdiv");
pub const ARITH_NEGF: OpPair<'static> = ("negf", "fneg");
pub const ARITH_SELECT: OpPair<'static> = ("select", "select");
pub const ARITH_EXTUI: OpPair<'static> = ("extui", "zext");
pub const ARITH_EXTSI: OpPair<'static> = ("extsi", "sext");
pub const ARITH_TRUNCI: OpPair<'static> = ("trunci", "trunc");
pub const ARITH_EXTF: OpPair<'static> = ("extf", "fpext");
pub const ARITH_TRUNCF: OpPair<'static> = ("truncf", "fptrunc");
pub const ARITH_SITOFP: OpPair<'static> = ("sitofp", "sitofp");
pub const ARITH_FPTOSI: OpPair<'static> = ("fptosi", "fptosi");
pub const ARITH_BITCAST: OpPair<'static> = ("bitcast", "bitcast");
