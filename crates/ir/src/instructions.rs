//! Instruction data: one tagged enum, pattern-match dispatch.

use crate::attrs::ParamAttrs;
use crate::constant::Constant;
use crate::entities::{Block, FuncId, GlobalId, MdId, TypeId, Value};
use smallvec::SmallVec;

/// An instruction operand.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    /// An SSA value: a parameter or an instruction result.
    Value(Value),
    /// An immediate constant (possibly a constant expression).
    Const(Constant),
    /// The address of a global variable.
    Global(GlobalId),
    /// The address of a function.
    Func(FuncId),
    /// A metadata reference (only in debug intrinsics).
    Metadata(MdId),
}

impl Operand {
    pub fn as_value(&self) -> Option<Value> {
        match self {
            Operand::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Operand::Const(c) => Some(c),
            _ => None,
        }
    }

    /// Sign-extended value when this operand is an integer constant.
    pub fn const_sext(&self) -> Option<i64> {
        self.as_const().and_then(Constant::sext_value)
    }

    /// Zero-extended value when this operand is an integer constant.
    pub fn const_zext(&self) -> Option<u64> {
        self.as_const().and_then(Constant::zext_value)
    }

    pub fn as_func(&self) -> Option<FuncId> {
        match self {
            Operand::Func(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<GlobalId> {
        match self {
            Operand::Global(g) => Some(*g),
            _ => None,
        }
    }
}

/// Cast opcodes (plus `freeze`, which behaves like a value-preserving cast
/// for every analysis here).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    FpToUi,
    FpToSi,
    UiToFp,
    SiToFp,
    PtrToInt,
    IntToPtr,
    Bitcast,
    AddrSpaceCast,
    Freeze,
}

impl CastOp {
    pub fn from_keyword(kw: &str) -> Option<Self> {
        Some(match kw {
            "trunc" => CastOp::Trunc,
            "zext" => CastOp::ZExt,
            "sext" => CastOp::SExt,
            "fptrunc" => CastOp::FpTrunc,
            "fpext" => CastOp::FpExt,
            "fptoui" => CastOp::FpToUi,
            "fptosi" => CastOp::FpToSi,
            "uitofp" => CastOp::UiToFp,
            "sitofp" => CastOp::SiToFp,
            "ptrtoint" => CastOp::PtrToInt,
            "inttoptr" => CastOp::IntToPtr,
            "bitcast" => CastOp::Bitcast,
            "addrspacecast" => CastOp::AddrSpaceCast,
            "freeze" => CastOp::Freeze,
            _ => return None,
        })
    }

    /// Casts that preserve a pointer value.
    pub fn preserves_pointer(self) -> bool {
        matches!(
            self,
            CastOp::Bitcast | CastOp::AddrSpaceCast | CastOp::Freeze
        )
    }

    /// Casts between integer representations of the same quantity.
    pub fn is_int_cast(self) -> bool {
        matches!(self, CastOp::Trunc | CastOp::ZExt | CastOp::SExt | CastOp::Freeze)
    }
}

/// Binary opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

impl BinOp {
    pub fn from_keyword(kw: &str) -> Option<Self> {
        Some(match kw {
            "add" => BinOp::Add,
            "sub" => BinOp::Sub,
            "mul" => BinOp::Mul,
            "udiv" => BinOp::UDiv,
            "sdiv" => BinOp::SDiv,
            "urem" => BinOp::URem,
            "srem" => BinOp::SRem,
            "shl" => BinOp::Shl,
            "lshr" => BinOp::LShr,
            "ashr" => BinOp::AShr,
            "and" => BinOp::And,
            "or" => BinOp::Or,
            "xor" => BinOp::Xor,
            "fadd" => BinOp::FAdd,
            "fsub" => BinOp::FSub,
            "fmul" => BinOp::FMul,
            "fdiv" => BinOp::FDiv,
            "frem" => BinOp::FRem,
            _ => return None,
        })
    }
}

/// Integer comparison predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl IntPredicate {
    pub fn from_keyword(kw: &str) -> Option<Self> {
        Some(match kw {
            "eq" => IntPredicate::Eq,
            "ne" => IntPredicate::Ne,
            "ugt" => IntPredicate::Ugt,
            "uge" => IntPredicate::Uge,
            "ult" => IntPredicate::Ult,
            "ule" => IntPredicate::Ule,
            "sgt" => IntPredicate::Sgt,
            "sge" => IntPredicate::Sge,
            "slt" => IntPredicate::Slt,
            "sle" => IntPredicate::Sle,
            _ => return None,
        })
    }

    /// The predicate obtained by swapping the operands (`a < b` becomes
    /// `b > a`).
    pub fn swapped(self) -> Self {
        match self {
            IntPredicate::Eq => IntPredicate::Eq,
            IntPredicate::Ne => IntPredicate::Ne,
            IntPredicate::Ugt => IntPredicate::Ult,
            IntPredicate::Uge => IntPredicate::Ule,
            IntPredicate::Ult => IntPredicate::Ugt,
            IntPredicate::Ule => IntPredicate::Uge,
            IntPredicate::Sgt => IntPredicate::Slt,
            IntPredicate::Sge => IntPredicate::Sle,
            IntPredicate::Slt => IntPredicate::Sgt,
            IntPredicate::Sle => IntPredicate::Sge,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            IntPredicate::Sgt | IntPredicate::Sge | IntPredicate::Slt | IntPredicate::Sle
        )
    }
}

/// One call-site argument with its attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallArg {
    pub value: Operand,
    pub attrs: ParamAttrs,
}

/// Debug record kinds (`#dbg_declare` / `#dbg_value` and their legacy
/// intrinsic spellings).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugRecordKind {
    Declare,
    Value,
}

/// The instruction itself.
#[derive(Clone, Debug, PartialEq)]
pub enum InstData {
    Alloca {
        allocated_ty: TypeId,
        count: Operand,
        align: u64,
    },
    Load {
        ty: TypeId,
        ptr: Operand,
    },
    Store {
        value: Operand,
        ptr: Operand,
    },
    GetElementPtr {
        source_ty: TypeId,
        base: Operand,
        indices: Vec<Operand>,
        inbounds: bool,
    },
    ICmp {
        pred: IntPredicate,
        lhs: Operand,
        rhs: Operand,
    },
    Binary {
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    Cast {
        op: CastOp,
        value: Operand,
        to_ty: TypeId,
    },
    Phi {
        ty: TypeId,
        incoming: Vec<(Operand, Block)>,
    },
    Select {
        cond: Operand,
        if_true: Operand,
        if_false: Operand,
    },
    Call {
        callee: Operand,
        args: Vec<CallArg>,
        ret_ty: TypeId,
    },
    Invoke {
        callee: Operand,
        args: Vec<CallArg>,
        ret_ty: TypeId,
        normal_dest: Block,
        unwind_dest: Block,
    },
    Br {
        dest: Block,
    },
    CondBr {
        cond: Operand,
        then_dest: Block,
        else_dest: Block,
    },
    Switch {
        value: Operand,
        default_dest: Block,
        cases: Vec<(i64, Block)>,
    },
    Ret {
        value: Option<Operand>,
    },
    AtomicRmw {
        ptr: Operand,
        value: Operand,
    },
    CmpXchg {
        ptr: Operand,
        expected: Operand,
        replacement: Operand,
    },
    Unreachable,
    /// A `#dbg_declare(...)` / `#dbg_value(...)` record line.
    DebugRecord {
        kind: DebugRecordKind,
        value: Operand,
        variable: Option<MdId>,
    },
    /// Any instruction the model does not represent. Operands are dropped;
    /// the analyses treat it as an opaque side effect.
    Unknown {
        opcode: String,
    },
}

impl InstData {
    /// Control-flow successors of this instruction, in IR operand order.
    pub fn branch_targets(&self) -> SmallVec<[Block; 2]> {
        let mut out = SmallVec::new();
        match self {
            InstData::Br { dest } => out.push(*dest),
            InstData::CondBr {
                then_dest,
                else_dest,
                ..
            } => {
                out.push(*then_dest);
                out.push(*else_dest);
            }
            InstData::Switch {
                default_dest,
                cases,
                ..
            } => {
                out.push(*default_dest);
                for (_, dest) in cases {
                    out.push(*dest);
                }
            }
            InstData::Invoke {
                normal_dest,
                unwind_dest,
                ..
            } => {
                out.push(*normal_dest);
                out.push(*unwind_dest);
            }
            _ => {}
        }
        out
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstData::Br { .. }
                | InstData::CondBr { .. }
                | InstData::Switch { .. }
                | InstData::Ret { .. }
                | InstData::Invoke { .. }
                | InstData::Unreachable
        )
    }

    /// The direct callee of a call or invoke, when there is one.
    pub fn direct_callee(&self) -> Option<FuncId> {
        match self {
            InstData::Call { callee, .. } | InstData::Invoke { callee, .. } => callee.as_func(),
            _ => None,
        }
    }

    /// Call arguments of a call or invoke.
    pub fn call_args(&self) -> Option<&[CallArg]> {
        match self {
            InstData::Call { args, .. } | InstData::Invoke { args, .. } => Some(args),
            _ => None,
        }
    }

    /// All value-level operands, for generic dataflow walks.
    pub fn operands(&self) -> SmallVec<[&Operand; 4]> {
        let mut out = SmallVec::new();
        match self {
            InstData::Alloca { count, .. } => out.push(count),
            InstData::Load { ptr, .. } => out.push(ptr),
            InstData::Store { value, ptr } => {
                out.push(value);
                out.push(ptr);
            }
            InstData::GetElementPtr { base, indices, .. } => {
                out.push(base);
                out.extend(indices.iter());
            }
            InstData::ICmp { lhs, rhs, .. } | InstData::Binary { lhs, rhs, .. } => {
                out.push(lhs);
                out.push(rhs);
            }
            InstData::Cast { value, .. } => out.push(value),
            InstData::Phi { incoming, .. } => out.extend(incoming.iter().map(|(op, _)| op)),
            InstData::Select {
                cond,
                if_true,
                if_false,
            } => {
                out.push(cond);
                out.push(if_true);
                out.push(if_false);
            }
            InstData::Call { callee, args, .. } | InstData::Invoke { callee, args, .. } => {
                out.push(callee);
                out.extend(args.iter().map(|a| &a.value));
            }
            InstData::CondBr { cond, .. } => out.push(cond),
            InstData::Switch { value, .. } => out.push(value),
            InstData::Ret { value: Some(v) } => out.push(v),
            InstData::AtomicRmw { ptr, value } => {
                out.push(ptr);
                out.push(value);
            }
            InstData::CmpXchg {
                ptr,
                expected,
                replacement,
            } => {
                out.push(ptr);
                out.push(expected);
                out.push(replacement);
            }
            InstData::DebugRecord { value, .. } => out.push(value),
            InstData::Br { .. }
            | InstData::Ret { value: None }
            | InstData::Unreachable
            | InstData::Unknown { .. } => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_swap_is_symmetric() {
        for pred in [
            IntPredicate::Eq,
            IntPredicate::Ne,
            IntPredicate::Ugt,
            IntPredicate::Uge,
            IntPredicate::Ult,
            IntPredicate::Ule,
            IntPredicate::Sgt,
            IntPredicate::Sge,
            IntPredicate::Slt,
            IntPredicate::Sle,
        ] {
            assert_eq!(pred.swapped().swapped(), pred);
        }
        assert_eq!(IntPredicate::Slt.swapped(), IntPredicate::Sgt);
        assert_eq!(IntPredicate::Eq.swapped(), IntPredicate::Eq);
    }
}
