//! In-memory model of LLVM IR for the stackscan analyzer.
//!
//! The model is deliberately smaller than LLVM's: it keeps exactly the
//! capability set the analyses need. Functions own their basic blocks and
//! instructions through entity maps; instructions are a tagged enum that the
//! analyses dispatch on with plain pattern matching.

pub mod attrs;
pub mod constant;
pub mod datalayout;
pub mod dominator_tree;
pub mod entities;
pub mod flowgraph;
pub mod function;
pub mod instructions;
pub mod metadata;
pub mod module;
pub mod types;

pub use crate::attrs::{FnAttrs, ParamAttrs};
pub use crate::constant::{ConstExpr, Constant};
pub use crate::datalayout::DataLayout;
pub use crate::dominator_tree::DominatorTree;
pub use crate::entities::{Block, FuncId, GlobalId, Inst, MdId, TypeId, Value};
pub use crate::flowgraph::ControlFlowGraph;
pub use crate::function::{BlockData, Function, Param, ValueData, ValueDef};
pub use crate::instructions::{
    BinOp, CallArg, CastOp, DebugRecordKind, InstData, IntPredicate, Operand,
};
pub use crate::metadata::{DwTag, MdNode, MetadataStore, TypeQuals};
pub use crate::module::{GlobalData, Module};
pub use crate::types::{TypeData, TypeStore};
