//! The middle tier: the intermediate representation and the optimization
//! passes that run over it before handing off to the backend.

pub mod opt;
pub mod tir;

pub use tir::{
    BlockId, CallTarget, FuncId, IRBlock, IRFunction, IRInst, IRModule, IRObject, IRTerm, MemBase, MemRef,
    SlotId, VReg,
};
