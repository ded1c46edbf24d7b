//! MPSL — a small, statically typed, shader-like expression language with a
//! just-in-time compiler and runtime.
//!
//! A host application describes the memory layout of an argument block (see
//! [`layout`]), submits source text through a shared [`context::Context`],
//! and gets back a [`program::Program`] whose compiled function can be
//! invoked repeatedly against instances of that layout.
//!
//! See `src/bin` for a small CLI that drives the pipeline for development use
//! (dumping tokens, AST, IR, or assembly).

#![allow(dead_code)]

pub mod common;
pub mod front;
pub mod middle;
pub mod back;

pub mod context;
pub mod layout;
pub mod program;

pub use common::error::Error;
pub use context::Context;
pub use layout::Layout;
pub use program::{CompileOptions, Program};
