//! The shared, reference-counted runtime state every [`crate::Program`]
//! compiles against (spec.md §4.9/§5).
//!
//! A `Context` bundles the three things spec.md calls out as the only
//! long-lived shared resources: the code allocator, the interned string
//! pool, and the built-in symbol table. The interned pool
//! (`internment::Intern`) and the built-in language tables
//! (`common::lang::OPERATORS`/`INTRINSICS`) are process-wide statics with no
//! per-`Context` state to own, so what actually lives behind the `Arc` here
//! is the one piece that *is* per-instance: detected/masked CPU feature
//! flags the backend's instruction selection consults on every compile.
//! Cloning a `Context` is an `Arc` clone (cheap, thread-safe reference
//! counting); the last `Drop` releases it exactly like any other `Arc`.

use std::sync::Arc;

use crate::back::TargetFeatures;

struct Inner {
    features: TargetFeatures,
}

/// Shared JIT/runtime resources. Cheap to clone (an `Arc` bump); safe to
/// share across threads, since the only state it owns is read-only after
/// construction.
#[derive(Clone)]
pub struct Context(Arc<Inner>);

impl Context {
    /// Construct a context with reference count 1, auto-detecting the host
    /// CPU's SIMD feature set.
    pub fn create() -> Context {
        let features = TargetFeatures::detect();
        log::debug!("mpsl context created: {features:?}");
        Context(Arc::new(Inner { features }))
    }

    /// The detected feature set, before any `CompileOptions::DISABLE_*`
    /// masking (each `Program::compile` call masks its own copy).
    pub fn features(&self) -> TargetFeatures {
        self.0.features
    }

    /// Number of outstanding handles to this context's shared state,
    /// exposed mainly for tests exercising the reference-counting
    /// described in spec.md §4.9.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::create()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_increments_and_drop_decrements_refcount() {
        let ctx = Context::create();
        assert_eq!(ctx.strong_count(), 1);
        let ctx2 = ctx.clone();
        assert_eq!(ctx.strong_count(), 2);
        drop(ctx2);
        assert_eq!(ctx.strong_count(), 1);
    }

    #[test]
    fn two_contexts_detect_the_same_host_features() {
        let a = Context::create();
        let b = Context::create();
        assert_eq!(a.features(), b.features());
    }
}
