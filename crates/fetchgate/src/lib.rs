//! Public facade crate for `fetchgate`.
//!
//! This crate intentionally contains no IO or provider-specific logic.
//! It re-exports the backend-agnostic types/traits from `fetchgate-core`.

pub use fetchgate_core::*;
