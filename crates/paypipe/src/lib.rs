//! Public facade crate for `paypipe`.
//!
//! This crate intentionally contains no IO or marketplace-specific logic.
//! It re-exports the backend-agnostic types/traits from `paypipe-core`.

pub use paypipe_core::*;
