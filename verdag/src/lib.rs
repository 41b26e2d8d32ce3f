//! verdag Library
//!
//! Dependency-aware orchestration of SMT-backed crate verification: crate
//! identity resolution, cross-crate symbol bindings, success-marker
//! propagation, and synthesis of the native environment the external
//! verifier needs.

pub mod cache;
pub mod deps;
pub mod env;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod platform;
pub mod task;
pub mod testing;
pub mod toolchain;
pub mod unit;

pub use error::{Result, VerifyError};
pub use graph::{BuildGraph, BuildReport, UnitOutcome};
pub use platform::Platform;
pub use toolchain::{ArtifactSource, LocalBundle, ToolchainBundle};
pub use unit::{UnitSpec, VerificationUnit};
