//! Host environment lookups.
//!
//! - `eligibility`: whether a target process may be instrumented.
//! - `toolchain`: OS-family strategy for locating the auxiliary compiler library.
//! - `artifacts`: resolution of installed agent/client artifacts.

pub mod artifacts;
pub mod eligibility;
pub mod toolchain;
