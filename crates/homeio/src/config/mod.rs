//! Configuration loading.
//!
//! homeio reads one or more TOML files. Files may `imports = [...]` others;
//! all of them are merged field by field with first-wins semantics, and a field
//! set twice is reported as a conflict pointing at both definitions.

#[allow(clippy::module_inception)]
mod config;
mod diagnostics;
mod partial;

pub use config::*;
pub use diagnostics::Diagnostic;
pub use diagnostics::LoadError;
pub use diagnostics::format_diagnostics;
