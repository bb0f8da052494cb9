//! Logic modules: prerequisite tooling the pipeline needs before it starts.
//!
//! # Modules
//!
//! - `dependencies`: detect, install, and record required tools
//! - `download`: direct-download fallback for tools no package source provides

pub mod dependencies;
pub mod download;
