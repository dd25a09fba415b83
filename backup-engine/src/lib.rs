//! Backup Engine Library
//!
//! Deduplicating block-level backup engine: files are split into fixed-size
//! blocks, stored once per content fingerprint on a pluggable backend and
//! recorded in immutable manifests.

pub mod backend;
pub mod commands;
pub mod config;
pub mod executor;
pub mod fs;
pub mod hash;
pub mod manifest;
pub mod queue;
pub mod report;
pub mod utils;
pub mod wrappers;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
