//! Filesystem access - directory traversal, file metadata and the text
//! form of byte paths.

pub mod metadata;
pub mod pathname;
pub mod walker;
