//! Lossless text form of byte paths.
//!
//! Manifests are JSON, so relative paths and symlink targets are stored as
//! strings even though Unix paths are arbitrary bytes. Valid UTF-8 passes
//! through unchanged except that `\` is doubled; every byte outside valid
//! UTF-8 is written as `\xNN`. [`decode`] gives back the exact bytes.

use crate::utils::errors::{EngineError, Result};
use std::ffi::{OsStr, OsString};
use std::fmt::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

pub fn encode(path: &OsStr) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            if c == '\\' {
                out.push_str("\\\\");
            } else {
                out.push(c);
            }
        }
        for byte in chunk.invalid() {
            let _ = write!(out, "\\x{byte:02x}");
        }
    }
    out
}

pub fn decode(text: &str) -> Result<PathBuf> {
    let malformed = || EngineError::InvalidManifest(format!("malformed escape in path '{text}'"));

    let mut bytes = Vec::with_capacity(text.len());
    let mut rest = text.as_bytes();
    while let Some((&b, tail)) = rest.split_first() {
        rest = match (b, tail) {
            (b'\\', [b'\\', tail @ ..]) => {
                bytes.push(b'\\');
                tail
            }
            (b'\\', [b'x', hi, lo, tail @ ..]) => {
                bytes.extend(hex::decode([*hi, *lo]).map_err(|_| malformed())?);
                tail
            }
            (b'\\', _) => return Err(malformed()),
            _ => {
                bytes.push(b);
                tail
            }
        };
    }
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}
