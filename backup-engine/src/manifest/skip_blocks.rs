//! Skip-blocks file: fingerprints known to be stored already.
//!
//! One fingerprint per line. Lines are either `algorithm:digest` or a bare
//! digest whose algorithm is inferred from its length (128 hex characters
//! for sha512, 64 for sha256). Blank lines and `#` comments are ignored.
//! Files written here always use the explicit form.

use crate::hash::BlockFingerprint;
use crate::utils::errors::{EngineError, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn parse_skip_blocks(content: &str) -> Result<Vec<BlockFingerprint>> {
    let mut fingerprints = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fp = line.parse::<BlockFingerprint>().map_err(|_| {
            EngineError::InvalidFingerprint(format!("line {}: '{}'", lineno + 1, line))
        })?;
        fingerprints.push(fp);
    }
    Ok(fingerprints)
}

pub fn read_skip_blocks(path: &Path) -> Result<Vec<BlockFingerprint>> {
    let content = fs::read_to_string(path)?;
    parse_skip_blocks(&content)
}

pub fn write_skip_blocks<'a, I>(path: &Path, fingerprints: I) -> Result<()>
where
    I: IntoIterator<Item = &'a BlockFingerprint>,
{
    let mut file = std::io::BufWriter::new(fs::File::create(path)?);
    for fp in fingerprints {
        writeln!(file, "{fp}")?;
    }
    file.flush()?;
    Ok(())
}
