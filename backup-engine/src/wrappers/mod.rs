//! Backend wrappers.
//!
//! A wrapper implements [`Backend`](crate::backend::Backend) by delegating
//! to an inner backend it exclusively owns, transforming names and/or
//! content on the way. Wrappers nest, and order matters: the usual stack is
//!
//! ```text
//! NameCrypto(DataCrypto(Compress(raw)))
//! ```
//!
//! so callers see plaintext names and content while the raw adapter only
//! ever sees hex-encoded encrypted names and encrypted payloads.

mod compress;
mod data_crypto;
mod name_crypto;

pub use compress::Compress;
pub use data_crypto::DataCrypto;
pub use name_crypto::NameCrypto;
