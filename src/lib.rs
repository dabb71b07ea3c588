//! Lossless columnar pre-processor for LZMA2.
//!
//! Row-oriented text (CSV, delimited logs, JSON-lines) is decomposed into
//! per-template column streams with far lower local entropy than the row
//! stream, coded with LZMA2, and framed as independently decodable blocks.
//! The reverse path reconstructs the original bytes exactly; a footer
//! index optionally gives O(log blocks) row-range access.

pub mod block;
pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod footer;
pub mod guard;
pub mod reader;
pub mod restore;
pub mod strategy;
pub mod template;
pub mod tokenizer;
pub mod varint;
pub mod writer;

pub use codec::{Backend, Coder};
pub use config::{ColSep, Config, GuardTunables};
pub use error::{Error, Result};
pub use reader::{decompress_file, decompress_rows, verify_file, DecompressStats};
pub use writer::{compress_file, compress_stream, CancelToken, CompressStats};
