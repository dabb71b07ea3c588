//! Block assembly and serialization.
//!
//! A block is the unit of independent compression: rows are tokenized,
//! templates interned, variable fields appended to per-template column
//! buffers, and the whole thing serialized into the logical on-disk form
//! that is handed to the coder.

use log::debug;

use crate::config::{ColSep, Config};
use crate::error::{Error, Result};
use crate::strategy::{self, Election};
use crate::template::{Intern, Registry, TemplateId};
use crate::tokenizer::{tokenize_row, RowShape, Strategy};
use crate::varint;

pub const BLOCK_MAGIC: u32 = 0x4341_5354; // "CAST"
pub const BLOCK_VERSION: u8 = 1;

pub const FLAG_OPAQUE: u8 = 1 << 0;
pub const FLAG_INDEXED: u8 = 1 << 1;
pub const FLAG_COLSEP_LENGTHS: u8 = 1 << 2;
pub const FLAG_AGGRESSIVE: u8 = 1 << 3;

/// Unit separator between column values when `FLAG_COLSEP_LENGTHS` is clear.
pub const COLUMN_UNIT_SEP: u8 = 0x1F;

/// Fixed-size part of the header: magic, version, flags.
pub const BLOCK_HEADER_FIXED: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub flags: u8,
    pub uncompressed_len: u64,
    pub row_count: u64,
    pub template_count: u64,
}

impl BlockHeader {
    pub fn is_opaque(&self) -> bool {
        self.flags & FLAG_OPAQUE != 0
    }

    pub fn lengths_mode(&self) -> bool {
        self.flags & FLAG_COLSEP_LENGTHS != 0
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&BLOCK_MAGIC.to_le_bytes());
        out.push(BLOCK_VERSION);
        out.push(self.flags);
        varint::write_u64(out, self.uncompressed_len);
        varint::write_u64(out, self.row_count);
        varint::write_u64(out, self.template_count);
    }

    /// Decode a header from the front of `buf`, returning it and the number
    /// of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < BLOCK_HEADER_FIXED {
            return Err(Error::Corrupt("block header truncated"));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice length"));
        if magic != BLOCK_MAGIC {
            return Err(Error::Corrupt("block magic mismatch"));
        }
        let version = buf[4];
        if version != BLOCK_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf[5];
        let mut at = BLOCK_HEADER_FIXED;
        let (uncompressed_len, used) = varint::read_u64(&buf[at..])?;
        at += used;
        let (row_count, used) = varint::read_u64(&buf[at..])?;
        at += used;
        let (template_count, used) = varint::read_u64(&buf[at..])?;
        at += used;
        Ok((
            Self {
                flags,
                uncompressed_len,
                row_count,
                template_count,
            },
            at,
        ))
    }
}

/// Column values stored back to back, addressed by end offsets.
#[derive(Debug, Default, Clone)]
struct ColumnBuffer {
    data: Vec<u8>,
    ends: Vec<usize>,
    has_unit_sep: bool,
}

impl ColumnBuffer {
    fn push(&mut self, value: &[u8]) {
        if value.contains(&COLUMN_UNIT_SEP) {
            self.has_unit_sep = true;
        }
        self.data.extend_from_slice(value);
        self.ends.push(self.data.len());
    }

    fn len(&self) -> usize {
        self.ends.len()
    }

    fn get(&self, index: usize) -> &[u8] {
        let start = if index == 0 { 0 } else { self.ends[index - 1] };
        &self.data[start..self.ends[index]]
    }
}

/// A block sealed in its uncompressed logical form, ready for the coder.
#[derive(Debug)]
pub struct SealedBlock {
    pub bytes: Vec<u8>,
    pub row_count: u64,
    pub plain_len: u64,
    pub opaque: bool,
}

/// Why assembly stopped consuming input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seal {
    EndOfInput,
    TemplateOverflow,
    RowLimit,
}

/// Assemble and serialize one block from the front of `input`.
///
/// Consumes whole rows up to `row_limit` (when given) or the end of
/// `input`, sealing early if the template registry fills up. Returns the
/// sealed block and the number of input bytes consumed; the caller feeds
/// the remainder to the next block.
pub fn build_block(
    input: &[u8],
    cfg: &Config,
    row_limit: Option<u64>,
) -> Result<(SealedBlock, usize)> {
    let strategy = match strategy::elect(input, cfg.sample_rows) {
        Election::Tokenize(strategy) => strategy,
        Election::Opaque => {
            debug!("block sampler found no stable strategy, sealing opaque");
            return Ok((seal_opaque(input, cfg)?, input.len()));
        }
    };

    // Capacity 1 at minimum: the first row of a block must always intern,
    // or sealing could never make progress.
    let mut registry = Registry::new(cfg.max_templates.max(1));
    let mut columns: Vec<Vec<ColumnBuffer>> = Vec::new();
    let mut row_order: Vec<TemplateId> = Vec::new();
    let mut shape = RowShape::default();
    let mut consumed = 0usize;
    let mut seal = Seal::EndOfInput;

    for row in input.split_inclusive(|&b| b == b'\n') {
        if row_limit.map_or(false, |limit| row_order.len() as u64 >= limit) {
            seal = Seal::RowLimit;
            break;
        }
        tokenize_row(row, strategy, &mut shape);
        if shape.nul_in_literal {
            // The sentinel would be ambiguous; fall back to a raw block.
            debug!("NUL in literal context, sealing block opaque");
            return Ok((seal_opaque(input, cfg)?, input.len()));
        }
        let id = match registry.intern(&shape.key) {
            Intern::Existing(id) => id,
            Intern::Fresh(id) => {
                columns.push(vec![ColumnBuffer::default(); shape.arity()]);
                id
            }
            Intern::Overflow => {
                seal = Seal::TemplateOverflow;
                break;
            }
        };
        row_order.push(id);
        let cols = &mut columns[id as usize];
        for (col, range) in cols.iter_mut().zip(shape.fields.iter()) {
            col.push(&row[range.clone()]);
        }
        consumed += row.len();
    }

    if seal == Seal::TemplateOverflow {
        debug!(
            "template registry full at {} entries, sealing block early",
            registry.len()
        );
    }
    let plain = &input[..consumed];
    let sealed = serialize(plain, strategy, &registry, &row_order, &columns, cfg)?;
    Ok((sealed, consumed))
}

/// Serialize `input` as a single opaque block: raw payload, no structure.
pub fn seal_opaque(input: &[u8], cfg: &Config) -> Result<SealedBlock> {
    let mut flags = FLAG_OPAQUE;
    if cfg.indexed {
        flags |= FLAG_INDEXED;
    }
    let header = BlockHeader {
        flags,
        uncompressed_len: input.len() as u64,
        row_count: 0,
        template_count: 0,
    };
    let mut bytes = Vec::with_capacity(input.len() + 32);
    header.encode(&mut bytes);
    bytes.extend_from_slice(input);
    bytes.extend_from_slice(&crc32(input).to_le_bytes());
    Ok(SealedBlock {
        bytes,
        row_count: 0,
        plain_len: input.len() as u64,
        opaque: true,
    })
}

fn serialize(
    plain: &[u8],
    strategy: Strategy,
    registry: &Registry,
    row_order: &[TemplateId],
    columns: &[Vec<ColumnBuffer>],
    cfg: &Config,
) -> Result<SealedBlock> {
    let any_unit_sep = columns
        .iter()
        .flatten()
        .any(|col| col.has_unit_sep);
    let lengths_mode = match cfg.colsep {
        ColSep::Auto => any_unit_sep,
        ColSep::Lengths => true,
        ColSep::Unit => {
            if any_unit_sep {
                return Err(Error::Corrupt(
                    "unit-separator column mode cannot carry 0x1F field bytes",
                ));
            }
            false
        }
    };

    let mut flags = 0u8;
    if cfg.indexed {
        flags |= FLAG_INDEXED;
    }
    if lengths_mode {
        flags |= FLAG_COLSEP_LENGTHS;
    }
    if strategy == Strategy::Aggressive {
        flags |= FLAG_AGGRESSIVE;
    }
    let header = BlockHeader {
        flags,
        uncompressed_len: plain.len() as u64,
        row_count: row_order.len() as u64,
        template_count: registry.len() as u64,
    };

    let mut bytes = Vec::with_capacity(plain.len() / 2 + 64);
    header.encode(&mut bytes);

    for template in registry.iter() {
        varint::write_u64(&mut bytes, template.key.len() as u64);
        bytes.extend_from_slice(&template.key);
    }

    for &id in row_order {
        varint::write_u64(&mut bytes, id as u64);
    }

    let mut stream = Vec::new();
    for cols in columns {
        for col in cols {
            stream.clear();
            if lengths_mode {
                for i in 0..col.len() {
                    let value = col.get(i);
                    varint::write_u64(&mut stream, value.len() as u64);
                    stream.extend_from_slice(value);
                }
            } else {
                for i in 0..col.len() {
                    if i > 0 {
                        stream.push(COLUMN_UNIT_SEP);
                    }
                    stream.extend_from_slice(col.get(i));
                }
            }
            varint::write_u64(&mut bytes, stream.len() as u64);
            bytes.extend_from_slice(&stream);
        }
    }

    bytes.extend_from_slice(&crc32(plain).to_le_bytes());
    Ok(SealedBlock {
        bytes,
        row_count: row_order.len() as u64,
        plain_len: plain.len() as u64,
        opaque: false,
    })
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
