//! Container compression driver.
//!
//! Orchestrates the guard decision, row-aligned chunking, block assembly,
//! coding and framing. Assembly is always serial (input order defines
//! template IDs and the row-order stream); with more than one lane the
//! coder calls run on worker threads and an in-order sink writes frames.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, info};

use crate::block;
use crate::codec::Coder;
use crate::config::Config;
use crate::container::{self, ContainerHeader};
use crate::error::{Error, Result};
use crate::footer::{FooterEntry, FooterIndex};
use crate::guard::{self, GuardDecision, GUARD_SAMPLE_BYTES};

/// Rows measured to size indexed blocks.
const ROW_SIZE_SAMPLE: u64 = 1000;

/// Cooperative cancellation flag, checked once per block.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CompressStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub blocks: u64,
    pub rows: u64,
}

/// Row-aligned chunker. Block inputs start and end on row boundaries;
/// unconsumed tails (early seals) are taken back for the next block.
struct BlockSource<R: Read> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    eof: bool,
}

impl<R: Read> BlockSource<R> {
    fn new(head: Vec<u8>, reader: BufReader<R>) -> Self {
        Self {
            reader,
            pending: head,
            eof: false,
        }
    }

    /// Append one row (through its LF, or to EOF) to `buf`.
    fn read_row_into(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let n = self.reader.read_until(b'\n', buf)?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        if buf.last() != Some(&b'\n') {
            self.eof = true;
        }
        Ok(true)
    }

    /// At least `target` bytes of whole rows, or everything left.
    fn next_solid(&mut self, target: usize) -> Result<Option<Vec<u8>>> {
        let mut buf = std::mem::take(&mut self.pending);
        while buf.len() < target {
            if !self.read_row_into(&mut buf)? {
                break;
            }
        }
        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buf))
        }
    }

    /// At least `rows` rows, or everything left.
    fn next_rows(&mut self, rows: u64) -> Result<Option<Vec<u8>>> {
        let mut buf = std::mem::take(&mut self.pending);
        let mut count = buf.iter().filter(|&&b| b == b'\n').count() as u64;
        while count < rows {
            if !self.read_row_into(&mut buf)? {
                break;
            }
            count += 1;
        }
        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buf))
        }
    }

    /// Take back the unconsumed tail of the last block input.
    fn push_back(&mut self, tail: &[u8]) {
        debug_assert!(self.pending.is_empty());
        self.pending = tail.to_vec();
    }

    /// Drain the rest of the input (opaque path).
    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buf = std::mem::take(&mut self.pending);
        self.reader.read_to_end(&mut buf)?;
        self.eof = true;
        Ok(buf)
    }

    /// §4.F row-size mode: mean row length over the first `ROW_SIZE_SAMPLE`
    /// rows decides how many rows each indexed block holds.
    fn rows_per_block(&mut self, target_block_bytes: usize) -> Result<u64> {
        let mut buf = std::mem::take(&mut self.pending);
        let mut count = buf.iter().filter(|&&b| b == b'\n').count() as u64;
        while count < ROW_SIZE_SAMPLE {
            if !self.read_row_into(&mut buf)? {
                break;
            }
            count += 1;
        }
        let (mut sample_rows, mut sample_bytes) = (0u64, 0u64);
        for row in buf.split_inclusive(|&b| b == b'\n').take(ROW_SIZE_SAMPLE as usize) {
            sample_rows += 1;
            sample_bytes += row.len() as u64;
        }
        self.pending = buf;
        if sample_rows == 0 {
            return Ok(1);
        }
        let mean = sample_bytes as f64 / sample_rows as f64;
        Ok(((target_block_bytes as f64 / mean).ceil() as u64).max(1))
    }
}

pub fn compress_file(
    input_path: &Path,
    output_path: &Path,
    cfg: &Config,
    cancel: &CancelToken,
) -> Result<CompressStats> {
    let input = File::open(input_path)?;
    let input_size = input.metadata()?.len();
    let output = File::create(output_path)?;
    let mut writer = BufWriter::new(output);
    let stats = compress_stream(input, &mut writer, input_size, cfg, cancel)?;
    writer.flush()?;
    Ok(stats)
}

/// Compress `input` into `output`. `input_size` is recorded in the
/// container header; pass 0 when unknown.
pub fn compress_stream<R: Read, W: Write + Send>(
    input: R,
    output: &mut W,
    input_size: u64,
    cfg: &Config,
    cancel: &CancelToken,
) -> Result<CompressStats> {
    let mut reader = BufReader::new(input);
    let mut head = Vec::with_capacity(GUARD_SAMPLE_BYTES);
    while head.len() < GUARD_SAMPLE_BYTES {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            break;
        }
        let take = chunk.len().min(GUARD_SAMPLE_BYTES - head.len());
        head.extend_from_slice(&chunk[..take]);
        reader.consume(take);
    }

    let header = ContainerHeader {
        indexed: cfg.indexed,
        input_size,
    };
    output.write_all(&header.encode())?;
    let header_len = header.encoded_len();
    let mut source = BlockSource::new(head, reader);

    let decision = guard::classify(&source.pending, &cfg.guard);
    if decision == GuardDecision::Opaque {
        info!("binary guard: input is opaque, skipping structural pass");
        return compress_opaque(&mut source, output, header_len, cfg, cancel);
    }

    let row_limit = if cfg.indexed {
        let rows = source.rows_per_block(cfg.target_block_bytes)?;
        info!("indexed mode: {rows} rows per block");
        Some(rows)
    } else {
        None
    };

    let (entries, mut stats) = if cfg.effective_threads() > 1 {
        compress_parallel(&mut source, output, header_len, row_limit, cfg, cancel)?
    } else {
        compress_serial(&mut source, output, header_len, row_limit, cfg, cancel)?
    };
    stats.bytes_out += header_len;

    if cfg.indexed {
        let footer = FooterIndex { entries };
        let bytes = footer.encode();
        output.write_all(&bytes)?;
        stats.bytes_out += bytes.len() as u64;
        debug!(
            "footer index: {} entries, {} bytes",
            footer.entries.len(),
            bytes.len()
        );
    }

    info!(
        "compressed {} bytes into {} bytes across {} blocks ({} rows)",
        stats.bytes_in, stats.bytes_out, stats.blocks, stats.rows
    );
    Ok(stats)
}

fn compress_opaque<R: Read, W: Write>(
    source: &mut BlockSource<R>,
    output: &mut W,
    header_len: u64,
    cfg: &Config,
    cancel: &CancelToken,
) -> Result<CompressStats> {
    let raw = source.read_to_end()?;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let sealed = block::seal_opaque(&raw, cfg)?;
    // The single opaque block is the one place the coder's own
    // multithreading pays off.
    let coder = Coder::new(cfg.backend, cfg.dict_size, cfg.effective_threads());
    let compressed = coder.encode(&sealed.bytes, 0)?;
    let frame_len = container::write_frame(output, &compressed)?;
    let prefix_len = frame_len - compressed.len() as u64;

    let mut bytes_out = header_len + frame_len;
    if cfg.indexed {
        let footer = FooterIndex {
            entries: vec![FooterEntry {
                compressed_offset: header_len + prefix_len,
                compressed_length: compressed.len() as u64,
                first_row_index: 0,
                row_count: 0,
            }],
        };
        let bytes = footer.encode();
        output.write_all(&bytes)?;
        bytes_out += bytes.len() as u64;
    }
    info!("compressed {} opaque bytes into {bytes_out} bytes", raw.len());
    Ok(CompressStats {
        bytes_in: raw.len() as u64,
        bytes_out,
        blocks: 1,
        rows: 0,
    })
}

fn next_block_input<R: Read>(
    source: &mut BlockSource<R>,
    row_limit: Option<u64>,
    target_block_bytes: usize,
) -> Result<Option<Vec<u8>>> {
    match row_limit {
        Some(rows) => source.next_rows(rows),
        None => source.next_solid(target_block_bytes),
    }
}

fn compress_serial<R: Read, W: Write>(
    source: &mut BlockSource<R>,
    output: &mut W,
    start_offset: u64,
    row_limit: Option<u64>,
    cfg: &Config,
    cancel: &CancelToken,
) -> Result<(Vec<FooterEntry>, CompressStats)> {
    let coder = Coder::new(cfg.backend, cfg.dict_size, 1);
    let mut entries = Vec::new();
    let mut stats = CompressStats::default();
    let mut offset = start_offset;
    let mut next_row = 1u64;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(input) = next_block_input(source, row_limit, cfg.target_block_bytes)? else {
            break;
        };
        let block_index = stats.blocks;
        let (sealed, consumed) = block::build_block(&input, cfg, row_limit)?;
        if consumed < input.len() {
            source.push_back(&input[consumed..]);
        }
        let compressed = coder.encode(&sealed.bytes, block_index)?;
        debug!(
            "block {block_index}: {} rows, {} -> {} bytes{}",
            sealed.row_count,
            sealed.plain_len,
            compressed.len(),
            if sealed.opaque { " (opaque)" } else { "" }
        );
        let frame_len = container::write_frame(output, &compressed)?;
        let prefix_len = frame_len - compressed.len() as u64;
        entries.push(FooterEntry {
            compressed_offset: offset + prefix_len,
            compressed_length: compressed.len() as u64,
            first_row_index: if sealed.row_count > 0 { next_row } else { 0 },
            row_count: sealed.row_count,
        });
        next_row += sealed.row_count;
        offset += frame_len;
        stats.bytes_in += sealed.plain_len;
        stats.bytes_out += frame_len;
        stats.rows += sealed.row_count;
        stats.blocks += 1;
    }
    Ok((entries, stats))
}

#[derive(Debug, Clone, Copy)]
struct BlockMeta {
    index: u64,
    rows: u64,
    plain_len: u64,
    opaque: bool,
}

/// Pipelined compression: this thread assembles blocks in input order,
/// worker lanes run the coder, a sink thread writes frames back in order.
fn compress_parallel<R: Read, W: Write + Send>(
    source: &mut BlockSource<R>,
    output: &mut W,
    start_offset: u64,
    row_limit: Option<u64>,
    cfg: &Config,
    cancel: &CancelToken,
) -> Result<(Vec<FooterEntry>, CompressStats)> {
    let lanes = cfg.effective_threads();
    let coder = Coder::new(cfg.backend, cfg.dict_size, 1);
    let (work_tx, work_rx) = mpsc::sync_channel::<(BlockMeta, Vec<u8>)>(lanes);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (done_tx, done_rx) = mpsc::sync_channel::<(BlockMeta, Result<Vec<u8>>)>(lanes);

    let mut reader_result: Result<(u64, u64)> = Ok((0, 0));
    let sink_result = thread::scope(|scope| -> Result<(Vec<FooterEntry>, CompressStats)> {
        for lane in 0..lanes {
            let work_rx = Arc::clone(&work_rx);
            let done_tx = done_tx.clone();
            let coder = coder.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("cast-coder-{lane}"))
                .spawn_scoped(scope, move || loop {
                    // A poisoned queue means a sibling lane died; shut this
                    // lane down too.
                    let received = match work_rx.lock() {
                        Ok(queue) => queue.recv(),
                        Err(_) => break,
                    };
                    let (meta, bytes) = match received {
                        Ok(item) => item,
                        Err(_) => break,
                    };
                    let result = if cancel.is_cancelled() {
                        Err(Error::Cancelled)
                    } else {
                        coder.encode(&bytes, meta.index)
                    };
                    drop(bytes);
                    if done_tx.send((meta, result)).is_err() {
                        break;
                    }
                })
                .map_err(Error::Io)?;
        }
        drop(done_tx);
        // The lanes hold their own queue handles; releasing this one lets
        // a fully-dead lane pool disconnect the work channel instead of
        // leaving the reader blocked on send.
        drop(work_rx);

        let sink = thread::Builder::new()
            .name("cast-sink".to_string())
            .spawn_scoped(scope, move || sink_loop(done_rx, output, start_offset))
            .map_err(Error::Io)?;

        // Reader role: assemble and serialize blocks in input order.
        let mut block_index = 0u64;
        let mut produced = (0u64, 0u64);
        loop {
            if cancel.is_cancelled() {
                reader_result = Err(Error::Cancelled);
                break;
            }
            let input = match next_block_input(source, row_limit, cfg.target_block_bytes) {
                Ok(Some(input)) => input,
                Ok(None) => break,
                Err(err) => {
                    reader_result = Err(err);
                    break;
                }
            };
            match block::build_block(&input, cfg, row_limit) {
                Ok((sealed, consumed)) => {
                    if consumed < input.len() {
                        source.push_back(&input[consumed..]);
                    }
                    produced.0 += sealed.plain_len;
                    produced.1 += sealed.row_count;
                    let meta = BlockMeta {
                        index: block_index,
                        rows: sealed.row_count,
                        plain_len: sealed.plain_len,
                        opaque: sealed.opaque,
                    };
                    if work_tx.send((meta, sealed.bytes)).is_err() {
                        break;
                    }
                    block_index += 1;
                }
                Err(err) => {
                    reader_result = Err(err);
                    break;
                }
            }
        }
        if let Ok(totals) = reader_result.as_mut() {
            *totals = produced;
        }
        drop(work_tx);
        sink.join().map_err(|_| {
            Error::Io(std::io::Error::other("compression sink thread panicked"))
        })?
    });

    let (bytes_in, rows) = reader_result?;
    let (entries, mut stats) = sink_result?;
    stats.bytes_in = bytes_in;
    stats.rows = rows;
    Ok((entries, stats))
}

fn sink_loop<W: Write>(
    done_rx: mpsc::Receiver<(BlockMeta, Result<Vec<u8>>)>,
    output: &mut W,
    start_offset: u64,
) -> Result<(Vec<FooterEntry>, CompressStats)> {
    let mut reorder: BTreeMap<u64, (BlockMeta, Vec<u8>)> = BTreeMap::new();
    let mut next_index = 0u64;
    let mut offset = start_offset;
    let mut next_row = 1u64;
    let mut entries = Vec::new();
    let mut stats = CompressStats::default();
    let mut first_err: Option<Error> = None;

    for (meta, result) in done_rx {
        match result {
            Ok(compressed) => {
                reorder.insert(meta.index, (meta, compressed));
            }
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
                continue;
            }
        }
        while first_err.is_none() {
            let Some((meta, compressed)) = reorder.remove(&next_index) else {
                break;
            };
            debug!(
                "block {}: {} rows, {} -> {} bytes{}",
                meta.index,
                meta.rows,
                meta.plain_len,
                compressed.len(),
                if meta.opaque { " (opaque)" } else { "" }
            );
            match container::write_frame(output, &compressed) {
                Ok(frame_len) => {
                    let prefix_len = frame_len - compressed.len() as u64;
                    entries.push(FooterEntry {
                        compressed_offset: offset + prefix_len,
                        compressed_length: compressed.len() as u64,
                        first_row_index: if meta.rows > 0 { next_row } else { 0 },
                        row_count: meta.rows,
                    });
                    next_row += meta.rows;
                    offset += frame_len;
                    stats.bytes_out += frame_len;
                    stats.blocks += 1;
                    next_index += 1;
                }
                Err(err) => {
                    first_err = Some(err);
                }
            }
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok((entries, stats)),
    }
}
