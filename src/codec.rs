//! Coder adapter: the only module that knows what the back-end is.
//!
//! Everything else hands in opaque byte buffers and gets opaque byte
//! buffers back. Two back-ends: LZMA2 in-process via liblzma, or an
//! external 7-Zip executable. Both are safe to drive from several worker
//! threads at once; the external variant keeps a scratch directory per
//! call.

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use xz2::read::XzDecoder;
use xz2::stream::{Check, Filters, LzmaOptions, MtStreamBuilder, Stream};
use xz2::write::XzEncoder;

use crate::error::{Error, Result};

const LZMA_PRESET_EXTREME: u32 = 0x8000_0000;
const LZMA_PRESET: u32 = 9 | LZMA_PRESET_EXTREME;

/// Cap on blind pre-allocation when the decoded size is unknown.
const MAX_DECODE_PREALLOC: usize = 2 * 1024 * 1024 * 1024;

/// Back-end selection; a configuration value, not a type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    NativeLzma2,
    SevenZip,
}

/// A configured coder. `threads` only affects the native encoder; the
/// external one decides its own parallelism.
#[derive(Debug, Clone)]
pub enum Coder {
    NativeLzma2 { dict_size: u32, threads: usize },
    SevenZip { dict_size: u32 },
}

impl Coder {
    pub fn new(backend: Backend, dict_size: u32, threads: usize) -> Self {
        match backend {
            Backend::NativeLzma2 => Coder::NativeLzma2 { dict_size, threads },
            Backend::SevenZip => Coder::SevenZip { dict_size },
        }
    }

    pub fn encode(&self, data: &[u8], block: u64) -> Result<Vec<u8>> {
        match self {
            Coder::NativeLzma2 { dict_size, threads } => {
                native_encode(data, *dict_size, *threads)
                    .map_err(|reason| Error::CodecEncode { block, reason })
            }
            Coder::SevenZip { dict_size } => seven_zip_encode(data, *dict_size)
                .map_err(|reason| Error::CodecEncode { block, reason }),
        }
    }

    pub fn decode(&self, data: &[u8], block: u64) -> Result<Vec<u8>> {
        match self {
            Coder::NativeLzma2 { .. } => native_decode(data)
                .map_err(|reason| Error::CodecDecode { block, reason }),
            Coder::SevenZip { .. } => seven_zip_decode(data)
                .map_err(|reason| Error::CodecDecode { block, reason }),
        }
    }
}

fn native_encode(data: &[u8], dict_size: u32, threads: usize) -> std::result::Result<Vec<u8>, String> {
    let mut opts =
        LzmaOptions::new_preset(LZMA_PRESET).map_err(|e| format!("lzma preset: {e}"))?;
    opts.dict_size(dict_size);
    let mut filters = Filters::new();
    filters.lzma2(&opts);

    // Multithreaded xz splits the input across threads; payloads smaller
    // than the dictionary gain nothing and lose ratio, so they stay solid.
    let multithread = threads > 1 && data.len() >= dict_size as usize;

    let stream = if multithread {
        MtStreamBuilder::new()
            .threads(threads as u32)
            .filters(filters)
            .check(Check::Crc32)
            .encoder()
            .map_err(|e| format!("lzma mt encoder init: {e}"))?
    } else {
        Stream::new_stream_encoder(&filters, Check::Crc32)
            .map_err(|e| format!("lzma encoder init: {e}"))?
    };

    let capacity = (data.len() / 2).min(dict_size as usize);
    let mut encoder = XzEncoder::new_stream(Vec::with_capacity(capacity), stream);
    encoder
        .write_all(data)
        .map_err(|e| format!("lzma write: {e}"))?;
    encoder.finish().map_err(|e| format!("lzma finish: {e}"))
}

fn native_decode(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut decoder = XzDecoder::new(data);
    let capacity = data.len().saturating_mul(6).min(MAX_DECODE_PREALLOC);
    let mut out = Vec::with_capacity(capacity);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| format!("lzma read: {e}"))?;
    Ok(out)
}

/// Resolve the 7-Zip command: `SEVEN_ZIP_PATH` first, then platform
/// conventions, then whatever is on PATH.
pub fn seven_zip_command() -> String {
    if let Ok(path) = env::var("SEVEN_ZIP_PATH") {
        return path.trim_matches('"').to_string();
    }
    if cfg!(target_os = "windows") {
        let standard = r"C:\Program Files\7-Zip\7z.exe";
        if Path::new(standard).exists() {
            return standard.to_string();
        }
        return "7z.exe".to_string();
    }
    if cfg!(target_os = "macos") {
        for path in ["/opt/homebrew/bin/7zz", "/usr/local/bin/7zz", "/usr/local/bin/7z"] {
            if Path::new(path).exists() {
                return path.to_string();
            }
        }
        return "7zz".to_string();
    }
    "7z".to_string()
}

/// Probe for a runnable 7-Zip executable.
pub fn find_seven_zip() -> Option<String> {
    let cmd = seven_zip_command();
    if (cmd.contains('/') || cmd.contains('\\')) && !Path::new(&cmd).exists() {
        return None;
    }
    Command::new(&cmd)
        .arg("-h")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()
        .map(|_| cmd)
}

fn seven_zip_encode(data: &[u8], dict_size: u32) -> std::result::Result<Vec<u8>, String> {
    let scratch = tempfile::Builder::new()
        .prefix("cast_xz_")
        .tempdir()
        .map_err(|e| format!("scratch dir: {e}"))?;
    let tmp_in = scratch.path().join("input.bin");
    let tmp_out = scratch.path().join("output.xz");

    let mut file = File::create(&tmp_in).map_err(|e| format!("scratch input: {e}"))?;
    file.write_all(data).map_err(|e| format!("scratch write: {e}"))?;
    file.sync_all().map_err(|e| format!("scratch sync: {e}"))?;
    drop(file);

    let dict_arg = format!("-m0=lzma2:d{dict_size}b");
    let output = Command::new(seven_zip_command())
        .args(["a", "-txz", "-mx=9", "-mmt=on", &dict_arg, "-y", "-bb0"])
        .arg(&tmp_out)
        .arg(&tmp_in)
        .output()
        .map_err(|e| format!("spawn 7z: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "7z exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    fs::read(&tmp_out).map_err(|e| format!("read 7z output: {e}"))
}

fn seven_zip_decode(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut child = Command::new(seven_zip_command())
        .args(["e", "-txz", "-si", "-so", "-y", "-bb0"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        // Not piped: an undrained stderr pipe can deadlock against stdout.
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| format!("spawn 7z: {e}"))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| "7z stdin unavailable".to_string())?;
    let input = data.to_vec();
    let feeder = thread::spawn(move || stdin.write_all(&input));

    let mut out = Vec::with_capacity(data.len().saturating_mul(5).min(MAX_DECODE_PREALLOC));
    if let Some(mut stdout) = child.stdout.take() {
        stdout
            .read_to_end(&mut out)
            .map_err(|e| format!("read 7z output: {e}"))?;
    }
    let status = child.wait().map_err(|e| format!("wait 7z: {e}"))?;
    let _ = feeder.join();
    if !status.success() {
        return Err(format!("7z exited with {status}"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_round_trip() {
        let coder = Coder::new(Backend::NativeLzma2, 1 << 20, 1);
        let data = b"the quick brown fox jumps over the lazy dog\n".repeat(100);
        let encoded = coder.encode(&data, 0).expect("encode");
        assert!(encoded.len() < data.len());
        let decoded = coder.decode(&encoded, 0).expect("decode");
        assert_eq!(decoded, data);
    }

    #[test]
    fn native_round_trip_empty() {
        let coder = Coder::new(Backend::NativeLzma2, 1 << 20, 1);
        let encoded = coder.encode(b"", 0).expect("encode");
        let decoded = coder.decode(&encoded, 0).expect("decode");
        assert!(decoded.is_empty());
    }

    #[test]
    fn decode_garbage_is_a_codec_error() {
        let coder = Coder::new(Backend::NativeLzma2, 1 << 20, 1);
        let err = coder.decode(b"definitely not xz", 7).unwrap_err();
        match err {
            Error::CodecDecode { block, .. } => assert_eq!(block, 7),
            other => panic!("unexpected error: {other}"),
        }
    }
}
