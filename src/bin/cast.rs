use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use log::info;

use cast::config::DEFAULT_DICT_SIZE;
use cast::{codec, Backend, CancelToken, Coder, Config, Error};

#[derive(Parser)]
#[command(name = "cast", version, about = "Columnar structural transform in front of LZMA2")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Prefer an external 7-Zip for compression, fall back to native.
    Auto,
    /// In-process liblzma.
    Native,
    /// External 7-Zip executable (honors SEVEN_ZIP_PATH).
    #[value(name = "7zip")]
    SevenZip,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a file into a container
    Compress {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = Mode::Auto)]
        mode: Mode,
        /// Target uncompressed block size, e.g. 64MB
        #[arg(long, value_parser = parse_size)]
        chunk_size: Option<u64>,
        /// LZMA2 dictionary size, e.g. 128MB
        #[arg(long, value_parser = parse_size)]
        dict_size: Option<u64>,
        /// Append a footer index for row-range queries
        #[arg(long)]
        indexed: bool,
        /// Re-read the container through the full reverse path afterwards
        #[arg(long)]
        verify: bool,
        /// Parallel coder lanes; N omitted means one per CPU
        #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "0")]
        multithread: Option<usize>,
    },
    /// Restore a container to the original bytes
    Decompress {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = Mode::Auto)]
        mode: Mode,
        /// 1-based inclusive row range, e.g. 5000..5001 (indexed containers)
        #[arg(long, value_parser = parse_rows)]
        rows: Option<(u64, u64)>,
    },
    /// Stream every block through the reverse path, checking all CRCs
    Verify {
        input: PathBuf,
        #[arg(long, value_enum, default_value_t = Mode::Auto)]
        mode: Mode,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}

fn run() -> cast::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Compress {
            input,
            output,
            mode,
            chunk_size,
            dict_size,
            indexed,
            verify,
            multithread,
        } => {
            let backend = resolve_backend(mode, true)?;
            let mut cfg = Config::default();
            cfg.backend = backend;
            cfg.indexed = indexed;
            if let Some(chunk) = chunk_size {
                cfg.target_block_bytes = usize::try_from(chunk)
                    .map_err(|_| Error::Usage("chunk size too large"))?;
            }
            if let Some(dict) = dict_size {
                cfg.dict_size =
                    u32::try_from(dict).map_err(|_| Error::Usage("dict size exceeds 4GB"))?;
            }
            if let Some(lanes) = multithread {
                cfg.threads = lanes;
            }

            let start = Instant::now();
            let stats = cast::compress_file(&input, &output, &cfg, &CancelToken::new())?;
            let ratio = if stats.bytes_out > 0 {
                stats.bytes_in as f64 / stats.bytes_out as f64
            } else {
                0.0
            };
            println!(
                "in_bytes={} out_bytes={} ratio={:.2} blocks={} rows={} elapsed_ms={}",
                stats.bytes_in,
                stats.bytes_out,
                ratio,
                stats.blocks,
                stats.rows,
                start.elapsed().as_millis()
            );

            if verify {
                let coder = Coder::new(backend, cfg.dict_size, 1);
                let start = Instant::now();
                let stats = cast::verify_file(&output, &coder)?;
                println!(
                    "verified_blocks={} verified_bytes={} elapsed_ms={}",
                    stats.blocks,
                    stats.bytes_out,
                    start.elapsed().as_millis()
                );
            }
            Ok(())
        }
        Commands::Decompress {
            input,
            output,
            mode,
            rows,
        } => {
            let backend = resolve_backend(mode, false)?;
            let coder = Coder::new(backend, DEFAULT_DICT_SIZE, 1);
            let start = Instant::now();
            let stats = match rows {
                Some((lo, hi)) => {
                    let mut file = std::fs::File::open(&input)?;
                    let out = std::fs::File::create(&output)?;
                    let mut writer = std::io::BufWriter::new(out);
                    let stats = cast::decompress_rows(&mut file, &mut writer, &coder, lo, hi)?;
                    std::io::Write::flush(&mut writer)?;
                    stats
                }
                None => cast::decompress_file(&input, &output, &coder)?,
            };
            println!(
                "out_bytes={} blocks={} rows={} elapsed_ms={}",
                stats.bytes_out,
                stats.blocks,
                stats.rows,
                start.elapsed().as_millis()
            );
            Ok(())
        }
        Commands::Verify { input, mode } => {
            let backend = resolve_backend(mode, false)?;
            let coder = Coder::new(backend, DEFAULT_DICT_SIZE, 1);
            let start = Instant::now();
            let stats = cast::verify_file(&input, &coder)?;
            println!(
                "verified_blocks={} verified_bytes={} elapsed_ms={}",
                stats.blocks,
                stats.bytes_out,
                start.elapsed().as_millis()
            );
            Ok(())
        }
    }
}

fn resolve_backend(mode: Mode, for_compress: bool) -> cast::Result<Backend> {
    match mode {
        Mode::Native => Ok(Backend::NativeLzma2),
        Mode::SevenZip => match codec::find_seven_zip() {
            Some(path) => {
                info!("using external 7-Zip at {path}");
                Ok(Backend::SevenZip)
            }
            None => Err(Error::Usage(
                "7zip mode requested but no executable found; install 7-Zip or set SEVEN_ZIP_PATH",
            )),
        },
        Mode::Auto => {
            if for_compress {
                if let Some(path) = codec::find_seven_zip() {
                    info!("auto-detected 7-Zip at {path}");
                    return Ok(Backend::SevenZip);
                }
            }
            Ok(Backend::NativeLzma2)
        }
    }
}

/// Parse sizes like `64MB`, `1G`, `512k`, `4096`.
fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim().to_uppercase();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(format!("invalid size: {input}"));
    }
    let number: u64 = digits.parse().map_err(|_| format!("invalid size: {input}"))?;
    let multiplier = match trimmed[digits.len()..].trim() {
        "G" | "GB" => 1024 * 1024 * 1024,
        "M" | "MB" => 1024 * 1024,
        "K" | "KB" => 1024,
        "" | "B" => 1,
        unit => return Err(format!("unknown size unit: {unit}")),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size overflows: {input}"))
}

/// Parse `LO..HI`, 1-based inclusive.
fn parse_rows(input: &str) -> Result<(u64, u64), String> {
    let (lo, hi) = input
        .split_once("..")
        .ok_or_else(|| format!("expected LO..HI, got {input}"))?;
    let lo: u64 = lo.trim().parse().map_err(|_| format!("invalid row: {lo}"))?;
    let hi: u64 = hi.trim().parse().map_err(|_| format!("invalid row: {hi}"))?;
    if lo == 0 || hi < lo {
        return Err("row range must be 1-based with LO <= HI".to_string());
    }
    Ok((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_parse_with_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64MB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("512k").unwrap(), 512 * 1024);
        assert!(parse_size("MB").is_err());
        assert!(parse_size("12XB").is_err());
    }

    #[test]
    fn row_ranges_parse() {
        assert_eq!(parse_rows("5000..5001").unwrap(), (5000, 5001));
        assert_eq!(parse_rows("1..1").unwrap(), (1, 1));
        assert!(parse_rows("0..5").is_err());
        assert!(parse_rows("9..5").is_err());
        assert!(parse_rows("7").is_err());
    }
}
