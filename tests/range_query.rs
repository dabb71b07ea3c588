use std::fs;

use tempfile::tempdir;

use cast::footer::{FooterIndex, FOOTER_TAIL_LEN};
use cast::{Backend, CancelToken, Coder, Config, Error};

fn numbered_lines(count: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 1..=count {
        out.extend_from_slice(format!("line {i}\n").as_bytes());
    }
    out
}

/// Mirror of the assembler's row-size arithmetic: a chunk size that yields
/// exactly `rows_per_block` rows per block for this input.
fn chunk_for_rows(input: &[u8], rows_per_block: u64) -> u64 {
    let sample: Vec<&[u8]> = input
        .split_inclusive(|&b| b == b'\n')
        .take(1000)
        .collect();
    let bytes: usize = sample.iter().map(|row| row.len()).sum();
    let mean = bytes as f64 / sample.len() as f64;
    (mean * rows_per_block as f64) as u64
}

fn parse_footer(container: &[u8]) -> FooterIndex {
    let footer_length = FooterIndex::decode_tail(container).expect("footer tail") as usize;
    let table_start = container.len() - FOOTER_TAIL_LEN - footer_length;
    FooterIndex::decode_entries(&container[table_start..table_start + footer_length])
        .expect("footer entries")
}

struct Fixture {
    _dir: tempfile::TempDir,
    packed: std::path::PathBuf,
    input: Vec<u8>,
}

fn indexed_fixture(rows: u32, rows_per_block: u64) -> Fixture {
    let dir = tempdir().expect("tempdir");
    let src = dir.path().join("input.log");
    let packed = dir.path().join("packed.cast");
    let input = numbered_lines(rows);
    fs::write(&src, &input).expect("write input");

    let mut cfg = Config::default();
    cfg.indexed = true;
    cfg.target_block_bytes = chunk_for_rows(&input, rows_per_block) as usize;
    cast::compress_file(&src, &packed, &cfg, &CancelToken::new()).expect("compress");
    Fixture {
        _dir: dir,
        packed,
        input,
    }
}

fn coder() -> Coder {
    Coder::new(Backend::NativeLzma2, Config::default().dict_size, 1)
}

#[test]
fn ten_thousand_lines_make_four_blocks_of_2500_rows() {
    let fixture = indexed_fixture(10_000, 2500);
    let container = fs::read(&fixture.packed).expect("read container");
    let footer = parse_footer(&container);

    assert_eq!(footer.entries.len(), 4);
    assert_eq!(footer.total_rows(), 10_000);
    let mut expected_first = 1u64;
    for entry in &footer.entries {
        assert_eq!(entry.row_count, 2500);
        assert_eq!(entry.first_row_index, expected_first);
        expected_first += entry.row_count;
    }
}

#[test]
fn range_query_returns_exact_rows_from_two_blocks() {
    let fixture = indexed_fixture(10_000, 2500);
    let mut file = fs::File::open(&fixture.packed).expect("open");
    let mut out = Vec::new();
    let stats =
        cast::decompress_rows(&mut file, &mut out, &coder(), 5000, 5001).expect("range query");
    assert_eq!(out, b"line 5000\nline 5001\n");
    // The range straddles the 2501..5000 and 5001..7500 blocks; nothing
    // else is decoded.
    assert_eq!(stats.blocks, 2);
    assert_eq!(stats.rows, 2);
}

#[test]
fn range_query_matches_full_restore_slice() {
    let fixture = indexed_fixture(1_000, 100);
    let mut file = fs::File::open(&fixture.packed).expect("open");
    let mut out = Vec::new();
    cast::decompress_rows(&mut file, &mut out, &coder(), 250, 612).expect("range query");

    let full: Vec<&[u8]> = fixture.input.split_inclusive(|&b| b == b'\n').collect();
    let expected: Vec<u8> = full[249..612].concat();
    assert_eq!(out, expected);
}

#[test]
fn single_row_and_boundary_queries() {
    let fixture = indexed_fixture(1_000, 100);
    for (lo, hi, expect) in [
        (1u64, 1u64, b"line 1\n".to_vec()),
        (1000, 1000, b"line 1000\n".to_vec()),
        (100, 101, b"line 100\nline 101\n".to_vec()),
    ] {
        let mut file = fs::File::open(&fixture.packed).expect("open");
        let mut out = Vec::new();
        cast::decompress_rows(&mut file, &mut out, &coder(), lo, hi).expect("range query");
        assert_eq!(out, expect, "rows {lo}..{hi}");
    }
}

#[test]
fn out_of_bounds_range_is_rejected() {
    let fixture = indexed_fixture(100, 10);
    let mut file = fs::File::open(&fixture.packed).expect("open");
    let mut out = Vec::new();
    let err = cast::decompress_rows(&mut file, &mut out, &coder(), 50, 200).unwrap_err();
    match err {
        Error::RangeOutOfBounds { lo, hi, total } => {
            assert_eq!((lo, hi, total), (50, 200, 100));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(out.is_empty());
}

#[test]
fn rows_on_solid_container_is_a_usage_error() {
    let dir = tempdir().expect("tempdir");
    let src = dir.path().join("input");
    let packed = dir.path().join("packed.cast");
    fs::write(&src, numbered_lines(100)).expect("write");
    cast::compress_file(&src, &packed, &Config::default(), &CancelToken::new())
        .expect("compress");

    let mut file = fs::File::open(&packed).expect("open");
    let mut out = Vec::new();
    let err = cast::decompress_rows(&mut file, &mut out, &coder(), 1, 10).unwrap_err();
    assert!(matches!(err, Error::Usage(_)));
}

#[test]
fn indexed_full_restore_equals_input() {
    let fixture = indexed_fixture(10_000, 2500);
    let dir = tempdir().expect("tempdir");
    let restored = dir.path().join("restored");
    cast::decompress_file(&fixture.packed, &restored, &coder()).expect("decompress");
    assert_eq!(fs::read(&restored).expect("read"), fixture.input);
}

#[test]
fn indexed_opaque_container_serves_no_rows() {
    let dir = tempdir().expect("tempdir");
    let src = dir.path().join("input");
    let packed = dir.path().join("packed.cast");
    // NUL-ridden input: the guard seals a single opaque block.
    fs::write(&src, vec![0u8; 4096]).expect("write");
    let mut cfg = Config::default();
    cfg.indexed = true;
    cast::compress_file(&src, &packed, &cfg, &CancelToken::new()).expect("compress");

    let mut file = fs::File::open(&packed).expect("open");
    let mut out = Vec::new();
    let err = cast::decompress_rows(&mut file, &mut out, &coder(), 1, 1).unwrap_err();
    match err {
        Error::RangeOutOfBounds { total, .. } => assert_eq!(total, 0),
        other => panic!("unexpected error: {other}"),
    }

    let restored = dir.path().join("restored");
    cast::decompress_file(&packed, &restored, &coder()).expect("decompress");
    assert_eq!(fs::read(&restored).expect("read"), vec![0u8; 4096]);
}
