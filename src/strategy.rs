//! Strategy sampler: elects Strict-vs-Aggressive tokenization per block.
//!
//! Operates on complete rows from the block head. Strict needs a delimiter
//! whose per-row count is consistent across the sample; Aggressive always
//! applies. The winner is the valid candidate covering the most variable
//! bytes, with Strict taking ties.

use crate::tokenizer::{tokenize_row, RowShape, Strategy};

/// Candidate Strict delimiters, in tie-break order.
pub const DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Coefficient-of-variation bound for delimiter election.
const MAX_CV: f64 = 0.1;

/// Share of sampled rows that must agree on one arity.
const MIN_STABILITY: f64 = 0.7;

/// Samples smaller than this cannot meaningfully fail the stability gate
/// and are judged on coverage alone.
const MIN_STABILITY_ROWS: usize = 8;

/// Sampler outcome, recorded in the block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Election {
    Tokenize(Strategy),
    /// Neither strategy was stable; the block travels raw.
    Opaque,
}

/// Elect a strategy from up to `sample_rows` rows at the head of `input`.
pub fn elect(input: &[u8], sample_rows: usize) -> Election {
    let rows: Vec<&[u8]> = input.split_inclusive(|&b| b == b'\n').take(sample_rows).collect();
    if rows.is_empty() {
        return Election::Opaque;
    }

    let mut best: Option<(Strategy, f64)> = None;
    if let Some(delim) = elect_delimiter(&rows) {
        if let Some(coverage) = score(&rows, Strategy::Strict { delim }) {
            best = Some((Strategy::Strict { delim }, coverage));
        }
    }
    if let Some(coverage) = score(&rows, Strategy::Aggressive) {
        // Strict wins ties.
        if best.map_or(true, |(_, strict_cov)| coverage > strict_cov) {
            best = Some((Strategy::Aggressive, coverage));
        }
    }

    match best {
        Some((strategy, _)) => Election::Tokenize(strategy),
        None => Election::Opaque,
    }
}

/// Count `delim` occurrences outside balanced double-quote spans.
fn delimiter_count(row: &[u8], delim: u8) -> usize {
    let mut count = 0;
    let mut in_quote = false;
    let mut i = 0;
    while i < row.len() {
        let b = row[i];
        if b == b'"' {
            if in_quote && row.get(i + 1) == Some(&b'"') {
                i += 2;
                continue;
            }
            in_quote = !in_quote;
        } else if b == delim && !in_quote {
            count += 1;
        }
        i += 1;
    }
    count
}

/// Pick the delimiter whose per-row count is most consistent: mean at least
/// one per row and coefficient of variation within `MAX_CV`, lowest CV
/// winning, ties broken by `DELIMITERS` order.
fn elect_delimiter(rows: &[&[u8]]) -> Option<u8> {
    let mut winner: Option<(u8, f64)> = None;
    for &delim in &DELIMITERS {
        let counts: Vec<f64> = rows
            .iter()
            .map(|row| delimiter_count(row, delim) as f64)
            .collect();
        let mean = counts.iter().sum::<f64>() / counts.len() as f64;
        if mean < 1.0 {
            continue;
        }
        let variance =
            counts.iter().map(|c| (c - mean) * (c - mean)).sum::<f64>() / counts.len() as f64;
        let cv = variance.sqrt() / mean;
        if cv > MAX_CV {
            continue;
        }
        if winner.map_or(true, |(_, best_cv)| cv < best_cv) {
            winner = Some((delim, cv));
        }
    }
    winner.map(|(delim, _)| delim)
}

/// Coverage score for a candidate, or `None` when it fails stability.
fn score(rows: &[&[u8]], strategy: Strategy) -> Option<f64> {
    let mut shape = RowShape::default();
    let mut coverage = 0.0;
    let mut arity_counts: Vec<(usize, usize)> = Vec::new();
    for row in rows {
        tokenize_row(row, strategy, &mut shape);
        coverage += shape.variable_bytes() as f64 / row.len() as f64;
        match arity_counts.iter_mut().find(|(arity, _)| *arity == shape.arity()) {
            Some((_, count)) => *count += 1,
            None => arity_counts.push((shape.arity(), 1)),
        }
    }
    if rows.len() >= MIN_STABILITY_ROWS {
        let modal = arity_counts.iter().map(|&(_, count)| count).max().unwrap_or(0);
        if (modal as f64) < MIN_STABILITY * rows.len() as f64 {
            return None;
        }
    }
    Some(coverage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_elects_strict_comma() {
        let input = b"a,b,c\nd,e,f\ng,h,i\nj,k,l\n".repeat(4);
        assert_eq!(
            elect(&input, 256),
            Election::Tokenize(Strategy::Strict { delim: b',' })
        );
    }

    #[test]
    fn tsv_elects_strict_tab() {
        let input = b"a\tb\nc\td\ne\tf\ng\th\n".repeat(4);
        assert_eq!(
            elect(&input, 256),
            Election::Tokenize(Strategy::Strict { delim: b'\t' })
        );
    }

    #[test]
    fn quoted_delimiters_do_not_break_consistency() {
        let input = b"\"a,b\",c\n\"d,e\",f\n".repeat(8);
        assert_eq!(
            elect(&input, 256),
            Election::Tokenize(Strategy::Strict { delim: b',' })
        );
    }

    #[test]
    fn delimiterless_logs_elect_aggressive() {
        let input = b"line 1\nline 2\nline 3\nline 4\nline 5\nline 6\nline 7\nline 8\n";
        assert_eq!(elect(input, 256), Election::Tokenize(Strategy::Aggressive));
    }

    #[test]
    fn inconsistent_delimiter_counts_disqualify_strict() {
        // Comma counts 1,3,1,3,... give a CV far above the bound.
        let input = b"a,b\nc,d,e,f\n".repeat(8);
        let rows: Vec<&[u8]> = input.split_inclusive(|&b| b == b'\n').collect();
        assert_eq!(elect_delimiter(&rows), None);
    }

    #[test]
    fn unstable_arity_under_both_strategies_is_opaque() {
        // Every row tokenizes to a different arity under either strategy.
        let mut input = Vec::new();
        for i in 1..=16 {
            for _ in 0..i {
                input.extend_from_slice(b"w ");
            }
            input.push(b'\n');
        }
        assert_eq!(elect(&input, 256), Election::Opaque);
    }

    #[test]
    fn small_samples_skip_the_stability_gate() {
        let input = b"x=1;y=2\nx=10;y=20;z=30\n";
        assert_eq!(elect(input, 256), Election::Tokenize(Strategy::Aggressive));
    }

    #[test]
    fn strict_wins_coverage_ties() {
        // Commas are consistent and both strategies cover the same bytes.
        let input = b"1,2\n3,4\n5,6\n7,8\n".repeat(4);
        assert_eq!(
            elect(&input, 256),
            Election::Tokenize(Strategy::Strict { delim: b',' })
        );
    }

    #[test]
    fn empty_input_is_opaque() {
        assert_eq!(elect(b"", 256), Election::Opaque);
    }
}
