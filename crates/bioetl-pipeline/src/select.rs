//! Row selection between Extract and Transform.

use std::collections::BTreeSet;

use bioetl_common::{sha256_hex, Record};
use bioetl_determinism::hash_row;

/// Keep the first `n` rows in extraction order.
pub fn apply_limit(mut rows: Vec<Record>, n: usize) -> Vec<Record> {
    rows.truncate(n);
    rows
}

/// Keep `n` rows chosen by seeded SHA-256 rank of their content, preserving
/// extraction order among the survivors. Equal rows tie-break on position.
pub fn apply_sample(rows: Vec<Record>, n: usize, seed: u64) -> Vec<Record> {
    if n >= rows.len() {
        return rows;
    }
    let none = BTreeSet::new();
    let mut ranked: Vec<(String, usize)> = rows
        .iter()
        .enumerate()
        .map(|(i, r)| (sha256_hex(format!("{seed}:{}", hash_row(r, &none, 6))), i))
        .collect();
    ranked.sort();
    let keep: BTreeSet<usize> = ranked.into_iter().take(n).map(|(_, i)| i).collect();

    rows.into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, r)| r)
        .collect()
}
