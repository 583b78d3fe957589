//! Stable multi-key sort.

use std::cmp::Ordering;

use bioetl_common::{Record, Value};

use crate::canonical::render;
use crate::config::NullPosition;

/// Sort `rows` ascending by `keys`, keeping input order among ties.
///
/// Values that are both numeric compare numerically; anything else compares
/// by canonical rendering.
pub fn stable_sort(rows: &mut [Record], keys: &[String], nulls: NullPosition, float_precision: usize) {
    if keys.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        keys.iter()
            .map(|k| compare(&a.value(k), &b.value(k), nulls, float_precision))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

fn compare(a: &Value, b: &Value, nulls: NullPosition, precision: usize) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return null_side(nulls),
        (false, true) => return null_side(nulls).reverse(),
        (false, false) => {}
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => render(a, precision).cmp(&render(b, precision)),
    }
}

fn null_side(nulls: NullPosition) -> Ordering {
    match nulls {
        NullPosition::First => Ordering::Less,
        NullPosition::Last => Ordering::Greater,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(rows: &[Record]) -> Vec<Value> {
        rows.iter().map(|r| r.value("tag")).collect()
    }

    fn row(key: impl Into<Value>, tag: &str) -> Record {
        Record::new("t").with("k", key).with("tag", tag)
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        let mut rows = vec![row(10i64, "ten"), row(9i64, "nine"), row(2.5, "two_half")];
        stable_sort(&mut rows, &["k".to_string()], NullPosition::Last, 6);
        assert_eq!(ids(&rows), vec![Value::from("two_half"), Value::from("nine"), Value::from("ten")]);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let mut rows = vec![row("b", "1"), row("a", "2"), row("b", "3"), row("a", "4")];
        stable_sort(&mut rows, &["k".to_string()], NullPosition::Last, 6);
        assert_eq!(ids(&rows), vec!["2", "4", "1", "3"].into_iter().map(Value::from).collect::<Vec<_>>());
    }

    #[test]
    fn test_null_position() {
        let keys = ["k".to_string()];
        let mut rows = vec![row(Value::Null, "null"), row(1i64, "one")];
        stable_sort(&mut rows, &keys, NullPosition::Last, 6);
        assert_eq!(ids(&rows)[1], Value::from("null"));

        stable_sort(&mut rows, &keys, NullPosition::First, 6);
        assert_eq!(ids(&rows)[0], Value::from("null"));
    }

    #[test]
    fn test_secondary_key() {
        let mut rows = vec![
            Record::new("t").with("a", 1i64).with("b", "z").with("tag", "1z"),
            Record::new("t").with("a", 1i64).with("b", "y").with("tag", "1y"),
            Record::new("t").with("a", 0i64).with("b", "x").with("tag", "0x"),
        ];
        stable_sort(&mut rows, &["a".to_string(), "b".to_string()], NullPosition::Last, 6);
        assert_eq!(ids(&rows), vec![Value::from("0x"), Value::from("1y"), Value::from("1z")]);
    }
}
