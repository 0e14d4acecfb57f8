//! Ready-made result parsers.

use sem_core::{CompleteResult, SemError, SemResult};

/// Parses whitespace-separated numeric rows. Lines with any non-numeric
/// token, and blank lines, are skipped.
pub fn parse_table(text: &str) -> Vec<Vec<f64>> {
    text.lines()
        .filter_map(|line| {
            let row: Option<Vec<f64>> = line.split_whitespace().map(|t| t.parse().ok()).collect();
            row.filter(|r| !r.is_empty())
        })
        .collect()
}

/// Numeric table printed on `stdout`, one row per line.
pub fn stdout_table(result: &CompleteResult) -> SemResult<Vec<Vec<f64>>> {
    Ok(parse_table(result.stdout()))
}

/// Every number printed on `stdout`, in reading order.
pub fn stdout_values(result: &CompleteResult) -> SemResult<Vec<f64>> {
    Ok(parse_table(result.stdout()).into_iter().flatten().collect())
}

/// First number printed on `stdout`.
pub fn stdout_value(result: &CompleteResult) -> SemResult<f64> {
    parse_table(result.stdout())
        .into_iter()
        .flatten()
        .next()
        .ok_or_else(|| SemError::bad_structure(format!("no number on stdout of {}", result.meta().id)))
}
