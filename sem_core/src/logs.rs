//! Log store: parsing, indexing and filtering of simulator log records.
//!
//! The simulator writes one record per line when logging is enabled with
//! `prefix_all`:
//!
//! ```text
//! +<time>s <context> [<extended context>] <Component>:<Function>(<args>): [<LEVEL>] <message>
//! ```
//!
//! The extended context is optional. Function-entry records have no
//! `: [LEVEL] message` suffix and are classified as `FUNCTION`.

use crate::error::{SemError, SemResult};
use crate::severity::SeverityClass;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// One decoded log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Position among the successfully parsed lines of the file
    pub index: usize,
    pub time: f64,
    pub context: String,
    pub extended_context: Option<String>,
    pub component: String,
    pub function: String,
    pub arguments: String,
    pub severity_class: SeverityClass,
    pub message: String,
}

// ============================================================================
// PARSING
// ============================================================================

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Splits a leading run of word characters. Returns `None` if it is empty.
fn take_word(s: &str) -> Option<(&str, &str)> {
    let end = s.find(|c: char| !is_word(c)).unwrap_or(s.len());
    (end > 0).then(|| s.split_at(end))
}

fn take_digits(s: &str) -> Option<(&str, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    (end > 0).then(|| s.split_at(end))
}

/// `<digits>.<digits>s ` after an optional sign.
fn take_time(s: &str) -> Option<(f64, &str)> {
    let s = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (whole, rest) = take_digits(s)?;
    let rest = rest.strip_prefix('.')?;
    let (frac, rest) = take_digits(rest)?;
    let rest = rest.strip_prefix("s ")?;
    let time = format!("{}.{}", whole, frac).parse().ok()?;
    Some((time, rest))
}

/// `<digits> ` or `-<digits> `.
fn take_context(s: &str) -> Option<(&str, &str)> {
    let digits_from = usize::from(s.starts_with('-'));
    let (digits, _) = take_digits(&s[digits_from..])?;
    let end = digits_from + digits.len();
    let rest = s[end..].strip_prefix(' ')?;
    Some((&s[..end], rest))
}

/// `: [<LEVEL><spaces>] <message>`
fn parse_suffix(tail: &str) -> Option<(&str, &str)> {
    let rest = tail.strip_prefix(": [")?;
    let (level, rest) = take_word(rest)?;
    let message = rest.trim_start().strip_prefix("] ")?;
    Some((level, message))
}

struct Body<'a> {
    component: &'a str,
    function: &'a str,
    arguments: &'a str,
    suffix: Option<(&'a str, &'a str)>,
}

/// `<Component>:<Function>(<args>)` plus optional suffix.
///
/// Arguments may contain parentheses, so every closing parenthesis is tried
/// in turn, shortest first, until the remainder is empty or a valid suffix.
fn parse_body(s: &str) -> Option<Body<'_>> {
    let (component, rest) = take_word(s)?;
    let rest = rest.strip_prefix(':')?;
    let (function, rest) = take_word(rest)?;
    let inner = rest.strip_prefix('(')?;

    for (close, _) in inner.match_indices(')') {
        let arguments = &inner[..close];
        let tail = &inner[close + 1..];
        if tail.is_empty() {
            return Some(Body { component, function, arguments, suffix: None });
        }
        if let Some(suffix) = parse_suffix(tail) {
            return Some(Body { component, function, arguments, suffix: Some(suffix) });
        }
    }
    None
}

/// Parses one line. Returns `None` when it does not have the expected shape.
pub fn parse_line(line: &str, index: usize) -> Option<LogRecord> {
    let line = line.trim_end_matches(['\n', '\r']);
    let (time, rest) = take_time(line)?;
    let (context, rest) = take_context(rest)?;

    let (extended_context, body) = match rest.strip_prefix('[') {
        Some(bracketed) => bracketed
            .match_indices("] ")
            .find_map(|(end, _)| {
                parse_body(&bracketed[end + 2..]).map(|body| (Some(&bracketed[..end]), body))
            })?,
        None => (None, parse_body(rest)?),
    };

    let (severity_class, message) = match body.suffix {
        None => (SeverityClass::Function, String::new()),
        Some((level, message)) => (level.parse().ok()?, message.trim_end().to_string()),
    };

    Some(LogRecord {
        index,
        time,
        context: context.to_string(),
        extended_context: extended_context.map(str::to_string),
        component: body.component.to_string(),
        function: body.function.to_string(),
        arguments: body.arguments.to_string(),
        severity_class,
        message,
    })
}

/// Parses every line of `text`, skipping malformed ones with a warning.
pub fn parse_log_text(text: &str) -> Vec<LogRecord> {
    let mut records = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        match parse_line(line, records.len()) {
            Some(record) => records.push(record),
            None => warn!("Skipping line {} not in prefix_all format: {:?}", lineno + 1, line),
        }
    }
    records
}

/// Reads and parses a log file.
pub fn parse_logs(path: impl AsRef<Path>) -> SemResult<Vec<LogRecord>> {
    let text = fs::read_to_string(path.as_ref())?;
    let records = parse_log_text(&text);
    debug!("Parsed {} log records from {}", records.len(), path.as_ref().display());
    Ok(records)
}

// ============================================================================
// FILTERS
// ============================================================================

/// Compound filter over log records.
///
/// Clauses are AND-ed. Severity clauses are the exception: a record passes
/// when its class is in `severity_class`, or when its component is listed in
/// `components` with that class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    pub severity_class: Option<Vec<SeverityClass>>,
    pub components: Option<IndexMap<String, Vec<SeverityClass>>>,
    pub function: Option<Vec<String>>,
    pub context: Option<Vec<String>>,
    pub time_begin: Option<f64>,
    pub time_end: Option<f64>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_severity(mut self, classes: impl IntoIterator<Item = SeverityClass>) -> Self {
        self.severity_class.get_or_insert_with(Vec::new).extend(classes);
        self
    }

    pub fn with_component(
        mut self,
        component: impl Into<String>,
        classes: impl IntoIterator<Item = SeverityClass>,
    ) -> Self {
        self.components
            .get_or_insert_with(IndexMap::new)
            .entry(component.into())
            .or_default()
            .extend(classes);
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function.get_or_insert_with(Vec::new).push(function.into());
        self
    }

    /// Accepts string or integer contexts, e.g. `"1"`, `1` or `-1`.
    pub fn with_context(mut self, context: impl ToString) -> Self {
        self.context.get_or_insert_with(Vec::new).push(context.to_string());
        self
    }

    pub fn with_time_begin(mut self, time: f64) -> Self {
        self.time_begin = Some(time);
        self
    }

    pub fn with_time_end(mut self, time: f64) -> Self {
        self.time_end = Some(time);
        self
    }

    /// True when no clause is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Builds a filter from loosely typed JSON arguments.
    ///
    /// Each list-valued clause also accepts a single value. Values that
    /// cannot be coerced fail with `BadFilter`.
    pub fn from_value(value: &Value) -> SemResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| SemError::bad_filter("filter must be an object"))?;
        let mut filter = Self::new();
        for (key, v) in object {
            if v.is_null() {
                continue;
            }
            match key.as_str() {
                "severity_class" => {
                    filter.severity_class = Some(severity_list(key, v)?);
                }
                "components" => {
                    let map = v
                        .as_object()
                        .ok_or_else(|| SemError::bad_filter("components must be an object"))?;
                    let mut components = IndexMap::new();
                    for (component, classes) in map {
                        components.insert(component.clone(), severity_list(component, classes)?);
                    }
                    filter.components = Some(components);
                }
                "function" => {
                    filter.function = Some(one_or_many(key, v, |item| item.as_str().map(str::to_string))?);
                }
                "context" => {
                    filter.context = Some(one_or_many(key, v, |item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
                        _ => None,
                    })?);
                }
                "time_begin" => filter.time_begin = Some(time_bound(key, v)?),
                "time_end" => filter.time_end = Some(time_bound(key, v)?),
                other => return Err(SemError::bad_filter(format!("unknown filter '{}'", other))),
            }
        }
        Ok(filter)
    }

    /// Whether a record satisfies every clause.
    pub fn matches(&self, record: &LogRecord) -> bool {
        if self.severity_class.is_some() || self.components.is_some() {
            let global = self
                .severity_class
                .as_ref()
                .map_or(false, |classes| classes.contains(&record.severity_class));
            let per_component = self.components.as_ref().map_or(false, |components| {
                components
                    .get(&record.component)
                    .map_or(false, |classes| classes.contains(&record.severity_class))
            });
            if !(global || per_component) {
                return false;
            }
        }
        if let Some(functions) = &self.function {
            if !functions.contains(&record.function) {
                return false;
            }
        }
        if let Some(contexts) = &self.context {
            if !contexts.contains(&record.context) {
                return false;
            }
        }
        if let Some(begin) = self.time_begin {
            if record.time < begin {
                return false;
            }
        }
        if let Some(end) = self.time_end {
            if record.time > end {
                return false;
            }
        }
        true
    }
}

fn one_or_many<T>(key: &str, value: &Value, convert: impl Fn(&Value) -> Option<T>) -> SemResult<Vec<T>> {
    let bad = || SemError::bad_filter(format!("'{}' has an unsupported value {}", key, value));
    match value {
        Value::Array(items) => items.iter().map(|item| convert(item).ok_or_else(bad)).collect(),
        single => Ok(vec![convert(single).ok_or_else(bad)?]),
    }
}

fn severity_list(key: &str, value: &Value) -> SemResult<Vec<SeverityClass>> {
    one_or_many(key, value, |item| item.as_str().and_then(|s| s.parse().ok()))
}

fn time_bound(key: &str, value: &Value) -> SemResult<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| SemError::bad_filter(format!("'{}' must be a number, got {}", key, value)))
}

// ============================================================================
// STORE
// ============================================================================

/// Distinct values seen in a log, for exploration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogSummary {
    pub records: usize,
    pub contexts: Vec<String>,
    pub components: Vec<String>,
    pub functions: Vec<String>,
    pub severity_classes: Vec<SeverityClass>,
    pub time_range: Option<(f64, f64)>,
}

/// In-memory, indexed collection of log records.
#[derive(Debug, Default)]
pub struct LogStore {
    records: Vec<LogRecord>,
    by_context: HashMap<String, Vec<usize>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a log file into a new store.
    pub fn from_file(path: impl AsRef<Path>) -> SemResult<Self> {
        let mut store = Self::new();
        store.insert(parse_logs(path)?)?;
        Ok(store)
    }

    /// Adds records. Their indices must not collide with stored ones.
    pub fn insert(&mut self, records: Vec<LogRecord>) -> SemResult<()> {
        let mut seen: IndexSet<usize> = self.records.iter().map(|r| r.index).collect();
        for record in &records {
            if !seen.insert(record.index) {
                return Err(SemError::bad_structure(format!(
                    "duplicate log record index {}",
                    record.index
                )));
            }
        }
        for record in records {
            self.by_context
                .entry(record.context.clone())
                .or_default()
                .push(self.records.len());
            self.records.push(record);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Records satisfying `filter`, in file order. An empty filter selects
    /// nothing.
    pub fn filter(&self, filter: &LogFilter) -> Vec<&LogRecord> {
        if filter.is_empty() {
            return Vec::new();
        }
        match &filter.context {
            Some(contexts) => {
                let mut positions: Vec<usize> = contexts
                    .iter()
                    .filter_map(|c| self.by_context.get(c))
                    .flatten()
                    .copied()
                    .collect();
                positions.sort_unstable();
                positions.dedup();
                positions
                    .into_iter()
                    .map(|i| &self.records[i])
                    .filter(|r| filter.matches(r))
                    .collect()
            }
            None => self.records.iter().filter(|r| filter.matches(r)).collect(),
        }
    }

    /// Distinct contexts, components, functions and classes in the log.
    pub fn summary(&self) -> LogSummary {
        let mut contexts = IndexSet::new();
        let mut components = IndexSet::new();
        let mut functions = IndexSet::new();
        let mut classes = IndexSet::new();
        let mut time_range: Option<(f64, f64)> = None;
        for r in &self.records {
            contexts.insert(r.context.clone());
            components.insert(r.component.clone());
            functions.insert(r.function.clone());
            classes.insert(r.severity_class);
            time_range = Some(match time_range {
                None => (r.time, r.time),
                Some((lo, hi)) => (lo.min(r.time), hi.max(r.time)),
            });
        }
        let mut severity_classes: Vec<SeverityClass> = classes.into_iter().collect();
        severity_classes.sort();
        LogSummary {
            records: self.records.len(),
            contexts: contexts.into_iter().collect(),
            components: components.into_iter().collect(),
            functions: functions.into_iter().collect(),
            severity_classes,
            time_range,
        }
    }

    /// Writes all records as a JSON array.
    pub fn write_json(&self, path: impl AsRef<Path>) -> SemResult<()> {
        fs::write(path, serde_json::to_vec(&self.records)?)?;
        Ok(())
    }

    /// Drops every record.
    pub fn wipe(&mut self) {
        self.records.clear();
        self.by_context.clear();
    }
}

/// Parses a log file and returns the indexed store with its summary.
pub fn process_logs(path: impl AsRef<Path>) -> SemResult<(LogStore, LogSummary)> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(SemError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("cannot access log file {}", path.display()),
        )));
    }
    let store = LogStore::from_file(path)?;
    let summary = store.summary();
    Ok((store, summary))
}
