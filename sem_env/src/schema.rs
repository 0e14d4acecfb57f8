//! Parameter schema discovery from the simulator's help output.
//!
//! `--PrintHelp` lists the script's own options between a `Program Options:`
//! (or `Program Arguments:`) header and the `General Arguments` section:
//!
//! ```text
//! Program Options:
//!     --nodes:     Number of nodes [3]
//!     --verbose:   Print more [false]
//! ```
//!
//! `--PrintGlobals` lists global values as `--Name=[value]`.

use crate::simulator::ParamSchema;
use sem_core::ParamValue;

/// Globals that the runner controls itself or that never vary per run.
pub const EXCLUDED_GLOBALS: [&str; 5] = [
    "RngRun",
    "RngSeed",
    "SchedulerType",
    "SimulatorImplementationType",
    "ChecksumEnabled",
];

/// Option name: the text after `--` up to the first `?`, `:`, `|` or `=`.
fn option_name(line: &str) -> Option<&str> {
    let start = line.find("--")? + 2;
    let rest = &line[start..];
    let end = rest.find(['?', ':', '|', '='])?;
    Some(&rest[..end])
}

/// Default value: the content of the last `[...]` on the line.
fn bracketed_default(line: &str) -> Option<&str> {
    let open = line.rfind('[')?;
    let close = line[open..].find(']')? + open;
    Some(&line[open + 1..close])
}

/// Parses the program options section of `--PrintHelp` output.
pub fn parse_help_output(text: &str) -> ParamSchema {
    let start = ["Program Options:", "Program Arguments:"]
        .iter()
        .filter_map(|header| text.rfind(header).map(|i| i + header.len()))
        .max();
    let Some(start) = start else {
        return ParamSchema::new();
    };
    let end = text[start..]
        .rfind("General Arguments")
        .map(|i| start + i)
        .unwrap_or(text.len());

    let mut schema = ParamSchema::new();
    for line in text[start..end].lines() {
        if let Some(name) = option_name(line) {
            let default = bracketed_default(line).map(ParamValue::infer);
            schema.insert(name.to_string(), default);
        }
    }
    schema
}

/// Parses `--PrintGlobals` output, skipping [`EXCLUDED_GLOBALS`].
pub fn parse_globals_output(text: &str) -> ParamSchema {
    let mut schema = ParamSchema::new();
    for line in text.lines() {
        let (Some(name), Some(value)) = (option_name(line), bracketed_default(line)) else {
            continue;
        };
        if name.is_empty() || EXCLUDED_GLOBALS.contains(&name) {
            continue;
        }
        schema.insert(name.to_string(), Some(ParamValue::infer(value)));
    }
    schema
}

/// Parses the `NS_LOG=print-list` output into component names.
pub fn parse_log_component_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(name, _)| name.trim())
        .filter(|name| !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_'))
        .map(str::to_string)
        .collect()
}
