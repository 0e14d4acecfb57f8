//! Log severity classes and per-component log specifiers.
//!
//! The simulator enables logging through an environment variable of the form
//! `COMP1=spec1:COMP2=spec2`, where each spec is a `|`-separated list of
//! severity tokens. Tokens come in several spellings (`level_debug`, `all`,
//! `**`, ...), so specifiers are always expanded to a [`SeveritySet`] before
//! being stored or compared.

use crate::error::{SemError, SemResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Environment variable read by the simulator to enable logging.
pub const LOG_ENV_VAR: &str = "NS_LOG";

/// One of the six atomic log levels, in increasing verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityClass {
    Error,
    Warn,
    Debug,
    Info,
    Function,
    Logic,
}

impl SeverityClass {
    /// All classes, ordered from least to most verbose.
    pub fn all() -> [SeverityClass; 6] {
        [
            SeverityClass::Error,
            SeverityClass::Warn,
            SeverityClass::Debug,
            SeverityClass::Info,
            SeverityClass::Function,
            SeverityClass::Logic,
        ]
    }

    /// Upper-case name as printed in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            SeverityClass::Error => "ERROR",
            SeverityClass::Warn => "WARN",
            SeverityClass::Debug => "DEBUG",
            SeverityClass::Info => "INFO",
            SeverityClass::Function => "FUNCTION",
            SeverityClass::Logic => "LOGIC",
        }
    }

    /// Lower-case token used in log specifiers.
    pub fn token(&self) -> &'static str {
        match self {
            SeverityClass::Error => "error",
            SeverityClass::Warn => "warn",
            SeverityClass::Debug => "debug",
            SeverityClass::Info => "info",
            SeverityClass::Function => "function",
            SeverityClass::Logic => "logic",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for SeverityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SeverityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SeverityClass::all()
            .into_iter()
            .find(|c| c.token().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown severity class: {}", s))
    }
}

/// A set of severity classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeveritySet(u8);

impl SeveritySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self(0b11_1111)
    }

    /// Every class up to and including `class`.
    pub fn up_to(class: SeverityClass) -> Self {
        SeverityClass::all()
            .into_iter()
            .filter(|c| *c <= class)
            .collect()
    }

    pub fn contains(&self, class: SeverityClass) -> bool {
        self.0 & class.bit() != 0
    }

    pub fn insert(&mut self, class: SeverityClass) {
        self.0 |= class.bit();
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = SeverityClass> + '_ {
        SeverityClass::all().into_iter().filter(|c| self.contains(*c))
    }

    /// Expands a `|`-separated specifier such as `level_debug|info`.
    ///
    /// A leading `*` selects every class. Prefix tokens are accepted and
    /// ignored.
    pub fn parse_spec(spec: &str) -> SemResult<Self> {
        let tokens: Vec<&str> = spec.split('|').map(str::trim).collect();
        let mut set = Self::empty();
        for token in &tokens {
            let expanded = expand_token(token).ok_or_else(|| {
                SemError::InvalidLogComponents(format!("unknown log level '{}'", token))
            })?;
            set = set.union(expanded);
        }
        if tokens.first() == Some(&"*") {
            set = Self::all();
        }
        Ok(set)
    }

    /// Canonical `|`-joined rendering, least verbose first.
    pub fn canonical(&self) -> String {
        self.iter().map(|c| c.token()).collect::<Vec<_>>().join("|")
    }
}

fn expand_token(token: &str) -> Option<SeveritySet> {
    use SeverityClass::*;
    let set = match token {
        "error" | "level_error" => SeveritySet::up_to(Error),
        "warn" => [Warn].into_iter().collect(),
        "debug" => [Debug].into_iter().collect(),
        "info" => [Info].into_iter().collect(),
        "function" => [Function].into_iter().collect(),
        "logic" => [Logic].into_iter().collect(),
        "level_warn" => SeveritySet::up_to(Warn),
        "level_debug" => SeveritySet::up_to(Debug),
        "level_info" => SeveritySet::up_to(Info),
        "level_function" => SeveritySet::up_to(Function),
        "all" | "level_all" | "level_logic" | "**" => SeveritySet::all(),
        "*" | "prefix_func" | "prefix_time" | "prefix_node" | "prefix_level" | "prefix_all" => {
            SeveritySet::empty()
        }
        _ => return None,
    };
    Some(set)
}

impl FromIterator<SeverityClass> for SeveritySet {
    fn from_iter<I: IntoIterator<Item = SeverityClass>>(iter: I) -> Self {
        let mut set = Self::empty();
        for class in iter {
            set.insert(class);
        }
        set
    }
}

impl fmt::Debug for SeveritySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeveritySet({})", self.canonical())
    }
}

impl fmt::Display for SeveritySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Per-component severity sets, as stored in a result's metadata.
///
/// Serializes as `{"Component": "error|warn"}`. Two values are equal exactly
/// when they enable the same classes for the same components, whatever
/// spelling was used to build them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogComponents(BTreeMap<String, SeveritySet>);

impl LogComponents {
    /// Parses `(component, specifier)` pairs.
    ///
    /// When `known` is given, components outside it are rejected and the `*`
    /// component expands to every known component. Without it, `*` is an
    /// error. Repeated components accumulate.
    pub fn parse<K, V, I>(pairs: I, known: Option<&[String]>) -> SemResult<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut map: BTreeMap<String, SeveritySet> = BTreeMap::new();
        for (component, spec) in pairs {
            let component = component.as_ref();
            let set = SeveritySet::parse_spec(spec.as_ref())?;
            if component == "*" {
                let known = known.ok_or_else(|| {
                    SemError::InvalidLogComponents(
                        "'*' requires the list of available log components".to_string(),
                    )
                })?;
                for comp in known {
                    let entry = map.entry(comp.clone()).or_default();
                    *entry = entry.union(set);
                }
                continue;
            }
            if let Some(known) = known {
                if !known.iter().any(|k| k == component) {
                    return Err(SemError::InvalidLogComponents(format!(
                        "'{}' is not an available log component",
                        component
                    )));
                }
            }
            let entry = map.entry(component.to_string()).or_default();
            *entry = entry.union(set);
        }
        Ok(Self(map))
    }

    /// Parses an `NS_LOG="comp=spec:comp2"` string.
    ///
    /// A bare component enables `all`; a bare `***` enables every class on
    /// every component.
    pub fn from_env_str(text: &str, known: Option<&[String]>) -> SemResult<Self> {
        let invalid = || SemError::InvalidLogComponents(format!("malformed {} string '{}'", LOG_ENV_VAR, text));
        let body = text
            .trim()
            .strip_prefix(LOG_ENV_VAR)
            .and_then(|rest| rest.strip_prefix('='))
            .map(|rest| rest.trim_matches('"'))
            .unwrap_or_else(|| text.trim().trim_matches('"'));
        if body.is_empty() {
            return Err(invalid());
        }

        let mut pairs: Vec<(String, String)> = Vec::new();
        for item in body.split(':') {
            let parts: Vec<&str> = item.split('=').collect();
            match parts.as_slice() {
                ["***"] => return Self::parse([("*", "all")], known),
                [component] if !component.is_empty() => {
                    pairs.push((component.to_string(), "all".to_string()))
                }
                [component, spec] if !component.is_empty() && !spec.is_empty() => {
                    pairs.push((component.to_string(), spec.to_string()))
                }
                _ => return Err(invalid()),
            }
        }
        Self::parse(pairs, known)
    }

    /// Value for the logging environment variable, with `prefix_all` added
    /// so every line carries time, node, function and level.
    pub fn to_env_value(&self) -> String {
        self.0
            .iter()
            .map(|(component, set)| {
                if set.is_empty() {
                    format!("{}=prefix_all", component)
                } else {
                    format!("{}={}|prefix_all", component, set.canonical())
                }
            })
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn get(&self, component: &str) -> Option<SeveritySet> {
        self.0.get(component).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SeveritySet)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for LogComponents {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let canonical: BTreeMap<&str, String> =
            self.0.iter().map(|(k, v)| (k.as_str(), v.canonical())).collect();
        canonical.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LogComponents {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        LogComponents::parse(raw, None).map_err(D::Error::custom)
    }
}
