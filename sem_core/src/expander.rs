//! Parameter-space expansion.
//!
//! A [`ParamSpec`] is the compact form users write: each key maps to a
//! scalar, a list of values, or a function of the other parameters. Expansion
//! turns it into the dense list of concrete combinations, in a deterministic
//! order where the last key varies fastest.

use crate::error::{SemError, SemResult};
use crate::params::{ParamMap, ParamValue};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// A value computed from the partially built combination.
pub type DerivedFn = Arc<dyn Fn(&ParamMap) -> Vec<ParamValue> + Send + Sync>;

/// One entry of a parameter spec.
#[derive(Clone)]
pub enum SpecValue {
    /// A single value, treated as a one-element list
    Scalar(ParamValue),

    /// An ordered list of values
    List(Vec<ParamValue>),

    /// Values computed from the keys in `depends_on`
    Derived {
        depends_on: Vec<String>,
        f: DerivedFn,
    },
}

impl fmt::Debug for SpecValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::List(v) => f.debug_tuple("List").field(v).finish(),
            Self::Derived { depends_on, .. } => f
                .debug_struct("Derived")
                .field("depends_on", depends_on)
                .finish_non_exhaustive(),
        }
    }
}

/// Compact parameter-space specification.
#[derive(Debug, Clone, Default)]
pub struct ParamSpec {
    entries: IndexMap<String, SpecValue>,
}

impl ParamSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a single-valued key.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.entries.insert(key.into(), SpecValue::Scalar(value.into()));
        self
    }

    /// Sets a list-valued key.
    pub fn with_list<V, I>(mut self, key: impl Into<String>, values: I) -> Self
    where
        V: Into<ParamValue>,
        I: IntoIterator<Item = V>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.entries.insert(key.into(), SpecValue::List(values));
        self
    }

    /// Sets a key whose values are computed from `depends_on`.
    ///
    /// The closure sees every key evaluated so far, which always includes the
    /// declared dependencies.
    pub fn derive<F>(mut self, key: impl Into<String>, depends_on: &[&str], f: F) -> Self
    where
        F: Fn(&ParamMap) -> Vec<ParamValue> + Send + Sync + 'static,
    {
        self.entries.insert(
            key.into(),
            SpecValue::Derived {
                depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
                f: Arc::new(f),
            },
        );
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: SpecValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<SpecValue> {
        self.entries.shift_remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&SpecValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SpecValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds a spec from a JSON object of scalars and arrays of scalars.
    pub fn from_json(value: &serde_json::Value) -> SemResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| SemError::bad_spec("spec must be a JSON object"))?;
        let mut spec = Self::new();
        for (key, v) in object {
            let entry = match v {
                serde_json::Value::Array(items) => SpecValue::List(
                    items
                        .iter()
                        .map(|item| {
                            ParamValue::from_json(item).ok_or_else(|| {
                                SemError::bad_spec(format!("{}: list items must be scalars", key))
                            })
                        })
                        .collect::<SemResult<_>>()?,
                ),
                other => SpecValue::Scalar(ParamValue::from_json(other).ok_or_else(|| {
                    SemError::bad_spec(format!("{}: value must be a scalar or a list", key))
                })?),
            };
            spec.insert(key.clone(), entry);
        }
        Ok(spec)
    }

    /// Evaluation order: every derived key comes after the keys it reads.
    ///
    /// Among keys whose dependencies are satisfied, insertion order wins, so
    /// a spec without derived keys evaluates in insertion order.
    fn evaluation_order(&self) -> SemResult<Vec<&str>> {
        for (key, value) in &self.entries {
            if let SpecValue::Derived { depends_on, .. } = value {
                for dep in depends_on {
                    if !self.entries.contains_key(dep) {
                        return Err(SemError::bad_spec(format!(
                            "'{}' depends on unknown key '{}'",
                            key, dep
                        )));
                    }
                }
            }
        }

        let mut placed: Vec<&str> = Vec::with_capacity(self.entries.len());
        let mut remaining: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        while !remaining.is_empty() {
            let ready = remaining.iter().position(|key| match &self.entries[*key] {
                SpecValue::Derived { depends_on, .. } => {
                    depends_on.iter().all(|d| placed.contains(&d.as_str()))
                }
                _ => true,
            });
            match ready {
                Some(pos) => placed.push(remaining.remove(pos)),
                None => {
                    return Err(SemError::bad_spec(format!(
                        "cyclic dependency among {:?}",
                        remaining
                    )))
                }
            }
        }
        Ok(placed)
    }

    /// Expands the spec into concrete combinations.
    ///
    /// Output keys follow the spec's insertion order. A key with an empty
    /// list (or a function returning nothing) removes its whole branch.
    pub fn expand(&self) -> SemResult<Vec<ParamMap>> {
        let order = self.evaluation_order()?;

        let mut partial: Vec<ParamMap> = vec![ParamMap::new()];
        for key in order {
            let mut next = Vec::with_capacity(partial.len());
            for prefix in &partial {
                let values = match &self.entries[key] {
                    SpecValue::Scalar(v) => vec![v.clone()],
                    SpecValue::List(vs) => vs.clone(),
                    SpecValue::Derived { f, .. } => f(prefix),
                };
                for value in values {
                    let mut extended = prefix.clone();
                    extended.insert(key.to_string(), value);
                    next.push(extended);
                }
            }
            partial = next;
        }

        Ok(partial
            .into_iter()
            .map(|combination| {
                self.entries
                    .keys()
                    .filter_map(|k| combination.get(k).map(|v| (k.clone(), v.clone())))
                    .collect()
            })
            .collect())
    }

    /// The spec as array axes, one per key in insertion order.
    ///
    /// Derived keys have no fixed axis and are rejected.
    pub fn axes(&self) -> SemResult<Vec<(String, Vec<ParamValue>)>> {
        self.entries
            .iter()
            .map(|(key, value)| match value {
                SpecValue::Scalar(v) => Ok((key.clone(), vec![v.clone()])),
                SpecValue::List(vs) => Ok((key.clone(), vs.clone())),
                SpecValue::Derived { .. } => Err(SemError::bad_spec(format!(
                    "'{}' is derived and cannot be used as an array axis",
                    key
                ))),
            })
            .collect()
    }
}

/// Expands several specs and concatenates their outputs.
pub fn expand_all(specs: &[ParamSpec]) -> SemResult<Vec<ParamMap>> {
    let mut all = Vec::new();
    for spec in specs {
        all.extend(spec.expand()?);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::param_map;
    use proptest::prelude::*;

    #[test]
    fn test_derived_key_from_list() {
        let spec = ParamSpec::new()
            .with_list("p", [1, 3])
            .derive("b", &["p"], |m| {
                vec![ParamValue::Int(10 * m["p"].as_i64().unwrap_or_default())]
            });

        let combos = spec.expand().unwrap();
        assert_eq!(
            combos,
            vec![
                param_map([("p", 1), ("b", 10)]),
                param_map([("p", 3), ("b", 30)]),
            ]
        );
    }

    #[test]
    fn test_last_key_varies_fastest() {
        let spec = ParamSpec::new()
            .with_list("a", [1, 2])
            .with_value("s", "x")
            .with_list("c", [10, 20, 30]);

        let combos = spec.expand().unwrap();
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0], param_map([("a", ParamValue::Int(1)), ("s", "x".into()), ("c", 10.into())]));
        assert_eq!(combos[1]["c"], ParamValue::Int(20));
        assert_eq!(combos[3]["a"], ParamValue::Int(2));
        assert_eq!(combos[3]["c"], ParamValue::Int(10));
    }

    #[test]
    fn test_derived_before_dependency_keeps_key_order() {
        let spec = ParamSpec::new()
            .derive("double", &["n"], |m| vec![ParamValue::Int(2 * m["n"].as_i64().unwrap_or_default())])
            .with_list("n", [2, 5]);

        let combos = spec.expand().unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[0].keys().collect::<Vec<_>>(), vec!["double", "n"]);
        assert_eq!(combos[1]["double"], ParamValue::Int(10));
    }

    #[test]
    fn test_derived_may_fan_out() {
        let spec = ParamSpec::new()
            .with_list("n", [1, 2])
            .derive("k", &["n"], |m| {
                (0..m["n"].as_i64().unwrap_or_default()).map(ParamValue::Int).collect()
            });

        let combos = spec.expand().unwrap();
        assert_eq!(combos.len(), 3);
    }

    #[test]
    fn test_empty_list_prunes_branch() {
        let spec = ParamSpec::new()
            .with_list("a", [1, 2])
            .with_list("b", Vec::<i64>::new());
        assert!(spec.expand().unwrap().is_empty());
    }

    #[test]
    fn test_dangling_reference_is_bad_spec() {
        let spec = ParamSpec::new().derive("b", &["missing"], |_| vec![]);
        assert!(matches!(spec.expand(), Err(SemError::BadSpec(_))));
    }

    #[test]
    fn test_cycle_is_bad_spec() {
        let spec = ParamSpec::new()
            .derive("a", &["b"], |_| vec![ParamValue::Int(1)])
            .derive("b", &["a"], |_| vec![ParamValue::Int(2)]);
        assert!(matches!(spec.expand(), Err(SemError::BadSpec(_))));

        let selfref = ParamSpec::new().derive("a", &["a"], |_| vec![]);
        assert!(matches!(selfref.expand(), Err(SemError::BadSpec(_))));
    }

    #[test]
    fn test_expand_all_concatenates() {
        let specs = vec![
            ParamSpec::new().with_list("a", [1, 2]),
            ParamSpec::new().with_value("a", 3),
        ];
        let combos = expand_all(&specs).unwrap();
        assert_eq!(combos.len(), 3);
        assert_eq!(combos[2]["a"], ParamValue::Int(3));
    }

    #[test]
    fn test_from_json_and_axes() {
        let value = serde_json::json!({"x": [1, 2], "name": "wifi"});
        let spec = ParamSpec::from_json(&value).unwrap();
        let axes = spec.axes().unwrap();
        assert_eq!(axes[0].0, "x");
        assert_eq!(axes[1].1, vec![ParamValue::from("wifi")]);

        let derived = spec.derive("y", &["x"], |_| vec![]);
        assert!(matches!(derived.axes(), Err(SemError::BadSpec(_))));

        assert!(ParamSpec::from_json(&serde_json::json!({"x": {"a": 1}})).is_err());
    }

    proptest! {
        #[test]
        fn prop_expansion_is_pure(a in prop::collection::vec(-50i64..50, 0..4),
                                  b in prop::collection::vec(-50i64..50, 0..4)) {
            let spec = ParamSpec::new()
                .with_list("a", a.clone())
                .with_list("b", b.clone())
                .derive("c", &["a", "b"], |m| vec![ParamValue::Int(
                    m["a"].as_i64().unwrap_or_default() + m["b"].as_i64().unwrap_or_default())]);
            let first = spec.expand().unwrap();
            let second = spec.expand().unwrap();
            prop_assert_eq!(first.len(), a.len() * b.len());
            prop_assert_eq!(first, second);
        }
    }
}
