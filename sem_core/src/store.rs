//! Campaign store: configuration, results catalog and output-file tree.
//!
//! # On-disk layout
//!
//! ```text
//! D/
//! ├── D.json            catalog: {"config": {"1": {...}}, "results": {"1": {...}, ...}}
//! └── data/
//!     └── <id>/         one directory per result
//!         ├── stdout
//!         ├── stderr
//!         └── ...       anything else the simulator wrote
//! ```
//!
//! The catalog is held in memory behind a lock and written back atomically
//! (temp file + rename). Inserts can be staged and flushed in batches; a
//! staged result is visible to queries immediately.

use crate::error::{require_absolute, SemError, SemResult};
use crate::params::{ParamMap, ParamValue, RNGRUN};
use crate::result::{CampaignConfig, CompleteResult, OutputFile, SimulationResult};
use crate::severity::LogComponents;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DATA_DIR: &str = "data";
const CONFIG_KEYS: [&str; 3] = ["commit", "params", "script"];

// ============================================================================
// QUERIES
// ============================================================================

/// Selection criteria for [`CampaignStore::get_results`].
///
/// Every constrained parameter must take one of the listed values. An `id`
/// overrides all other criteria.
#[derive(Debug, Clone, Default)]
pub struct ResultQuery {
    pub params: IndexMap<String, Vec<ParamValue>>,
    pub id: Option<String>,
    pub log_components: Option<LogComponents>,
}

impl ResultQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches the single result with this id.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Matches results whose parameters equal every entry of `params`.
    pub fn from_params(params: &ParamMap) -> Self {
        Self {
            params: params.iter().map(|(k, v)| (k.clone(), vec![v.clone()])).collect(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), vec![value.into()]);
        self
    }

    pub fn with_values<V, I>(mut self, key: impl Into<String>, values: I) -> Self
    where
        V: Into<ParamValue>,
        I: IntoIterator<Item = V>,
    {
        self.params.insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_log_components(mut self, log_components: LogComponents) -> Self {
        self.log_components = Some(log_components);
        self
    }

    fn matches(&self, result: &SimulationResult) -> bool {
        if let Some(id) = &self.id {
            return &result.meta.id == id;
        }
        let params_ok = self.params.iter().all(|(key, allowed)| {
            result
                .params
                .get(key)
                .map(|stored| allowed.iter().any(|v| v == stored))
                .unwrap_or(false)
        });
        let logs_ok = match &self.log_components {
            Some(wanted) => result.meta.log_components.as_ref() == Some(wanted),
            None => true,
        };
        params_ok && logs_ok
    }
}

/// Lazily yields the smallest non-negative `RngRun` values not yet in use.
#[derive(Debug, Clone)]
pub struct RngRunAllocator {
    used: BTreeSet<i64>,
    next: i64,
}

impl RngRunAllocator {
    pub fn new(used: impl IntoIterator<Item = i64>) -> Self {
        Self {
            used: used.into_iter().collect(),
            next: 0,
        }
    }

    /// Marks a value as taken so it is never yielded.
    pub fn reserve(&mut self, value: i64) {
        self.used.insert(value);
    }

    /// Takes the smallest free value.
    pub fn allocate(&mut self) -> i64 {
        loop {
            let candidate = self.next;
            self.next += 1;
            if !self.used.contains(&candidate) {
                return candidate;
            }
        }
    }
}

impl Iterator for RngRunAllocator {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        Some(self.allocate())
    }
}

// ============================================================================
// STORE
// ============================================================================

#[derive(Debug, Default)]
struct Catalog {
    results: BTreeMap<u64, SimulationResult>,
    next_doc_id: u64,
    dirty: bool,
}

impl Catalog {
    fn push(&mut self, result: SimulationResult) {
        self.next_doc_id += 1;
        self.results.insert(self.next_doc_id, result);
        self.dirty = true;
    }
}

/// Durable store of one campaign's configuration and results.
pub struct CampaignStore {
    dir: PathBuf,
    catalog_path: PathBuf,
    config: CampaignConfig,
    catalog: RwLock<Catalog>,
}

impl CampaignStore {
    /// Creates a new campaign at `dir`.
    ///
    /// An existing non-empty directory is only replaced when `overwrite` is
    /// set and every entry in it belongs to the store (the catalog, `data/`,
    /// hidden files).
    pub fn create(dir: impl AsRef<Path>, config: CampaignConfig, overwrite: bool) -> SemResult<Self> {
        let dir = dir.as_ref();
        require_absolute(dir)?;
        let catalog_path = catalog_path_for(dir)?;

        if dir.exists() && fs::read_dir(dir)?.next().is_some() {
            if !overwrite {
                return Err(SemError::AlreadyExists(dir.to_path_buf()));
            }
            let catalog_name = catalog_path.file_name().map(|n| n.to_os_string());
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let owned = Some(&name) == catalog_name.as_ref()
                    || (name == DATA_DIR && entry.file_type()?.is_dir())
                    || name.to_string_lossy().starts_with('.');
                if !owned {
                    return Err(SemError::UserDataPresent(
                        dir.to_path_buf(),
                        name.to_string_lossy().into_owned(),
                    ));
                }
            }
            warn!("Overwriting existing campaign at {}", dir.display());
            if catalog_path.exists() {
                fs::remove_file(&catalog_path)?;
            }
            let data = dir.join(DATA_DIR);
            if data.exists() {
                fs::remove_dir_all(&data)?;
            }
        }

        fs::create_dir_all(dir.join(DATA_DIR))?;
        let store = Self {
            dir: dir.to_path_buf(),
            catalog_path,
            config,
            catalog: RwLock::new(Catalog {
                dirty: true,
                ..Catalog::default()
            }),
        };
        store.flush()?;
        info!("Created campaign at {} (script={})", dir.display(), store.config.script);
        Ok(store)
    }

    /// Loads an existing campaign.
    pub fn load(dir: impl AsRef<Path>) -> SemResult<Self> {
        let dir = dir.as_ref();
        require_absolute(dir)?;
        let catalog_path = catalog_path_for(dir)?;
        if !catalog_path.is_file() {
            return Err(SemError::corrupt(format!("no catalog at {}", catalog_path.display())));
        }

        let raw: Value = serde_json::from_slice(&fs::read(&catalog_path)?)
            .map_err(|e| SemError::corrupt(format!("catalog is not valid JSON: {}", e)))?;
        let config = parse_config(&raw)?;

        let mut catalog = Catalog::default();
        if let Some(results) = raw.get("results") {
            let rows = results
                .as_object()
                .ok_or_else(|| SemError::corrupt("results table is not an object"))?;
            for (doc_id, row) in rows {
                let doc_id: u64 = doc_id
                    .parse()
                    .map_err(|_| SemError::corrupt(format!("invalid document id '{}'", doc_id)))?;
                let result: SimulationResult = serde_json::from_value(row.clone())
                    .map_err(|e| SemError::corrupt(format!("result {}: {}", doc_id, e)))?;
                catalog.results.insert(doc_id, result);
            }
        }
        catalog.next_doc_id = catalog.results.keys().next_back().copied().unwrap_or(0);

        debug!("Loaded campaign at {} with {} results", dir.display(), catalog.results.len());
        Ok(Self {
            dir: dir.to_path_buf(),
            catalog_path,
            config,
            catalog: RwLock::new(catalog),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.join(DATA_DIR)
    }

    pub fn catalog_path(&self) -> &Path {
        &self.catalog_path
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    pub fn script(&self) -> &str {
        &self.config.script
    }

    pub fn commit(&self) -> &str {
        &self.config.commit
    }

    /// Declared parameters with their defaults.
    pub fn params(&self) -> &IndexMap<String, Option<ParamValue>> {
        &self.config.params
    }

    pub fn len(&self) -> usize {
        self.catalog.read().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Output directory of a result.
    pub fn result_dir(&self, id: &str) -> PathBuf {
        self.data_dir().join(id)
    }

    // ------------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------------

    /// Checks a result's parameter names against the campaign schema.
    pub fn validate(&self, result: &SimulationResult) -> SemResult<()> {
        let expected: BTreeSet<&str> = self
            .config
            .param_names()
            .chain(std::iter::once(RNGRUN))
            .collect();
        let found: BTreeSet<&str> = result.params.keys().map(String::as_str).collect();
        if expected != found {
            let missing: Vec<_> = expected.difference(&found).collect();
            let extra: Vec<_> = found.difference(&expected).collect();
            return Err(SemError::bad_structure(format!(
                "result {}: missing params {:?}, unexpected params {:?}",
                result.meta.id, missing, extra
            )));
        }
        if result.params.get(RNGRUN).and_then(ParamValue::as_i64).map_or(true, |r| r < 0) {
            return Err(SemError::bad_structure(format!(
                "result {}: {} must be a non-negative integer",
                result.meta.id, RNGRUN
            )));
        }
        if result.meta.id.is_empty() || result.meta.id.contains(['/', '\\']) {
            return Err(SemError::bad_structure(format!("invalid result id '{}'", result.meta.id)));
        }
        Ok(())
    }

    /// Adds a result to the in-memory catalog without writing to disk.
    ///
    /// The result directory is created, with empty `stdout`/`stderr` files if
    /// the simulator did not leave any.
    pub fn stage_result(&self, result: SimulationResult) -> SemResult<()> {
        self.validate(&result)?;
        let dir = self.result_dir(&result.meta.id);
        fs::create_dir_all(&dir)?;
        for name in ["stdout", "stderr"] {
            let path = dir.join(name);
            if !path.exists() {
                fs::File::create(path)?;
            }
        }
        self.catalog.write().push(result);
        Ok(())
    }

    /// Inserts a result and writes the catalog through.
    pub fn insert_result(&self, result: SimulationResult) -> SemResult<()> {
        self.stage_result(result)?;
        self.flush()
    }

    /// Inserts a loosely typed result, checking it against the canonical
    /// structure.
    pub fn insert_value(&self, value: Value) -> SemResult<()> {
        let result: SimulationResult =
            serde_json::from_value(value).map_err(|e| SemError::bad_structure(e.to_string()))?;
        self.insert_result(result)
    }

    /// Inserts several results and writes the catalog once.
    ///
    /// All results are validated before any is inserted.
    pub fn insert_many(&self, results: impl IntoIterator<Item = SimulationResult>) -> SemResult<()> {
        let results: Vec<SimulationResult> = results.into_iter().collect();
        for result in &results {
            self.validate(result)?;
        }
        for result in results {
            self.stage_result(result)?;
        }
        self.flush()
    }

    /// Writes staged changes to disk, if there are any.
    pub fn flush(&self) -> SemResult<()> {
        let mut catalog = self.catalog.write();
        if !catalog.dirty {
            return Ok(());
        }

        let mut results = Map::new();
        for (doc_id, result) in &catalog.results {
            results.insert(doc_id.to_string(), serde_json::to_value(result)?);
        }
        let document = json!({
            "config": { "1": serde_json::to_value(&self.config)? },
            "results": Value::Object(results),
        });
        write_atomic(&self.catalog_path, &serde_json::to_vec(&document)?)?;
        catalog.dirty = false;
        debug!("Flushed {} results to {}", catalog.results.len(), self.catalog_path.display());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Every stored result, in insertion order.
    pub fn all_results(&self) -> Vec<SimulationResult> {
        self.catalog.read().results.values().cloned().collect()
    }

    /// Results matching `query`.
    pub fn get_results(&self, query: &ResultQuery) -> SemResult<Vec<SimulationResult>> {
        self.get_results_any(std::slice::from_ref(query))
    }

    /// Results matching at least one of `queries`, without duplicates.
    pub fn get_results_any(&self, queries: &[ResultQuery]) -> SemResult<Vec<SimulationResult>> {
        for query in queries {
            if query.id.is_none() {
                self.check_known(query.params.keys())?;
            }
        }
        let catalog = self.catalog.read();
        let matches: Vec<SimulationResult> = catalog
            .results
            .values()
            .filter(|r| queries.iter().any(|q| q.matches(r)))
            .cloned()
            .collect();
        if queries.iter().any(|q| q.id.is_some()) && matches.len() > 1 {
            // Ids are unique per result but a result may be inserted twice.
            let mut seen = BTreeSet::new();
            return Ok(matches.into_iter().filter(|r| seen.insert(r.meta.id.clone())).collect());
        }
        Ok(matches)
    }

    /// Results matching `query`, together with their output files.
    ///
    /// `file_filter` restricts which file names are loaded.
    pub fn get_complete_results(
        &self,
        query: &ResultQuery,
        file_filter: Option<&dyn Fn(&str) -> bool>,
    ) -> SemResult<Vec<CompleteResult>> {
        self.get_results(query)?
            .into_iter()
            .map(|result| self.complete(result, file_filter))
            .collect()
    }

    /// Loads the output files of one result.
    pub fn complete(
        &self,
        result: SimulationResult,
        file_filter: Option<&dyn Fn(&str) -> bool>,
    ) -> SemResult<CompleteResult> {
        let mut output = IndexMap::new();
        for (name, path) in self.result_files(&result.meta.id)? {
            if let Some(filter) = file_filter {
                if !filter(&name) {
                    continue;
                }
            }
            let bytes = fs::read(&path)?;
            let file = match String::from_utf8(bytes) {
                Ok(text) => OutputFile::Text(text),
                Err(e) => OutputFile::Raw(e.into_bytes()),
            };
            output.insert(name, file);
        }
        Ok(CompleteResult { result, output })
    }

    /// Output files of a result, by name.
    pub fn result_files(&self, id: &str) -> SemResult<IndexMap<String, PathBuf>> {
        let dir = self.result_dir(id);
        let mut files: Vec<(String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
            }
        }
        files.sort();
        Ok(files.into_iter().collect())
    }

    /// Fresh `RngRun` values, smallest first, skipping those in use.
    pub fn next_rngruns(&self) -> RngRunAllocator {
        let catalog = self.catalog.read();
        RngRunAllocator::new(
            catalog
                .results
                .values()
                .filter_map(|r| r.params.get(RNGRUN).and_then(ParamValue::as_i64)),
        )
    }

    fn check_known<'a>(&self, keys: impl Iterator<Item = &'a String>) -> SemResult<()> {
        for key in keys {
            if key != RNGRUN && !self.config.params.contains_key(key) {
                return Err(SemError::UnknownParam(key.clone()));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------------

    /// Removes a result and its output directory. Not reversible.
    pub fn delete_result(&self, id: &str) -> SemResult<()> {
        {
            let mut catalog = self.catalog.write();
            let before = catalog.results.len();
            catalog.results.retain(|_, r| r.meta.id != id);
            if catalog.results.len() == before {
                return Err(SemError::NoResults(format!("no result with id {}", id)));
            }
            catalog.dirty = true;
        }
        let dir = self.result_dir(id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        self.flush()
    }

    /// Removes every result and all output files.
    pub fn wipe(&self) -> SemResult<()> {
        {
            let mut catalog = self.catalog.write();
            catalog.results.clear();
            catalog.next_doc_id = 0;
            catalog.dirty = true;
        }
        let data = self.data_dir();
        if data.exists() {
            fs::remove_dir_all(&data)?;
        }
        fs::create_dir_all(&data)?;
        warn!("Wiped all results of campaign {}", self.dir.display());
        self.flush()
    }
}

impl std::fmt::Debug for CampaignStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("results", &self.len())
            .finish()
    }
}

// ============================================================================
// MERGE
// ============================================================================

/// Combines several campaigns with identical configs into a new one at
/// `output`.
///
/// Results are renumbered in source order. Data directories are copied, or
/// moved when `move_data` is set, in which case the sources are removed.
pub fn merge_campaigns(output: &Path, sources: &[PathBuf], move_data: bool) -> SemResult<CampaignStore> {
    let stores: Vec<CampaignStore> = sources.iter().map(CampaignStore::load).collect::<SemResult<_>>()?;
    let reference = stores
        .first()
        .ok_or_else(|| SemError::ConfigMismatch("no campaigns to merge".to_string()))?;
    for store in &stores[1..] {
        if store.config() != reference.config() {
            return Err(SemError::ConfigMismatch(format!(
                "{} and {}",
                reference.dir().display(),
                store.dir().display()
            )));
        }
    }

    let merged = CampaignStore::create(output, reference.config().clone(), false)?;
    for store in &stores {
        for result in store.all_results() {
            let src = store.result_dir(&result.meta.id);
            let dst = merged.result_dir(&result.meta.id);
            if src.exists() && !dst.exists() {
                if move_data {
                    move_dir(&src, &dst)?;
                } else {
                    copy_dir(&src, &dst)?;
                }
            }
            merged.stage_result(result)?;
        }
    }
    merged.flush()?;

    if move_data {
        for store in &stores {
            fs::remove_dir_all(store.data_dir())?;
            fs::remove_file(store.catalog_path())?;
            if fs::read_dir(store.dir())?.next().is_none() {
                fs::remove_dir(store.dir())?;
            }
        }
    }
    info!("Merged {} campaigns into {} ({} results)", stores.len(), output.display(), merged.len());
    Ok(merged)
}

// ============================================================================
// HELPERS
// ============================================================================

fn catalog_path_for(dir: &Path) -> SemResult<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| SemError::corrupt(format!("{} has no directory name", dir.display())))?;
    Ok(dir.join(format!("{}.json", name.to_string_lossy())))
}

fn parse_config(raw: &Value) -> SemResult<CampaignConfig> {
    let table = raw
        .get("config")
        .and_then(Value::as_object)
        .ok_or_else(|| SemError::corrupt("missing config table"))?;
    if table.len() != 1 {
        return Err(SemError::corrupt(format!("config table has {} rows, expected 1", table.len())));
    }
    let row = table
        .values()
        .next()
        .and_then(Value::as_object)
        .ok_or_else(|| SemError::corrupt("config row is not an object"))?;
    let mut keys: Vec<&str> = row.keys().map(String::as_str).collect();
    keys.sort_unstable();
    if keys != CONFIG_KEYS {
        return Err(SemError::corrupt(format!("unexpected config keys {:?}", keys)));
    }
    serde_json::from_value(Value::Object(row.clone()))
        .map_err(|e| SemError::corrupt(format!("config row: {}", e)))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> SemResult<()> {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", name));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Recursively copies a directory tree.
pub fn copy_dir(src: &Path, dst: &Path) -> SemResult<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn move_dir(src: &Path, dst: &Path) -> SemResult<()> {
    if fs::rename(src, dst).is_err() {
        // Different filesystems
        copy_dir(src, dst)?;
        fs::remove_dir_all(src)?;
    }
    Ok(())
}
