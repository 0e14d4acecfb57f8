//! SEM Core: campaigns, parameter spaces and simulator logs.
//!
//! This crate holds everything the Simulation Execution Manager needs that
//! does not involve launching processes:
//!
//! - **Parameters** ([`ParamValue`], [`ParamSpec`]): dynamically typed
//!   combinations and the compact specs that expand into them
//! - **Campaign store** ([`CampaignStore`]): the durable catalog of results
//!   and their output directories
//! - **Log store** ([`LogStore`]): parsing and filtering of `prefix_all`
//!   simulator logs
//! - **Severities** ([`LogComponents`]): per-component log specifiers and
//!   their equivalence
//!
//! # Example
//!
//! ```ignore
//! use sem_core::{CampaignStore, ParamSpec, ResultQuery};
//!
//! let spec = ParamSpec::new()
//!     .with_list("nodes", [2, 4, 8])
//!     .with_value("mode", "fast");
//! for combination in spec.expand()? {
//!     let existing = store.get_results(&ResultQuery::from_params(&combination))?;
//!     println!("{} results for {:?}", existing.len(), combination);
//! }
//! ```

pub mod error;
pub mod expander;
pub mod logs;
pub mod params;
pub mod result;
pub mod severity;
pub mod store;

pub use error::{require_absolute, SemError, SemResult};
pub use expander::{expand_all, DerivedFn, ParamSpec, SpecValue};
pub use logs::{parse_line, parse_logs, process_logs, LogFilter, LogRecord, LogStore, LogSummary};
pub use params::{
    combination_key, equivalent, param_map, rngrun_of, without_rngrun, CombinationKey, ParamMap,
    ParamValue, RNGRUN,
};
pub use result::{CampaignConfig, CompleteResult, OutputFile, ResultMeta, SimulationResult};
pub use severity::{LogComponents, SeverityClass, SeveritySet, LOG_ENV_VAR};
pub use store::{merge_campaigns, CampaignStore, ResultQuery, RngRunAllocator};
