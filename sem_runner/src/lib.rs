//! SEM Runner: executing parameter sweeps against a campaign
//!
//! This crate turns a [`ParamSpec`](sem_core::ParamSpec) into stored results:
//!
//! - **Runners** ([`runner`]): sequential, worker-pool, longest-first and
//!   conditional strategies, all yielding results in completion order
//! - **Manager** ([`CampaignManager`]): computes missing runs, dispatches
//!   them and stores what comes back
//! - **Views** ([`ResultArray`], [`ResultFrame`]): results reshaped for
//!   analysis
//!
//! # Usage
//!
//! ```ignore
//! use sem_runner::{CampaignManager, RunOptions, RunnerKind};
//! use sem_env::ProcessSimulator;
//!
//! let sim = ProcessSimulator::new("/opt/ns-3/build/scratch/wifi", "wifi").shared();
//! let manager = CampaignManager::new("/data/wifi-campaign", sim, false)
//!     .await?
//!     .with_runner(RunnerKind::Lpt);
//!
//! let spec = ParamSpec::new().with_list("nodes", [2, 4, 8]);
//! manager.run_missing_simulations(&spec, RunOptions::runs(10)).await?;
//! let throughput = manager.get_results_as_array(&spec, stdout_values, 10)?;
//! ```

pub mod config;
pub mod manager;
pub mod observer;
pub mod parsers;
pub mod runner;
pub mod views;

pub use config::RunnerConfig;
pub use manager::{CampaignManager, RunOptions, RunReport, StoreCondition};
pub use observer::{Observers, RunObserver, TracingObserver};
pub use parsers::{parse_table, stdout_table, stdout_value, stdout_values};
pub use runner::{
    ConditionalRunner, Job, LptRunner, ParallelRunner, ResultStream, RunContext, Runner, RunnerKind,
    SequentialRunner,
};
pub use views::{ParsedValues, ResultArray, ResultFrame};
