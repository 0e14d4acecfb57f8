//! SEM Simulator Abstraction Layer
//!
//! Runners never spawn processes themselves. They talk to a [`Simulator`],
//! which can be:
//!
//! - **Production** ([`ProcessSimulator`]): the compiled script binary,
//!   driven through `tokio::process`
//! - **Testing** ([`InProcessSimulator`]): a Rust closure that writes the
//!   same files a real run would
//!
//! # Example
//!
//! ```ignore
//! use sem_env::{ProcessSimulator, Simulator};
//!
//! let sim = ProcessSimulator::new("/opt/ns3/build/scratch/wifi", "wifi")
//!     .with_library_path("/opt/ns3/build/lib");
//! let schema = sim.available_parameters().await?;
//! let outcome = sim.execute(&params, &run_dir, &[]).await?;
//! ```

mod error;
mod in_process;
mod process;
pub mod schema;
mod simulator;
mod types;

pub use error::EnvError;
pub use in_process::{InProcessSimulator, SimOutput};
pub use process::{exit_code, ProcessSimulator};
pub use simulator::{format_arguments, ParamSchema, Simulator};
pub use types::{BuildProfile, ExecutionOutcome};
