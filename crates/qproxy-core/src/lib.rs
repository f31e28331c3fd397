pub mod classifier;
pub mod credits;
pub mod job;
pub mod router;
pub mod state;
pub mod waiter;
pub mod worker;

pub use job::{Job, JobResult};
pub use router::{ProviderRouter, RouteError};
pub use state::AppState;
pub use waiter::{wait_for_result, WaitOutcome};
pub use worker::{ensure_worker, WorkerRegistry};
