//! Asynchronous job execution: durable job records, the worker pool that claims
//! them, and the handlers that do the work.

pub mod artifact_store;
pub mod dispatcher;
pub mod handlers;
pub mod job_store;
pub mod model;
pub mod runner;

pub use dispatcher::{Broadcaster, Dispatcher, DispatcherConfig, Subscription};
pub use handlers::{HandlerRegistry, JobHandler, Services};
pub use job_store::{JobStore, SqliteJobStore};
pub use model::{Job, JobKind, JobStatus, ProgressEvent};
pub use runner::{JobContext, JobRunner};
