mod archival;
mod clock;
mod db;
mod engine;
mod errors;
mod gc;
mod materializer;
mod models;
mod period;
mod planner;
mod progress;
mod skip;
mod stats;
mod sync;

pub use clock::{Clock, FixedClock, SystemClock};
pub use db::{Database, UnitOfWork};
pub use engine::EngineService;
pub use errors::{EngineError, EngineResult};
pub use materializer::Materialization;
pub use models::*;
pub use period::{bounds, instance_for, instances_in_range, timeline, PeriodInstance};
pub use planner::{generation_window, PlanEntry};
pub use progress::{NoopReporter, ProgressReporter};
pub use sync::{ExternalEventRecord, ExternalSchedulePage, ExternalScheduleSource};
