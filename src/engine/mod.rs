// Runner engine — state machine, bounded queue, streaming runners and the per-session manager.

pub mod completion;
pub mod manager;
pub mod queue;
pub mod runner;
pub mod state;
pub mod stats;
pub mod streaming;

pub use completion::Completion;
pub use manager::{RegisteredRunner, RunnerManager};
pub use runner::{ReadRequest, Runner, RunnerChunk, RunnerContext, RunnerControl};
pub use state::{RunnerCore, RunnerId, RunnerStatus};
pub use stats::{StatsCollector, StoreStatistics};
pub use streaming::{Feed, StreamingRunner};
