//! Session-bound background runners and the cache-backed store that owns them.
//!
//! A [`SessionStore`] creates each session exactly once per generation, even
//! under concurrent requests, and turns cache evictions into asynchronous
//! cleanup. Runners stream results from a background task through a bounded
//! queue to a single consumer that may poll, await, cancel or abort.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod session;
pub mod source;
pub mod telemetry;

pub use config::{RunnerOptions, StoreConfig};
pub use engine::{
    Completion, ReadRequest, Runner, RunnerChunk, RunnerContext, RunnerControl, RunnerId,
    RunnerManager, RunnerStatus, StoreStatistics, StreamingRunner,
};
pub use error::{Error, Result};
pub use session::{
    ExternalSession, MemorySessionState, Session, SessionKey, SessionLease, SessionStore,
};
