// Cache backends — the expiring cache contract and the in-process implementation.

pub mod memory;
pub mod traits;

pub use memory::{MemoryCache, MemoryCacheOptions};
pub use traits::{CachePriority, EntryOptions, EvictionCallback, EvictionReason, ExpiringCache};
