// Data source abstraction — pull sources and the push producer that feed streaming runners.

pub mod iter_source;
pub mod push;
pub mod traits;

pub use iter_source::{IterSource, TryIterSource};
pub use push::Producer;
pub use traits::PullSource;
