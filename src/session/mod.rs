// Session layer — keys, groups, sessions and the store that owns them.

pub mod external;
pub mod group;
pub mod identity;
pub mod keys;
pub mod lease;
pub mod resolver;
#[allow(clippy::module_inception)]
pub mod session;
pub mod store;

pub use external::{ExternalSession, MemorySessionState};
pub use group::SessionGroup;
pub use identity::{GuidSessionIdSupplier, SessionIdSupplier};
pub use keys::{MarkerKeys, SessionIdentity, SessionKey};
pub use lease::SessionLease;
pub use resolver::{RunnerMarker, RunnerResolver};
pub use session::{Session, SessionScope};
pub use store::{SessionInitializer, SessionStore, SessionStoreBuilder, StoreCache, StoreEntry, StoreKey};
