// Base session id suppliers.

use bytes::Bytes;
use uuid::Uuid;

use super::external::ExternalSession;

pub const DEFAULT_BASE_ID_KEY: &str = "SessionStore_BaseId";

/// Maps an external session to the base id its sessions are grouped under.
pub trait SessionIdSupplier: Send + Sync {
    fn base_session_id(&self, external: &dyn ExternalSession) -> String;
}

/// Generates a UUID v4 on first use and persists it in the external session.
#[derive(Debug, Clone)]
pub struct GuidSessionIdSupplier {
    key: String,
}

impl GuidSessionIdSupplier {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for GuidSessionIdSupplier {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_ID_KEY)
    }
}

impl SessionIdSupplier for GuidSessionIdSupplier {
    fn base_session_id(&self, external: &dyn ExternalSession) -> String {
        let mut generate = || Bytes::from(Uuid::new_v4().simple().to_string());
        let stored = external.get_or_set(&self.key, &mut generate);
        match String::from_utf8(stored.to_vec()) {
            Ok(id) if !id.is_empty() => id,
            _ => {
                let id = Uuid::new_v4().simple().to_string();
                external.set_string(&self.key, &id);
                id
            }
        }
    }
}
