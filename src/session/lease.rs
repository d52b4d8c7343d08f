// Request-scoped session handle — fetches on request start, detaches when dropped.

use std::ops::Deref;
use std::sync::Arc;

use super::external::ExternalSession;
use super::session::Session;
use super::store::SessionStore;
use crate::error::Result;

/// Holds one group reference for the duration of a request.
pub struct SessionLease {
    store: Arc<SessionStore>,
    session: Arc<Session>,
}

impl SessionLease {
    pub async fn acquire(
        store: &Arc<SessionStore>,
        external: &dyn ExternalSession,
        request_id: &str,
        suffix: Option<&str>,
    ) -> Result<Self> {
        let session = store.fetch_or_create(external, request_id, suffix).await?;
        Ok(Self {
            store: store.clone(),
            session,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.store.detach(&self.session);
    }
}
