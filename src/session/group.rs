// Session group — reference count and creation lock shared by every session of one base id.

use parking_lot::Mutex;

struct GroupState {
    refs: usize,
    disposed: bool,
}

/// One per base id.
///
/// A group whose count dropped to zero is disposed and never revived; the
/// store replaces it with a fresh group on the next fetch.
pub struct SessionGroup {
    base_id: String,
    state: Mutex<GroupState>,
    create_lock: tokio::sync::Mutex<()>,
}

impl SessionGroup {
    pub fn new(base_id: impl Into<String>) -> Self {
        Self {
            base_id: base_id.into(),
            state: Mutex::new(GroupState {
                refs: 0,
                disposed: false,
            }),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    /// Take a reference. Fails once the group is disposed.
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.disposed {
            return false;
        }
        state.refs += 1;
        true
    }

    /// Drop a reference; returns the remaining count. Reaching zero disposes the group.
    pub fn release(&self) -> usize {
        let mut state = self.state.lock();
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 {
            state.disposed = true;
        }
        state.refs
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().refs
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Serializes create-or-fetch for this base id.
    pub fn create_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.create_lock
    }
}
