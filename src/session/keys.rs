// Session identity and the per-request marker key scheme.

use std::fmt;

use crate::engine::state::RunnerId;

/// `(base_id, suffix)` pair naming one session slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    base_id: String,
    suffix: Option<String>,
}

impl SessionKey {
    pub fn new(base_id: impl Into<String>, suffix: Option<&str>) -> Self {
        Self {
            base_id: base_id.into(),
            suffix: suffix.map(str::to_string),
        }
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.suffix {
            Some(suffix) => write!(f, "{}|{}", self.base_id, suffix),
            None => f.write_str(&self.base_id),
        }
    }
}

/// One incarnation of a session slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub key: SessionKey,
    pub generation: u32,
}

impl SessionIdentity {
    pub fn new(key: SessionKey, generation: u32) -> Self {
        Self { key, generation }
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}#{}", self.key, self.generation)
    }
}

const GENERATION_SUFFIX: &str = "Generation";
const TYPE_SUFFIX: &str = "_Type";

/// Builds and parses the keys written into the per-request store.
///
/// Runner marker: `{prefix}_{session}#{generation}-{number}`, its type
/// companion appends `_Type`. Generation marker: `{prefix}_{session}#Generation`.
#[derive(Debug, Clone)]
pub struct MarkerKeys {
    prefix: String,
}

impl MarkerKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn session_prefix(&self, key: &SessionKey) -> String {
        format!("{}_{}#", self.prefix, key)
    }

    pub fn generation(&self, key: &SessionKey) -> String {
        format!("{}{}", self.session_prefix(key), GENERATION_SUFFIX)
    }

    pub fn runner(&self, id: &RunnerId) -> String {
        format!("{}{}-{}", self.session_prefix(&id.session), id.generation, id.number)
    }

    pub fn runner_type(&self, id: &RunnerId) -> String {
        format!("{}{}", self.runner(id), TYPE_SUFFIX)
    }

    /// Parse a runner marker (or its `_Type` companion) belonging to `key`.
    ///
    /// Returns `(generation, number)`.
    pub fn parse_runner(&self, key: &SessionKey, marker: &str) -> Option<(u32, u32)> {
        let rest = marker.strip_prefix(&self.session_prefix(key))?;
        let rest = rest.strip_suffix(TYPE_SUFFIX).unwrap_or(rest);
        let (generation, number) = rest.split_once('-')?;
        Some((generation.parse().ok()?, number.parse().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_includes_suffix() {
        assert_eq!(SessionKey::new("abc", None).to_string(), "abc");
        assert_eq!(SessionKey::new("abc", Some("tab2")).to_string(), "abc|tab2");
    }

    #[test]
    fn marker_keys_round_trip() {
        let markers = MarkerKeys::new("Runner");
        let key = SessionKey::new("abc", None);
        let id = RunnerId::new(key.clone(), 3, 12);

        assert_eq!(markers.generation(&key), "Runner_abc#Generation");
        assert_eq!(markers.runner(&id), "Runner_abc#3-12");
        assert_eq!(markers.runner_type(&id), "Runner_abc#3-12_Type");
        assert_eq!(markers.parse_runner(&key, "Runner_abc#3-12"), Some((3, 12)));
        assert_eq!(markers.parse_runner(&key, "Runner_abc#3-12_Type"), Some((3, 12)));
        assert_eq!(markers.parse_runner(&key, "Runner_abc#Generation"), None);
    }

    #[test]
    fn markers_of_other_sessions_do_not_parse() {
        let markers = MarkerKeys::new("Runner");
        let key = SessionKey::new("abc", None);
        assert_eq!(markers.parse_runner(&key, "Runner_abc|x#1-0"), None);
        assert_eq!(markers.parse_runner(&key, "Runner_abcd#1-0"), None);
        assert_eq!(markers.parse_runner(&key, "Other_abc#1-0"), None);
    }
}
