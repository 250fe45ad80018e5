//! Per-envelope state that is reset when one envelope ends and the next begins.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Default cap on the number of session properties
pub const DEFAULT_MAX_SESSION_PROPERTIES: usize = 100;

/// The boundary hook failed to reset envelope-scoped state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryError(pub String);

impl std::fmt::Display for BoundaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "boundary reset failed: {}", self.0)
    }
}

impl std::error::Error for BoundaryError {}

/// Called between ending one envelope and starting the next, so that data
/// scoped to the old envelope does not leak into the new one.
pub trait BoundaryDelegate: Send + Sync {
    fn prepare_for_new_envelope(&self, timestamp_ms: i64, clear_user_info: bool) -> Result<(), BoundaryError>;
}

#[derive(Debug, Default)]
struct PropertiesState {
    temporary: HashMap<String, String>,
    permanent: HashMap<String, String>,
    user_id: Option<String>,
    last_boundary_ms: Option<i64>,
}

impl PropertiesState {
    fn len(&self) -> usize {
        self.temporary.len() + self.permanent.len()
    }

    fn contains(&self, key: &str) -> bool {
        self.temporary.contains_key(key) || self.permanent.contains_key(key)
    }
}

/// Key/value properties attached to envelopes.
///
/// Temporary properties are cleared at every envelope boundary, permanent
/// ones survive until removed. The total count is capped.
pub struct SessionProperties {
    max_properties: usize,
    state: Mutex<PropertiesState>,
}

impl Default for SessionProperties {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSION_PROPERTIES)
    }
}

impl SessionProperties {
    pub fn new(max_properties: usize) -> Self {
        Self {
            max_properties,
            state: Mutex::new(PropertiesState::default()),
        }
    }

    /// Add or replace a property. Returns false when the key is empty or the
    /// cap is reached and the key is new.
    pub fn add(&self, key: &str, value: &str, permanent: bool) -> bool {
        let key = key.trim();
        if key.is_empty() {
            return false;
        }

        let mut state = self.state.lock();
        if !state.contains(key) && state.len() >= self.max_properties {
            log::warn!("[SESSION_PROPERTIES] Property limit {} reached, ignoring '{}'", self.max_properties, key);
            return false;
        }

        // A key lives in exactly one of the two maps
        state.temporary.remove(key);
        state.permanent.remove(key);
        let target = if permanent {
            &mut state.permanent
        } else {
            &mut state.temporary
        };
        target.insert(key.to_string(), value.to_string());
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed_temporary = state.temporary.remove(key).is_some();
        let removed_permanent = state.permanent.remove(key).is_some();
        removed_temporary || removed_permanent
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .permanent
            .get(key)
            .or_else(|| state.temporary.get(key))
            .cloned()
    }

    /// All properties, permanent and temporary.
    pub fn all(&self) -> HashMap<String, String> {
        let state = self.state.lock();
        state
            .permanent
            .iter()
            .chain(state.temporary.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        self.state.lock().user_id = user_id;
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.lock().user_id.clone()
    }

    /// Time of the last envelope boundary, if any.
    pub fn last_boundary_ms(&self) -> Option<i64> {
        self.state.lock().last_boundary_ms
    }
}

impl BoundaryDelegate for SessionProperties {
    fn prepare_for_new_envelope(&self, timestamp_ms: i64, clear_user_info: bool) -> Result<(), BoundaryError> {
        let mut state = self.state.lock();
        state.temporary.clear();
        if clear_user_info {
            state.user_id = None;
        }
        state.last_boundary_ms = Some(timestamp_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_clears_temporary_properties_only() {
        let properties = SessionProperties::default();
        assert!(properties.add("plan", "pro", true));
        assert!(properties.add("screen", "checkout", false));

        properties.prepare_for_new_envelope(1000, false).unwrap();

        assert_eq!(properties.get("plan").as_deref(), Some("pro"));
        assert_eq!(properties.get("screen"), None);
        assert_eq!(properties.last_boundary_ms(), Some(1000));
    }

    #[test]
    fn test_boundary_clears_user_info_on_request() {
        let properties = SessionProperties::default();
        properties.set_user_id(Some("user-42".to_string()));

        properties.prepare_for_new_envelope(1, false).unwrap();
        assert_eq!(properties.user_id().as_deref(), Some("user-42"));

        properties.prepare_for_new_envelope(2, true).unwrap();
        assert_eq!(properties.user_id(), None);
    }

    #[test]
    fn test_property_cap() {
        let properties = SessionProperties::new(2);
        assert!(properties.add("a", "1", false));
        assert!(properties.add("b", "2", true));
        assert!(!properties.add("c", "3", false));

        // replacing an existing key is allowed at the cap
        assert!(properties.add("a", "10", true));
        assert_eq!(properties.all().len(), 2);
        assert_eq!(properties.get("a").as_deref(), Some("10"));

        assert!(properties.remove("b"));
        assert!(properties.add("c", "3", false));
    }

    #[test]
    fn test_blank_keys_are_rejected() {
        let properties = SessionProperties::default();
        assert!(!properties.add("  ", "value", false));
        assert!(properties.all().is_empty());
    }
}
