//! Volatile per-application gain map owned by the authoritative service.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

/// Gain reported for applications that were never configured.
pub const DEFAULT_GAIN: f32 = 1.0;
/// Lowest storable gain (silence).
pub const MIN_GAIN: f32 = 0.0;
/// Highest storable gain (unity).
pub const MAX_GAIN: f32 = 1.0;

/// Clamp into `[MIN_GAIN, MAX_GAIN]`; NaN resolves to `MAX_GAIN`.
#[inline]
pub fn clamp_gain(value: f32) -> f32 {
    value.min(MAX_GAIN).max(MIN_GAIN)
}

/// One application's stored level.
#[derive(Clone, Debug, PartialEq)]
pub struct GainEntry {
    /// Application identifier, e.g. a reverse-DNS bundle id.
    pub app_id: String,
    /// Linear gain in `[0.0, 1.0]`.
    pub gain: f32,
}

/// Mutex protected map from application identifier to gain.
///
/// The store clamps on every write even though the service validates first.
#[derive(Default)]
pub struct GainStore {
    gains: Mutex<HashMap<String, f32>>,
}

impl GainStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` (clamped) for `app_id`, returning the stored value.
    pub fn set_gain(&self, app_id: &str, value: f32) -> f32 {
        let clamped = clamp_gain(value);
        if clamped != value {
            debug!(app_id, requested = value, stored = clamped, "clamped gain");
        }
        self.gains.lock().insert(app_id.to_owned(), clamped);
        clamped
    }

    /// Stored gain, or [`DEFAULT_GAIN`] when none was set.
    pub fn get_gain(&self, app_id: &str) -> f32 {
        self.gains
            .lock()
            .get(app_id)
            .copied()
            .unwrap_or(DEFAULT_GAIN)
    }

    /// Forget `app_id`, returning the previous value if there was one.
    pub fn remove_gain(&self, app_id: &str) -> Option<f32> {
        self.gains.lock().remove(app_id)
    }

    /// Full copy of the map.
    pub fn all_gains(&self) -> HashMap<String, f32> {
        self.gains.lock().clone()
    }

    /// Number of configured applications.
    pub fn len(&self) -> usize {
        self.gains.lock().len()
    }

    /// Whether no application has a stored gain.
    pub fn is_empty(&self) -> bool {
        self.gains.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_on_write() {
        let store = GainStore::new();
        for (input, expected) in [
            (-3.0, 0.0),
            (-0.0, 0.0),
            (0.25, 0.25),
            (1.0, 1.0),
            (7.5, 1.0),
            (f32::INFINITY, 1.0),
            (f32::NEG_INFINITY, 0.0),
        ] {
            store.set_gain("com.example.app", input);
            assert_eq!(store.get_gain("com.example.app"), expected, "input {input}");
        }
    }

    #[test]
    fn nan_follows_min_then_max() {
        let store = GainStore::new();
        store.set_gain("nan", f32::NAN);
        assert_eq!(store.get_gain("nan"), 1.0f32.min(f32::NAN).max(0.0));
    }

    #[test]
    fn unknown_identifier_defaults_to_unity() {
        let store = GainStore::new();
        assert_eq!(store.get_gain("never.configured"), DEFAULT_GAIN);
    }

    #[test]
    fn representable_values_round_trip_exactly() {
        let store = GainStore::new();
        store.set_gain("com.spotify.client", 0.37);
        assert_eq!(store.get_gain("com.spotify.client"), 0.37);
    }

    #[test]
    fn remove_restores_default() {
        let store = GainStore::new();
        store.set_gain("a", 0.2);
        assert_eq!(store.remove_gain("a"), Some(0.2));
        assert_eq!(store.remove_gain("a"), None);
        assert_eq!(store.get_gain("a"), DEFAULT_GAIN);
        assert!(store.is_empty());
    }

    #[test]
    fn all_gains_is_a_detached_copy() {
        let store = GainStore::new();
        store.set_gain("a", 0.1);
        let snapshot = store.all_gains();
        store.set_gain("a", 0.9);
        store.set_gain("b", 0.5);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["a"], 0.1);
        assert_eq!(store.len(), 2);
    }
}
