//! Atomically replaceable configuration handle.

use std::sync::{Arc, RwLock};

/// Shared, read-mostly configuration.
///
/// Readers take a cheap `Arc` snapshot; writers build a complete new value
/// and swap it in, so no reader ever observes a half-applied update.
#[derive(Debug)]
pub struct ConfigHandle<T> {
    current: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for ConfigHandle<T> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
        }
    }
}

impl<T: Clone> ConfigHandle<T> {
    /// Create a handle holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Get the current configuration.
    pub fn snapshot(&self) -> Arc<T> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the whole configuration.
    pub fn replace(&self, value: T) {
        let value = Arc::new(value);
        match self.current.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    /// Derive a new configuration from the current one and swap it in.
    ///
    /// The closure works on a copy; the result replaces the shared value only
    /// if the closure succeeds.
    pub fn update<F>(&self, f: F) -> crate::Result<Arc<T>>
    where
        F: FnOnce(&mut T) -> crate::Result<()>,
    {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (**guard).clone();
        f(&mut next)?;
        let next = Arc::new(next);
        *guard = next.clone();
        Ok(next)
    }
}

/// Serde helpers storing `Duration` as whole milliseconds.
///
/// Use with `#[serde(with = "parcelsync_common::config::millis")]`.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Settings {
        batch: usize,
        name: String,
    }

    #[test]
    fn test_snapshot_is_stable_across_update() {
        let handle = ConfigHandle::new(Settings {
            batch: 10,
            name: "a".into(),
        });
        let before = handle.snapshot();

        handle
            .update(|s| {
                s.batch = 20;
                Ok(())
            })
            .unwrap();

        assert_eq!(before.batch, 10);
        assert_eq!(handle.snapshot().batch, 20);
        assert_eq!(handle.snapshot().name, "a");
    }

    #[test]
    fn test_failed_update_leaves_value_untouched() {
        let handle = ConfigHandle::new(Settings {
            batch: 10,
            name: "a".into(),
        });

        let result = handle.update(|s| {
            s.batch = 0;
            Err(crate::Error::Config("batch must be positive".into()))
        });

        assert!(result.is_err());
        assert_eq!(handle.snapshot().batch, 10);
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Timed {
        #[serde(with = "millis")]
        timeout: std::time::Duration,
    }

    #[test]
    fn test_duration_as_millis() {
        let json = serde_json::to_string(&Timed {
            timeout: std::time::Duration::from_secs(2),
        })
        .unwrap();
        assert_eq!(json, r#"{"timeout":2000}"#);
        let parsed: Timed = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.timeout.as_millis(), 2000);
    }

    #[test]
    fn test_clones_share_state() {
        let handle = ConfigHandle::new(Settings {
            batch: 1,
            name: "x".into(),
        });
        let other = handle.clone();
        other.replace(Settings {
            batch: 2,
            name: "y".into(),
        });
        assert_eq!(handle.snapshot().name, "y");
    }
}
