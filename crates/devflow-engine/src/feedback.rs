//! Name registry for feedback receivers
//!
//! Feedback lets a stage further down a chain send events back into an
//! earlier stage. The receiving stage registers under a name when the chain
//! is built; senders look the name up per event and push directly into it.

use crate::filter::EventSink;
use devflow_core::{DevflowError, DevflowResult};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::debug;

/// Shared name to receiver map
///
/// Only weak references are stored; a registered stage that has been torn
/// down simply stops resolving.
#[derive(Default)]
pub struct FeedbackRegistry {
    receivers: RwLock<HashMap<String, Weak<dyn EventSink>>>,
}

impl FeedbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver; a name held by a live receiver cannot be reused
    pub fn register(&self, name: &str, receiver: Weak<dyn EventSink>) -> DevflowResult<()> {
        let mut receivers = self.receivers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = receivers.get(name) {
            if existing.strong_count() > 0 {
                return Err(DevflowError::DuplicateFeedback {
                    name: name.to_string(),
                });
            }
        }
        receivers.insert(name.to_string(), receiver);
        debug!(name, "feedback receiver registered");
        Ok(())
    }

    /// Live receiver registered under `name`
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn EventSink>> {
        self.receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(Weak::upgrade)
    }

    pub fn unregister(&self, name: &str) {
        let removed = self
            .receivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            debug!(name, "feedback receiver unregistered");
        }
    }

    /// Names of receivers that are still alive
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, receiver)| receiver.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;

    #[test]
    fn test_register_and_lookup() {
        let registry = FeedbackRegistry::new();
        let receiver: Arc<dyn EventSink> = Arc::new(NullSink::new());
        registry.register("calibration", Arc::downgrade(&receiver)).unwrap();

        assert!(registry.lookup("calibration").is_some());
        assert!(registry.lookup("other").is_none());
        assert_eq!(registry.names(), vec!["calibration".to_string()]);

        registry.unregister("calibration");
        assert!(registry.lookup("calibration").is_none());
    }

    #[test]
    fn test_duplicate_live_name_rejected() {
        let registry = FeedbackRegistry::new();
        let first: Arc<dyn EventSink> = Arc::new(NullSink::new());
        let second: Arc<dyn EventSink> = Arc::new(NullSink::new());
        registry.register("loop", Arc::downgrade(&first)).unwrap();

        let result = registry.register("loop", Arc::downgrade(&second));
        assert!(matches!(result, Err(DevflowError::DuplicateFeedback { .. })));

        // A dead registration may be replaced
        drop(first);
        assert!(registry.lookup("loop").is_none());
        registry.register("loop", Arc::downgrade(&second)).unwrap();
        assert!(registry.lookup("loop").is_some());
    }
}
