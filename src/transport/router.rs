use log::{debug, warn};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};

use super::SignalListener;
use crate::types::SignalData;

struct Registration {
    pattern: String,
    listener: Arc<dyn SignalListener>,
}

impl Registration {
    fn matches(&self, name: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => self.pattern == name,
        }
    }
}

/// Dispatches received signals to the local listeners registered for them.
///
/// Patterns are exact signal names or prefixes ending with `*`.
pub struct SignalRouter {
    listeners: RwLock<Vec<Registration>>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, pattern: &str, listener: Arc<dyn SignalListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                pattern: pattern.to_string(),
                listener,
            });
    }

    /// Drops every listener.
    pub fn clear(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn has_listener(&self, name: &str) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|registration| registration.matches(name))
    }

    /// Calls every matching listener. Returns `None` when nothing matched.
    /// A failing listener is logged and does not stop the others.
    pub async fn dispatch(&self, name: &str, data: &SignalData) -> Option<Vec<Value>> {
        let matching: Vec<Arc<dyn SignalListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|registration| registration.matches(name))
            .map(|registration| registration.listener.clone())
            .collect();

        if matching.is_empty() {
            debug!("No listener for signal {}", name);
            return None;
        }

        let mut results = Vec::new();
        for listener in matching {
            match listener.handle_received_signal(name, data).await {
                Ok(Some(value)) => results.push(value),
                Ok(None) => {}
                Err(e) => warn!(
                    "Listener failed on signal {} from {}: {:#}",
                    name, data.sender_uid, e
                ),
            }
        }
        Some(results)
    }
}

impl Default for SignalRouter {
    fn default() -> Self {
        Self::new()
    }
}
