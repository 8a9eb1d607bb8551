/**
 * registry.rs
 *
 * Token-keyed handoff registries. One instance per table; the mutex is
 * scoped to the map mutation itself, the bounded channels carry the
 * actual cross-task handoff.
 */

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// Registry errors
#[derive(Debug)]
pub enum RegistryError {
    Duplicate(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Duplicate(token) => {
                write!(f, "token already registered: {}", token)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Concurrent token -> bounded-queue mapping.
///
/// Whichever side registers an entry is responsible for unregistering it
/// on every exit path, timeouts included.
pub struct TokenRegistry<T> {
    name: &'static str,
    capacity: usize,
    entries: Mutex<HashMap<String, mpsc::Sender<T>>>,
}

impl<T> TokenRegistry<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create the queue for `token`. Fails if the token is live.
    pub fn register(&self, token: &str) -> Result<mpsc::Receiver<T>, RegistryError> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if entries.contains_key(token) {
            return Err(RegistryError::Duplicate(token.to_string()));
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        entries.insert(token.to_string(), tx);
        Ok(rx)
    }

    /// Best-effort non-blocking send into an existing queue.
    ///
    /// Refused deliveries (no such token, full queue, receiving task
    /// gone) hand the value back so the caller can still dispose of it,
    /// e.g. answer on a connection it carries.
    pub fn deliver(&self, token: &str, value: T) -> Result<(), T> {
        let tx = {
            let entries = self.entries.lock().expect("registry lock poisoned");
            entries.get(token).cloned()
        };

        match tx {
            Some(tx) => match tx.try_send(value) {
                Ok(()) => Ok(()),
                Err(err) => {
                    warn!(registry = self.name, token, "queue unavailable, delivery refused");
                    Err(err.into_inner())
                }
            },
            None => {
                warn!(registry = self.name, token, "stale delivery for unknown token");
                Err(value)
            }
        }
    }

    pub fn unregister(&self, token: &str) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries.remove(token);
    }

    pub fn contains(&self, token: &str) -> bool {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.contains_key(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_deliver_unregister() {
        let registry: TokenRegistry<u32> = TokenRegistry::new("test", 1);

        let mut rx = registry.register("tok").unwrap();
        assert!(registry.deliver("tok", 7).is_ok());
        assert_eq!(rx.recv().await, Some(7));

        registry.unregister("tok");
        assert!(!registry.contains("tok"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry: TokenRegistry<u32> = TokenRegistry::new("test", 1);

        let _rx = registry.register("tok").unwrap();
        assert!(matches!(
            registry.register("tok"),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[test]
    fn stale_delivery_returns_the_value() {
        let registry: TokenRegistry<u32> = TokenRegistry::new("test", 1);
        assert_eq!(registry.deliver("nobody", 1), Err(1));
    }

    #[test]
    fn full_queue_returns_the_value() {
        tokio_test::block_on(async {
            let registry: TokenRegistry<u32> = TokenRegistry::new("test", 1);

            let _rx = registry.register("tok").unwrap();
            assert!(registry.deliver("tok", 1).is_ok());
            assert_eq!(registry.deliver("tok", 2), Err(2));
        });
    }

    #[test]
    fn token_is_reusable_after_unregister() {
        let registry: TokenRegistry<u32> = TokenRegistry::new("test", 1);

        let _rx = registry.register("tok").unwrap();
        registry.unregister("tok");
        assert!(registry.register("tok").is_ok());
    }
}
