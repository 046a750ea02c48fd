//! Short-lived internal tokens.
//!
//! Each invocation gets a fresh bearer token so the function can call back
//! into the host for the lifetime of the call. Tokens live in a
//! process-wide map with a fixed TTL; stale entries are removed on access
//! and by a background sweeper.

use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct InternalTokenStore {
    ttl: Duration,
    tokens: Arc<Mutex<HashMap<String, Instant>>>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl InternalTokenStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Mutex::new(None),
        }
    }

    /// Mint a 32-byte crypto-random hex token and register it.
    pub fn generate(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        self.tokens
            .lock()
            .expect("token lock poisoned")
            .insert(token.clone(), Instant::now());
        token
    }

    /// True iff the token exists and is within its TTL. Stale entries are
    /// deleted on access.
    pub fn validate(&self, token: &str) -> bool {
        let mut tokens = self.tokens.lock().expect("token lock poisoned");
        match tokens.get(token) {
            Some(created_at) if created_at.elapsed() < self.ttl => true,
            Some(_) => {
                tokens.remove(token);
                false
            }
            None => false,
        }
    }

    /// Start the background sweeper. Idempotent: a second start is a no-op.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().expect("sweeper lock poisoned");
        if sweeper.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let tokens = Arc::clone(&self.tokens);
        let ttl = self.ttl;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokens
                            .lock()
                            .expect("token lock poisoned")
                            .retain(|_, created_at| created_at.elapsed() < ttl);
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
        *sweeper = Some(SweeperHandle { stop: stop_tx, task });
    }

    /// Stop the sweeper and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let handle = self.sweeper.lock().expect("sweeper lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            let _ = handle.task.await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tokens.lock().expect("token lock poisoned").len()
    }
}

impl Default for InternalTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_64_hex_chars() {
        let store = InternalTokenStore::new();
        let token = store.generate();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        // Tokens are unique
        assert_ne!(token, store.generate());
    }

    #[test]
    fn test_validate_fresh_token() {
        let store = InternalTokenStore::new();
        let token = store.generate();
        assert!(store.validate(&token));
        assert!(!store.validate("not-a-token"));
    }

    #[test]
    fn test_stale_token_deleted_on_access() {
        let store = InternalTokenStore::with_ttl(Duration::from_millis(0));
        let token = store.generate();
        assert!(!store.validate(&token));
        // Deleted, not just rejected
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_tokens() {
        let store = InternalTokenStore::with_ttl(Duration::from_millis(0));
        store.generate();
        store.generate();
        assert_eq!(store.len(), 2);

        // Sweep logic, exercised directly against the shared map
        store
            .tokens
            .lock()
            .unwrap()
            .retain(|_, created_at| created_at.elapsed() < store.ttl);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_joins() {
        let store = InternalTokenStore::new();
        store.start_sweeper();
        store.start_sweeper();
        store.stop().await;
        store.stop().await;
        // Sweeper is gone; a fresh start works again
        store.start_sweeper();
        store.stop().await;
    }
}
