use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed mutual exclusion: callers holding the guard for a key serialize
/// against each other, different keys proceed in parallel. Used to
/// single-flight state mutation and backfill per room.
#[derive(Default)]
pub struct Linearizer {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Linearizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn same_key_serializes() {
        let linearizer = Arc::new(Linearizer::new());
        let concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let linearizer = linearizer.clone();
            let concurrent = concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = linearizer.lock("!room:x").await;
                let inside = concurrent.fetch_add(1, Ordering::SeqCst);
                assert_eq!(inside, 0);
                tokio::task::yield_now().await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let linearizer = Linearizer::new();
        let _a = linearizer.lock("!a:x").await;
        // Locking a different key must not deadlock while "!a:x" is held.
        let _b = linearizer.lock("!b:x").await;
    }
}
