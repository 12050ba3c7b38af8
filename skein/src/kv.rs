use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::oneshot;

#[cfg(test)]
mod tests;

/// Waiters are woken on the appearance of a value: a plain `set` on an absent
/// key, or a `set` after a `del`. Deletion itself never wakes anyone.
struct Waiter {
    id: u64,
    tx: oneshot::Sender<String>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, String>,
    waiters: HashMap<String, Vec<Waiter>>,
    next_waiter: u64,
}

/// Concurrent key-value store with blocking reads, owned by the application
/// master and used as the rendezvous point between dependent services.
///
/// A single lock covers the entries and the waiter registry, which makes the
/// store linearizable: whichever of a racing `set` and `get` takes the lock
/// first is ordered first.
#[derive(Default)]
pub struct KvStore {
    inner: Mutex<Inner>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().unwrap().entries.contains_key(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// Unconditional upsert. All waiters registered on `key` observe this value.
    pub fn set(&self, key: String, value: String) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(waiters) = inner.waiters.remove(&key) {
            trace!(key = %key, waiters = waiters.len(), "waking kv waiters");
            for waiter in waiters {
                // A closed receiver just means the waiter was cancelled
                // between deregistration and delivery.
                let _ = waiter.tx.send(value.clone());
            }
        }
        inner.entries.insert(key, value);
    }

    /// Remove `key` if present. Idempotent; returns whether a value was removed.
    pub fn del(&self, key: &str) -> bool {
        self.inner.lock().unwrap().entries.remove(key).is_some()
    }

    /// Return the value for `key`, blocking until one is set.
    ///
    /// Dropping the returned future (client disconnect, deadline) removes the
    /// registered waiter, so a later `set` does not deliver to a dead caller.
    pub async fn wait(&self, key: &str) -> String {
        loop {
            let (id, rx) = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(value) = inner.entries.get(key) {
                    return value.clone();
                }
                let id = inner.next_waiter;
                inner.next_waiter += 1;
                let (tx, rx) = oneshot::channel();
                inner.waiters.entry(key.to_owned()).or_default().push(Waiter { id, tx });
                (id, rx)
            };
            let _guard = WaiterGuard { store: self, key, id };
            match rx.await {
                Ok(value) => return value,
                // Sender dropped without a send; re-register and keep waiting.
                Err(_) => continue,
            }
        }
    }

    fn deregister(&self, key: &str, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(waiters) = inner.waiters.get_mut(key) {
            waiters.retain(|waiter| waiter.id != id);
            if waiters.is_empty() {
                inner.waiters.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn waiter_count(&self, key: &str) -> usize {
        self.inner.lock().unwrap().waiters.get(key).map_or(0, Vec::len)
    }
}

struct WaiterGuard<'a> {
    store: &'a KvStore,
    key: &'a str,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.store.deregister(self.key, self.id);
    }
}
