#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use persister::{AsyncStorage, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// In-memory storage whose failures and latency are scripted by the test
#[derive(Default)]
pub struct ScriptedStorage {
    items: Mutex<HashMap<String, String>>,
    written: Mutex<Vec<String>>,
    latency: Duration,
    set_calls: AtomicUsize,
    get_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    failing_sets: AtomicUsize,
    always_fail_sets: AtomicBool,
    fail_gets: AtomicBool,
    fail_removes: AtomicBool,
}

impl ScriptedStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    /// Fail the next `n` writes
    pub fn fail_next_sets(&self, n: usize) {
        self.failing_sets.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_sets(&self, fail: bool) {
        self.always_fail_sets.store(fail, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Put a value in place without counting it as a write
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.items.lock().insert(key.to_string(), value.to_string());
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    /// Successful writes, oldest first
    pub fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail_set(&self) -> bool {
        if self.always_fail_sets.load(Ordering::SeqCst) {
            return true;
        }
        self.failing_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AsyncStorage for ScriptedStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(Error::Storage("read rejected".to_string()));
        }
        Ok(self.raw(key))
    }

    async fn set_item(&self, key: &str, value: String) -> Result<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail_set() {
            return Err(Error::Storage("write rejected".to_string()));
        }

        self.items.lock().insert(key.to_string(), value.clone());
        self.written.lock().push(value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(Error::Storage("delete rejected".to_string()));
        }
        self.items.lock().remove(key);
        Ok(())
    }
}

/// Error sink usable as a persister error hook
pub fn error_sink() -> (Arc<Mutex<Vec<Error>>>, impl Fn(Error) + Send + Sync + 'static) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    (errors, move |err: Error| sink.lock().push(err))
}
