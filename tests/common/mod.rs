//! Fake distributed stores and log capture shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use storefront_shield::store::{AtomicScript, DistributedStore, StoreError};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// In-memory stand-in for Redis. Runs the sliding-window script natively.
#[derive(Debug, Default)]
pub struct MemoryStore {
    strings: Mutex<HashMap<String, (String, u64)>>,
    zsets: Mutex<HashMap<String, Vec<(u64, String)>>>,
    pub script_calls: AtomicUsize,
    pub unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Value and TTL seconds of a string key.
    pub fn raw(&self, key: &str) -> Option<(String, u64)> {
        self.strings.lock().unwrap().get(key).cloned()
    }

    pub fn zset_len(&self, key: &str) -> usize {
        self.zsets.lock().unwrap().get(key).map_or(0, Vec::len)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.strings.lock().unwrap().keys().cloned().collect();
        keys.extend(self.zsets.lock().unwrap().keys().cloned());
        keys.sort();
        keys
    }

    fn sliding_window(&self, keys: &[String], args: &[String]) -> Result<Vec<i64>, StoreError> {
        let parse = |i: usize| -> Result<u64, StoreError> {
            args.get(i)
                .and_then(|a| a.parse().ok())
                .ok_or_else(|| StoreError::Script(format!("bad argument {}", i)))
        };
        let (now, window, points) = (parse(0)?, parse(1)?, parse(2)?);
        let key = keys.first().ok_or_else(|| StoreError::Script("missing key".into()))?;

        let mut zsets = self.zsets.lock().unwrap();
        let set = zsets.entry(key.clone()).or_default();
        set.retain(|(score, _)| i128::from(*score) > i128::from(now) - i128::from(window));
        if set.len() as u64 >= points {
            let oldest = set.iter().map(|(score, _)| *score).min().unwrap_or(now);
            return Ok(vec![0, (oldest + window - now) as i64]);
        }
        set.push((now, args[3].clone()));
        Ok(vec![1, 0])
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.strings.lock().unwrap().get(key).map(|(v, _)| v.clone()))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.strings.lock().unwrap().insert(key.to_string(), (value.to_string(), ttl_secs));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut strings = self.strings.lock().unwrap();
        let mut zsets = self.zsets.lock().unwrap();
        let mut removed = 0;
        for key in keys {
            if strings.remove(key).is_some() || zsets.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan_keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.keys().into_iter().filter(|k| glob_match(pattern, k)).collect())
    }

    async fn run_atomic_script(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<i64>, StoreError> {
        self.script_calls.fetch_add(1, Ordering::SeqCst);
        match script.name() {
            "sliding_window_consume" => self.sliding_window(keys, args),
            other => Err(StoreError::Script(format!("unknown script {}", other))),
        }
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.strings.lock().unwrap().remove(key).map(|(v, _)| v))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Store that claims to be up but fails every operation.
#[derive(Debug, Default)]
pub struct FailingStore {
    pub calls: AtomicUsize,
}

impl FailingStore {
    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Connection("connection refused".into()))
    }
}

#[async_trait]
impl DistributedStore for FailingStore {
    fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        self.fail()
    }

    async fn set_with_expiry(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), StoreError> {
        self.fail()
    }

    async fn delete(&self, _keys: &[String]) -> Result<u64, StoreError> {
        self.fail()
    }

    async fn scan_keys_matching(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        self.fail()
    }

    async fn run_atomic_script(
        &self,
        _script: &AtomicScript,
        _keys: &[String],
        _args: &[String],
    ) -> Result<Vec<i64>, StoreError> {
        self.fail()
    }

    async fn get_and_delete(&self, _key: &str) -> Result<Option<String>, StoreError> {
        self.fail()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.fail()
    }
}

/// Store whose script always returns the same reply.
#[derive(Debug)]
pub struct ScriptedStore(pub Vec<i64>);

#[async_trait]
impl DistributedStore for ScriptedStore {
    fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn set_with_expiry(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete(&self, _keys: &[String]) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn scan_keys_matching(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    async fn run_atomic_script(
        &self,
        _script: &AtomicScript,
        _keys: &[String],
        _args: &[String],
    ) -> Result<Vec<i64>, StoreError> {
        Ok(self.0.clone())
    }

    async fn get_and_delete(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Glob matcher for `*`, `?` and backslash escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn tokens(pattern: &str) -> Vec<Option<char>> {
        // None = '*', Some('\0') = '?', Some(c) = literal
        let mut out = Vec::new();
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => out.push(None),
                '?' => out.push(Some('\0')),
                '\\' => out.push(chars.next()),
                c => out.push(Some(c)),
            }
        }
        out
    }
    fn matches(p: &[Option<char>], t: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(None) => (0..=t.len()).any(|i| matches(&p[1..], &t[i..])),
            Some(Some('\0')) => !t.is_empty() && matches(&p[1..], &t[1..]),
            Some(Some(c)) => t.first() == Some(c) && matches(&p[1..], &t[1..]),
        }
    }
    let text: Vec<char> = text.chars().collect();
    matches(&tokens(pattern), &text)
}

/// Capture formatted log output for the current thread.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// Install a capturing subscriber for the current thread.
pub fn capture_logs() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(writer.clone()))
        .with_target(true)
        .with_ansi(false)
        .without_time()
        .finish();
    (writer, tracing::subscriber::set_default(subscriber))
}
