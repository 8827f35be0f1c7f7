//! Scripted in-memory backends for tests.
//!
//! Outcomes are queued per key (node ID for inference, tool ID for tools).
//! An empty queue answers with an echo of the payload. Every call records
//! its key and updates a concurrency high-water mark.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use switchyard_types::error::CallError;
use switchyard_types::node::ModelNode;

use super::inference::InferenceBackend;
use super::tool::ToolBackend;

#[derive(Default)]
struct ScriptInner {
    outcomes: Mutex<HashMap<String, VecDeque<Result<Value, CallError>>>>,
    delays: Mutex<HashMap<String, u64>>,
    default_delay_ms: AtomicUsize,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct Script {
    inner: Arc<ScriptInner>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next call with this key.
    pub fn push(&self, key: &str, outcome: Result<Value, CallError>) -> &Self {
        self.inner
            .outcomes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    /// Queue the same failure `n` times.
    pub fn fail_times(&self, key: &str, n: usize, error: CallError) -> &Self {
        for _ in 0..n {
            self.push(key, Err(error.clone()));
        }
        self
    }

    pub fn delay(&self, key: &str, ms: u64) -> &Self {
        self.inner.delays.lock().unwrap().insert(key.to_string(), ms);
        self
    }

    pub fn default_delay(&self, ms: u64) -> &Self {
        self.inner.default_delay_ms.store(ms as usize, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, key: &str) -> usize {
        self.calls().iter().filter(|k| k.as_str() == key).count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    async fn answer(&self, key: &str, payload: &Value, cancel: Option<CancellationToken>) -> Result<Value, CallError> {
        self.inner.calls.lock().unwrap().push(key.to_string());
        let now = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);

        let delay_ms = self
            .inner
            .delays
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(self.inner.default_delay_ms.load(Ordering::SeqCst) as u64);
        let outcome = self
            .inner
            .outcomes
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|q| q.pop_front());

        let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
        let cancelled = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = sleep => false,
                    _ = token.cancelled() => true,
                }
            }
            None => {
                sleep.await;
                false
            }
        };

        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            return Err(CallError::Unavailable("cancelled".to_string()));
        }
        outcome.unwrap_or_else(|| Ok(json!({ "key": key, "payload": payload })))
    }
}

impl InferenceBackend for Script {
    async fn invoke(
        &self,
        node: &ModelNode,
        payload: &Value,
        cancel: CancellationToken,
    ) -> Result<Value, CallError> {
        self.answer(&node.node_id, payload, Some(cancel)).await
    }
}

impl ToolBackend for Script {
    async fn call_tool(&self, tool_id: &str, args: &Value) -> Result<Value, CallError> {
        self.answer(tool_id, args, None).await
    }
}
