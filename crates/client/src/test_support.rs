//! In-process remote and probe for the facade tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Notify};

use clinicsync_core::errors::{RemoteError, Result};
use clinicsync_core::health::{HealthProbe, ProbeOutcome};
use clinicsync_core::resources::{extract_id, QueryParams, RemoteResourceApi};
use clinicsync_core::search::SearchRequest;

type CreatedSender = mpsc::UnboundedSender<(String, Value)>;

#[derive(Default)]
pub(crate) struct TestRemote {
    records: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
    failing: AtomicBool,
    next_id: AtomicU64,
    last_list: Mutex<Option<QueryParams>>,
    gate: Mutex<Option<(Arc<Notify>, CreatedSender)>>,
    pub calls: AtomicUsize,
}

impl TestRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, resource_type: &str, record: Value) {
        if let Value::Object(map) = record {
            self.records
                .lock()
                .unwrap()
                .entry(resource_type.to_string())
                .or_default()
                .push(map);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn last_list_params(&self) -> Option<QueryParams> {
        self.last_list.lock().unwrap().clone()
    }

    /// Creates report `(temp_id, record)` and block until the gate is notified.
    pub fn hold_creates(&self) -> (Arc<Notify>, mpsc::UnboundedReceiver<(String, Value)>) {
        let notify = Arc::new(Notify::new());
        let (tx, rx) = mpsc::unbounded_channel();
        *self.gate.lock().unwrap() = Some((notify.clone(), tx));
        (notify, rx)
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::network("connection refused").into());
        }
        Ok(())
    }

    fn rows(&self, resource_type: &str) -> Vec<Map<String, Value>> {
        self.records
            .lock()
            .unwrap()
            .get(resource_type)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteResourceApi for TestRemote {
    async fn list(&self, resource_type: &str, params: &QueryParams) -> Result<Vec<Value>> {
        self.check()?;
        *self.last_list.lock().unwrap() = Some(params.clone());
        Ok(self
            .rows(resource_type)
            .into_iter()
            .filter(|row| {
                params
                    .filters
                    .iter()
                    .all(|(field, value)| row.get(field) == Some(value))
            })
            .map(Value::Object)
            .collect())
    }

    async fn get(&self, resource_type: &str, id: &str) -> Result<Option<Value>> {
        self.check()?;
        Ok(self
            .rows(resource_type)
            .into_iter()
            .find(|row| extract_id(row).as_deref() == Some(id))
            .map(Value::Object))
    }

    async fn create(
        &self,
        resource_type: &str,
        data: &Map<String, Value>,
        temp_id: &str,
    ) -> Result<Value> {
        self.check()?;
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut record = data.clone();
        record.insert("id".to_string(), Value::String(id));
        self.seed(resource_type, Value::Object(record.clone()));

        let gate = self.gate.lock().unwrap().clone();
        if let Some((notify, tx)) = gate {
            let _ = tx.send((temp_id.to_string(), Value::Object(record.clone())));
            notify.notified().await;
        }
        Ok(Value::Object(record))
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<Value> {
        self.check()?;
        let mut records = self.records.lock().unwrap();
        let rows = records.entry(resource_type.to_string()).or_default();
        match rows
            .iter_mut()
            .find(|row| extract_id(row).as_deref() == Some(id))
        {
            Some(row) => {
                for (field, value) in data {
                    row.insert(field.clone(), value.clone());
                }
                Ok(Value::Object(row.clone()))
            }
            None => Err(RemoteError::status(404, format!("{} not found", id)).into()),
        }
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<bool> {
        self.check()?;
        let mut records = self.records.lock().unwrap();
        let rows = records.entry(resource_type.to_string()).or_default();
        let before = rows.len();
        rows.retain(|row| extract_id(row).as_deref() != Some(id));
        Ok(rows.len() != before)
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Value>> {
        self.check()?;
        let term = request.term.to_lowercase();
        Ok(self
            .rows(&request.resource_type)
            .into_iter()
            .filter(|row| {
                row.get(&request.field)
                    .and_then(Value::as_str)
                    .is_some_and(|value| value.to_lowercase().contains(&term))
            })
            .map(Value::Object)
            .collect())
    }
}

pub(crate) struct ScriptedProbe {
    outcome: Mutex<ProbeOutcome>,
}

impl ScriptedProbe {
    pub fn new(outcome: ProbeOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
        }
    }

    pub fn set(&self, outcome: ProbeOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> ProbeOutcome {
        self.outcome.lock().unwrap().clone()
    }
}
