//! Scripted collaborators for dispatcher tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use loader_common::{Action, LoaderConfig, Record, RecordCodec, Result};
use stream_loader::dispatch::DispatchConfig;
use stream_loader::engine::{Engine, EngineError, EngineResult};
use stream_loader::governor::{Governor, GovernorDecision};
use stream_loader::source::{AckToken, MessageId, RawMessage, Received, Source};

/// Dispatch configuration with timings suited to tests.
pub fn test_config(queue_depth: usize, workers: usize) -> DispatchConfig {
    let mut config = DispatchConfig::from_loader(&LoaderConfig::default(), Action::Add);
    config.queue_depth = queue_depth;
    config.workers = workers;
    config.retry_backoff = Duration::from_millis(1);
    config.randomize_backoff = false;
    config.shutdown_grace = Duration::from_secs(5);
    config.heartbeat_interval = Duration::from_secs(3600);
    config.monitoring_period = Duration::from_secs(3600);
    config
}

pub fn test_codec() -> RecordCodec {
    RecordCodec::new("senzingStreamLoader", Some("TEST".to_string()), None)
}

/// Source that hands out scripted bodies, then reports Closed (or Idle
/// when kept open). Records every ack and nack it sees.
pub struct ScriptedSource {
    bodies: Mutex<VecDeque<String>>,
    keep_open: bool,
    receives: AtomicU64,
    acked: Mutex<Vec<MessageId>>,
    nacked: Mutex<Vec<MessageId>>,
}

impl ScriptedSource {
    pub fn new(bodies: &[&str]) -> Self {
        ScriptedSource {
            bodies: Mutex::new(bodies.iter().map(|b| b.to_string()).collect()),
            keep_open: false,
            receives: AtomicU64::new(0),
            acked: Mutex::new(Vec::new()),
            nacked: Mutex::new(Vec::new()),
        }
    }

    /// Report Idle instead of Closed once the bodies run out.
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    /// Number of receive() calls so far, idle polls included.
    pub fn receives(&self) -> u64 {
        self.receives.load(Ordering::Relaxed)
    }

    pub fn acked(&self) -> Vec<MessageId> {
        self.acked.lock().unwrap().clone()
    }

    pub fn nacked(&self) -> Vec<MessageId> {
        self.nacked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn receive(&self) -> Result<Received> {
        self.receives.fetch_add(1, Ordering::Relaxed);
        let body = self.bodies.lock().unwrap().pop_front();
        match body {
            Some(body) => Ok(Received::Message(RawMessage {
                id: Uuid::new_v4(),
                body,
                token: AckToken::None,
            })),
            None if self.keep_open => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Received::Idle)
            }
            None => Ok(Received::Closed),
        }
    }

    async fn ack(&self, message: &RawMessage) -> Result<()> {
        self.acked.lock().unwrap().push(message.id);
        Ok(())
    }

    async fn nack(&self, message: &RawMessage) -> Result<()> {
        self.nacked.lock().unwrap().push(message.id);
        Ok(())
    }
}

/// One step of a per-record engine script.
pub enum EngineScript {
    Ok,
    OkInfo(Value),
    Rejected(&'static str),
    Transient(&'static str),
    Fatal(&'static str),
    /// Hold the call until the test releases a permit.
    Block,
}

/// Engine whose responses are scripted per RECORD_ID. Unscripted calls
/// succeed, producing an empty info payload for with-info actions.
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<String, VecDeque<EngineScript>>>,
    calls: Mutex<Vec<(Action, Value)>>,
    gate: Arc<Semaphore>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        ScriptedEngine {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn script(&self, record_id: &str, steps: Vec<EngineScript>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(record_id.to_string(), steps.into());
    }

    /// Let `permits` blocked calls proceed.
    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn calls(&self) -> Vec<(Action, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, record_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, record)| record["RECORD_ID"] == record_id)
            .count()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn call(&self, action: Action, record: &Record) -> EngineResult {
        self.calls.lock().unwrap().push((action, record.as_json()));
        let step = {
            self.scripts
                .lock()
                .unwrap()
                .get_mut(record.record_id())
                .and_then(|queue| queue.pop_front())
        };
        match step {
            None | Some(EngineScript::Ok) => {
                if action.with_info() {
                    Ok(Some(json!({})))
                } else {
                    Ok(None)
                }
            }
            Some(EngineScript::OkInfo(info)) => Ok(Some(info)),
            Some(EngineScript::Rejected(detail)) => Err(EngineError::Rejected(detail.to_string())),
            Some(EngineScript::Transient(detail)) => {
                Err(EngineError::Transient(detail.to_string()))
            }
            Some(EngineScript::Fatal(detail)) => Err(EngineError::Fatal(detail.to_string())),
            Some(EngineScript::Block) => {
                let permit = self.gate.acquire().await.expect("gate closed");
                permit.forget();
                Ok(None)
            }
        }
    }
}

/// Governor that replays scripted decisions, then lets everything through.
pub struct ScriptedGovernor {
    decisions: Mutex<VecDeque<GovernorDecision>>,
}

impl ScriptedGovernor {
    pub fn new(decisions: Vec<GovernorDecision>) -> Self {
        ScriptedGovernor {
            decisions: Mutex::new(decisions.into()),
        }
    }
}

#[async_trait]
impl Governor for ScriptedGovernor {
    async fn before_call(&self, _record: &Record) -> GovernorDecision {
        self.decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(GovernorDecision::Proceed)
    }
}
