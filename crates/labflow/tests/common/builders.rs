//! Programmable stage handlers and registry builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use labflow::pipeline::{StageError, StageHandler, StageRegistry};

/// Returns scripted results in order, then succeeds with
/// `{"stage": <name>}` once the script runs out.
pub struct ScriptedHandler {
    name: String,
    script: Mutex<VecDeque<Result<Value, StageError>>>,
    calls: AtomicU32,
    inputs: Mutex<Vec<Value>>,
    delay: Option<Duration>,
}

impl ScriptedHandler {
    pub fn ok(name: &str) -> Arc<Self> {
        Self::scripted(name, vec![])
    }

    pub fn scripted(name: &str, script: Vec<Result<Value, StageError>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            inputs: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    /// Succeeds after sleeping for `delay` on every call.
    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            inputs: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap().clone()
    }
}

impl StageHandler for ScriptedHandler {
    fn invoke(&self, _job_id: &str, input: &Value) -> Result<Value, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.clone());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({ "stage": self.name })))
    }
}

/// Scripted handlers of a standard pipeline, by stage name.
pub struct StageHandlers(HashMap<String, Arc<ScriptedHandler>>);

impl StageHandlers {
    pub fn get(&self, stage: &str) -> &ScriptedHandler {
        &self.0[stage]
    }

    pub fn total_calls(&self) -> u32 {
        self.0.values().map(|h| h.calls()).sum()
    }
}

/// The standard eight-stage pipeline with a scripted handler per stage.
pub fn standard_pipeline() -> (StageRegistry, StageHandlers) {
    standard_pipeline_with(HashMap::new())
}

/// Stages named in `scripts` get those results; the rest succeed.
pub fn standard_pipeline_with(
    mut scripts: HashMap<&str, Vec<Result<Value, StageError>>>,
) -> (StageRegistry, StageHandlers) {
    let mut handlers = HashMap::new();
    let registry = StageRegistry::standard(|name| {
        let handler = match scripts.remove(name) {
            Some(script) => ScriptedHandler::scripted(name, script),
            None => ScriptedHandler::ok(name),
        };
        handlers.insert(name.to_string(), handler.clone());
        handler as Arc<dyn StageHandler>
    })
    .expect("standard registry");

    (registry, StageHandlers(handlers))
}
