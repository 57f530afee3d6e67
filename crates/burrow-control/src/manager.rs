//! Process-wide index of active control sessions by run id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::control::Control;

/// Run-id -> control index. At most one control is reachable per run id;
/// inserting over an existing entry evicts the old session first.
#[derive(Default)]
pub struct ControlManager {
    ctls_by_run_id: RwLock<HashMap<String, Arc<Control>>>,
}

impl ControlManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ctl` under `run_id`. An existing session under the same id
    /// has `replaced` invoked before being displaced, so a reconnecting
    /// client supplants its prior session atomically.
    pub fn add(&self, run_id: &str, ctl: Arc<Control>) -> Option<Arc<Control>> {
        let mut ctls = self.ctls_by_run_id.write().unwrap();
        if let Some(old) = ctls.get(run_id) {
            old.replaced(&ctl);
        }
        ctls.insert(run_id.to_string(), ctl)
    }

    /// Remove the entry for `run_id` only if it still points at `ctl`: a
    /// late teardown of an evicted session must not remove its successor.
    pub fn del(&self, run_id: &str, ctl: &Arc<Control>) {
        let mut ctls = self.ctls_by_run_id.write().unwrap();
        if let Some(current) = ctls.get(run_id) {
            if Arc::ptr_eq(current, ctl) {
                ctls.remove(run_id);
                debug!(run_id = %run_id, "control deregistered");
            }
        }
    }

    pub fn get_by_id(&self, run_id: &str) -> Option<Arc<Control>> {
        self.ctls_by_run_id.read().unwrap().get(run_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.ctls_by_run_id.read().unwrap().len()
    }
}
