//! Failure tracker (C13, §4.8): a per-pipeline consecutive-failure counter
//! that tells the worker when to pause a pipeline rather than keep retrying.

use std::collections::HashMap;
use std::sync::RwLock;

const DEFAULT_THRESHOLD: u32 = 3;

pub struct FailureTracker {
    threshold: u32,
    counts: RwLock<HashMap<String, u32>>,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            counts: RwLock::new(HashMap::new()),
        }
    }

    /// Records a failure for `pipeline_id`, returning whether the pipeline
    /// should now pause.
    pub fn record_failure(&self, pipeline_id: &str) -> bool {
        let mut counts = self.counts.write().unwrap();
        let count = counts.entry(pipeline_id.to_string()).or_insert(0);
        *count += 1;
        *count >= self.threshold
    }

    /// A successful completion resets the counter for `pipeline_id`.
    pub fn record_success(&self, pipeline_id: &str) {
        self.counts.write().unwrap().remove(pipeline_id);
    }

    pub fn should_pause(&self, pipeline_id: &str) -> bool {
        self.counts
            .read()
            .unwrap()
            .get(pipeline_id)
            .is_some_and(|count| *count >= self.threshold)
    }

    pub fn consecutive_failures(&self, pipeline_id: &str) -> u32 {
        *self.counts.read().unwrap().get(pipeline_id).unwrap_or(&0)
    }
}
