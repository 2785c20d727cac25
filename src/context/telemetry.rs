use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassTiming {
    pub pass: String,
    pub elapsed: Duration,
}

/// Per-compile timings and counters. Owned by the compilation context, so
/// independent compiles never share it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    timings: Vec<PassTiming>,
    counters: BTreeMap<String, u64>,
}

impl Telemetry {
    pub fn record_pass(&mut self, pass: &str, elapsed: Duration) {
        self.timings.push(PassTiming {
            pass: pass.to_string(),
            elapsed,
        });
    }

    pub fn count(&mut self, counter: &str) {
        self.add(counter, 1);
    }

    pub fn add(&mut self, counter: &str, amount: u64) {
        *self.counters.entry(counter.to_string()).or_default() += amount;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    pub fn timings(&self) -> &[PassTiming] {
        &self.timings
    }

    pub fn total_pass_time(&self) -> Duration {
        self.timings.iter().map(|x| x.elapsed).sum()
    }

    pub fn reset(&mut self) {
        self.timings.clear();
        self.counters.clear();
    }
}
