//! JSON exporter for scenario runs.
//!
//! Writes every run's per-node outcomes and transfer log to one file so
//! failures can be inspected after a CI run.

use crate::runner::ScenarioResult;
use serde::Serialize;
use std::fs::File;
use std::io::Write;

/// Complete export of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SimExport {
    /// Base seed of the invocation
    pub base_seed: u64,

    /// Nodes per run
    pub nodes: usize,

    /// Runs that passed
    pub passed: usize,

    /// Runs that failed
    pub failed: usize,

    /// All runs, in execution order
    pub results: Vec<ScenarioResult>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(base_seed: u64, nodes: usize) -> Self {
        Self {
            base_seed,
            nodes,
            passed: 0,
            failed: 0,
            results: Vec::new(),
        }
    }

    /// Adds a run.
    pub fn add_result(&mut self, result: ScenarioResult) {
        if result.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
