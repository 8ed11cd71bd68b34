//! Per-workflow, per-circle, per-backend migration progress.
//!
//! Each (workflow, circle, backend) slot has exactly one writer: the worker
//! that owns it. The observability endpoint reads concurrently and accepts
//! stale values.

use dashmap::DashMap;
use serde::Serialize;

/// The three data-movement workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    Rebalance,
    Recovery,
    Resync,
}

impl Workflow {
    pub fn as_str(self) -> &'static str {
        match self {
            Workflow::Rebalance => "rebalance",
            Workflow::Recovery => "recovery",
            Workflow::Resync => "resync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rebalance" => Some(Workflow::Rebalance),
            "recovery" => Some(Workflow::Recovery),
            "resync" => Some(Workflow::Resync),
            _ => None,
        }
    }
}

/// Progress record for one (workflow, circle, backend) slot.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MigrationInfo {
    pub circle_num: usize,
    pub database: String,
    pub measurement: String,
    /// Measurements examined on this backend across the pass.
    pub backend_measure_total: usize,
    pub need_migrate: usize,
    pub not_migrate: usize,
}

/// One status table per workflow, each indexed circle -> backend URL.
#[derive(Debug)]
pub struct MigrationTables {
    rebalance: Vec<DashMap<String, MigrationInfo>>,
    recovery: Vec<DashMap<String, MigrationInfo>>,
    resync: Vec<DashMap<String, MigrationInfo>>,
}

impl MigrationTables {
    pub fn new(circle_count: usize) -> Self {
        let build = || (0..circle_count).map(|_| DashMap::new()).collect();
        Self {
            rebalance: build(),
            recovery: build(),
            resync: build(),
        }
    }

    fn table(&self, workflow: Workflow) -> &[DashMap<String, MigrationInfo>] {
        match workflow {
            Workflow::Rebalance => &self.rebalance,
            Workflow::Recovery => &self.recovery,
            Workflow::Resync => &self.resync,
        }
    }

    /// Reset one circle's slots to zeros. Called once by the workflow
    /// dispatcher before any worker is spawned.
    pub fn clear(&self, workflow: Workflow, circle_num: usize) {
        if let Some(table) = self.table(workflow).get(circle_num) {
            table.clear();
        }
    }

    /// Apply an update to the slot owned by the calling worker.
    pub fn update<F>(&self, workflow: Workflow, circle_num: usize, url: &str, f: F)
    where
        F: FnOnce(&mut MigrationInfo),
    {
        if let Some(table) = self.table(workflow).get(circle_num) {
            let mut slot = table.entry(url.to_string()).or_default();
            f(&mut slot);
        }
    }

    /// Snapshot one slot. Test and observability hook.
    pub fn get(&self, workflow: Workflow, circle_num: usize, url: &str) -> Option<MigrationInfo> {
        self.table(workflow)
            .get(circle_num)?
            .get(url)
            .map(|slot| slot.clone())
    }

    /// Snapshot a whole workflow table for the status endpoint.
    pub fn snapshot(&self, workflow: Workflow) -> Vec<std::collections::BTreeMap<String, MigrationInfo>> {
        self.table(workflow)
            .iter()
            .map(|table| {
                table
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect()
            })
            .collect()
    }
}
