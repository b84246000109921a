//! JSON exporter for scenario reports.
//!
//! Writes the timeline of a run plus the final authoritative records, so a
//! failing seed can be inspected without re-running it.

use crate::runner::ScenarioMetrics;
use serde::Serialize;
use statelink_core::record::Currency;
use statelink_core::PlayerRecord;
use std::fs::File;
use std::io::Write;
use uuid::Uuid;

/// Something that happened during a run.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    /// Virtual time in milliseconds
    pub time_ms: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Final state of one participant.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub player: String,
    pub coins: u64,
    pub gems: u64,
    pub trophies: u32,
    pub xp: u64,
    pub milestones: usize,
    /// Sum of granted but uncollected rewards
    pub pending_rewards: u64,
    pub removals: usize,
    /// Whether the client's cache ended equal to this record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_converged: Option<bool>,
}

impl RecordSummary {
    pub fn new(record: &PlayerRecord, cache_converged: Option<bool>) -> Self {
        Self {
            player: record.id.to_string(),
            coins: record.balance(Currency::Coins),
            gems: record.balance(Currency::Gems),
            trophies: record.profile.trophies,
            xp: record.profile.xp,
            milestones: record.tutorial.completed.len(),
            pending_rewards: record.rewards.iter().map(|r| r.amount).sum(),
            removals: record.history.removals.len(),
            cache_converged,
        }
    }
}

/// Complete scenario export.
#[derive(Debug, Clone, Serialize)]
pub struct SimExport {
    /// Stable per (scenario, seed)
    pub run_id: Uuid,

    pub scenario: String,

    pub seed: u64,

    /// Virtual duration in milliseconds
    pub duration_ms: u64,

    pub timeline: Vec<TimelineEntry>,

    pub records: Vec<RecordSummary>,

    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        let salt = scenario
            .bytes()
            .fold(0xcbf29ce484222325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x100000001b3));
        Self {
            run_id: Uuid::from_u64_pair(seed, salt),
            scenario: scenario.to_string(),
            seed,
            duration_ms: 0,
            timeline: Vec::new(),
            records: Vec::new(),
            passed: false,
            failure_reason: None,
            metrics: ScenarioMetrics::default(),
        }
    }

    /// Adds a timeline entry.
    pub fn note(&mut self, time_ms: u64, message: impl Into<String>, level: Option<&str>) {
        self.duration_ms = self.duration_ms.max(time_ms);
        self.timeline.push(TimelineEntry {
            time_ms,
            message: message.into(),
            level: level.map(str::to_string),
        });
    }

    pub fn add_record(&mut self, summary: RecordSummary) {
        self.records.push(summary);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>, metrics: ScenarioMetrics) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.metrics = metrics;
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = self.to_json()?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
