//! Statelink Deterministic Simulation Testing (DST) Harness
//!
//! This crate runs the authoritative backend and any number of optimistic
//! clients inside one controlled process, so replication bugs reproduce
//! from a single seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only on explicit steps and client sleeps
//! - **Network**: Per-player channels that drop requests, lose acks or partition
//! - **Randomness**: Session keys, match outcomes and submission order derive from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock + Seeded RNG)              │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                                                             │
//! │  ┌─────────┐  SimTransport   ┌──────────────────────────┐   │
//! │  │ Client  │────────────────►│         Backend          │   │
//! │  │   #1    │  (drop / lose   │  gate · router · resolver│   │
//! │  └─────────┘   ack / split)  └────────────▲─────────────┘   │
//! │  ┌─────────┐                              │                 │
//! │  │ Client  │──────────────────────────────┤                 │
//! │  │   #2    │                              │ trusted frames  │
//! │  └─────────┘                 ┌────────────┴─────────────┐   │
//! │       ▲ replica              │       MatchOracle        │   │
//! │       └──────────────────────│ (seeded match, replicas) │   │
//! │                              └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use statelink_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::MatchSettlement);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod keys;
mod network;
mod oracle;
mod runner;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{RecordSummary, SimExport, TimelineEntry};
pub use keys::DeterministicKeyProvider;
pub use network::{NetworkStats, SimNetworkController, SimTransport};
pub use oracle::{MatchOracle, TrustedSnapshots};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimClient, SimConfig, SimError, SimWorld};
