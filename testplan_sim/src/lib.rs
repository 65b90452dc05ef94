//! In-process test plan harness
//!
//! Runs every node of a test plan as a tokio task inside one process, so a
//! whole run can be driven from a unit test or from the `testplan-sim` CLI.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ LocalSyncService (barriers + topics)                 │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼────┐                       │
//! │  │  Node   │◄────────────►│  Node   │     ...               │
//! │  │   #0    │   SimSwarm   │   #1    │                       │
//! │  └─────────┘              └─────────┘                       │
//! │       ▲                        ▲                            │
//! │  ┌────┴────────────────────────┴────┐                       │
//! │  │  SimNetworkController (faults)   │                       │
//! │  │  SimRemoteHub (dataset remotes)  │                       │
//! │  └──────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All identities and link faults derive from a single 64-bit seed, and
//! nodes join in index order, so a seed always yields the same roles.
//!
//! # Usage
//!
//! ```ignore
//! use testplan_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::Push).await;
//! assert!(result.passed);
//! ```

mod dataset;
mod exporter;
mod keys;
mod network;
mod runner;
mod world;
pub mod scenarios;

pub use dataset::{SimDatasetEngine, SimRemoteHub, TransferKind, TransferRecord};
pub use exporter::SimExport;
pub use keys::DeterministicKeyProvider;
pub use network::{SimNetworkController, SimShaper, SimSwarm, SimTransport};
pub use runner::{NodeSummary, ScenarioResult, ScenarioRunner};
pub use world::{NodeHandle, SimWorld};
