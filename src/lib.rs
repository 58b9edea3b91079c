//! # driftwatch
//!
//! Fleet inventory and configuration-drift engine.
//!
//! driftwatch scans application shares on a fleet of Windows hosts, reads
//! the identity of every deployed binary, links each application to the web
//! site or OS service hosting it and to the databases and endpoints it talks
//! to, and records the result as pretty-printed JSON in a git working copy.
//! Every change becomes one commit, so the repository history is the
//! deployment history of the fleet.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌──────────┐
//! │ Host probe │──▶│ Discovery  │──▶│  Snapshot  │──▶│   Git    │
//! │ sites/svcs │   │ + Analyzer │   │  records   │   │  remote  │
//! └────────────┘   └─────▲──────┘   └────────────┘   └──────────┘
//!                        │
//!          ┌─────────────┴─────────────┐
//!          │                           │
//!    ┌───────────┐               ┌───────────┐
//!    │ Scheduler │               │  Watcher  │
//!    │ (cycles)  │               │ (changes) │
//!    └───────────┘               └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! driftwatch init                 # clone or create the data directory
//! driftwatch paths                # check configured search paths
//! driftwatch discover all         # one pass, then commit
//! driftwatch run                  # duty cycle until Ctrl-C
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`models`] | Core data types |
//! | [`identity`] | PE / CLR binary identity reader |
//! | [`connections`] | Connection-string and endpoint parsing |
//! | [`site_config`] | IIS site configuration parsing |
//! | [`analyzer`] | Main-binary selection and linkage |
//! | [`catalog`] | Data directory layout and typed reads |
//! | [`probe`] | Remote host queries |
//! | [`discovery`] | Per-host discovery passes |
//! | [`store`] | Git-backed snapshot store |
//! | [`schedule`] | Awake/asleep duty cycle |
//! | [`watcher`] | Share watchers and change triggers |
//! | [`scheduler`] | Long-running work loop |

pub mod analyzer;
pub mod catalog;
pub mod config;
pub mod connections;
pub mod discovery;
pub mod identity;
pub mod logging;
pub mod models;
pub mod probe;
pub mod schedule;
pub mod scheduler;
pub mod site_config;
pub mod store;
pub mod watcher;
mod xml;

#[cfg(test)]
mod test_utils;
