//! # skillforge
//!
//! A declarative skillset engine that turns heterogeneous document sources
//! into vector-store records.
//!
//! A configuration file declares skill definitions, composes them into
//! skillsets, and names the skillsets an indexer runs. Each skillset is a
//! chain of pluggable stages ("skills"): a source seeds it, transforms
//! read, split and embed, and a sink persists the result. An optional
//! tracker remembers what each document looked like last time so unchanged
//! documents are skipped on the next run.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────┐   ┌────────────┐   ┌──────────────┐
//! │  config +  │──▶│ registry  │──▶│  assemble  │──▶│    engine    │
//! │   schema   │   │ (factories│   │ (contracts │   │ (channels,   │
//! └────────────┘   │  by name) │   │  checked)  │   │ retry, gate) │
//!                  └───────────┘   └────────────┘   └──────┬───────┘
//!                                                          │
//!                                         ┌────────────────┤
//!                                         ▼                ▼
//!                                   ┌──────────┐     ┌──────────┐
//!                                   │ tracker  │     │  sinks   │
//!                                   └──────────┘     └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Configuration loading and typed parameter blocks |
//! | [`schema`] | Structural validation collecting every violation |
//! | [`models`] | Documents, chunks, index records, tracker entries |
//! | [`registry`] | `(category, name)` to skill factory lookup |
//! | [`assemble`] | Skillset to contract-checked pipeline |
//! | [`engine`] | Concurrent pipeline execution and run reports |
//! | [`skills`] | Skill traits and the built-in skills |
//! | [`tracker`] | Cross-run document state |
//! | [`indexer`] | Runs an indexer's skillsets and reconciles the tracker |
//! | [`progress`] | Progress events on stderr |
//! | [`db`] | SQLite pool helpers |
//! | [`error`] | Error taxonomy and exit codes |

pub mod assemble;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod models;
pub mod progress;
pub mod registry;
pub mod schema;
pub mod skills;
pub mod tracker;
