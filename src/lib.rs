//! # ATT&CK Ingest
//!
//! A concurrent ingestion pipeline for malware-function manifests with
//! MITRE ATT&CK technique mappings.
//!
//! Manifests live in a `<root>/<hash>/<alias>/manifest.json` directory
//! layout. The pipeline discovers them, validates and normalizes each one
//! (including MITRE ATT&CK technique IDs), and writes the result to SQLite
//! in transactional batches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────────┐   ┌──────────┐
//! │ Scanner  │──▶│  Parser  │──▶│ BatchImporter │──▶│  SQLite   │
//! │ discover │   │ validate │   │ transactional │   │ functions │
//! │ (pooled) │   │ normalize│   │ retry+backoff │   │ mappings  │
//! └──────────┘   └──────────┘   └───────────────┘   └──────────┘
//!        └─────────── ImportManager orchestrates ──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! attck init                         # create database
//! attck techniques load matrix.json  # load ATT&CK reference tables
//! attck import ./samples             # scan, parse, import
//! attck stats                        # see what landed
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`scanner`] | Concurrent manifest discovery |
//! | [`parser`] | Manifest validation and normalization |
//! | [`importer`] | Transactional batch import |
//! | [`manager`] | Pipeline orchestration |
//! | [`store`] | Storage abstraction (SQLite, in-memory) |
//! | [`refdata`] | ATT&CK reference-table loading |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod importer;
pub mod ingest;
pub mod manager;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod progress;
pub mod refdata;
pub mod scanner;
pub mod stats;
pub mod store;
