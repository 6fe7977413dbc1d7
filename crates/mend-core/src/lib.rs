//! Core types, versioned graph storage, and configuration for mend.
//!
//! This crate provides the foundational data structures used across all mend crates:
//! - [`types`]: Interface nodes, edges, validation records and error types
//! - [`graph`]: Immutable per-version [`GraphState`](graph::GraphState) with bounded traversal
//! - [`store`]: The [`InterfaceStore`](store::InterfaceStore) and [`RepairLedger`](store::RepairLedger) traits
//! - [`sqlite`]: SQLite-backed MVCC implementation of both traits
//! - [`vector`]: Approximate nearest-neighbor index over node embeddings
//! - [`config`]: Configuration loading from `.mend/mend.json`
//! - [`hash`]: Deterministic UIDs and content hashes (base62 of xxhash64)

pub mod config;
pub mod graph;
pub mod hash;
pub mod ledger;
pub mod sqlite;
pub mod sqlite_queries;
pub mod store;
pub mod types;
pub mod vector;
