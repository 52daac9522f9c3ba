#![doc = "knowledge-sync-core: reconciliation engine for knowledge-sync."]

//! This crate holds everything that does not talk HTTP: scanning the sync root,
//! naming collections, the persisted sync state, retry handling and the reconciler
//! that turns local and remote inventories into uploads and deletions.
//!
//! The knowledge service is reached only through [`contract::KnowledgeClient`], so the
//! whole pipeline can be driven by a mock or an in-memory fake in tests.
//!
//! # Usage
//! Build a [`config::SynchroniseConfig`], pick a client and call
//! [`synchronise::synchronise`].

pub mod config;
pub mod contract;
pub mod naming;
pub mod retry;
pub mod scan;
pub mod state;
pub mod synchronise;
