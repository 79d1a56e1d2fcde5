//! Orchestration services over the session source and profile store.
//!
//! ARCHITECTURE
//! ============
//! `provision` owns the idempotent get-or-create protocol for profiles.
//! `sync` owns the read model and arbitrates between the session fetch and
//! the session-change subscription.

pub mod provision;
pub mod sync;
