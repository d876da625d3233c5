//! # Airlift
//!
//! The core of a modular over-the-air update agent for constrained edge
//! devices. Airlift keeps a set of named, independently versioned driver
//! modules in sync with an authoritative remote catalog: it polls the
//! catalog manifest, downloads new module binaries, verifies their
//! integrity and authenticity, and hot-swaps them into the running
//! process without a restart, with durable staging, atomic commit
//! across power failures, and rollback when a new binary refuses to
//! come up.
//!
//! ## Features
//!
//! - **Manifest-authoritative verification** — the expected digest and
//!   signature for every artifact come from the catalog manifest read
//!   in the same cycle; side-files downloaded next to a binary are
//!   never trusted.
//! - **Atomic, journaled staging** — per-module `active` / `staging` /
//!   `backup` slots with a commit marker, so any power failure leaves a
//!   state the next boot deterministically classifies as pre-commit or
//!   post-commit.
//! - **Rollback on failed reload** — a new binary that fails to load
//!   after commit is rolled back to the previous active, which is kept
//!   through a post-commit grace window.
//! - **Tick-driven, single-threaded** — the host calls
//!   [`orchestrator::Orchestrator::tick`] from its main loop; nothing
//!   spawns threads or sleeps, and retry backoff is computed against
//!   the host's clock.
//! - **Evidence capture** — an append-only JSONL event log and
//!   per-update receipts with attempt counts and error classifications.
//!
//! ## Pipeline
//!
//! The per-update flow is **check → download → verify → commit →
//! reload → finalize**:
//!
//! 1. [`orchestrator::Orchestrator::tick`] polls the catalog on its
//!    check interval and diffs the manifest against tracked versions.
//! 2. Pending updates drain one at a time, highest priority first,
//!    gated on the host's safe window.
//! 3. Artifact bytes are staged durably, verified against the
//!    manifest's digest (and signature, when required), committed
//!    atomically, and hot-swapped through the module loader.
//! 4. A reload failure after commit rolls back to the backup slot and
//!    reloads the previous version.
//!
//! ## Modules
//!
//! - [`orchestrator`] — the tick-driven update state machine
//! - [`catalog`] — manifest and artifact fetches with classified errors
//! - [`manifest`] — manifest parsing (nested and legacy flat shapes)
//! - [`verify`] — size cap, SHA-256, and RSA signature discipline
//! - [`staging`] — durable slots with journaled atomic commit
//! - [`tracker`] — name → active version map
//! - [`state`] — persisted agent state (`state.json`)
//! - [`events`] — append-only JSONL event log
//! - [`config`] — `airlift.toml` loading and validation
//! - [`types`] — domain types: statuses, pending updates, receipts
//!
//! The module ABI and the executable-memory loader live in the
//! `airlift-abi` and `airlift-loader` crates; version parsing and
//! download backoff in `airlift-semver` and `airlift-retry`.

/// Manifest and artifact fetches against the remote catalog.
pub mod catalog;

/// Configuration file (`airlift.toml`) loading and validation.
pub mod config;

/// Append-only JSONL event log.
pub mod events;

/// Catalog manifest model and artifact path layout.
pub mod manifest;

/// The tick-driven update state machine.
pub mod orchestrator;

/// Durable per-module staging with atomic commit.
pub mod staging;

/// Persisted agent state.
pub mod state;

/// In-memory version tracking per module.
pub mod tracker;

/// Domain types: statuses, priorities, pending updates, receipts.
pub mod types;

/// Artifact verification: size cap, digest, signature.
pub mod verify;

/// Backoff policies for artifact downloads.
/// Re-exported from the airlift-retry microcrate.
pub use airlift_retry as retry;

/// Semantic version triples.
/// Re-exported from the airlift-semver microcrate.
pub use airlift_semver as semver;
