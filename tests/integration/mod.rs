//! Integration test suite for braid.
//!
//! These tests drive the scheduler, the concurrency controller and the
//! checkpoint manager together against real temporary git repositories.
//! Workers are scripted in-process, so nothing here needs a network or an
//! external agent.
//!
//! # Test Categories
//!
//! - `scheduling`: dependency order, retries, failure propagation, priority
//! - `conflict_resolution`: overlapping edits, merge ordering, double merges
//! - `validation`: completion evidence required per task category
//! - `recovery`: checkpoints, rewind and branching
//! - `graph_properties`: property tests for the task graph

mod fixtures;

mod conflict_resolution;
mod graph_properties;
mod recovery;
mod scheduling;
mod validation;
