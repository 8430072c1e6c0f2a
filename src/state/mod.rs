//! Durable state for task trees and checkpoints.

mod store;

pub use store::StateStore;
