//! Integration testing framework for RingKV rings
//!
//! Runs real `ChordNode`s against a simulated network instead of TCP:
//!
//! - Request routing between nodes over channels, one task per request
//! - Node failure and recovery
//! - Manually driven stabilization rounds
//! - Ring and key placement invariant checks

pub mod scenarios;

pub use invariants::{InvariantViolation, NetworkInvariants};
pub use network_simulator::{NetworkSimulator, SimulatedNetworkClient, SimulatorMessage};
pub use scenarios::TestScenarios;
pub use test_harness::{TestHarness, TestResult};
