//! Top-level simulator runner.
//!
//! Drives one control-plane server and one simulator container per
//! selected simulator, enforces the suite deadline, and force-ends
//! whatever the simulator left open when it exits.

pub mod simulator_runner;

pub use simulator_runner::{RunnerConfig, SimulatorRunner};
