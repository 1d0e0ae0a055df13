//! kubefix library crate
//!
//! Proposes JSON Patch remediations for Kubernetes manifest violations,
//! certifies them through the verification gates and exposes the pieces so
//! benchmarks and external tooling can drive them without the CLI.

pub mod config;
pub mod controller;
pub mod detection;
pub mod guidance;
pub mod manifest;
pub mod merge;
pub mod model;
pub mod patch;
pub mod report;
pub mod rules;
pub mod secrets;
pub mod semantic;
pub mod util;
pub mod verify;
