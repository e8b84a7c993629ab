//! Dependency-aware concurrent test execution.
//!
//! Tests and fixtures form a [`graph::dependency::DependencyGraph`] whose
//! edges say what must finish (and, for gating edges, pass) before what.
//! The [`runner::scheduler::Scheduler`] executes the graph on a fixed pool of
//! worker threads, handing each node exclusive use of the shared resources
//! it declares through a [`resource::pool::ResourcePool`].

pub mod cli;
pub mod emit;
pub mod graph;
pub mod logging;
pub mod manifest;
pub mod resource;
pub mod runner;
