//! `collabmesh`: a multi-agent collaboration substrate.
//!
//! Given a master prompt, [`orchestrator::PipelineOrchestrator`] splits the
//! work into typed subtasks ([`fragmenter`]), assigns each to one of several
//! heterogeneous agents by role/domain/cost ([`assigner`], backed by
//! [`roles_registry`]), executes them concurrently ([`dispatcher`], through
//! the external [`invoker::AgentInvoker`] capability), detects and resolves
//! content-level conflicts ([`composer`], backed by [`arbitration`]), and
//! persists every step into a queryable shared-memory graph ([`memory_graph`]).
//!
//! Every component is reachable independently; the orchestrator is a
//! convenience wiring of the full pipeline, not the only entry point.

pub mod arbitration;
pub mod assigner;
pub mod composer;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod fragmenter;
pub mod invoker;
pub mod memory_graph;
pub mod model;
pub mod orchestrator;
pub mod roles_registry;
