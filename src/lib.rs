// src/lib.rs

pub mod collabmesh;

pub use collabmesh::composer::CollaborativeComposer;
pub use collabmesh::dispatcher::SubtaskDispatcher;
pub use collabmesh::fragmenter::TaskFragmenter;
pub use collabmesh::memory_graph::MemoryGraph;
pub use collabmesh::model::{CompositionResult, SubtaskResult, TaskFragment};
pub use collabmesh::orchestrator::{OrchestratorError, PipelineEnvelope, PipelineOrchestrator};
pub use collabmesh::roles_registry::RolesRegistry;
