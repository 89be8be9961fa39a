//! Multi-agent coordination state for AgentMesh.
//!
//! Everything the gateway's `session.*`, `task.*`, `workflow.*`,
//! `workspace.*`, `document.*`, and `state.*` methods operate on: the
//! session lifecycle state machine, the task board, ordered workflows,
//! shared workspaces with versioned documents, and per-agent G-counters.
//! All state is tenant-partitioned.

pub mod session;
pub mod state;
pub mod tasks;
pub mod workflow;
pub mod workspace;

pub use session::{Session, SessionManager, SessionMessage, SessionMetrics, SessionState};
pub use state::{CrdtState, StateChange};
pub use tasks::{Task, TaskBoard, TaskStatus};
pub use workflow::{Workflow, WorkflowCoordinator, WorkflowStatus, WorkflowStep};
pub use workspace::{Document, Workspace, WorkspaceManager};
