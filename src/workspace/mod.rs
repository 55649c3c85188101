//! Per-device workspace handling: snapshots, drafts, checkpoints and the
//! local state that ties a device to its workspace ref.

pub mod chain;
pub mod ignore;
pub mod lifecycle;
pub mod secrets;
pub mod stack;
pub mod state;
pub mod trace;

pub use chain::{checkpoint_chain, latest_for_change, list_checkpoints, CheckpointEntry};
pub use ignore::SyncIgnore;
pub use lifecycle::{CheckpointResult, SyncResult};
pub use stack::StackResult;
pub use state::{Alignment, WorkspaceConfig, WorkspaceState};
pub use trace::TraceKind;
