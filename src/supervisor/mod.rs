// Lifecycle supervision of the node's single proxy worker process.
//
// process.rs  : ProcessSupervisor (start, stop, restart, config swap)
// watcher.rs  : per-instance task that owns the child, signals and reaps it
// state.rs    : lock-guarded shared state
// outcome.rs  : classification of how the worker ended
// error.rs    : supervisor error taxonomy

pub mod error;
pub mod outcome;
pub mod process;
pub mod state;
pub mod watcher;

pub use error::SupervisorError;
pub use outcome::TerminationOutcome;
pub use process::ProcessSupervisor;
