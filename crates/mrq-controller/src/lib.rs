//! Review queue controller: per-reviewer sessions over the record backend.

pub mod batch;
pub mod config;
pub mod debounce;
pub mod error;
pub mod events;
pub mod generation;
pub mod navigation;
pub mod poll;
pub mod selection;
pub mod session;

pub use batch::{resolve_target, BatchOrchestrator};
pub use config::ControllerConfig;
pub use error::{ControllerError, ResolutionError};
pub use events::{EventBus, ReviewEvent};
pub use generation::{Applied, Generation, Generations, RequestKind};
pub use selection::{SelectionManager, SelectionScope, SelectionSet};
pub use session::{
    LoadingFlags, Presentation, QueryChange, RefreshOutcome, RefreshTrigger, ReviewSession,
    SessionId, SessionView,
};

pub const CRATE_NAME: &str = "mrq-controller";
