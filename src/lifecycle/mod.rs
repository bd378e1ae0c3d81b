// Re-export all public items from submodules
pub mod catalog;
pub mod errors;
pub mod orchestrator;
pub mod validate;

pub use self::errors::VmError;
pub use self::orchestrator::{
    CreateRequest, EditReport, Lifecycle, Performance, RuntimeState, StartReport, VmChanges,
    VmInfo, VmSummary,
};
