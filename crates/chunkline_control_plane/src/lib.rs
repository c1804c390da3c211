pub mod app;
pub mod coordinator;
pub mod sweeper;
pub mod validation;

pub use app::{build_router, AppState, SseUpdate};
pub use coordinator::{CoordinatorError, UploadCoordinator};
pub use sweeper::{spawn_orphan_sweeper, SweeperConfig};
pub use validation::{AssemblyValidator, SizeValidator, ValidationError};
