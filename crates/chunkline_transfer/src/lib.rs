mod progress;
mod retry;
mod scheduler;
mod source;
mod transport;

pub use progress::{ChunkState, TransferSnapshot, TransferState};
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerConfig, SchedulerError, TransferReport, TransferScheduler};
pub use source::read_chunk;
pub use transport::{TransportError, UploadTransport};

pub const DEFAULT_CONCURRENCY: usize = 3;
