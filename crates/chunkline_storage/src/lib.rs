pub mod repository;
pub mod scratch;
pub mod store;

pub use repository::{ChunklineStorage, StorageConfig};
pub use scratch::{file_digest, ChunkWriter};
pub use store::{timestamp, OpenedSession, SessionRecord, SessionStore};
