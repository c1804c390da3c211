pub mod layout;
pub mod protocol;

pub use layout::{ChunkLayout, LayoutError, DEFAULT_CHUNK_SIZE};
pub use protocol::{
    ChunkAck, ChunkStatus, CleanupResponse, FinalizeResponse, HandshakeRequest, HandshakeResponse,
    SessionId, SessionStatus, SessionStatusResponse, UnknownStatus,
};
