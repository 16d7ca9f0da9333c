//! dialtone-services — scene compilation, pacing, transfers and sessions.
//! Everything above the wire format and below the daemon lives here.

pub mod chunk_types;
pub mod chunker;
pub mod compiler;
pub mod connection;
pub mod directory;
pub mod pacer;
pub mod parser;
pub mod scene;
pub mod script;
pub mod session;
pub mod storage;
pub mod xfer;

pub use chunk_types::OutgoingChunk;
pub use compiler::Compiler;
pub use connection::{normalize_screen_name, Connection, ConnectionInfo, ConnectionRegistry};
pub use directory::{Directory, ScreenNameRecord, StaticDirectory};
pub use pacer::{FramePacer, PacerLimits};
pub use scene::{SceneContext, SceneInfo, SceneRegistry};
pub use script::{CompileError, Script, ScriptBuilder};
pub use session::{run_session, ServerContext};
pub use storage::{FileMeta, FileStorage, LocalFileStorage, MemoryStorage, StorageError};
pub use xfer::{
    Direction, FailureReason, TransferEngine, TransferLimits, TransferReport, TransferState,
    TransferStatus, XferError,
};
