pub mod chunk;
pub mod engine;
pub mod multipart;
pub mod path;
pub mod progress;

pub use chunk::{ChunkPlan, MAX_PART_NUMBER};
pub use engine::{TransferEngine, TransferJob, TransferReport};
pub use multipart::{MultipartBackend, MultipartSession, PartRecord, SessionState};
pub use progress::{TransferProgress, TransferStats};
