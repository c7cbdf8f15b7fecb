// Transcoding engine and stream cache for the medley media service.
//
// The crate covers the processing side only: job orchestration over
// pluggable storage backends, the staged version-commit protocol, segment
// transfer with checksumming, the crypto key lifecycle and the on-disk
// content cache. RPC broker wiring, HTTP delivery and database access live
// in the embedding service.

pub mod cache;
pub mod commit;
pub mod config;
pub mod job;
pub mod keystore;
pub mod processor;
pub mod rpc;
pub mod storage;
pub mod transfer;

pub use config::EngineConfig;
pub use job::JobRunner;
pub use rpc::{ErrorInfo, JobEvent, ResourceKey, TranscodeRequest};
