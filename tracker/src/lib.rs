pub mod completion;
pub mod memdisk;
pub mod scenario;
pub mod softdep;
pub mod syncer;

pub use completion::{completion_channel, CompletedWrite, CompletionQueue, CompletionResult, CompletionWorker, IoCompletion, IoStatus};
pub use memdisk::MemDisk;
pub use scenario::{run_scenario, Scenario, ScenarioReport};
pub use softdep::{
    BufferFlusher, DeferredWork, DepId, DepKind, DepState, FsBackend, LinkCounts, PointerSite, RemoveKind, RollbackToken,
    Softdep, SoftdepStats, WriteOutcome,
};
pub use syncer::Syncer;
