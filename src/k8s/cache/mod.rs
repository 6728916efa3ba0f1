pub mod chain;
pub mod config;
pub mod errors;
pub mod mirror;
pub mod pod_cache;
pub mod queue;
pub mod source;

pub use chain::{ChainHandler, Handler, SyncGate};
pub use config::ControllerOptions;
pub use mirror::{key_func, EventSink, Mirror, SyncFlag};
pub use pod_cache::{PodCache, PodEntry};
pub use queue::{Queue, QueueStats, Task};
pub use source::{KubeSource, Listing, SourceEvent, WatchSource};
