pub mod batch_dispatcher;
pub mod compaction;
pub mod filter;
pub mod manifest;
pub mod partition;
pub mod placement;
pub mod region;
pub mod worker_pool;
