//! DriftFS Meta - meta server control plane
//!
//! The read side of metadata replication: [`store::MetaDataStore`]
//! indexes on-disk checkpoints and transaction log segments by log
//! sequence and serves range reads from a worker pool, caching open
//! descriptors behind a recency list with age- and count-based
//! retention. The startup loader rebuilds the index from the checkpoint
//! and log directories.

pub mod load;
pub mod lru;
pub mod store;

pub use store::{MetaDataStore, ReadMetaData};
