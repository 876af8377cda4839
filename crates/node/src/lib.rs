//! Storage-provider node: task scheduling, secondary replication over the
//! overlay, seal submission and gc of deleted objects.

pub mod approval;
pub mod config;
pub mod devchain;
pub mod erasure;
pub mod error;
pub mod executor;
pub mod gc;
pub mod interfaces;
pub mod manager;
pub mod metadb;
pub mod p2p;
pub mod peers;
pub mod peerstore;
pub mod piece;
pub mod queue;
pub mod rcmgr;
pub mod receiver;
pub mod replicator;
pub mod signer;
pub mod stream;
pub mod task;

pub use error::{SpError, SpResult};
