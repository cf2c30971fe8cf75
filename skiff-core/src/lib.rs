//! Skiff Core
//!
//! Decision engine and block storage for the Skiff block-exchange node.

pub mod cid_sha2;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod message;
pub mod metrics;
pub mod prq;
pub mod runtime;
pub mod storage;
pub mod traffic;
pub mod wantlist;

pub use config::Config;
pub use engine::{DisconnectPolicy, Engine, Envelope, Outbox};
pub use message::BlockSwapMessage;
pub use metrics::Metrics;
pub use runtime::run_node;
pub use storage::{Block, BlockStore};
pub use wantlist::{Entry, Wantlist};
