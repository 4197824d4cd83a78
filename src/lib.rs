//! raft-core: an embeddable consensus engine for cluster membership and log
//! replication, designed to sit alongside a host database server and be
//! driven entirely through the `control` module's in-process calls.

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod log;
pub mod state_machine;
pub mod storage;
pub mod transport;
pub mod types;
pub mod worker;

pub use config::Config;
pub use control::RaftControl;
pub use error::{RaftError, Result};
pub use worker::Worker;
