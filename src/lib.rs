//! tidemq: a priority-ordered message queue broker with a blocking TCP client.

pub mod client;
pub mod config;
pub mod context;
pub mod logging;
pub mod manager;
pub mod message;
pub mod pools;
pub mod remote;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod store;
pub mod sweeper;
pub mod utils;
pub mod wire;
