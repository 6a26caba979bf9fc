pub mod cluster;
pub mod config;
pub mod network;
pub mod raft;
pub mod storage;
pub mod util;
