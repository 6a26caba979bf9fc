pub mod election;
pub mod log;
pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;
pub mod types;

pub use node::RaftNode;
pub use rpc::RaftMessage;
pub use state::{NodeState, RaftState, StateSnapshot};
pub use types::{AppliedEntry, LogEntry, LogIndex, NodeId, Term};
