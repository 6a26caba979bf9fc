pub mod directory;
pub mod fanout;

pub use directory::{ClusterDirectory, Peer, PeerRecord};
pub use fanout::{collect, fan_out, PeerReply};
