pub mod codec;
pub mod memory;
pub mod server;
pub mod transport;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use server::serve;
pub use transport::{TcpTransport, Transport};
