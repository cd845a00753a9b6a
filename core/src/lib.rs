pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod node;
pub mod node_id;
pub mod store;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use net::{Acceptor, Connection, Job, NetworkConfig};
pub use node::{Node, NodeClass};
pub use node_id::NodeId;
pub use store::{Handle, NodeStore};
