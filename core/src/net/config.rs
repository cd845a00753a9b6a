use serde_derive::{Deserialize, Serialize};

/// Network-layer tuning, filled in once at `Acceptor::start` and copied into
/// every `Connection` as its `localConfig`. `remoteConfig` is the peer's
/// equivalent, learned by an upstream protocol layer during the Hello
/// exchange and not modeled here.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub port: u16,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    pub max_message_size: usize,
    pub max_chunk_count: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            port: 4840,
            recv_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
            max_chunk_count: 0,
        }
    }
}
