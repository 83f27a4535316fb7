use derive_getters::Getters;
use serde::{Deserialize, Serialize};

pub type Port = u16;

pub fn default_ssh_port() -> Port {
    22
}

/// A remote login host.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    host: String,
    #[serde(default = "self::default_ssh_port")]
    port: Port,
}

impl Host {
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
        }
    }

    pub fn new_with_port<S: Into<String>>(host: S, port: Port) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, as accepted by `ToSocketAddrs`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
