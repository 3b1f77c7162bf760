use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub const LISTEN_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

pub const fn listen_port() -> u16 {
    5059
}

fn listen_addr() -> Ipv4Addr {
    LISTEN_ADDR
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "listen_addr")]
    pub listen_addr: Ipv4Addr,
    #[serde(default = "listen_port")]
    pub listen_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: listen_addr(),
            listen_port: listen_port(),
        }
    }
}
