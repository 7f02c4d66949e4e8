use serde::{Deserialize, Serialize};

use crate::link::ServerConfig;
use crate::split_tunnel::SplitTunnelConfig;

pub const DEFAULT_MTU: u32 = 9000;

/// Runtime configuration of a single tunnel attempt. Assembled by the RPC
/// handler from a parsed share link plus per-connect options and handed to
/// the engine adapter, which owns it for the lifetime of the connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub dns: DnsProvider,
    pub custom_dns: Option<String>,
    pub mtu: u32,
    pub kill_switch: bool,
    pub split_tunnel: SplitTunnelConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProvider {
    #[default]
    Cloudflare,
    Google,
    Custom,
    System,
}

impl Config {
    pub fn new(server: ServerConfig) -> Self {
        Config {
            server,
            dns: DnsProvider::default(),
            custom_dns: None,
            mtu: DEFAULT_MTU,
            kill_switch: false,
            split_tunnel: SplitTunnelConfig::default(),
        }
    }
}
