use clap::{Parser, Subcommand};

use mrvpn_lib::ipc;
use mrvpn_lib::rpc::Request;
use mrvpn_lib::split_tunnel::Mode;

/// MRVPN control interface for the MRVPN backend service
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Endpoint of the local control channel
    #[arg(
        short,
        long,
        env = ipc::ENDPOINT_ENV,
        default_value = ipc::DEFAULT_ENDPOINT
    )]
    pub endpoint: String,

    /// Format output as json
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Query current tunnel status
    #[command()]
    Status {},

    /// Connect using a proxy server share link
    #[command()]
    Connect {
        /// vless:// or hysteria2:// share link
        link: String,
    },

    /// Disconnect the active tunnel
    #[command()]
    Disconnect {},

    /// List installed applications for split tunneling
    #[command()]
    Apps {},

    /// Show the stored split tunnel configuration
    #[command()]
    SplitGet {},

    /// Store a split tunnel configuration
    #[command()]
    SplitSet {
        /// Selection mode: off, app or domain
        mode: Mode,

        /// Executable names selected in app mode
        #[arg(long)]
        apps: Vec<String>,

        /// Host patterns selected in domain mode
        #[arg(long)]
        domains: Vec<String>,

        /// Route everything except the selection
        #[arg(long)]
        invert: bool,
    },

    /// Measure tcp latency towards a server link
    #[command()]
    Ping {
        /// vless:// or hysteria2:// share link
        link: String,
    },

    /// Ask the backend service to exit
    #[command()]
    Shutdown {},
}

impl Command {
    pub fn into_request(self, id: String) -> Request {
        let (method, params) = match self {
            Command::Status {} => ("vpn.status", None),
            Command::Connect { link } => ("vpn.connect", Some(serde_json::json!({ "link": link }))),
            Command::Disconnect {} => ("vpn.disconnect", None),
            Command::Apps {} => ("apps.list", None),
            Command::SplitGet {} => ("split.getConfig", None),
            Command::SplitSet {
                mode,
                apps,
                domains,
                invert,
            } => (
                "split.setConfig",
                Some(serde_json::json!({
                    "mode": mode,
                    "apps": apps,
                    "domains": domains,
                    "invert": invert,
                })),
            ),
            Command::Ping { link } => ("servers.ping", Some(serde_json::json!({ "link": link }))),
            Command::Shutdown {} => ("service.shutdown", None),
        };
        Request {
            id,
            method: method.to_string(),
            params,
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
