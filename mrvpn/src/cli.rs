use clap::{Parser, Subcommand};

use mrvpn_lib::ipc;

/// MRVPN backend service - manages the proxy tunnel and the UI control channel
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Run as a windows service when started by the service manager,
    /// interactively otherwise
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Endpoint of the local control channel
    #[arg(
        short,
        long,
        env = ipc::ENDPOINT_ENV,
        default_value = ipc::DEFAULT_ENDPOINT
    )]
    pub endpoint: String,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Register the backend as an auto-start windows service
    Install,

    /// Stop and remove the windows service
    Uninstall,

    /// Start the installed windows service
    Start,

    /// Stop the running windows service
    Stop,

    /// Run in the foreground without service dispatch
    Interactive,

    /// Entry point used by the service control manager
    #[command(hide = true)]
    Service,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_without_arguments() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["mrvpn"])?;
        assert!(args.command.is_none());
        assert_eq!(args.endpoint, ipc::DEFAULT_ENDPOINT);
        Ok(())
    }

    #[test]
    fn parses_interactive_with_custom_endpoint() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["mrvpn", "--endpoint", "/tmp/test.sock", "interactive"])?;
        assert!(matches!(args.command, Some(Command::Interactive)));
        assert_eq!(args.endpoint, "/tmp/test.sock");
        Ok(())
    }
}
