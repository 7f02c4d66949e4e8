use tokio_util::sync::CancellationToken;

use std::process;

mod cli;
mod run;
mod service;

fn main() {
    let args = cli::parse();

    let exit = match args.command {
        Some(cli::Command::Install) => service::install(),
        Some(cli::Command::Uninstall) => service::uninstall(),
        Some(cli::Command::Start) => service::service_manager_start(),
        Some(cli::Command::Stop) => service::service_manager_stop(),
        Some(cli::Command::Service) => service::run_service(args.endpoint),
        Some(cli::Command::Interactive) => interactive(&args.endpoint),
        None => match service::try_dispatch(&args.endpoint) {
            Some(exit) => exit,
            None => interactive(&args.endpoint),
        },
    };

    process::exit(exit)
}

fn interactive(endpoint: &str) -> exitcode::ExitCode {
    mrvpn_lib::logging::init_interactive();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {} interactively",
        env!("CARGO_PKG_NAME")
    );

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed creating runtime");
            return exitcode::OSERR;
        }
    };

    runtime.block_on(async {
        let shutdown = CancellationToken::new();
        let interrupt = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("interrupt received, initiating shutdown");
                    interrupt.cancel();
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed listening for interrupt");
                }
            }
        });

        match run::run(endpoint, shutdown).await {
            Ok(()) => exitcode::OK,
            Err(e) => {
                tracing::error!(error = %e, "daemon failed");
                exitcode::SOFTWARE
            }
        }
    })
}
