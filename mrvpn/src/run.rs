use anyhow::Result;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

use mrvpn_lib::engine::Engine;
use mrvpn_lib::ipc::Server;
use mrvpn_lib::rpc::handler::Handler;
use mrvpn_lib::rpc::{Notification, StateChangedParams};
use mrvpn_lib::state::StateMachine;

/// Wires the core together and runs until the shutdown token fires: state
/// machine, engine adapter, rpc handler, ipc server, notification fan-out.
pub async fn run(endpoint: &str, shutdown: CancellationToken) -> Result<()> {
    let state = Arc::new(StateMachine::new());
    let engine = Arc::new(Engine::new(state.clone()));
    let handler = Arc::new(Handler::new(engine.clone(), state.clone(), shutdown.clone()));
    let (server, drained) = Server::start(endpoint, handler)?;
    let server = Arc::new(server);

    let broadcast = server.clone();
    let info_source = engine.clone();
    state.on_state_change(move |change| {
        let server_name = info_source.connection_info().map(|info| info.server_name);
        broadcast.broadcast(&Notification::state_changed(StateChangedParams {
            state: change.state,
            error: change.error.clone(),
            server_name,
        }));
    });

    let broadcast = server.clone();
    state.on_stats(move |stats| broadcast.broadcast(&Notification::stats_update(*stats)));

    tokio::spawn(async move {
        if drained.await.is_ok() {
            tracing::info!("last ui client disconnected, tunnel stays up");
        }
    });

    tracing::info!("enter listening mode");
    shutdown.cancelled().await;

    tracing::info!("shutting down");
    engine.disconnect().await;
    server.stop().await;
    Ok(())
}
