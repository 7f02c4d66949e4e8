use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::link::Protocol;
use crate::singbox;
use crate::state::{State, StateMachine};

pub mod clash;
pub mod traffic;

pub const ENGINE_ENV: &str = "MRVPN_ENGINE";

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const STARTUP_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("a tunnel is already active")]
    AlreadyConnected,
    #[error("proxy engine binary not found at `{}`", .0.display())]
    EngineNotFound(PathBuf),
    #[error("failed encoding engine configuration: {0}")]
    EncodeConfig(#[from] serde_json::Error),
    #[error("failed writing engine configuration: {0}")]
    WriteConfig(std::io::Error),
    #[error("failed starting proxy engine: {0}")]
    Spawn(std::io::Error),
    #[error("proxy engine exited during startup ({0})")]
    EarlyExit(String),
}

/// Read-only snapshot of the live connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub server_name: String,
    pub protocol: Protocol,
    pub connected_at: SystemTime,
}

struct Active {
    child: Child,
    cancel: CancellationToken,
    config_path: PathBuf,
}

/// Owns the embedded engine process and the proxy-only traffic poller.
/// At most one engine instance is alive at any time.
pub struct Engine {
    state: Arc<StateMachine>,
    lifecycle: tokio::sync::Mutex<Option<Active>>,
    info: Mutex<Option<ConnectionInfo>>,
    config: Mutex<Option<Config>>,
    accounting: Arc<Mutex<traffic::Accounting>>,
}

impl Engine {
    pub fn new(state: Arc<StateMachine>) -> Self {
        Engine {
            state,
            lifecycle: tokio::sync::Mutex::new(None),
            info: Mutex::new(None),
            config: Mutex::new(None),
            accounting: Arc::default(),
        }
    }

    pub async fn connect(&self, config: Config) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(Error::AlreadyConnected);
        }

        self.state.set_state(State::Connecting, None);

        let active = match start_engine(&config).await {
            Ok(active) => active,
            Err(e) => {
                tracing::error!(error = %e, server = %config.server.name, "connect failed");
                self.state.set_state(State::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        *self.info.lock().expect("engine info lock poisoned") = Some(ConnectionInfo {
            server_name: config.server.name.clone(),
            protocol: config.server.protocol,
            connected_at: SystemTime::now(),
        });
        *self.config.lock().expect("engine config lock poisoned") = Some(config);
        self.accounting.lock().expect("accounting lock poisoned").reset();

        let cancel = active.cancel.clone();
        *lifecycle = Some(active);
        drop(lifecycle);

        self.state.set_state(State::Connected, None);
        self.spawn_poller(cancel);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(mut active) = lifecycle.take() else {
            // next successful disconnect leaves a previous failure behind
            if self.state.state() == State::Error {
                self.state.set_state(State::Disconnected, None);
            }
            return;
        };

        self.state.set_state(State::Disconnecting, None);
        active.cancel.cancel();
        if let Err(e) = active.child.kill().await {
            tracing::warn!(error = %e, "failed stopping proxy engine");
        }
        remove_config_file(&active.config_path).await;

        *self.info.lock().expect("engine info lock poisoned") = None;
        *self.config.lock().expect("engine config lock poisoned") = None;
        drop(lifecycle);

        self.state.set_state(State::Disconnected, None);
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.info.lock().expect("engine info lock poisoned").clone()
    }

    pub fn connected_at(&self) -> Option<SystemTime> {
        self.connection_info().map(|info| info.connected_at)
    }

    pub fn config(&self) -> Option<Config> {
        self.config.lock().expect("engine config lock poisoned").clone()
    }

    fn spawn_poller(&self, cancel: CancellationToken) {
        let state = self.state.clone();
        let accounting = self.accounting.clone();
        tokio::spawn(async move {
            let client = match clash::Client::new() {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot create control plane client");
                    return;
                }
            };

            // let the control API bind before the first query
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match client.connections().await {
                    Ok(snapshot) => {
                        let stats = {
                            let mut accounting = accounting.lock().expect("accounting lock poisoned");
                            accounting.ingest(&snapshot.connections)
                        };
                        state.notify_stats(stats);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "traffic poll failed");
                    }
                }
            }
        });
    }
}

async fn start_engine(config: &Config) -> Result<Active, Error> {
    let binary = engine_binary();
    if !binary.exists() {
        return Err(Error::EngineNotFound(binary));
    }

    let document = singbox::build(config);
    let payload = serde_json::to_vec_pretty(&document)?;
    let config_path = std::env::temp_dir().join(format!("mrvpn-{}.json", uuid::Uuid::new_v4()));
    tokio::fs::write(&config_path, payload).await.map_err(Error::WriteConfig)?;

    tracing::info!(
        binary = %binary.display(),
        config = %config_path.display(),
        server = %config.server.name,
        "starting proxy engine"
    );

    let mut child = match Command::new(&binary)
        .arg("run")
        .arg("-c")
        .arg(&config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            remove_config_file(&config_path).await;
            return Err(Error::Spawn(e));
        }
    };

    tokio::time::sleep(STARTUP_GRACE).await;
    if let Ok(Some(status)) = child.try_wait() {
        remove_config_file(&config_path).await;
        return Err(Error::EarlyExit(status.to_string()));
    }

    Ok(Active {
        child,
        cancel: CancellationToken::new(),
        config_path,
    })
}

fn engine_binary() -> PathBuf {
    if let Ok(path) = std::env::var(ENGINE_ENV) {
        return PathBuf::from(path);
    }
    let name = if cfg!(windows) { "sing-box.exe" } else { "sing-box" };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

async fn remove_config_file(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(error = %e, path = %path.display(), "failed removing engine config file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_without_instance_is_a_no_op() {
        let state = Arc::new(StateMachine::new());
        let engine = Engine::new(state.clone());

        engine.disconnect().await;
        assert_eq!(state.state(), State::Disconnected);
        assert!(engine.connection_info().is_none());
    }

    #[tokio::test]
    async fn failed_connect_sets_error_and_releases_the_slot() {
        let state = Arc::new(StateMachine::new());
        let engine = Engine::new(state.clone());

        let config = Config::new(crate::link::parse("vless://uuid@example.com:443").unwrap());
        // no engine binary is present in the test environment
        let result = engine.connect(config.clone()).await;
        assert!(result.is_err());
        assert_eq!(state.state(), State::Error);
        assert!(state.last_error().is_some());
        assert!(engine.config().is_none());

        // a later disconnect recovers to disconnected
        engine.disconnect().await;
        assert_eq!(state.state(), State::Disconnected);

        // and the slot is free for another attempt
        let result = engine.connect(config).await;
        assert!(!matches!(result, Err(Error::AlreadyConnected)));
    }
}
