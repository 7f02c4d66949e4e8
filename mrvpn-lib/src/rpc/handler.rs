use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use crate::apps;
use crate::config::{Config, DnsProvider};
use crate::engine::Engine;
use crate::link;
use crate::rpc::{
    self, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, Request, Response, StatusResult,
};
use crate::split_tunnel::{Mode, SplitTunnelConfig};
use crate::state::{State, StateMachine};

pub const MAX_LINK_LENGTH: usize = 2048;

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    link: String,
    #[serde(default)]
    split_tunnel_mode: Option<Mode>,
    #[serde(default)]
    split_tunnel_apps: Option<Vec<String>>,
    #[serde(default)]
    split_tunnel_domains: Option<Vec<String>>,
    #[serde(default)]
    split_tunnel_invert: Option<bool>,
    #[serde(default)]
    dns: Option<DnsProvider>,
    #[serde(default)]
    custom_dns: Option<String>,
    #[serde(default)]
    mtu: Option<u32>,
    #[serde(default)]
    kill_switch: Option<bool>,
}

#[derive(Clone, Debug, Deserialize)]
struct PingParams {
    link: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct PingResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latency: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Dispatches decoded requests to the engine, state machine, split-tunnel
/// store and app enumerator. The stored split-tunnel config is the only
/// mutable state owned here.
pub struct Handler {
    engine: Arc<Engine>,
    state: Arc<StateMachine>,
    split_tunnel: RwLock<SplitTunnelConfig>,
    shutdown: CancellationToken,
}

impl Handler {
    pub fn new(engine: Arc<Engine>, state: Arc<StateMachine>, shutdown: CancellationToken) -> Self {
        Handler {
            engine,
            state,
            split_tunnel: RwLock::new(SplitTunnelConfig::default()),
            shutdown,
        }
    }

    /// Handles one wire line. Lines that are not JSON answer with a parse
    /// error, JSON that is not a request with an invalid-request error.
    pub async fn handle_line(&self, line: &str) -> Response {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "failed parsing request");
                return Response::parse_error();
            }
        };
        let id = value.get("id").and_then(Value::as_str).map(str::to_string);
        let request: Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "malformed request object");
                return Response::error(id, INVALID_REQUEST, "invalid request");
            }
        };
        self.handle(request).await
    }

    pub async fn handle(&self, request: Request) -> Response {
        tracing::debug!(id = %request.id, method = %request.method, "incoming request");
        let Request { id, method, params } = request;
        match method.as_str() {
            "vpn.connect" => self.connect(id, params).await,
            "vpn.disconnect" => self.disconnect(id).await,
            "vpn.status" => self.status(id),
            "apps.list" => self.list_apps(id).await,
            "split.setConfig" => self.set_split_config(id, params),
            "split.getConfig" => self.get_split_config(id),
            "servers.ping" => self.ping(id, params).await,
            "service.shutdown" => self.schedule_shutdown(id),
            _ => {
                tracing::warn!(%method, "unknown method");
                Response::error(Some(id), METHOD_NOT_FOUND, "method not found")
            }
        }
    }

    async fn connect(&self, id: String, params: Option<Value>) -> Response {
        let params: ConnectParams = match decode_params(&id, params) {
            Ok(params) => params,
            Err(response) => return response,
        };
        if params.link.len() > MAX_LINK_LENGTH {
            return Response::error(Some(id), INVALID_PARAMS, "link exceeds maximum length");
        }

        let server = match link::parse(&params.link) {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!(error = %e, "rejected connect link");
                return Response::error(Some(id), INVALID_PARAMS, "invalid configuration");
            }
        };

        let split_tunnel = match params.split_tunnel_mode {
            Some(mode) => SplitTunnelConfig {
                mode,
                apps: params.split_tunnel_apps.unwrap_or_default(),
                domains: params.split_tunnel_domains.unwrap_or_default(),
                invert: params.split_tunnel_invert.unwrap_or_default(),
            },
            None => self.split_tunnel.read().expect("split tunnel lock poisoned").clone(),
        };

        let mut config = Config::new(server);
        config.split_tunnel = split_tunnel;
        if let Some(dns) = params.dns {
            config.dns = dns;
        }
        config.custom_dns = params.custom_dns;
        if let Some(mtu) = params.mtu {
            config.mtu = mtu;
        }
        if let Some(kill_switch) = params.kill_switch {
            config.kill_switch = kill_switch;
        }

        match self.engine.connect(config).await {
            Ok(()) => Response::result(id, serde_json::json!({ "state": State::Connected })),
            Err(e) => {
                tracing::error!(error = %e, "connect request failed");
                Response::error(Some(id), INTERNAL_ERROR, rpc::sanitize_error(&e.to_string()))
            }
        }
    }

    async fn disconnect(&self, id: String) -> Response {
        self.engine.disconnect().await;
        Response::result(id, serde_json::json!({ "state": State::Disconnected }))
    }

    fn status(&self, id: String) -> Response {
        let state = self.state.state();
        let mut status = StatusResult {
            state,
            server_name: None,
            protocol: None,
            connected_at: None,
        };
        if state == State::Connected {
            if let Some(info) = self.engine.connection_info() {
                status.server_name = Some(info.server_name);
                status.protocol = Some(info.protocol.to_string());
                status.connected_at = info
                    .connected_at
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_secs());
            }
        }
        match serde_json::to_value(status) {
            Ok(value) => Response::result(id, value),
            Err(e) => internal(id, e),
        }
    }

    async fn list_apps(&self, id: String) -> Response {
        match tokio::task::spawn_blocking(apps::list).await {
            Ok(list) => match serde_json::to_value(list) {
                Ok(value) => Response::result(id, value),
                Err(e) => internal(id, e),
            },
            Err(e) => internal(id, e),
        }
    }

    fn set_split_config(&self, id: String, params: Option<Value>) -> Response {
        let config: SplitTunnelConfig = match decode_params(&id, params) {
            Ok(config) => config,
            Err(response) => return response,
        };
        tracing::info!(mode = %config.mode, apps = config.apps.len(), domains = config.domains.len(), "split tunnel config updated");
        *self.split_tunnel.write().expect("split tunnel lock poisoned") = config.clone();
        match serde_json::to_value(config) {
            Ok(value) => Response::result(id, value),
            Err(e) => internal(id, e),
        }
    }

    fn get_split_config(&self, id: String) -> Response {
        let config = self.split_tunnel.read().expect("split tunnel lock poisoned").clone();
        match serde_json::to_value(config) {
            Ok(value) => Response::result(id, value),
            Err(e) => internal(id, e),
        }
    }

    async fn ping(&self, id: String, params: Option<Value>) -> Response {
        let params: PingParams = match decode_params(&id, params) {
            Ok(params) => params,
            Err(response) => return response,
        };
        let result = ping_server(&params.link).await;
        match serde_json::to_value(result) {
            Ok(value) => Response::result(id, value),
            Err(e) => internal(id, e),
        }
    }

    // reply first, exit shortly after so the response can flush
    fn schedule_shutdown(&self, id: String) -> Response {
        tracing::info!("shutdown requested over ipc");
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_DELAY).await;
            shutdown.cancel();
        });
        Response::result(id, serde_json::json!({ "status": "ok" }))
    }
}

fn decode_params<T: serde::de::DeserializeOwned>(id: &str, params: Option<Value>) -> Result<T, Response> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| {
        tracing::warn!(error = %e, "invalid request params");
        Response::error(Some(id.to_string()), INVALID_PARAMS, "invalid parameters")
    })
}

fn internal(id: String, e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "internal failure handling request");
    Response::error(Some(id), INTERNAL_ERROR, "an internal error occurred")
}

async fn ping_server(link: &str) -> PingResult {
    if link.len() > MAX_LINK_LENGTH {
        return PingResult::err("invalid configuration");
    }
    let server = match link::parse(link) {
        Ok(server) => server,
        Err(e) => {
            tracing::warn!(error = %e, "rejected ping link");
            return PingResult::err("invalid configuration");
        }
    };

    let addrs: Vec<IpAddr> = match server.address.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => match tokio::net::lookup_host((server.address.as_str(), server.port)).await {
            Ok(resolved) => resolved.map(|a| a.ip()).collect(),
            Err(e) => {
                tracing::debug!(error = %e, host = %server.address, "ping resolution failed");
                return PingResult::err("unable to resolve host");
            }
        },
    };

    if addrs.is_empty() {
        return PingResult::err("unable to resolve host");
    }
    if addrs.iter().any(|ip| is_disallowed(*ip)) {
        return PingResult::err("cannot ping private addresses");
    }

    let target = (addrs[0], server.port);
    let started = Instant::now();
    match tokio::time::timeout(PING_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => PingResult {
            latency: Some(started.elapsed().as_millis() as u64),
            error: None,
        },
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "ping dial failed");
            PingResult::err(rpc::sanitize_error(&e.to_string()))
        }
        Err(_) => PingResult::err("request timed out"),
    }
}

impl PingResult {
    fn err(message: impl Into<String>) -> Self {
        PingResult {
            latency: None,
            error: Some(message.into()),
        }
    }
}

/// Loopback, RFC-1918, link-local, unique-local and unspecified targets are
/// never dialed.
fn is_disallowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_unspecified() || v4.is_link_local() || v4.is_private()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_disallowed(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (segments[0] & 0xffc0) == 0xfe80
                || (segments[0] & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn handler() -> Handler {
        let state = Arc::new(StateMachine::new());
        let engine = Arc::new(Engine::new(state.clone()));
        Handler::new(engine, state, CancellationToken::new())
    }

    #[rstest]
    #[case("127.0.0.1", true)]
    #[case("10.1.2.3", true)]
    #[case("172.16.0.1", true)]
    #[case("192.168.1.1", true)]
    #[case("169.254.10.10", true)]
    #[case("0.0.0.0", true)]
    #[case("::1", true)]
    #[case("fe80::1", true)]
    #[case("fc00::1", true)]
    #[case("::ffff:192.168.0.1", true)]
    #[case("1.1.1.1", false)]
    #[case("2606:4700:4700::1111", false)]
    fn flags_disallowed_ping_targets(#[case] ip: &str, #[case] expected: bool) {
        assert_eq!(is_disallowed(ip.parse().unwrap()), expected);
    }

    #[tokio::test]
    async fn split_config_round_trips() {
        let handler = handler();

        let response = handler
            .handle_line(
                r#"{"id":"1","method":"split.setConfig","params":{"mode":"app","apps":["chrome.exe"],"domains":[],"invert":false}}"#,
            )
            .await;
        assert_eq!(response.id.as_deref(), Some("1"));
        assert!(response.error.is_none());

        let response = handler.handle_line(r#"{"id":"2","method":"split.getConfig"}"#).await;
        assert_eq!(response.id.as_deref(), Some("2"));
        let result = response.result.expect("result");
        assert_eq!(result["mode"], "app");
        assert_eq!(result["apps"][0], "chrome.exe");
    }

    #[tokio::test]
    async fn invalid_split_mode_is_rejected() {
        let handler = handler();
        let response = handler
            .handle_line(r#"{"id":"3","method":"split.setConfig","params":{"mode":"tcp","apps":[],"domains":[],"invert":false}}"#)
            .await;
        assert_eq!(response.error.expect("error").code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_method_answers_not_found() {
        let handler = handler();
        let response = handler.handle_line(r#"{"id":"9","method":"vpn.levitate"}"#).await;
        assert_eq!(response.error.expect("error").code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_line_answers_parse_error() {
        let handler = handler();
        let response = handler.handle_line("this is not json").await;
        assert_eq!(response.id, None);
        assert_eq!(response.error.expect("error").code, rpc::PARSE_ERROR);
    }

    #[tokio::test]
    async fn json_without_a_method_is_an_invalid_request() {
        let handler = handler();
        let response = handler.handle_line(r#"{"id":"x","params":{}}"#).await;
        assert_eq!(response.id.as_deref(), Some("x"));
        assert_eq!(response.error.expect("error").code, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn status_starts_disconnected() {
        let handler = handler();
        let response = handler.handle_line(r#"{"id":"s","method":"vpn.status"}"#).await;
        let result = response.result.expect("result");
        assert_eq!(result["state"], "disconnected");
        assert!(result.get("serverName").is_none());
        assert!(result.get("connectedAt").is_none());
    }

    #[tokio::test]
    async fn ping_rejects_private_addresses_without_dialing() {
        let handler = handler();
        let response = handler
            .handle_line(r#"{"id":"p","method":"servers.ping","params":{"link":"vless://u@127.0.0.1:443"}}"#)
            .await;
        let result = response.result.expect("result");
        assert_eq!(result["error"], "cannot ping private addresses");
        assert!(result.get("latency").is_none());
    }

    #[tokio::test]
    async fn overlong_connect_link_is_invalid() {
        let handler = handler();
        let link = format!("vless://uuid@example.com:443?pad={}", "x".repeat(MAX_LINK_LENGTH));
        let request = serde_json::json!({"id": "c", "method": "vpn.connect", "params": {"link": link}});
        let response = handler.handle_line(&request.to_string()).await;
        assert_eq!(response.error.expect("error").code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn connect_with_invalid_link_is_invalid_configuration() {
        let handler = handler();
        let response = handler
            .handle_line(r#"{"id":"c","method":"vpn.connect","params":{"link":"trojan://nope@example.com"}}"#)
            .await;
        let error = response.error.expect("error");
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.message, "invalid configuration");
    }

    #[tokio::test]
    async fn shutdown_replies_before_cancelling() {
        let state = Arc::new(StateMachine::new());
        let engine = Arc::new(Engine::new(state.clone()));
        let shutdown = CancellationToken::new();
        let handler = Handler::new(engine, state, shutdown.clone());

        let response = handler.handle_line(r#"{"id":"q","method":"service.shutdown"}"#).await;
        assert!(response.error.is_none());
        assert!(!shutdown.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .expect("shutdown token cancelled");
    }
}
