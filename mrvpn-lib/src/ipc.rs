use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::rpc::handler::Handler;
use crate::rpc::{Notification, Response};

pub mod client;
pub mod transport;

#[cfg(windows)]
pub const DEFAULT_ENDPOINT: &str = r"\\.\pipe\MRVPN";
#[cfg(unix)]
pub const DEFAULT_ENDPOINT: &str = "/var/run/mrvpn.sock";

pub const ENDPOINT_ENV: &str = "MRVPN_SOCKET_PATH";

pub const MAX_CLIENTS: usize = 10;
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const READ_DEADLINE: Duration = Duration::from_secs(300);

/// Local control server: accepts pipe clients, feeds their newline-delimited
/// requests to the handler in arrival order and pushes broadcasts to every
/// live connection.
pub struct Server {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

struct Shared {
    connections: Mutex<ConnectionSet>,
}

#[derive(Default)]
struct ConnectionSet {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<String>>,
    had_client: bool,
    drained: Option<oneshot::Sender<()>>,
}

impl Server {
    /// Binds the endpoint and starts the accept loop. The returned receiver
    /// fires once when the last client of a non-empty session disconnects.
    pub fn start(endpoint: &str, handler: Arc<Handler>) -> io::Result<(Server, oneshot::Receiver<()>)> {
        let listener = transport::Listener::bind(endpoint)?;
        tracing::info!(%endpoint, "ipc server listening");

        let (drained_sender, drained_receiver) = oneshot::channel();
        let shared = Arc::new(Shared {
            connections: Mutex::new(ConnectionSet {
                drained: Some(drained_sender),
                ..ConnectionSet::default()
            }),
        });

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(
            listener,
            shared.clone(),
            handler,
            cancel.clone(),
            tracker.clone(),
        ));

        let server = Server { shared, cancel, tracker };
        Ok((server, drained_receiver))
    }

    /// Queues a notification line on every live connection. A connection
    /// whose writer has already failed is skipped; the writer failure path
    /// removes it from the set.
    pub fn broadcast(&self, notification: &Notification) {
        let line = match serde_json::to_string(notification) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed encoding notification");
                return;
            }
        };
        let senders: Vec<(u64, mpsc::UnboundedSender<String>)> = {
            let set = self.shared.connections.lock().expect("connection set lock poisoned");
            set.senders.iter().map(|(id, sender)| (*id, sender.clone())).collect()
        };
        for (id, sender) in senders {
            if sender.send(line.clone()).is_err() {
                tracing::debug!(conn = id, "skipping broadcast to closing connection");
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.shared.connections.lock().expect("connection set lock poisoned").senders.len()
    }

    /// Closes the listener, then all connections, then waits for their tasks.
    pub async fn stop(&self) {
        tracing::info!("stopping ipc server");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn accept_loop(
    mut listener: transport::Listener,
    shared: Arc<Shared>,
    handler: Arc<Handler>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let Some((id, receiver)) = shared.register() else {
            tracing::warn!("rejecting client beyond connection cap");
            drop(stream);
            continue;
        };
        tracing::debug!(conn = id, "client connected");
        tracker.spawn(handle_connection(
            stream,
            id,
            receiver,
            shared.clone(),
            handler.clone(),
            cancel.child_token(),
        ));
    }
}

async fn handle_connection(
    stream: transport::Stream,
    id: u64,
    receiver: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
    handler: Arc<Handler>,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = tokio::spawn(write_loop(write_half, receiver, cancel.clone()));

    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE));
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(READ_DEADLINE, lines.next()) => next,
        };
        match next {
            Err(_) => {
                tracing::info!(conn = id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(line))) => {
                let response = handler.handle_line(&line).await;
                if shared.send_to(id, response).is_err() {
                    break;
                }
            }
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                tracing::warn!(conn = id, "message exceeds size limit, closing connection");
                let _ = shared.send_to(id, Response::parse_error());
                break;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => {
                tracing::warn!(conn = id, error = %e, "read failed");
                break;
            }
        }
    }

    // dropping the sender lets the writer drain queued replies and exit
    shared.remove(id);
    if let Err(e) = writer.await {
        tracing::warn!(conn = id, error = %e, "writer task failed");
    }
    tracing::debug!(conn = id, "client disconnected");
}

async fn write_loop(
    mut write_half: tokio::io::WriteHalf<transport::Stream>,
    mut receiver: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = receiver.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let write = async {
            write_half.write_all(line.as_bytes()).await?;
            write_half.write_all(b"\n").await
        };
        if let Err(e) = write.await {
            tracing::warn!(error = %e, "write failed, closing connection");
            cancel.cancel();
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

impl Shared {
    fn register(&self) -> Option<(u64, mpsc::UnboundedReceiver<String>)> {
        let mut set = self.connections.lock().expect("connection set lock poisoned");
        if set.senders.len() >= MAX_CLIENTS {
            return None;
        }
        let id = set.next_id;
        set.next_id += 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        set.senders.insert(id, sender);
        set.had_client = true;
        Some((id, receiver))
    }

    fn send_to(&self, id: u64, response: Response) -> Result<(), ()> {
        let line = serde_json::to_string(&response).map_err(|e| {
            tracing::error!(error = %e, "failed encoding response");
        })?;
        let set = self.connections.lock().expect("connection set lock poisoned");
        match set.senders.get(&id) {
            Some(sender) => sender.send(line).map_err(|_| ()),
            None => Err(()),
        }
    }

    fn remove(&self, id: u64) {
        let mut set = self.connections.lock().expect("connection set lock poisoned");
        set.senders.remove(&id);
        if set.senders.is_empty() && set.had_client {
            if let Some(drained) = set.drained.take() {
                tracing::info!("all ipc clients disconnected");
                let _ = drained.send(());
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::rpc;
    use crate::state::{StateMachine, TrafficStats};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    fn test_handler() -> Arc<Handler> {
        let state = Arc::new(StateMachine::new());
        let engine = Arc::new(Engine::new(state.clone()));
        Arc::new(Handler::new(engine, state, CancellationToken::new()))
    }

    async fn request_response(stream: &mut BufReader<UnixStream>, request: &str) -> Response {
        stream.get_mut().write_all(request.as_bytes()).await.unwrap();
        stream.get_mut().write_all(b"\n").await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn socket_path(dir: &tempfile::TempDir) -> String {
        dir.path().join("mrvpn.sock").to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn responses_preserve_request_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let (server, _drained) = Server::start(&path, test_handler()).unwrap();

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut client = BufReader::new(stream);

        client
            .get_mut()
            .write_all(
                b"{\"id\":\"1\",\"method\":\"split.setConfig\",\"params\":{\"mode\":\"app\",\"apps\":[\"chrome.exe\"],\"domains\":[],\"invert\":false}}\n{\"id\":\"2\",\"method\":\"split.getConfig\"}\n",
            )
            .await
            .unwrap();

        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        let first: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(first.id.as_deref(), Some("1"));

        line.clear();
        client.read_line(&mut line).await.unwrap();
        let second: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(second.id.as_deref(), Some("2"));
        let result = second.result.expect("result");
        assert_eq!(result["mode"], "app");
        assert_eq!(result["apps"][0], "chrome.exe");

        server.stop().await;
    }

    #[tokio::test]
    async fn broadcasts_reach_every_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let (server, _drained) = Server::start(&path, test_handler()).unwrap();

        let mut first = BufReader::new(UnixStream::connect(&path).await.unwrap());
        let mut second = BufReader::new(UnixStream::connect(&path).await.unwrap());
        // a round trip guarantees both clients are registered
        request_response(&mut first, r#"{"id":"a","method":"vpn.status"}"#).await;
        request_response(&mut second, r#"{"id":"b","method":"vpn.status"}"#).await;

        server.broadcast(&Notification::stats_update(TrafficStats {
            upload: 42,
            download: 7,
            up_speed: 0,
            down_speed: 0,
        }));

        for client in [&mut first, &mut second] {
            let mut line = String::new();
            client.read_line(&mut line).await.unwrap();
            let notification: Notification = serde_json::from_str(&line).unwrap();
            assert_eq!(notification.method, rpc::STATS_UPDATE_METHOD);
            assert_eq!(notification.params.unwrap()["upload"], 42);
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn clients_beyond_the_cap_are_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let (server, _drained) = Server::start(&path, test_handler()).unwrap();

        let mut clients = Vec::new();
        for i in 0..MAX_CLIENTS {
            let mut client = BufReader::new(UnixStream::connect(&path).await.unwrap());
            let request = format!(r#"{{"id":"{i}","method":"vpn.status"}}"#);
            request_response(&mut client, &request).await;
            clients.push(client);
        }
        assert_eq!(server.client_count(), MAX_CLIENTS);

        let mut rejected = UnixStream::connect(&path).await.unwrap();
        let mut buf = [0u8; 1];
        let read = rejected.read(&mut buf).await.unwrap();
        assert_eq!(read, 0, "over-cap client should see an immediate close");

        server.stop().await;
    }

    #[tokio::test]
    async fn drained_signal_fires_after_last_client_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let (server, drained) = Server::start(&path, test_handler()).unwrap();

        let mut client = BufReader::new(UnixStream::connect(&path).await.unwrap());
        request_response(&mut client, r#"{"id":"1","method":"vpn.status"}"#).await;
        drop(client);

        tokio::time::timeout(Duration::from_secs(2), drained)
            .await
            .expect("drained signal within deadline")
            .expect("drained sender kept alive");

        server.stop().await;
    }

    #[tokio::test]
    async fn oversize_line_answers_parse_error_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let (server, _drained) = Server::start(&path, test_handler()).unwrap();

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut client = BufReader::new(stream);

        let oversize = vec![b'x'; MAX_MESSAGE_SIZE + 16];
        // the server may close mid-write once the limit is exceeded
        let _ = client.get_mut().write_all(&oversize).await;

        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(response.id, None);
        assert_eq!(response.error.expect("error").code, rpc::PARSE_ERROR);

        line.clear();
        let closed = client.read_line(&mut line).await.unwrap();
        assert_eq!(closed, 0, "connection should be closed after the oversize line");

        server.stop().await;
    }
}
