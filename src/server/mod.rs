//! Socket-facing service loops.
//!
//! Both the TEM and the camera service are a [`Service`] driven by the same accept
//! loop. Each accepted connection gets its own session task:
//!
//! ```text
//! Accepting ─► ReadingRequest ─► Dispatching ─► WritingResponse ─┐
//!                   ▲                                            │
//!                   └────────────────────────────────────────────┘
//!              └─► Closed (disconnect, exit/kill, protocol error, timeout, shutdown)
//! ```
//!
//! Per-request failures become error responses here and never reach the accept loop.
//! Only unrecoverable framing faults, timeouts and I/O errors end a session, and they
//! end only that session.

pub mod camera;
pub mod tem;

pub use camera::CameraService;
pub use tem::TemService;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::error::{AppResult, EmulatorError};
use crate::protocol::{read_frame, write_frame, FrameLimits, RawRequest, Response};

/// One frame of a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A JSON response envelope.
    Response(Response),
    /// Raw bytes, written as-is inside a length prefix.
    Payload(Bytes),
}

/// Frames produced after the service returned, in order. An `Err` is sent as an
/// error response and ends the stream.
pub type ReplyStream = mpsc::Receiver<AppResult<Vec<Outbound>>>;

/// What a service sends back for one request.
#[derive(Debug, Default)]
pub struct Reply {
    /// Frames written in order.
    pub frames: Vec<Outbound>,
    /// Further frames, written as they arrive once `frames` is out.
    pub stream: Option<ReplyStream>,
    /// End the session once this reply is written.
    pub close: bool,
}

impl Reply {
    /// A plain response.
    pub fn respond(response: Response) -> Self {
        Self {
            frames: vec![Outbound::Response(response)],
            ..Self::default()
        }
    }

    /// A reply whose frames are all produced later.
    pub fn streaming(stream: ReplyStream) -> Self {
        Self {
            stream: Some(stream),
            ..Self::default()
        }
    }

    /// Append a response followed by its raw payload.
    pub fn push_with_payload(&mut self, response: Response, payload: Bytes) {
        self.frames.push(Outbound::Response(response));
        self.frames.push(Outbound::Payload(payload));
    }

    /// Close the session silently, as the `exit`/`kill` sentinels do.
    pub fn close_session() -> Self {
        Self {
            close: true,
            ..Self::default()
        }
    }

    /// The first response frame, if any.
    pub fn response(&self) -> Option<&Response> {
        first_response(&self.frames)
    }
}

fn first_response(frames: &[Outbound]) -> Option<&Response> {
    frames.iter().find_map(|f| match f {
        Outbound::Response(r) => Some(r),
        Outbound::Payload(_) => None,
    })
}

/// One category of operations served on its own address.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handle one decoded request. Errors are reported to the client by the caller.
    async fn handle(&self, request: RawRequest) -> AppResult<Reply>;
}

/// Per-connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, nothing read yet.
    Accepting,
    /// Waiting for the next request frame.
    ReadingRequest,
    /// Decoding and handling a request.
    Dispatching,
    /// Writing the reply, including any streamed frames.
    WritingResponse,
    /// Terminal.
    Closed(CloseReason),
}

/// Why a session reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection between requests.
    ClientDisconnect,
    /// The client sent `exit` or `kill`.
    ClientExit,
    /// Unrecoverable framing error.
    ProtocolError,
    /// The client stalled past a configured bound.
    Timeout,
    /// The service is shutting down.
    Shutdown,
    /// Socket error while reading or writing.
    Io,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::ClientDisconnect => "client disconnected",
            CloseReason::ClientExit => "client exit",
            CloseReason::ProtocolError => "protocol error",
            CloseReason::Timeout => "timeout",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Io => "i/o error",
        };
        f.write_str(s)
    }
}

/// Session-level I/O configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Frame size and timeout bounds applied to every connection.
    pub limits: FrameLimits,
    /// How long shutdown waits for sessions before aborting them.
    pub shutdown_grace: Duration,
}

/// Bind a listener. Failure is fatal at startup.
pub async fn bind(service: &'static str, addr: &str) -> AppResult<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        EmulatorError::ResourceExhaustion(format!("{service} service cannot bind {addr}: {e}"))
    })
}

/// A running accept loop.
#[derive(Debug)]
pub struct ServiceHandle {
    name: &'static str,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    /// Address the service is actually listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Service name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the accept loop to finish draining.
    pub async fn join(self) -> AppResult<()> {
        self.task.await.map_err(|e| EmulatorError::ServiceFailed {
            service: self.name,
            reason: e.to_string(),
        })
    }
}

/// Start serving `service` on `listener` until `shutdown` flips to `true`.
pub fn spawn_service<S: Service>(
    service: Arc<S>,
    listener: TcpListener,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
) -> AppResult<ServiceHandle> {
    let local_addr = listener.local_addr()?;
    let name = service.name();
    info!(service = name, addr = %local_addr, "Service listening");

    let span = info_span!("service", service = name, addr = %local_addr);
    let task = tokio::spawn(accept_loop(service, listener, config, shutdown).instrument(span));
    Ok(ServiceHandle {
        name,
        local_addr,
        task,
    })
}

async fn accept_loop<S: Service>(
    service: Arc<S>,
    listener: TcpListener,
    config: SessionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions: JoinSet<CloseReason> = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let session_id = Uuid::new_v4();
                    let span =
                        info_span!("session", service = service.name(), %session_id, %peer);
                    sessions.spawn(
                        run_session(Arc::clone(&service), stream, config.limits, shutdown.clone())
                            .instrument(span),
                    );
                }
                Err(e) => {
                    // Usually descriptor exhaustion; back off instead of spinning.
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                log_session_end(done);
            }
        }
    }

    drop(listener);
    info!(active = sessions.len(), "Stopped accepting, draining sessions");

    let drain = async {
        while let Some(done) = sessions.join_next().await {
            log_session_end(done);
        }
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!(remaining = sessions.len(), "Grace period elapsed, aborting sessions");
        sessions.shutdown().await;
    }
    info!("Service stopped");
}

fn log_session_end(done: Result<CloseReason, tokio::task::JoinError>) {
    match done {
        Ok(reason) => debug!(%reason, "session finished"),
        Err(e) if e.is_panic() => warn!(error = %e, "session task panicked"),
        Err(_) => {}
    }
}

/// Drive one connection until it closes.
pub async fn run_session<S: Service>(
    service: Arc<S>,
    stream: TcpStream,
    limits: FrameLimits,
    mut shutdown: watch::Receiver<bool>,
) -> CloseReason {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let mut state = SessionState::Accepting;
    trace!(?state, "session opened");

    let reason = loop {
        if *shutdown.borrow() {
            break CloseReason::Shutdown;
        }

        state = SessionState::ReadingRequest;
        trace!(?state);
        // Shutdown may interrupt waiting for a request, never a request in flight.
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break CloseReason::Shutdown,
            frame = read_frame(&mut reader, &limits) => frame,
        };

        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => break CloseReason::ClientDisconnect,
            Err(err) => {
                let reason = match err {
                    EmulatorError::Timeout(_) => CloseReason::Timeout,
                    EmulatorError::Io(_) => CloseReason::Io,
                    _ => CloseReason::ProtocolError,
                };
                warn!(error = %err, "closing session");
                // Best effort: the peer may already be gone.
                if let Ok(bytes) = Response::error(&err).encode() {
                    let _ = write_frame(&mut writer, &bytes, limits.io_timeout).await;
                }
                break reason;
            }
        };

        state = SessionState::Dispatching;
        trace!(?state, bytes = body.len());
        let (command, mut reply) = match RawRequest::decode(&body) {
            Ok(request) => {
                let command = request.name();
                let reply = service
                    .handle(request)
                    .await
                    .unwrap_or_else(|err| Reply::respond(Response::error(&err)));
                (command, reply)
            }
            Err(err) => ("<malformed>".to_string(), Reply::respond(Response::error(&err))),
        };

        log_response(service.name(), &command, reply.response());

        state = SessionState::WritingResponse;
        trace!(?state, frames = reply.frames.len(), streaming = reply.stream.is_some());
        let written = match write_frames(&mut writer, &reply.frames, limits.io_timeout).await {
            Ok(()) => match reply.stream.as_mut() {
                Some(stream) => {
                    write_stream(&mut writer, stream, service.name(), &command, limits.io_timeout)
                        .await
                }
                None => Ok(()),
            },
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!(error = %err, "failed to write response");
            break match err {
                EmulatorError::Timeout(_) => CloseReason::Timeout,
                _ => CloseReason::Io,
            };
        }

        if reply.close {
            break CloseReason::ClientExit;
        }
    };

    state = SessionState::Closed(reason);
    debug!(?state, "session closed");
    reason
}

fn log_response(service: &str, command: &str, response: Option<&Response>) {
    match response {
        Some(Response::Ok { generation, .. }) => info!(service, %command, generation, "ok"),
        Some(Response::Error { kind, message }) => {
            warn!(service, %command, ?kind, %message, "error")
        }
        None => {}
    }
}

async fn write_frames<W>(writer: &mut W, frames: &[Outbound], io_timeout: Duration) -> AppResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    for frame in frames {
        match frame {
            Outbound::Response(response) => {
                write_frame(writer, &response.encode()?, io_timeout).await?
            }
            Outbound::Payload(payload) => write_frame(writer, payload, io_timeout).await?,
        }
    }
    Ok(())
}

/// Forward streamed frames until the producer finishes or fails.
async fn write_stream<W>(
    writer: &mut W,
    stream: &mut ReplyStream,
    service: &str,
    command: &str,
    io_timeout: Duration,
) -> AppResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(item) = stream.recv().await {
        match item {
            Ok(frames) => {
                log_response(service, command, first_response(&frames));
                write_frames(writer, &frames, io_timeout).await?;
            }
            Err(err) => {
                let response = Response::error(&err);
                log_response(service, command, Some(&response));
                return write_frame(writer, &response.encode()?, io_timeout).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::{json, Value};
    use tokio::io::AsyncWriteExt;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn handle(&self, request: RawRequest) -> AppResult<Reply> {
            match request.name().as_str() {
                "echo" => Ok(Reply::respond(Response::ok(0, request.params))),
                "exit" => Ok(Reply::close_session()),
                "count" => {
                    let (tx, rx) = mpsc::channel(1);
                    tokio::spawn(async move {
                        for i in 0..3u64 {
                            let frames = vec![Outbound::Response(Response::ok(i, Value::from(i)))];
                            if tx.send(Ok(frames)).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx
                            .send(Err(EmulatorError::RenderFailure("out of film".into())))
                            .await;
                    });
                    Ok(Reply::streaming(rx))
                }
                _ => Err(EmulatorError::UnknownCommand(request.command)),
            }
        }
    }

    fn limits() -> FrameLimits {
        FrameLimits {
            max_frame_bytes: 1024,
            idle_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(1),
        }
    }

    async fn pair() -> (TcpStream, tokio::task::JoinHandle<CloseReason>, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            run_session(Arc::new(Echo), stream, limits(), rx).await
        });
        let client = TcpStream::connect(addr).await.unwrap();
        (client, server, tx)
    }

    async fn call(client: &mut TcpStream, body: &[u8]) -> Response {
        write_frame(client, body, Duration::from_secs(1)).await.unwrap();
        let frame = read_frame(client, &limits()).await.unwrap().unwrap();
        Response::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_session_survives_request_errors() {
        let (mut client, server, _tx) = pair().await;

        let r = call(&mut client, br#"{"command": "FOO"}"#).await;
        assert!(matches!(r, Response::Error { kind: ErrorKind::UnknownCommand, .. }));

        let r = call(&mut client, b"{{{{").await;
        assert!(matches!(r, Response::Error { kind: ErrorKind::ProtocolError, .. }));

        let r = call(&mut client, br#"{"command": "echo", "params": {"a": 1}}"#).await;
        assert_eq!(r, Response::ok(0, json!({"a": 1})));

        drop(client);
        assert_eq!(server.await.unwrap(), CloseReason::ClientDisconnect);
    }

    #[tokio::test]
    async fn test_streamed_reply_is_written_in_order() {
        let (mut client, server, _tx) = pair().await;

        let first = call(&mut client, br#"{"command": "count"}"#).await;
        assert_eq!(first, Response::ok(0, Value::from(0)));
        for i in 1..3u64 {
            let frame = read_frame(&mut client, &limits()).await.unwrap().unwrap();
            assert_eq!(Response::decode(&frame).unwrap(), Response::ok(i, Value::from(i)));
        }
        let frame = read_frame(&mut client, &limits()).await.unwrap().unwrap();
        let r = Response::decode(&frame).unwrap();
        assert!(matches!(r, Response::Error { kind: ErrorKind::RenderFailure, .. }));

        // The session is still usable after a failed stream.
        let r = call(&mut client, br#"{"command": "echo", "params": 7}"#).await;
        assert_eq!(r, Response::ok(0, Value::from(7)));

        drop(client);
        assert_eq!(server.await.unwrap(), CloseReason::ClientDisconnect);
    }

    #[tokio::test]
    async fn test_exit_closes_session_without_reply() {
        let (mut client, server, _tx) = pair().await;
        write_frame(&mut client, br#"{"command": "exit"}"#, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(server.await.unwrap(), CloseReason::ClientExit);
        assert!(read_frame(&mut client, &limits()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_session() {
        let (mut client, server, _tx) = pair().await;
        client.write_all(&4096u32.to_be_bytes()).await.unwrap();

        let frame = read_frame(&mut client, &limits()).await.unwrap().unwrap();
        let r = Response::decode(&frame).unwrap();
        assert!(matches!(r, Response::Error { kind: ErrorKind::ProtocolError, .. }));
        assert_eq!(server.await.unwrap(), CloseReason::ProtocolError);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_session() {
        let (_client, server, tx) = pair().await;
        tx.send(true).unwrap();
        assert_eq!(server.await.unwrap(), CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_accept_loop_serves_many_sessions_and_stops() {
        let listener = bind("test", "127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = spawn_service(
            Arc::new(Echo),
            listener,
            SessionConfig {
                limits: limits(),
                shutdown_grace: Duration::from_secs(1),
            },
            rx,
        )
        .unwrap();

        let mut a = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut b = TcpStream::connect(handle.local_addr()).await.unwrap();
        let ra = call(&mut a, br#"{"command": "echo", "params": 1}"#).await;
        let rb = call(&mut b, br#"{"command": "echo", "params": 2}"#).await;
        assert_eq!(ra, Response::ok(0, Value::from(1)));
        assert_eq!(rb, Response::ok(0, Value::from(2)));

        tx.send(true).unwrap();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicked_loop_is_internal_error() {
        let handle = ServiceHandle {
            name: "test",
            local_addr: "127.0.0.1:1".parse().unwrap(),
            task: tokio::spawn(async { panic!("accept loop died") }),
        };
        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, EmulatorError::ServiceFailed { service: "test", .. }));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_resource_exhaustion() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = held.local_addr().unwrap().to_string();
        let err = bind("tem", &addr).await.unwrap_err();
        assert!(matches!(err, EmulatorError::ResourceExhaustion(_)));
    }
}
