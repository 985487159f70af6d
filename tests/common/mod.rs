#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Deeply nested uses in sub-modules are falsely flagged as being unused"
)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use prost::Message as _;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing_subscriber::EnvFilter;
use vehicle_cloud_link::proto::{
    AttributeStatus, ClientMessage, CommandErrorStatus, CommandStatus, CommandStatusUpdates,
    PushMessage, VehicleCommandStatuses, VepUpdate, VepUpdates, attribute_status, client_message,
    push_message,
};

pub const VIN: &str = "WDD1770000000001";
pub const TOKEN: &str = "access-token-1";

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// What the mock server observed from the client.
#[derive(Debug)]
pub enum ServerEvent {
    /// Handshake accepted, with the request headers
    Connected(HeaderMap),
    /// Handshake refused with the configured status
    Rejected(StatusCode),
    Binary(Vec<u8>),
    Ping,
    /// Client sent a close frame, with its code if any
    Closed(Option<u16>),
    /// Socket ended without a close frame
    Dropped,
}

#[derive(Clone, Debug)]
enum ServerCommand {
    Push(Vec<u8>),
    Close(u16),
}

/// Mock push service speaking binary frames.
pub struct MockPushServer {
    addr: SocketAddr,
    /// Broadcast to ALL connected clients
    command_tx: broadcast::Sender<ServerCommand>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    handshakes: Arc<AtomicUsize>,
}

impl MockPushServer {
    /// Start a mock server on a random port that accepts every handshake.
    pub async fn start() -> Self {
        Self::start_rejecting(0, StatusCode::TOO_MANY_REQUESTS).await
    }

    /// Start a mock server that refuses the first `count` handshakes with `status`.
    pub async fn start_rejecting(count: usize, status: StatusCode) -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (command_tx, _) = broadcast::channel::<ServerCommand>(100);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let handshakes = Arc::new(AtomicUsize::new(0));
        let rejections = Arc::new(AtomicUsize::new(count));

        let broadcast_tx = command_tx.clone();
        let accepted = Arc::clone(&handshakes);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                // Subscribe before the handshake so nothing pushed after it is missed.
                let mut commands = broadcast_tx.subscribe();
                let events = events_tx.clone();
                let handshake_events = events_tx.clone();
                let handshakes = Arc::clone(&accepted);
                let rejections = Arc::clone(&rejections);

                let callback = move |request: &Request,
                                     response: Response|
                      -> Result<Response, ErrorResponse> {
                    handshakes.fetch_add(1, Ordering::SeqCst);
                    let reject = rejections
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                            left.checked_sub(1)
                        })
                        .is_ok();

                    if reject {
                        drop(handshake_events.send(ServerEvent::Rejected(status)));
                        let mut error = ErrorResponse::new(Some("slow down".to_owned()));
                        *error.status_mut() = status;
                        return Err(error);
                    }

                    drop(handshake_events.send(ServerEvent::Connected(request.headers().clone())));
                    Ok(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Binary(bytes))) => {
                                        drop(events.send(ServerEvent::Binary(bytes.to_vec())));
                                    }
                                    Some(Ok(Message::Ping(_))) => {
                                        drop(events.send(ServerEvent::Ping));
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        let code = frame.map(|frame| u16::from(frame.code));
                                        drop(events.send(ServerEvent::Closed(code)));
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    _ => {
                                        drop(events.send(ServerEvent::Dropped));
                                        break;
                                    }
                                }
                            }
                            command = commands.recv() => {
                                match command {
                                    Ok(ServerCommand::Push(bytes)) => {
                                        if write.send(Message::Binary(bytes.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerCommand::Close(code)) => {
                                        let frame = CloseFrame {
                                            code: code.into(),
                                            reason: "server restart".into(),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                        break;
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            command_tx,
            events_rx,
            handshakes,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/v2/ws", self.addr)
    }

    /// Send a binary frame to all connected clients.
    pub fn push(&self, bytes: Vec<u8>) {
        drop(self.command_tx.send(ServerCommand::Push(bytes)));
    }

    /// Close every connection from the server side.
    pub fn close_all(&self, code: u16) {
        drop(self.command_tx.send(ServerCommand::Close(code)));
    }

    /// Number of handshakes seen so far, accepted or not.
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        timeout(EVENT_WAIT, self.events_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the next accepted handshake and return its headers.
    pub async fn expect_connected(&mut self) -> HeaderMap {
        loop {
            match self.next_event().await {
                Some(ServerEvent::Connected(headers)) => return headers,
                Some(_) => {}
                None => panic!("client never connected"),
            }
        }
    }

    /// Wait for the next binary frame from the client and decode it.
    pub async fn expect_client_message(&mut self) -> ClientMessage {
        loop {
            match self.next_event().await {
                Some(ServerEvent::Binary(bytes)) => return ClientMessage::decode(&*bytes).unwrap(),
                Some(_) => {}
                None => panic!("client sent no binary frame"),
            }
        }
    }

    /// Wait for a close frame from the client and return its code.
    pub async fn expect_closed(&mut self) -> Option<u16> {
        loop {
            match self.next_event().await {
                Some(ServerEvent::Closed(code)) => return code,
                Some(_) => {}
                None => panic!("client never closed the socket"),
            }
        }
    }

    pub async fn expect_ping(&mut self) {
        loop {
            match self.next_event().await {
                Some(ServerEvent::Ping) => return,
                Some(_) => {}
                None => panic!("client sent no PING"),
            }
        }
    }
}

/// Route client logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

fn push(msg: push_message::Msg) -> Vec<u8> {
    PushMessage {
        tracking_id: "push-1".to_owned(),
        msg: Some(msg),
    }
    .encode_to_vec()
}

/// A partial telemetry update for [`VIN`] carrying one numeric attribute.
pub fn telemetry_push(sequence_number: i32, attribute: &str, value: f64) -> Vec<u8> {
    let mut attributes = HashMap::new();
    attributes.insert(
        attribute.to_owned(),
        AttributeStatus {
            timestamp_in_ms: 1_700_000_000_000,
            status: 0,
            value: Some(attribute_status::Value::DoubleValue(value)),
        },
    );

    let mut updates = HashMap::new();
    updates.insert(
        VIN.to_owned(),
        VepUpdate {
            vin: VIN.to_owned(),
            full_update: false,
            emit_timestamp_in_ms: 1_700_000_000_100,
            attributes,
        },
    );

    push(push_message::Msg::VepUpdates(VepUpdates {
        updates,
        sequence_number: Some(sequence_number),
    }))
}

/// A command status update for [`VIN`].
pub fn command_status_push(
    sequence_number: i32,
    request_id: &str,
    state: i32,
    errors: &[(&str, &str)],
) -> Vec<u8> {
    let status = CommandStatus {
        request_id: request_id.to_owned(),
        command_type: 1,
        state,
        errors: errors
            .iter()
            .map(|(code, message)| CommandErrorStatus {
                code: (*code).to_owned(),
                message: (*message).to_owned(),
            })
            .collect(),
        timestamp_in_ms: 1_700_000_000_200,
    };

    let mut updates_by_vin = HashMap::new();
    updates_by_vin.insert(
        VIN.to_owned(),
        VehicleCommandStatuses {
            vin: VIN.to_owned(),
            statuses: vec![status],
        },
    );

    push(push_message::Msg::CommandStatusUpdates(CommandStatusUpdates {
        updates_by_vin,
        sequence_number: Some(sequence_number),
    }))
}

/// Sequence number carried by an acknowledgment, with the kind of update it acknowledges.
pub fn acknowledged(message: &ClientMessage) -> Option<(&'static str, i32)> {
    match message.msg.as_ref()? {
        client_message::Msg::AcknowledgeVepUpdates(ack) => Some(("telemetry", ack.sequence_number)),
        client_message::Msg::AcknowledgeCommandStatusUpdates(ack) => {
            Some(("command_status", ack.sequence_number))
        }
        _ => None,
    }
}
