use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, mpsc},
};
use tracing::{debug, info, warn};

use crate::{
    frame::{Command, Frame},
    transport::{self, FrameReader, FrameWriter},
};

type ClientId = u64;

pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(BrokerState::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &Arc<BrokerState>) {
    info!("broker shutting down");
    state.broadcast(error_frame("broker shutting down")).await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<BrokerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<BrokerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckMode {
    Auto,
    /// `client` or `client-individual`: messages carry an `ack` header.
    Client,
}

impl AckMode {
    fn from_header(value: Option<&str>) -> Self {
        match value {
            Some("client") | Some("client-individual") => AckMode::Client,
            _ => AckMode::Auto,
        }
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    destination: String,
    ack: AckMode,
}

struct ClientRecord {
    login: String,
    outbox: mpsc::UnboundedSender<Frame>,
    /// Keyed by the subscription id the client chose.
    subscriptions: HashMap<String, Subscription>,
}

struct BrokerState {
    clients: Mutex<HashMap<ClientId, ClientRecord>>,
    /// Login → passcode; users are registered on their first CONNECT.
    users: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
    next_message_id: AtomicU64,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register_client(
        &self,
        id: ClientId,
        login: &str,
        passcode: &str,
        outbox: mpsc::UnboundedSender<Frame>,
    ) -> Result<(), RegisterClientError> {
        // Lock order: users, then clients.
        let mut users = self.users.lock().await;
        match users.get(login) {
            Some(expected) if expected != passcode => {
                return Err(RegisterClientError::WrongPassword);
            }
            Some(_) => {}
            None => {
                users.insert(login.to_string(), passcode.to_string());
            }
        }

        let mut clients = self.clients.lock().await;
        if clients.values().any(|client| client.login == login) {
            return Err(RegisterClientError::AlreadyLoggedIn);
        }

        clients.insert(
            id,
            ClientRecord {
                login: login.to_string(),
                outbox,
                subscriptions: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn remove_client(&self, id: ClientId) -> Option<ClientRecord> {
        let mut clients = self.clients.lock().await;
        clients.remove(&id)
    }

    async fn subscribe(&self, id: ClientId, subscription_id: &str, subscription: Subscription) {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get_mut(&id) {
            client
                .subscriptions
                .insert(subscription_id.to_string(), subscription);
        }
    }

    async fn unsubscribe(&self, id: ClientId, subscription_id: &str) -> Option<Subscription> {
        let mut clients = self.clients.lock().await;
        clients
            .get_mut(&id)
            .and_then(|client| client.subscriptions.remove(subscription_id))
    }

    /// Queues a MESSAGE for every subscription on `destination` and returns
    /// how many were queued.
    async fn publish(&self, destination: &str, body: &str) -> usize {
        let clients = self.clients.lock().await;
        let mut delivered = 0;

        for client in clients.values() {
            for (subscription_id, subscription) in &client.subscriptions {
                if subscription.destination != destination {
                    continue;
                }

                let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
                let mut message = Frame::new(Command::Message)
                    .header("subscription", subscription_id)
                    .header("message-id", message_id)
                    .header("destination", destination);
                if subscription.ack == AckMode::Client {
                    message = message.header("ack", message_id);
                }

                if client.outbox.send(message.with_body(body)).is_ok() {
                    delivered += 1;
                }
            }
        }

        delivered
    }

    async fn broadcast(&self, frame: Frame) {
        let clients = self.clients.lock().await;
        for client in clients.values() {
            if client.outbox.send(frame.clone()).is_err() {
                debug!(login = %client.login, "client outbox already closed");
            }
        }
    }
}

#[derive(Debug, Error)]
enum RegisterClientError {
    #[error("Wrong password")]
    WrongPassword,
    #[error("User already logged in")]
    AlreadyLoggedIn,
}

fn error_frame(message: &str) -> Frame {
    Frame::new(Command::Error)
        .header("message", message)
        .with_body(message)
}

async fn handle_connection(stream: TcpStream, state: Arc<BrokerState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (mut reader, writer) = transport::split(stream);
    let (outbox, mut inbox) = mpsc::unbounded_channel();

    let client_id = state.next_id();
    let login = perform_handshake(&mut reader, &writer, &state, client_id, outbox).await?;
    info!(?peer, login, "client connected");

    let result = run_client_session(&state, client_id, &mut reader, &writer, &mut inbox).await;
    cleanup_client_disconnect(&state, client_id, peer).await;

    result
}

async fn perform_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &FrameWriter<W>,
    state: &BrokerState,
    client_id: ClientId,
    outbox: mpsc::UnboundedSender<Frame>,
) -> Result<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(raw) = reader.read_frame().await? else {
        anyhow::bail!("connection closed before handshake");
    };

    let connect = match Frame::decode(&raw) {
        Ok(frame) if frame.command() == Command::Connect => frame,
        _ => {
            writer.send(&error_frame("expected CONNECT frame")).await?;
            anyhow::bail!("expected CONNECT frame first");
        }
    };

    let (Some(login), Some(passcode)) = (connect.get("login"), connect.get("passcode")) else {
        writer.send(&error_frame("missing login or passcode")).await?;
        anyhow::bail!("CONNECT without credentials");
    };

    if let Err(err) = state
        .register_client(client_id, login, passcode, outbox)
        .await
    {
        writer.send(&error_frame(&err.to_string())).await?;
        anyhow::bail!("login rejected for {login}: {err}");
    }

    writer
        .send(&Frame::new(Command::Connected).header("version", "1.2"))
        .await?;
    Ok(login.to_string())
}

async fn run_client_session<R, W>(
    state: &BrokerState,
    client_id: ClientId,
    reader: &mut FrameReader<R>,
    writer: &FrameWriter<W>,
    inbox: &mut mpsc::UnboundedReceiver<Frame>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            raw = reader.read_frame() => {
                if !handle_client_frame(raw?, writer, state, client_id).await? {
                    break;
                }
            }
            Some(outgoing) = inbox.recv() => {
                writer.send(&outgoing).await?;
            }
        }
    }

    Ok(())
}

async fn handle_client_frame<W>(
    raw: Option<String>,
    writer: &FrameWriter<W>,
    state: &BrokerState,
    client_id: ClientId,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(raw) = raw else {
        return Ok(false);
    };

    let frame = match Frame::decode(&raw) {
        Ok(frame) => frame,
        Err(err) => {
            writer.send(&error_frame(&err.to_string())).await?;
            return Ok(false);
        }
    };

    let keep_open = match frame.command() {
        Command::Subscribe => {
            let (Some(destination), Some(id)) = (frame.get("destination"), frame.get("id")) else {
                writer
                    .send(&error_frame("SUBSCRIBE requires destination and id"))
                    .await?;
                return Ok(false);
            };
            let subscription = Subscription {
                destination: destination.to_string(),
                ack: AckMode::from_header(frame.get("ack")),
            };
            state.subscribe(client_id, id, subscription).await;
            true
        }
        Command::Unsubscribe => {
            let Some(id) = frame.get("id") else {
                writer.send(&error_frame("UNSUBSCRIBE requires id")).await?;
                return Ok(false);
            };
            if state.unsubscribe(client_id, id).await.is_none() {
                debug!(client_id, id, "unsubscribe for unknown subscription");
            }
            true
        }
        Command::Send => {
            let Some(destination) = frame.get("destination") else {
                writer.send(&error_frame("SEND requires destination")).await?;
                return Ok(false);
            };
            let delivered = state.publish(destination, frame.body()).await;
            debug!(client_id, destination, delivered, "published message");
            true
        }
        Command::Ack => {
            debug!(client_id, id = frame.get("id"), "message acknowledged");
            true
        }
        Command::Disconnect => false,
        Command::Connect => {
            writer.send(&error_frame("already connected")).await?;
            true
        }
        other => {
            writer
                .send(&error_frame(&format!("unexpected {other} frame")))
                .await?;
            return Ok(false);
        }
    };

    if let Some(receipt) = frame.get("receipt") {
        writer
            .send(&Frame::new(Command::Receipt).header("receipt-id", receipt))
            .await?;
    }

    Ok(keep_open)
}

async fn cleanup_client_disconnect(
    state: &BrokerState,
    client_id: ClientId,
    peer: Option<SocketAddr>,
) {
    if let Some(ClientRecord { login, .. }) = state.remove_client(client_id).await {
        info!(?peer, %login, "client disconnected");
    }
}
