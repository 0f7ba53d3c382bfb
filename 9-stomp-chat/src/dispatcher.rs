//! Inbound side of a session: reads broker frames and reacts to them.
//!
//! Frames are handled one at a time in arrival order. The dispatcher stops
//! for good when the broker confirms the logout, reports an error, or the
//! connection goes away; each of those also trips the session's
//! [`Termination`] so the other loops wind down too.

use std::sync::Arc;

use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    select,
};
use tracing::{debug, warn};

use crate::{
    console::Console,
    encoder,
    frame::{Command, Frame},
    registry::{CorrelationRegistry, PendingAction, ReceiptId},
    termination::Termination,
    transport::{FrameReader, FrameWriter},
};

/// Why the dispatcher left its listening state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// The broker confirmed our DISCONNECT.
    LoggedOut,
    /// The broker sent an ERROR frame.
    ServerError,
    /// The connection closed or failed.
    ConnectionLost,
    /// Something else set the termination flag.
    Terminated,
}

pub struct Dispatcher<R, W> {
    reader: FrameReader<R>,
    writer: Arc<FrameWriter<W>>,
    registry: Arc<CorrelationRegistry>,
    console: Console,
    termination: Termination,
}

impl<R, W> Dispatcher<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: FrameReader<R>,
        writer: Arc<FrameWriter<W>>,
        registry: Arc<CorrelationRegistry>,
        console: Console,
        termination: Termination,
    ) -> Self {
        Self {
            reader,
            writer,
            registry,
            console,
            termination,
        }
    }

    pub async fn run(mut self) -> Stopped {
        let stopped = self.listen().await;
        self.termination.trigger();
        debug!(?stopped, "inbound dispatcher stopped");
        stopped
    }

    async fn listen(&mut self) -> Stopped {
        loop {
            if self.termination.is_set() {
                return Stopped::Terminated;
            }

            let raw = select! {
                _ = self.termination.triggered() => return Stopped::Terminated,
                raw = self.reader.read_frame() => raw,
            };

            let raw = match raw {
                Ok(Some(raw)) => raw,
                Ok(None) => return self.connection_lost().await,
                Err(error) => {
                    warn!(?error, "failed to read frame from broker");
                    return self.connection_lost().await;
                }
            };

            match Frame::decode(&raw) {
                Ok(frame) => {
                    if let Some(stopped) = self.dispatch(frame).await {
                        return stopped;
                    }
                }
                Err(error) => debug!(%error, "dropping malformed frame"),
            }
        }
    }

    // Handlers borrow `&mut self` so the spawned future needs `R: Send` only.
    async fn dispatch(&mut self, frame: Frame) -> Option<Stopped> {
        match frame.command() {
            Command::Message => {
                self.handle_message(&frame).await;
                None
            }
            Command::Receipt => self.handle_receipt(&frame).await,
            Command::Error => Some(self.handle_error(&frame).await),
            other => {
                debug!(command = %other, "ignoring frame");
                None
            }
        }
    }

    async fn handle_message(&mut self, frame: &Frame) {
        if let Some(id) = frame.get("ack") {
            if let Err(error) = self.writer.send(&encoder::ack(id)).await {
                warn!(?error, ack = id, "failed to acknowledge message");
            }
        }

        // Without a destination there is nothing meaningful to show.
        if let Some(destination) = frame.get("destination") {
            self.console
                .say(&format!("Message from {destination}: {}", frame.body()))
                .await;
        }
    }

    async fn handle_receipt(&mut self, frame: &Frame) -> Option<Stopped> {
        let receipt = frame
            .get("receipt-id")
            .and_then(|id| id.trim().parse::<ReceiptId>().ok())?;
        let action = match self.registry.resolve_receipt(receipt) {
            Some(action) => action,
            None => {
                debug!(receipt, "ignoring unknown receipt");
                return None;
            }
        };

        self.console.say(&format!("Confirmed: {action}")).await;
        (action == PendingAction::Disconnect).then_some(Stopped::LoggedOut)
    }

    async fn handle_error(&mut self, frame: &Frame) -> Stopped {
        let reason = match (frame.body().trim(), frame.get("message")) {
            ("", Some(message)) => message,
            (body, _) => body,
        };
        self.console.say(&format!("Server Error: {reason}")).await;
        Stopped::ServerError
    }

    async fn connection_lost(&mut self) -> Stopped {
        self.console.say("Disconnected from server").await;
        Stopped::ConnectionLost
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        io,
        marker::PhantomData,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream, ReadBuf, duplex},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    struct Harness {
        /// Broker side: frames written here reach the dispatcher.
        inbound: DuplexStream,
        /// Broker side: frames the dispatcher sends (ACKs).
        outbound: FrameReader<BufReader<DuplexStream>>,
        console: BufReader<DuplexStream>,
        registry: Arc<CorrelationRegistry>,
        termination: Termination,
        task: JoinHandle<Stopped>,
    }

    impl Harness {
        fn start() -> Self {
            let (inbound, client_read) = duplex(4096);
            let (client_write, broker_read) = duplex(4096);
            let (console_out, console_in) = duplex(4096);

            let registry = Arc::new(CorrelationRegistry::new());
            let termination = Termination::new();
            let dispatcher = Dispatcher::new(
                FrameReader::new(BufReader::new(client_read)),
                Arc::new(FrameWriter::new(client_write)),
                Arc::clone(&registry),
                Console::new(console_out),
                termination.clone(),
            );

            Self {
                inbound,
                outbound: FrameReader::new(BufReader::new(broker_read)),
                console: BufReader::new(console_in),
                registry,
                termination,
                task: tokio::spawn(dispatcher.run()),
            }
        }

        async fn deliver(&mut self, raw: &str) {
            self.inbound.write_all(raw.as_bytes()).await.expect("deliver");
            self.inbound.write_all(b"\0").await.expect("deliver");
        }

        async fn console_line(&mut self) -> String {
            let mut line = String::new();
            timeout(WAIT, self.console.read_line(&mut line))
                .await
                .expect("console line in time")
                .expect("console read");
            line.trim_end().to_string()
        }

        async fn sent_frame(&mut self) -> Frame {
            let raw = timeout(WAIT, self.outbound.read_frame())
                .await
                .expect("frame in time")
                .expect("read frame")
                .expect("frame");
            Frame::decode(&raw).expect("valid frame")
        }

        async fn stopped(self) -> Stopped {
            timeout(WAIT, self.task)
                .await
                .expect("dispatcher should stop")
                .expect("dispatcher task")
        }
    }

    #[tokio::test]
    async fn message_is_acked_and_printed() {
        let mut harness = Harness::start();

        harness
            .deliver("MESSAGE\ndestination:/topic/news\nack:7\n\nHello")
            .await;

        let ack = harness.sent_frame().await;
        assert_eq!(ack.encode(), "ACK\nid:7\n\n");
        assert_eq!(
            harness.console_line().await,
            "Message from /topic/news: Hello"
        );
    }

    #[tokio::test]
    async fn message_without_destination_is_acked_silently() {
        let mut harness = Harness::start();

        harness.deliver("MESSAGE\nack:3\n\nhidden").await;
        harness
            .deliver("MESSAGE\ndestination:/b\n\nshown")
            .await;

        assert_eq!(harness.sent_frame().await.get("id"), Some("3"));
        assert_eq!(harness.console_line().await, "Message from /b: shown");
    }

    #[tokio::test]
    async fn join_receipt_is_confirmed_once() {
        let mut harness = Harness::start();
        let (receipt, _) = harness.registry.record_join("/topic/news");

        let frame = format!("RECEIPT\nreceipt-id:{receipt}\n\n");
        harness.deliver(&frame).await;
        harness.deliver(&frame).await;
        harness.deliver("RECEIPT\nreceipt-id:999\n\n").await;
        harness.deliver("MESSAGE\ndestination:/marker\n\nend").await;

        assert_eq!(
            harness.console_line().await,
            "Confirmed: Joined channel: /topic/news"
        );
        // Duplicate and unknown receipts print nothing.
        assert_eq!(harness.console_line().await, "Message from /marker: end");
        assert_eq!(harness.registry.outstanding_receipts(), 0);
        assert!(!harness.termination.is_set());
    }

    #[tokio::test]
    async fn disconnect_receipt_terminates_session() {
        let mut harness = Harness::start();
        let receipt = harness.registry.record_disconnect();

        harness
            .deliver(&format!("RECEIPT\nreceipt-id:{receipt}\n\n"))
            .await;

        assert_eq!(harness.console_line().await, "Confirmed: DISCONNECT");
        let termination = harness.termination.clone();
        assert_eq!(harness.stopped().await, Stopped::LoggedOut);
        assert!(termination.is_set());
    }

    #[tokio::test]
    async fn error_frame_terminates_session() {
        let mut harness = Harness::start();

        harness.deliver("ERROR\n\nBad frame").await;

        assert_eq!(harness.console_line().await, "Server Error: Bad frame");
        let termination = harness.termination.clone();
        assert_eq!(harness.stopped().await, Stopped::ServerError);
        assert!(termination.is_set());
    }

    #[tokio::test]
    async fn error_without_body_reports_message_header() {
        let mut harness = Harness::start();

        harness
            .deliver("ERROR\nmessage:Wrong password\n\n")
            .await;

        assert_eq!(
            harness.console_line().await,
            "Server Error: Wrong password"
        );
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_skipped() {
        let mut harness = Harness::start();

        harness.deliver("garbage-without-newline").await;
        harness.deliver("CONNECTED\nversion:1.2\n\n").await;
        harness.deliver("BEGIN\n\n").await;
        harness
            .deliver("MESSAGE\ndestination:/c\n\nstill listening")
            .await;

        assert_eq!(
            harness.console_line().await,
            "Message from /c: still listening"
        );
    }

    #[tokio::test]
    async fn closed_connection_terminates_session() {
        let mut harness = Harness::start();

        harness.inbound.shutdown().await.expect("close inbound");

        assert_eq!(harness.console_line().await, "Disconnected from server");
        let termination = harness.termination.clone();
        assert_eq!(harness.stopped().await, Stopped::ConnectionLost);
        assert!(termination.is_set());
    }

    #[tokio::test]
    async fn external_termination_stops_listening() {
        let harness = Harness::start();

        harness.termination.trigger();

        assert_eq!(harness.stopped().await, Stopped::Terminated);
    }

    /// Reader that may move between threads but cannot be shared by them.
    struct SendOnly<R> {
        inner: R,
        _not_sync: PhantomData<Cell<()>>,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for SendOnly<R> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl<R: AsyncBufRead + Unpin> AsyncBufRead for SendOnly<R> {
        fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
            Pin::new(&mut self.get_mut().inner).poll_fill_buf(cx)
        }

        fn consume(mut self: Pin<&mut Self>, amt: usize) {
            Pin::new(&mut self.inner).consume(amt)
        }
    }

    #[tokio::test]
    async fn runs_as_task_over_reader_that_is_not_sync() {
        let (mut inbound, client_read) = duplex(4096);
        let (client_write, _broker_read) = duplex(4096);
        let (console_out, console_in) = duplex(4096);

        let reader = SendOnly {
            inner: BufReader::new(client_read),
            _not_sync: PhantomData,
        };
        let task = tokio::spawn(
            Dispatcher::new(
                FrameReader::new(reader),
                Arc::new(FrameWriter::new(client_write)),
                Arc::new(CorrelationRegistry::new()),
                Console::new(console_out),
                Termination::new(),
            )
            .run(),
        );

        inbound
            .write_all(b"ERROR\nmessage:boom\n\n\0")
            .await
            .expect("deliver");

        let mut line = String::new();
        timeout(WAIT, BufReader::new(console_in).read_line(&mut line))
            .await
            .expect("console line in time")
            .expect("console read");
        assert_eq!(line.trim_end(), "Server Error: boom");
        assert_eq!(
            timeout(WAIT, task)
                .await
                .expect("dispatcher should stop")
                .expect("dispatcher task"),
            Stopped::ServerError
        );
    }
}
