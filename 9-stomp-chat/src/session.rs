//! A logged-in session and the loop that turns console commands into frames.
//!
//! [`Session::run`] starts the [`Dispatcher`] as a tokio task and the input
//! relay as a thread. It then polls the input queue until the termination
//! flag is set. On the way out it waits for the dispatcher before closing the
//! connection, so nothing is still reading from a transport being torn down.

use std::{io::BufRead, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    select,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    console::Console,
    dispatcher::{Dispatcher, Stopped},
    encoder,
    frame::Frame,
    input::SessionCommand,
    registry::CorrelationRegistry,
    relay::{InputQueue, spawn_input_relay},
    termination::Termination,
    transport::{FrameReader, FrameWriter},
};

/// Upper bound on how long a queued command waits before it is sent.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Session<R, W> {
    reader: FrameReader<R>,
    writer: Arc<FrameWriter<W>>,
    registry: Arc<CorrelationRegistry>,
    queue: Arc<InputQueue>,
    termination: Termination,
    console: Console,
    poll_interval: Duration,
}

impl<R, W> Session<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: FrameReader<R>, writer: FrameWriter<W>, console: Console) -> Self {
        Self {
            reader,
            writer: Arc::new(writer),
            registry: Arc::new(CorrelationRegistry::new()),
            queue: Arc::new(InputQueue::new()),
            termination: Termination::new(),
            console,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn termination(&self) -> Termination {
        self.termination.clone()
    }

    pub fn queue(&self) -> Arc<InputQueue> {
        Arc::clone(&self.queue)
    }

    pub fn registry(&self) -> Arc<CorrelationRegistry> {
        Arc::clone(&self.registry)
    }

    /// Runs the session until the termination flag is set.
    ///
    /// `input` feeds the relay thread. If the relay is still blocked on a
    /// read when the session ends it is left behind; process exit reclaims
    /// it.
    pub async fn run<I>(self, input: I) -> Result<Stopped>
    where
        I: BufRead + Send + 'static,
    {
        let Session {
            reader,
            writer,
            registry,
            queue,
            termination,
            console,
            poll_interval,
        } = self;

        let relay = spawn_input_relay(input, Arc::clone(&queue), termination.clone())
            .context("failed to start input relay")?;
        let dispatcher = tokio::spawn(
            Dispatcher::new(
                reader,
                Arc::clone(&writer),
                Arc::clone(&registry),
                console.clone(),
                termination.clone(),
            )
            .run(),
        );

        let commands = CommandLoop {
            writer: &writer,
            registry: &registry,
            queue: &queue,
            termination: &termination,
            console: &console,
            poll_interval,
        };
        commands.run().await;
        if !queue.is_empty() {
            debug!(unsent = queue.len(), "discarding queued console input");
        }

        let stopped = dispatcher.await.context("inbound dispatcher panicked")?;
        info!(?stopped, "session finished");

        if let Err(error) = writer.close().await {
            debug!(?error, "connection already closed");
        }

        if relay.is_finished() {
            if relay.join().is_err() {
                warn!("input relay panicked");
            }
        } else {
            debug!("input relay still waiting on console input");
        }

        Ok(stopped)
    }
}

struct CommandLoop<'a, W> {
    writer: &'a FrameWriter<W>,
    registry: &'a CorrelationRegistry,
    queue: &'a InputQueue,
    termination: &'a Termination,
    console: &'a Console,
    poll_interval: Duration,
}

impl<W> CommandLoop<'_, W>
where
    W: AsyncWrite + Unpin,
{
    async fn run(&self) {
        while !self.termination.is_set() {
            if let Some(line) = self.queue.pop() {
                self.handle_line(&line).await;
            }

            select! {
                _ = sleep(self.poll_interval) => {}
                _ = self.termination.triggered() => break,
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let Some(command) = SessionCommand::parse(line) else {
            debug!(line, "ignoring console input");
            return;
        };

        match command {
            SessionCommand::Logout => self.send(encoder::disconnect(self.registry)).await,
            SessionCommand::Join { destination } => {
                self.send(encoder::join(self.registry, &destination)).await
            }
            SessionCommand::Send { destination, body } => {
                self.send(encoder::publish(&destination, &body)).await
            }
            SessionCommand::Exit { destination } => self.leave(&destination).await,
        }
    }

    async fn leave(&self, destination: &str) {
        match self.registry.binding_for(destination) {
            Some(subscription) => {
                self.send(encoder::leave(subscription)).await;
                self.registry.unbind(destination);
            }
            None => {
                self.console
                    .say(&format!("Error: Not subscribed to channel {destination}"))
                    .await
            }
        }
    }

    /// Failed sends are not retried; a broken connection surfaces through
    /// the dispatcher.
    async fn send(&self, frame: Frame) {
        if let Err(error) = self.writer.send(&frame).await {
            warn!(?error, command = %frame.command(), "failed to send frame");
        }
    }
}
