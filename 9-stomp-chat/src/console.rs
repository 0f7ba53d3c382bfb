use std::{io, sync::Arc};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::warn;

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-oriented user console shared by every part of a session.
///
/// Each call writes one whole line and flushes, so lines from the session
/// loop and the dispatcher never interleave.
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Sink>>,
}

impl Console {
    pub fn new<W>(out: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await
    }

    /// Like [`Console::write_line`], but a failed write is only logged.
    pub async fn say(&self, line: &str) {
        if let Err(error) = self.write_line(line).await {
            warn!(?error, "failed to write console line");
        }
    }
}
