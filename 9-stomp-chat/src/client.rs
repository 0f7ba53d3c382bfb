use std::io::{self, BufRead, BufReader};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    console::Console,
    encoder,
    frame::{Command, Frame},
    input::LoginRequest,
    session::Session,
    termination::Termination,
    transport::{self, FrameReader, FrameWriter, TcpFrameReader, TcpFrameWriter},
};

/// Broker's answer to our CONNECT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Accepted,
    Rejected(String),
    Closed,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let console = Console::stdout();
    let input = BufReader::new(io::stdin());

    let Some((reader, writer, input)) = login(input, &console, &args.virtual_host).await? else {
        return Ok(());
    };

    let session =
        Session::new(reader, writer, console.clone()).with_poll_interval(args.poll_interval());
    watch_ctrl_c(session.termination());

    session.run(input).await?;
    console.say("Exiting application...").await;

    Ok(())
}

/// Reads console lines until a `login` succeeds.
///
/// Returns `None` if the console closes first. The input is handed back so
/// the session's relay continues from the next unread line.
async fn login<I>(
    mut input: I,
    console: &Console,
    virtual_host: &str,
) -> Result<Option<(TcpFrameReader, TcpFrameWriter, I)>>
where
    I: BufRead + Send + 'static,
{
    loop {
        let (returned, line) = read_console_line(input).await?;
        input = returned;
        let Some(line) = line else {
            return Ok(None);
        };

        let request = match LoginRequest::parse(&line) {
            Ok(request) => request,
            Err(error) => {
                console.say(&error.to_string()).await;
                continue;
            }
        };

        if let Some((reader, writer)) = attempt_login(&request, console, virtual_host).await {
            return Ok(Some((reader, writer, input)));
        }
    }
}

async fn attempt_login(
    request: &LoginRequest,
    console: &Console,
    virtual_host: &str,
) -> Option<(TcpFrameReader, TcpFrameWriter)> {
    let (mut reader, writer) = match transport::connect(&request.host, request.port).await {
        Ok(connection) => connection,
        Err(error) => {
            warn!(?error, host = %request.host, port = request.port, "connect failed");
            console.say("Could not connect to server").await;
            return None;
        }
    };
    info!(host = %request.host, port = request.port, "connected");

    let outcome = match handshake(&mut reader, &writer, request, virtual_host).await {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!(?error, "login handshake failed");
            Handshake::Closed
        }
    };

    match outcome {
        Handshake::Accepted => {
            console.say("Login successful").await;
            Some((reader, writer))
        }
        Handshake::Rejected(reason) => {
            console.say(&format!("Login failed: {reason}")).await;
            close_quietly(&writer).await;
            None
        }
        Handshake::Closed => {
            console.say("Login failed: connection closed").await;
            close_quietly(&writer).await;
            None
        }
    }
}

/// Sends CONNECT and waits for the broker's verdict.
pub async fn handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &FrameWriter<W>,
    request: &LoginRequest,
    virtual_host: &str,
) -> io::Result<Handshake>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .send(&encoder::connect(
            virtual_host,
            &request.login,
            &request.passcode,
        ))
        .await?;

    let Some(raw) = reader.read_frame().await? else {
        return Ok(Handshake::Closed);
    };

    let outcome = match Frame::decode(&raw) {
        Ok(frame) if frame.command() == Command::Connected => Handshake::Accepted,
        Ok(frame) if frame.command() == Command::Error => {
            Handshake::Rejected(rejection_reason(&frame))
        }
        Ok(frame) => Handshake::Rejected(format!("unexpected {} frame", frame.command())),
        Err(error) => Handshake::Rejected(error.to_string()),
    };
    Ok(outcome)
}

fn rejection_reason(frame: &Frame) -> String {
    match (frame.get("message"), frame.body().trim()) {
        (Some(message), _) => message.to_string(),
        (None, "") => "server refused the connection".to_string(),
        (None, body) => body.to_string(),
    }
}

/// Blocking console reads run off the async workers.
async fn read_console_line<I>(mut input: I) -> Result<(I, Option<String>)>
where
    I: BufRead + Send + 'static,
{
    let (input, line) = tokio::task::spawn_blocking(move || -> io::Result<_> {
        let mut line = String::new();
        let read = input.read_line(&mut line)?;
        let line = (read > 0).then(|| line.trim_end_matches(['\r', '\n']).to_string());
        Ok((input, line))
    })
    .await
    .context("console reader panicked")?
    .context("failed to read console input")?;
    Ok((input, line))
}

fn watch_ctrl_c(termination: Termination) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, shutting down");
                termination.trigger();
            }
            Err(error) => warn!(?error, "ctrl-c handler failed"),
        }
    });
}

async fn close_quietly<W: AsyncWrite + Unpin>(writer: &FrameWriter<W>) {
    if let Err(error) = writer.close().await {
        warn!(?error, "failed to close connection cleanly");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader as AsyncBufReader, duplex};

    use super::*;

    fn request() -> LoginRequest {
        LoginRequest {
            host: "127.0.0.1".into(),
            port: 61613,
            login: "u".into(),
            passcode: "p".into(),
        }
    }

    #[tokio::test]
    async fn handshake_sends_connect_and_accepts_connected() {
        let (client_io, broker_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (broker_read, mut broker_write) = tokio::io::split(broker_io);
        let mut reader = FrameReader::new(AsyncBufReader::new(client_read));
        let writer = FrameWriter::new(client_write);
        let mut broker = FrameReader::new(AsyncBufReader::new(broker_read));

        broker_write
            .write_all(b"CONNECTED\nversion:1.2\n\n\0")
            .await
            .expect("reply");
        let outcome = handshake(&mut reader, &writer, &request(), encoder::DEFAULT_VIRTUAL_HOST)
            .await
            .expect("handshake");

        assert_eq!(outcome, Handshake::Accepted);
        assert_eq!(
            broker.read_frame().await.expect("read").as_deref(),
            Some("CONNECT\naccept-version:1.2\nhost:stomp.cs.bgu.ac.il\nlogin:u\npasscode:p\n\n")
        );
    }

    #[tokio::test]
    async fn handshake_reports_error_message() {
        let (client_io, broker_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (_broker_read, mut broker_write) = tokio::io::split(broker_io);
        let mut reader = FrameReader::new(AsyncBufReader::new(client_read));
        let writer = FrameWriter::new(client_write);

        broker_write
            .write_all(b"ERROR\nmessage:Wrong password\n\n\0")
            .await
            .expect("reply");
        let outcome = handshake(&mut reader, &writer, &request(), "vhost")
            .await
            .expect("handshake");

        assert_eq!(outcome, Handshake::Rejected("Wrong password".into()));
    }

    #[tokio::test]
    async fn handshake_notices_closed_connection() {
        let (client_io, broker_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut reader = FrameReader::new(AsyncBufReader::new(client_read));
        let writer = FrameWriter::new(client_write);
        drop(broker_io);

        let outcome = handshake(&mut reader, &writer, &request(), "vhost").await;

        // Writing to a dropped peer may fail before the read sees EOF.
        assert!(matches!(outcome, Ok(Handshake::Closed) | Err(_)));
    }
}
