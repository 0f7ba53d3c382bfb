//! STOMP frame model and its text codec.
//!
//! A frame on the wire is a command line, `key:value` header lines, a blank
//! line and an optional body. The null terminator is the transport's concern
//! (see [`crate::transport`]); [`Frame::encode`] and [`Frame::decode`] only
//! deal with the text in between.
//!
//! Header values are not escaped. A value containing a newline produces a
//! frame the peer cannot parse back.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Byte that terminates every frame on the wire.
pub const FRAME_TERMINATOR: u8 = b'\0';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
    Ack,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Ack => "ACK",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = DecodeError;

    fn from_str(word: &str) -> Result<Self, Self::Err> {
        let command = match word {
            "CONNECT" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            "ACK" => Command::Ack,
            other => return Err(DecodeError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame has no command line")]
    MissingCommandLine,
    #[error("unknown frame command '{0}'")]
    UnknownCommand(String),
}

/// One protocol message: command, headers and body.
///
/// Headers keep insertion order so encoded frames are deterministic. Setting a
/// key twice replaces the earlier value in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    headers: Vec<(String, String)>,
    body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Adds a header, replacing any previous value for the same key.
    pub fn header(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        let value = value.to_string();
        match self.headers.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.headers.push((key, value)),
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Renders the frame as wire text, without the terminator.
    pub fn encode(&self) -> String {
        let mut text = String::with_capacity(self.encoded_len_hint());
        text.push_str(self.command.as_str());
        text.push('\n');
        for (key, value) in &self.headers {
            text.push_str(key);
            text.push(':');
            text.push_str(value);
            text.push('\n');
        }
        text.push('\n');
        text.push_str(&self.body);
        text
    }

    /// Parses wire text (terminator already stripped) back into a frame.
    ///
    /// The first blank line after the command line (`\n\n`, or `\n\r\n` when
    /// lines end in CRLF) splits headers from body, so a frame with no
    /// headers such as `ERROR\n\nBad frame` still yields its body. Header
    /// lines without a colon are skipped.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        // Heart-beats arrive as bare EOLs between frames.
        let raw = raw.trim_start_matches(['\r', '\n']);
        let command_end = raw.find('\n').ok_or(DecodeError::MissingCommandLine)?;
        let command = raw[..command_end].trim_end_matches('\r').parse()?;

        let rest = &raw[command_end..];
        let (header_block, body) = match header_end(rest) {
            Some((split, separator)) => (&rest[..split], &rest[split + separator..]),
            None => (rest, ""),
        };

        let frame = header_block
            .lines()
            .filter_map(|line| line.trim_end_matches('\r').split_once(':'))
            .fold(Frame::new(command), |frame, (key, value)| {
                frame.header(key, value)
            });

        Ok(frame.with_body(body))
    }

    fn encoded_len_hint(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(key, value)| key.len() + value.len() + 2)
            .sum();
        self.command.as_str().len() + headers + self.body.len() + 2
    }
}

/// Offset and length of the blank line that ends the header block.
fn header_end(rest: &str) -> Option<(usize, usize)> {
    let lf = rest.find("\n\n").map(|at| (at, 2));
    let crlf = rest.find("\n\r\n").map(|at| (at, 3));
    match (lf, crlf) {
        (Some(lf), Some(crlf)) => Some(lf.min(crlf)),
        (lf, crlf) => lf.or(crlf),
    }
}
