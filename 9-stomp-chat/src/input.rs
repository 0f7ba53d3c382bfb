//! Parsing of console lines typed by the user.
//!
//! Before a session exists only `login` is meaningful, see
//! [`LoginRequest::parse`]. Afterwards [`SessionCommand::parse`] recognises
//! the chat commands and ignores everything else.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub passcode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("You must login first")]
    NotLogin,
    #[error("Error: Missing login arguments")]
    MissingArguments,
    #[error("Error: Invalid address format (host:port)")]
    InvalidAddress,
}

impl LoginRequest {
    /// Parses `login <host:port> <username> <password>`.
    ///
    /// The error's `Display` is the exact line shown to the user.
    pub fn parse(line: &str) -> Result<Self, LoginError> {
        let mut words = line.split_whitespace();
        if words.next() != Some("login") {
            return Err(LoginError::NotLogin);
        }

        let (Some(address), Some(login), Some(passcode)) = (words.next(), words.next(), words.next())
        else {
            return Err(LoginError::MissingArguments);
        };

        let (host, port) = address.split_once(':').ok_or(LoginError::InvalidAddress)?;
        let port = port.parse().map_err(|_| LoginError::InvalidAddress)?;
        if host.is_empty() {
            return Err(LoginError::InvalidAddress);
        }

        Ok(Self {
            host: host.to_string(),
            port,
            login: login.to_string(),
            passcode: passcode.to_string(),
        })
    }
}

/// Commands available once logged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Join { destination: String },
    Send { destination: String, body: String },
    Exit { destination: String },
    Logout,
}

impl SessionCommand {
    /// Returns `None` for lines the session should silently ignore:
    /// unknown words, `join`/`exit` without a channel, blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let (word, rest) = next_word(line);
        match word {
            "logout" => Some(SessionCommand::Logout),
            "join" => non_empty(next_word(rest).0).map(|destination| SessionCommand::Join {
                destination: destination.to_string(),
            }),
            "exit" => non_empty(next_word(rest).0).map(|destination| SessionCommand::Exit {
                destination: destination.to_string(),
            }),
            "send" => {
                let (destination, message) = next_word(rest);
                // Only the separator space goes; further spacing is part of the message.
                let body = message.strip_prefix(' ').unwrap_or(message);
                Some(SessionCommand::Send {
                    destination: destination.to_string(),
                    body: body.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Splits off the first whitespace-delimited word; the remainder keeps its
/// leading whitespace.
fn next_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    let end = text.find(char::is_whitespace).unwrap_or(text.len());
    text.split_at(end)
}

fn non_empty(word: &str) -> Option<&str> {
    (!word.is_empty()).then_some(word)
}
