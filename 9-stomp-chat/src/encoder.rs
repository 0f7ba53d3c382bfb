//! Frames for the operations a client initiates.
//!
//! Only SUBSCRIBE and DISCONNECT ask for a receipt; their ids come from the
//! [`CorrelationRegistry`] so the dispatcher can match the broker's answer.

use crate::{
    frame::{Command, Frame},
    registry::{CorrelationRegistry, SubscriptionId},
};

pub const ACCEPT_VERSION: &str = "1.2";
pub const DEFAULT_VIRTUAL_HOST: &str = "stomp.cs.bgu.ac.il";
/// Every delivered message must be acknowledged on its own.
pub const ACK_MODE: &str = "client-individual";

/// CONNECT is answered with CONNECTED or ERROR, never a receipt.
pub fn connect(host: &str, login: &str, passcode: &str) -> Frame {
    Frame::new(Command::Connect)
        .header("accept-version", ACCEPT_VERSION)
        .header("host", host)
        .header("login", login)
        .header("passcode", passcode)
}

pub fn join(registry: &CorrelationRegistry, destination: &str) -> Frame {
    let (receipt, subscription) = registry.record_join(destination);
    Frame::new(Command::Subscribe)
        .header("destination", destination)
        .header("id", subscription)
        .header("receipt", receipt)
        .header("ack", ACK_MODE)
}

pub fn publish(destination: &str, body: &str) -> Frame {
    Frame::new(Command::Send)
        .header("destination", destination)
        .with_body(body)
}

pub fn leave(subscription: SubscriptionId) -> Frame {
    Frame::new(Command::Unsubscribe).header("id", subscription)
}

/// The session only counts as cleanly closed once this receipt comes back.
pub fn disconnect(registry: &CorrelationRegistry) -> Frame {
    let receipt = registry.record_disconnect();
    Frame::new(Command::Disconnect).header("receipt", receipt)
}

pub fn ack(id: &str) -> Frame {
    Frame::new(Command::Ack).header("id", id)
}
