//! STOMP 1.2 chat client, plus a small broker to talk to.
//!
//! The client joins and leaves channels and exchanges messages over a
//! null-terminated text frame protocol. Modules, leaves first:
//!
//! - [`frame`] models frames and converts them to and from wire text.
//! - [`transport`] reads and writes null-terminated frames on a byte stream.
//! - [`registry`] tracks receipts still awaited and channel subscriptions.
//! - [`encoder`] builds the frames for each client-initiated operation.
//! - [`dispatcher`] reacts to frames arriving from the broker.
//! - [`relay`] moves console lines onto a queue from a dedicated thread.
//! - [`session`] runs the logged-in loops and shuts them down together.
//! - [`client`] handles login on the console and then drives a session.
//! - [`broker`] is a minimal STOMP broker, used for local runs and tests.
//!
//! [`input`], [`console`] and [`termination`] are the small pieces shared
//! between them; [`cli`] parses the command line.

pub mod broker;
pub mod cli;
pub mod client;
pub mod console;
pub mod dispatcher;
pub mod encoder;
pub mod frame;
pub mod input;
pub mod registry;
pub mod relay;
pub mod session;
pub mod termination;
pub mod transport;
