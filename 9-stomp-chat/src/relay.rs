//! Moves console lines onto a queue so nothing else blocks on stdin.
//!
//! The relay runs on its own OS thread because a console read cannot be
//! cancelled: it only notices termination after the current read returns.

use std::{
    collections::VecDeque,
    io::{self, BufRead},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

use tracing::{debug, warn};

use crate::termination::Termination;

/// FIFO of raw console lines, guarded independently of the registry.
#[derive(Debug, Default)]
pub struct InputQueue {
    lines: Mutex<VecDeque<String>>,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, line: impl Into<String>) {
        self.lock().push_back(line.into());
    }

    /// Takes the oldest line without waiting.
    pub fn pop(&self) -> Option<String> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

pub fn spawn_input_relay<I>(
    input: I,
    queue: Arc<InputQueue>,
    termination: Termination,
) -> io::Result<JoinHandle<()>>
where
    I: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("input-relay".to_string())
        .spawn(move || relay_lines(input, &queue, &termination))
}

/// Pushes every line read from `input` until termination or end of input.
pub fn relay_lines<I: BufRead>(mut input: I, queue: &InputQueue, termination: &Termination) {
    let mut line = String::new();
    while !termination.is_set() {
        line.clear();
        match input.read_line(&mut line) {
            Ok(0) => {
                debug!("console input closed");
                break;
            }
            Ok(_) => queue.push(line.trim_end_matches(['\r', '\n'])),
            Err(error) => {
                warn!(?error, "failed to read console input");
                break;
            }
        }
    }
}
