//! Shared deadline scheduler.
//!
//! One background task serves every registered handler, so arming and
//! disarming an idle timeout is a channel send rather than a spawned timer.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Callback invoked by [`Timeouts`] once a deadline passes.
pub trait TimeoutHandler: Send + Sync {
    fn on_timeout(&self);
}

enum Command {
    Upsert {
        key: u64,
        handler: Weak<dyn TimeoutHandler>,
        deadline: Instant,
    },
    Remove(u64),
}

struct Entry {
    handler: Weak<dyn TimeoutHandler>,
    deadline: Instant,
}

pub struct Timeouts {
    commands: mpsc::UnboundedSender<Command>,
    next_key: AtomicU64,
    shutdown: CancellationToken,
}

impl Timeouts {
    /// Spawns the scheduler task; must be called inside a tokio runtime.
    pub fn start() -> Arc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run(receiver, shutdown.clone()));
        Arc::new(Self {
            commands,
            next_key: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Arms `key` to fire at `deadline`. An already armed key is only moved
    /// to a later deadline, never to an earlier one.
    pub fn add_or_update_to_later(&self, key: u64, handler: Weak<dyn TimeoutHandler>, deadline: Instant) {
        let _ = self.commands.send(Command::Upsert { key, handler, deadline });
    }

    pub fn remove(&self, key: u64) {
        let _ = self.commands.send(Command::Remove(key));
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Timeouts {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Timeouts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeouts")
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn run(mut receiver: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
    let mut queue: BTreeSet<(Instant, u64)> = BTreeSet::new();
    let mut entries: HashMap<u64, Entry> = HashMap::new();

    loop {
        let next_deadline = queue.iter().next().map(|(deadline, _)| *deadline);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = receiver.recv() => match command {
                Some(Command::Upsert { key, handler, deadline }) => {
                    if let Some(existing) = entries.get_mut(&key) {
                        existing.handler = handler;
                        if existing.deadline >= deadline {
                            continue;
                        }
                        queue.remove(&(existing.deadline, key));
                        existing.deadline = deadline;
                    } else {
                        entries.insert(key, Entry { handler, deadline });
                    }
                    queue.insert((deadline, key));
                }
                Some(Command::Remove(key)) => {
                    if let Some(entry) = entries.remove(&key) {
                        queue.remove(&(entry.deadline, key));
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                let now = Instant::now();
                while let Some(&(deadline, key)) = queue.iter().next() {
                    if deadline > now {
                        break;
                    }
                    queue.remove(&(deadline, key));
                    if let Some(handler) = entries.remove(&key).and_then(|entry| entry.handler.upgrade()) {
                        handler.on_timeout();
                    }
                }
            }
        }
    }

    tracing::debug!(pending = entries.len(), "Timeout scheduler stopped");
}
