//! Correlation of submitted commands with their asynchronous outcome.
//!
//! Every command sent on the push channel is registered in the [`CommandTracker`] under the
//! caller's request identifier. The entry is settled exactly once: by a terminal status frame,
//! by its own timeout, or by [`CommandTracker::fail_all`] on shutdown.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use strum_macros::Display;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use crate::error::{Error, Kind};
use crate::frame::CommandErrorDetail;

/// Outcome delivered to the submitter of a command.
pub type CommandOutcome = std::result::Result<(), CommandError>;

/// Lifecycle state of a command as reported by the service.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandState {
    Unknown,
    Initiated,
    Enqueued,
    Processing,
    Waiting,
    Finished,
    Failed,
}

impl CommandState {
    /// Map the numeric wire code. Codes this client does not know map to
    /// [`CommandState::Unknown`].
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Initiated,
            2 => Self::Enqueued,
            3 => Self::Processing,
            4 => Self::Waiting,
            5 => Self::Finished,
            6 => Self::Failed,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Why a command did not succeed.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The service reported the command as failed
    Failed {
        request_id: String,
        errors: Vec<CommandErrorDetail>,
    },
    /// No terminal status arrived in time
    TimedOut { request_id: String, after: Duration },
    /// Another command with the same request identifier is still in flight
    DuplicateRequestId(String),
    /// No connection became ready within the configured wait
    NotConnected,
    /// The connection was shut down while the command was in flight
    Disconnected { request_id: String },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { request_id, errors } if errors.is_empty() => {
                write!(f, "command {request_id} failed without error details")
            }
            Self::Failed { request_id, errors } => {
                write!(f, "command {request_id} failed: ")?;
                for (i, error) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "[{}] {}", error.code, error.message)?;
                }
                Ok(())
            }
            Self::TimedOut { request_id, after } => {
                write!(f, "command {request_id} timed out after {after:?}")
            }
            Self::DuplicateRequestId(request_id) => {
                write!(f, "command {request_id} is already in flight")
            }
            Self::NotConnected => write!(f, "push channel is not connected"),
            Self::Disconnected { request_id } => {
                write!(f, "connection closed before command {request_id} completed")
            }
        }
    }
}

impl StdError for CommandError {}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Error::with_source(Kind::Command, e)
    }
}

struct PendingCommand {
    completion: oneshot::Sender<CommandOutcome>,
    timeout: JoinHandle<()>,
    submitted_at: Instant,
    /// Distinguishes this registration from a later one reusing the request id
    ticket: u64,
}

/// Registry of in-flight commands keyed by request identifier.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct CommandTracker {
    pending: Arc<DashMap<String, PendingCommand>>,
    tickets: Arc<AtomicU64>,
}

impl fmt::Debug for CommandTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTracker")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl CommandTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `request_id` and arm its timeout.
    ///
    /// The returned receiver yields the single outcome for this command. Must be called from
    /// within a tokio runtime.
    pub fn register(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> std::result::Result<oneshot::Receiver<CommandOutcome>, CommandError> {
        match self.pending.entry(request_id.to_owned()) {
            Entry::Occupied(_) => Err(CommandError::DuplicateRequestId(request_id.to_owned())),
            Entry::Vacant(entry) => {
                let (completion, receiver) = oneshot::channel();
                let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
                let timer = self.spawn_timeout(request_id.to_owned(), ticket, timeout);

                entry.insert(PendingCommand {
                    completion,
                    timeout: timer,
                    submitted_at: Instant::now(),
                    ticket,
                });

                #[cfg(feature = "tracing")]
                tracing::debug!(request_id, ?timeout, "Registered command");

                Ok(receiver)
            }
        }
    }

    fn spawn_timeout(
        &self,
        request_id: String,
        ticket: u64,
        after: Duration,
    ) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        // Clamps timeouts too large to schedule instead of overflowing the deadline.
        let expiry = sleep(after);

        tokio::spawn(async move {
            expiry.await;

            if let Some((request_id, command)) =
                pending.remove_if(&request_id, |_, command| command.ticket == ticket)
            {
                #[cfg(feature = "tracing")]
                tracing::warn!(%request_id, ?after, "Command timed out");

                _ = command
                    .completion
                    .send(Err(CommandError::TimedOut { request_id, after }));
            }
        })
    }

    /// Deliver `outcome` to the command registered under `request_id`.
    ///
    /// Returns `false` when no such command is pending, e.g. for late status updates of a
    /// command that already completed or timed out.
    pub fn settle(&self, request_id: &str, outcome: CommandOutcome) -> bool {
        let Some((_, command)) = self.pending.remove(request_id) else {
            #[cfg(feature = "tracing")]
            tracing::trace!(request_id, "Ignoring outcome for unknown command");
            return false;
        };
        command.timeout.abort();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            request_id,
            success = outcome.is_ok(),
            elapsed = ?command.submitted_at.elapsed(),
            "Command settled"
        );

        // The submitter may have stopped waiting; the entry is gone either way.
        _ = command.completion.send(outcome);
        true
    }

    /// Drop the command without delivering an outcome.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.pending.remove(request_id) {
            Some((_, command)) => {
                command.timeout.abort();
                true
            }
            None => false,
        }
    }

    /// Fail every pending command with the error produced by `error`.
    pub fn fail_all<F>(&self, error: F) -> usize
    where
        F: Fn(&str) -> CommandError,
    {
        let request_ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();

        request_ids
            .into_iter()
            .filter(|request_id| self.settle(request_id, Err(error(request_id))))
            .count()
    }

    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
