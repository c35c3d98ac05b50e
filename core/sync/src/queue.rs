//! Durable command queue for eventual saves and deletes.
//!
//! Commands are journaled to disk before `enqueue` returns and the journal
//! is rewritten after every state change, so a restart picks up exactly the
//! commands that had not reached a terminal state. Commands for the same
//! object identity form a lane: only the oldest command of a lane can be
//! dispatched, and only while no other command of that lane is in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use eaves_common::{Error, ObjectRef, Result};
use eaves_model::SaveDelta;

/// Identifier of a queued command.
pub type CommandId = Uuid;

/// What a queued command does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    /// Create or update, depending on whether the target has an object id
    /// when the command is dispatched.
    Save { delta: SaveDelta },
    Delete,
}

/// Lifecycle of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    InFlight,
    Completed,
    FailedTerminal,
}

/// A command waiting to reach the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub id: CommandId,
    /// Enqueue order, unique and increasing.
    pub seq: u64,
    /// Object the command applies to. Rewritten when the object is created.
    pub target: ObjectRef,
    pub kind: CommandKind,
    pub status: CommandStatus,
    /// Session of the actor that enqueued the command.
    pub session_token: Option<String>,
    /// Failed dispatch attempts so far.
    pub attempts: u32,
    /// Not dispatchable before this instant.
    pub not_before: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Error code of the terminal failure, if any.
    #[serde(default)]
    pub error_code: Option<i64>,
}

/// Notification about queue progress.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued {
        id: CommandId,
        target: ObjectRef,
    },
    Completed {
        id: CommandId,
        target: ObjectRef,
    },
    Retrying {
        id: CommandId,
        attempts: u32,
        message: String,
    },
    Failed {
        id: CommandId,
        target: ObjectRef,
        code: i64,
        message: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Journal {
    next_seq: u64,
    commands: Vec<QueuedCommand>,
    #[serde(default)]
    failed: Vec<QueuedCommand>,
}

/// Durable FIFO of commands, ordered per object identity.
pub struct CommandQueue {
    commands: BTreeMap<u64, QueuedCommand>,
    failed: Vec<QueuedCommand>,
    next_seq: u64,
    /// Path to persist the journal. `None` keeps the queue in memory.
    journal_path: Option<PathBuf>,
    events: broadcast::Sender<QueueEvent>,
}

impl CommandQueue {
    /// Create a queue that is not persisted.
    pub fn in_memory() -> Self {
        Self::from_journal(Journal::default(), None)
    }

    /// Open the queue journaled at `journal_path`.
    ///
    /// Commands that were in flight when the process stopped are pending
    /// again.
    ///
    /// # Errors
    /// - Unreadable or corrupt journal
    pub async fn open(journal_path: impl AsRef<Path>) -> Result<Self> {
        let journal_path = journal_path.as_ref().to_path_buf();
        if let Some(parent) = journal_path.parent() {
            fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }

        let journal = if journal_path.exists() {
            let content = fs::read_to_string(&journal_path)
                .await
                .map_err(Error::Io)?;
            serde_json::from_str(&content).map_err(|e| {
                Error::Serialization(format!(
                    "Corrupt command journal {}: {}",
                    journal_path.display(),
                    e
                ))
            })?
        } else {
            Journal::default()
        };

        let queue = Self::from_journal(journal, Some(journal_path));
        if !queue.commands.is_empty() {
            info!("Reloaded {} queued commands", queue.commands.len());
        }
        Ok(queue)
    }

    fn from_journal(journal: Journal, journal_path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(256);
        let commands = journal
            .commands
            .into_iter()
            .map(|mut command| {
                if command.status == CommandStatus::InFlight {
                    command.status = CommandStatus::Pending;
                }
                (command.seq, command)
            })
            .collect::<BTreeMap<_, _>>();
        let next_seq = commands
            .keys()
            .next_back()
            .map(|seq| seq + 1)
            .unwrap_or(0)
            .max(journal.next_seq);
        Self {
            commands,
            failed: journal.failed,
            next_seq,
            journal_path,
            events,
        }
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Append a command. It is durable when this returns.
    pub async fn enqueue(
        &mut self,
        target: ObjectRef,
        kind: CommandKind,
        session_token: Option<String>,
    ) -> Result<CommandId> {
        let command = QueuedCommand {
            id: Uuid::new_v4(),
            seq: self.next_seq,
            target: target.clone(),
            kind,
            status: CommandStatus::Pending,
            session_token,
            attempts: 0,
            not_before: None,
            enqueued_at: Utc::now(),
            last_error: None,
            error_code: None,
        };
        let id = command.id;
        self.next_seq += 1;
        self.commands.insert(command.seq, command);

        if let Err(e) = self.persist().await {
            self.next_seq -= 1;
            self.commands.remove(&self.next_seq);
            return Err(e);
        }

        debug!("Enqueued command {} for {}", id, target);
        self.emit(QueueEvent::Enqueued { id, target });
        Ok(id)
    }

    /// Claim every dispatchable lane head and mark it in flight.
    ///
    /// A lane head is dispatchable once it is pending and past its backoff.
    /// A lane whose head is in flight yields nothing.
    pub async fn take_ready(&mut self, now: DateTime<Utc>) -> Result<Vec<QueuedCommand>> {
        let mut seen: HashSet<ObjectRef> = HashSet::new();
        let mut ready = Vec::new();
        for command in self.commands.values() {
            if !seen.insert(command.target.clone()) {
                continue;
            }
            let due = command.not_before.is_none_or(|t| t <= now);
            if command.status == CommandStatus::Pending && due {
                ready.push(command.seq);
            }
        }
        if ready.is_empty() {
            return Ok(Vec::new());
        }

        for seq in &ready {
            if let Some(command) = self.commands.get_mut(seq) {
                command.status = CommandStatus::InFlight;
            }
        }
        if let Err(e) = self.persist().await {
            for seq in &ready {
                if let Some(command) = self.commands.get_mut(seq) {
                    command.status = CommandStatus::Pending;
                }
            }
            return Err(e);
        }
        Ok(ready
            .iter()
            .filter_map(|seq| self.commands.get(seq).cloned())
            .collect())
    }

    fn position(&self, id: CommandId) -> Result<u64> {
        self.commands
            .values()
            .find(|c| c.id == id)
            .map(|c| c.seq)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown command {}", id)))
    }

    /// Remove a command that reached the remote service successfully.
    pub async fn complete(&mut self, id: CommandId) -> Result<()> {
        let seq = self.position(id)?;
        let Some(mut command) = self.commands.remove(&seq) else {
            return Ok(());
        };
        command.status = CommandStatus::Completed;
        self.persist().await?;
        debug!("Completed command {}", id);
        self.emit(QueueEvent::Completed {
            id,
            target: command.target,
        });
        Ok(())
    }

    /// Complete a create and move every remaining command of the created
    /// object to its new identity.
    ///
    /// Pointer values in other commands' deltas are rewritten as well.
    pub async fn complete_create(
        &mut self,
        id: CommandId,
        created: &ObjectRef,
    ) -> Result<usize> {
        let seq = self.position(id)?;
        let Some(mut command) = self.commands.remove(&seq) else {
            return Ok(0);
        };
        let previous = command.target.clone();
        let rewritten = self.rewrite_identity(&previous, created);
        command.status = CommandStatus::Completed;
        self.persist().await?;
        debug!("Created {} from {}, rewrote {} commands", created, previous, rewritten);
        self.emit(QueueEvent::Completed {
            id,
            target: created.clone(),
        });
        Ok(rewritten)
    }

    /// Move every command of an object created outside the queue to its
    /// new identity.
    pub async fn reassign(&mut self, from: &ObjectRef, to: &ObjectRef) -> Result<usize> {
        let rewritten = self.rewrite_identity(from, to);
        if rewritten > 0 {
            self.persist().await?;
        }
        Ok(rewritten)
    }

    fn rewrite_identity(&mut self, from: &ObjectRef, to: &ObjectRef) -> usize {
        let mut changed = 0;
        for command in self.commands.values_mut() {
            let mut touched = false;
            if command.target == *from {
                command.target = to.clone();
                touched = true;
            }
            if let CommandKind::Save { delta } = &mut command.kind {
                touched |= delta.rewrite_ref(from, to);
            }
            if touched {
                changed += 1;
            }
        }
        changed
    }

    /// Put a command back after a transient failure.
    pub async fn retry_later(&mut self, id: CommandId, error: &Error, delay: Duration) -> Result<()> {
        let seq = self.position(id)?;
        let attempts = {
            let Some(command) = self.commands.get_mut(&seq) else {
                return Ok(());
            };
            command.status = CommandStatus::Pending;
            command.attempts += 1;
            command.last_error = Some(error.to_string());
            command.not_before = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
            command.attempts
        };
        self.persist().await?;
        warn!(
            "Command {} failed (attempt {}): {}. Retrying in {:?}",
            id, attempts, error, delay
        );
        self.emit(QueueEvent::Retrying {
            id,
            attempts,
            message: error.to_string(),
        });
        Ok(())
    }

    /// Release an in-flight command without counting a failure.
    pub async fn defer(&mut self, id: CommandId, delay: Duration) -> Result<()> {
        let seq = self.position(id)?;
        if let Some(command) = self.commands.get_mut(&seq) {
            command.status = CommandStatus::Pending;
            command.not_before = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
        }
        self.persist().await
    }

    /// Hand an in-flight command back to its lane without touching the
    /// journal.
    ///
    /// Used when settling a command failed; the journal still holds the
    /// command as claimed, which reopens as pending. Returns whether the
    /// command was in flight.
    pub fn release(&mut self, id: CommandId) -> bool {
        match self.commands.values_mut().find(|c| c.id == id) {
            Some(command) if command.status == CommandStatus::InFlight => {
                command.status = CommandStatus::Pending;
                true
            }
            _ => false,
        }
    }

    /// Move a command to the failed list after a permanent failure.
    ///
    /// It stays there until acknowledged.
    pub async fn fail(&mut self, id: CommandId, error: &Error) -> Result<()> {
        let seq = self.position(id)?;
        let Some(mut command) = self.commands.remove(&seq) else {
            return Ok(());
        };
        command.status = CommandStatus::FailedTerminal;
        command.last_error = Some(error.to_string());
        command.error_code = Some(error.code());
        let target = command.target.clone();
        self.failed.push(command);
        self.persist().await?;

        warn!("Command {} for {} failed permanently: {}", id, target, error);
        self.emit(QueueEvent::Failed {
            id,
            target,
            code: error.code(),
            message: error.to_string(),
        });
        Ok(())
    }

    /// Failed commands not yet acknowledged.
    pub fn failed(&self) -> &[QueuedCommand] {
        &self.failed
    }

    /// Drop a failed command from the failed list.
    pub async fn acknowledge(&mut self, id: CommandId) -> Result<Option<QueuedCommand>> {
        let Some(index) = self.failed.iter().position(|c| c.id == id) else {
            return Ok(None);
        };
        let command = self.failed.remove(index);
        self.persist().await?;
        Ok(Some(command))
    }

    /// Non-terminal commands in enqueue order.
    pub fn pending(&self) -> Vec<QueuedCommand> {
        self.commands.values().cloned().collect()
    }

    /// Non-terminal commands for one identity, in enqueue order.
    pub fn commands_for(&self, target: &ObjectRef) -> Vec<&QueuedCommand> {
        self.commands
            .values()
            .filter(|c| c.target == *target)
            .collect()
    }

    /// Whether any command other than `except` is waiting for `target`.
    pub fn has_pending_for(&self, target: &ObjectRef, except: Option<CommandId>) -> bool {
        self.commands
            .values()
            .any(|c| c.target == *target && Some(c.id) != except)
    }

    pub fn get(&self, id: CommandId) -> Option<&QueuedCommand> {
        self.commands.values().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Earliest time a backed-off command becomes dispatchable.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.commands
            .values()
            .filter(|c| c.status == CommandStatus::Pending)
            .filter_map(|c| c.not_before)
            .min()
    }

    /// Persist the journal.
    ///
    /// Written to a temporary file and renamed over the old journal so a
    /// crash never leaves a torn file behind.
    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.journal_path else {
            return Ok(());
        };
        let journal = JournalRef {
            next_seq: self.next_seq,
            commands: self.commands.values().collect(),
            failed: &self.failed,
        };
        let json = serde_json::to_string_pretty(&journal)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).await.map_err(Error::Io)?;
        fs::rename(&tmp, path).await.map_err(Error::Io)
    }
}

#[derive(Serialize)]
struct JournalRef<'a> {
    next_seq: u64,
    commands: Vec<&'a QueuedCommand>,
    failed: &'a [QueuedCommand],
}
