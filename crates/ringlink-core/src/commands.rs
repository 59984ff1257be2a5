//! Device command dispatch
//!
//! Commands are executed one at a time by a dedicated worker task, so the link
//! never sees two vendor requests in flight. While the link is busy, non-urgent
//! commands are coalesced into one request for up to `batch_window` or until
//! `max_batch_size` commands are queued. Latency-sensitive kinds (configurable,
//! `locate` by default) always go out immediately.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace, warn};

use crate::config::CommandConfig;
use crate::error::CommandError;
use crate::radio::LinkHandle;

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Kind of device command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Make the ring vibrate or flash so it can be found
    Locate,
    /// Vendor command registered in configuration
    Custom(String),
}

impl CommandKind {
    pub const LOCATE: &'static str = "locate";

    /// Resolve a command name; unknown names are rejected
    pub fn parse(name: &str, config: &CommandConfig) -> Result<Self, CommandError> {
        let name = name.trim();
        if name.eq_ignore_ascii_case(Self::LOCATE) {
            return Ok(CommandKind::Locate);
        }
        config
            .custom_commands
            .iter()
            .find(|c| c.as_str() == name)
            .map(|c| CommandKind::Custom(c.clone()))
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            CommandKind::Locate => Self::LOCATE,
            CommandKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A command with its opaque payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub kind: CommandKind,
    pub payload: Vec<u8>,
}

impl DeviceCommand {
    pub fn new(kind: CommandKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn locate() -> Self {
        Self::new(CommandKind::Locate, Vec::new())
    }
}

/// One request to the vendor executor: a single command or a coalesced batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub id: u64,
    pub link: LinkHandle,
    pub commands: Vec<DeviceCommand>,
}

/// Exactly one of these answers each request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Success(Vec<u8>),
    Timeout,
    Failure(i32),
}

/// Vendor command executor
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: DeviceRequest) -> CommandOutcome;
}

/// Reply channel handed to the dispatcher
pub type CommandReply = oneshot::Sender<Result<CommandOutcome, CommandError>>;

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

struct PendingCommand {
    link: LinkHandle,
    command: DeviceCommand,
    reply: CommandReply,
}

enum WorkerMsg {
    Submit(PendingCommand),
    RejectPending,
}

/// Front of the command worker; owned by the engine task
pub struct CommandDispatcher {
    tx: mpsc::UnboundedSender<WorkerMsg>,
    worker: JoinHandle<()>,
}

impl CommandDispatcher {
    pub fn spawn(config: CommandConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = CommandWorker {
            config,
            executor,
            batch: Vec::new(),
            batch_deadline: None,
            last_dispatch: None,
            next_request_id: 0,
        };
        Self {
            tx,
            worker: tokio::spawn(worker.run(rx)),
        }
    }

    /// Queue a command for `link`; the answer arrives on `reply`
    pub fn submit(&self, link: LinkHandle, command: DeviceCommand, reply: CommandReply) {
        let pending = PendingCommand {
            link,
            command,
            reply,
        };
        if let Err(mpsc::error::SendError(WorkerMsg::Submit(pending))) =
            self.tx.send(WorkerMsg::Submit(pending))
        {
            let _ = pending.reply.send(Err(CommandError::EngineStopped));
        }
    }

    /// Answer every queued command with "not connected"
    pub fn reject_pending(&self) {
        let _ = self.tx.send(WorkerMsg::RejectPending);
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher").finish_non_exhaustive()
    }
}

struct CommandWorker {
    config: CommandConfig,
    executor: Arc<dyn CommandExecutor>,
    batch: Vec<PendingCommand>,
    batch_deadline: Option<Instant>,
    last_dispatch: Option<Instant>,
    next_request_id: u64,
}

impl CommandWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMsg>) {
        loop {
            let deadline = self.batch_deadline;
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(WorkerMsg::Submit(pending)) => self.on_submit(pending).await,
                    Some(WorkerMsg::RejectPending) => self.reject_all(),
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush().await;
                }
            }
        }
        self.reject_all();
        debug!("Command worker stopped");
    }

    fn bypasses_batching(&self, command: &DeviceCommand) -> bool {
        self.config
            .bypass_batching
            .iter()
            .any(|k| k.as_str() == command.kind.name())
    }

    fn link_busy(&self, now: Instant) -> bool {
        self.last_dispatch
            .map(|t| now.duration_since(t) < self.config.idle_threshold)
            .unwrap_or(false)
    }

    async fn on_submit(&mut self, pending: PendingCommand) {
        let now = Instant::now();
        if self.bypasses_batching(&pending.command) || !self.link_busy(now) {
            trace!("Dispatching {} immediately", pending.command.kind);
            self.execute(vec![pending]).await;
            return;
        }

        // A batch only ever targets one link
        if self.batch.first().map(|p| p.link) != Some(pending.link) && !self.batch.is_empty() {
            self.flush().await;
        }
        if self.batch.is_empty() {
            self.batch_deadline = Some(now + self.config.batch_window);
        }
        trace!("Batching {} ({} queued)", pending.command.kind, self.batch.len() + 1);
        self.batch.push(pending);
        if self.batch.len() >= self.config.max_batch_size {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        self.batch_deadline = None;
        let batch = std::mem::take(&mut self.batch);
        if !batch.is_empty() {
            self.execute(batch).await;
        }
    }

    async fn execute(&mut self, pending: Vec<PendingCommand>) {
        let Some(link) = pending.first().map(|p| p.link) else {
            return;
        };
        self.next_request_id += 1;
        let mut replies = Vec::with_capacity(pending.len());
        let mut commands = Vec::with_capacity(pending.len());
        for p in pending {
            commands.push(p.command);
            replies.push(p.reply);
        }
        let request = DeviceRequest {
            id: self.next_request_id,
            link,
            commands,
        };
        debug!(
            "Executing request #{} with {} command(s)",
            request.id,
            request.commands.len()
        );

        self.last_dispatch = Some(Instant::now());
        let outcome = match timeout(self.config.command_timeout, self.executor.execute(request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => CommandOutcome::Timeout,
        };
        self.last_dispatch = Some(Instant::now());

        match &outcome {
            CommandOutcome::Success(_) => {}
            CommandOutcome::Timeout => warn!("Device request timed out"),
            CommandOutcome::Failure(code) => warn!("Device request failed with code {}", code),
        }
        for reply in replies {
            let _ = reply.send(Ok(outcome.clone()));
        }
    }

    fn reject_all(&mut self) {
        self.batch_deadline = None;
        let rejected = std::mem::take(&mut self.batch);
        if !rejected.is_empty() {
            debug!("Rejecting {} queued command(s): not connected", rejected.len());
        }
        for pending in rejected {
            let _ = pending.reply.send(Err(CommandError::NotConnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedExecutor;
    use std::time::Duration;

    const LINK: LinkHandle = LinkHandle(1);

    fn custom_config() -> CommandConfig {
        CommandConfig {
            custom_commands: vec!["sync_time".to_string()],
            ..CommandConfig::default()
        }
    }

    fn sync_time() -> DeviceCommand {
        DeviceCommand::new(CommandKind::Custom("sync_time".into()), vec![0x01])
    }

    fn submit(
        dispatcher: &CommandDispatcher,
        command: DeviceCommand,
    ) -> oneshot::Receiver<Result<CommandOutcome, CommandError>> {
        let (tx, rx) = oneshot::channel();
        dispatcher.submit(LINK, command, tx);
        rx
    }

    #[test]
    fn test_parse_command_names() {
        let config = custom_config();
        assert_eq!(CommandKind::parse("locate", &config), Ok(CommandKind::Locate));
        assert_eq!(
            CommandKind::parse("sync_time", &config),
            Ok(CommandKind::Custom("sync_time".into()))
        );
        assert_eq!(
            CommandKind::parse("self_destruct", &config),
            Err(CommandError::UnknownCommand("self_destruct".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_link_dispatches_immediately() {
        let executor = Arc::new(SimulatedExecutor::new());
        let dispatcher = CommandDispatcher::spawn(custom_config(), executor.clone());

        let outcome = submit(&dispatcher, sync_time()).await.unwrap();
        assert_eq!(outcome, Ok(CommandOutcome::Success(Vec::new())));
        assert_eq!(executor.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_link_coalesces_commands() {
        let executor = Arc::new(SimulatedExecutor::new());
        let dispatcher = CommandDispatcher::spawn(custom_config(), executor.clone());

        submit(&dispatcher, sync_time()).await.unwrap().unwrap();
        let replies: Vec<_> = (0..3).map(|_| submit(&dispatcher, sync_time())).collect();
        for reply in replies {
            assert!(reply.await.unwrap().is_ok());
        }

        let requests = executor.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].commands.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_flushes_at_max_size() {
        let executor = Arc::new(SimulatedExecutor::new());
        let dispatcher = CommandDispatcher::spawn(custom_config(), executor.clone());

        submit(&dispatcher, sync_time()).await.unwrap().unwrap();
        let replies: Vec<_> = (0..7).map(|_| submit(&dispatcher, sync_time())).collect();
        for reply in replies {
            reply.await.unwrap().unwrap();
        }

        let sizes: Vec<_> = executor.requests().iter().map(|r| r.commands.len()).collect();
        assert_eq!(sizes, vec![1, 5, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locate_bypasses_batch() {
        let executor = Arc::new(SimulatedExecutor::new());
        let dispatcher = CommandDispatcher::spawn(custom_config(), executor.clone());

        submit(&dispatcher, sync_time()).await.unwrap().unwrap();
        let queued = submit(&dispatcher, sync_time());
        let locate = submit(&dispatcher, DeviceCommand::locate());

        locate.await.unwrap().unwrap();
        let requests = executor.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].commands, vec![DeviceCommand::locate()]);

        queued.await.unwrap().unwrap();
        assert_eq!(executor.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_pending_answers_not_connected() {
        let executor = Arc::new(SimulatedExecutor::new());
        let dispatcher = CommandDispatcher::spawn(custom_config(), executor.clone());

        submit(&dispatcher, sync_time()).await.unwrap().unwrap();
        let queued = submit(&dispatcher, sync_time());
        dispatcher.reject_pending();

        assert_eq!(queued.await.unwrap(), Err(CommandError::NotConnected));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(executor.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_executor_times_out() {
        let executor = Arc::new(SimulatedExecutor::new());
        executor.set_latency(Duration::from_secs(30));
        let dispatcher = CommandDispatcher::spawn(custom_config(), executor.clone());

        let outcome = submit(&dispatcher, DeviceCommand::locate()).await.unwrap();
        assert_eq!(outcome, Ok(CommandOutcome::Timeout));
    }
}
