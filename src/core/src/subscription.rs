use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use deskchat_protocol::{MessageChange, RoomId};

use crate::backend::{ChatBackend, PushChannel};
use crate::config::ChatConfig;
use crate::error::{BackendError, ChatError};
use crate::message_store::SharedLog;

/// Lifecycle of the push channel for the displayed room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Opening,
    Open,
    /// Establishing or re-establishing failed `attempt` times so far.
    Degraded { attempt: u32 },
    Closing,
    /// Gave up after the configured attempts. History stays visible but
    /// no live updates arrive until the channel is reopened.
    Failed,
}

impl ChannelState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Open)
    }
}

struct Active {
    room_id: RoomId,
    task: JoinHandle<()>,
}

/// Owns at most one push channel and pumps its events into the shared log.
///
/// `open` tears down any previous channel first. `close` returns only
/// after the pump task is gone and the channel released, so nothing is
/// delivered once it completes.
pub struct SubscriptionManager {
    backend: Arc<dyn ChatBackend>,
    config: Arc<ChatConfig>,
    log: Arc<SharedLog>,
    state: Arc<watch::Sender<ChannelState>>,
    active: Mutex<Option<Active>>,
}

impl SubscriptionManager {
    pub fn new(backend: Arc<dyn ChatBackend>, config: Arc<ChatConfig>, log: Arc<SharedLog>) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            backend,
            config,
            log,
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Room of the running channel, if any.
    pub fn room_id(&self) -> Option<RoomId> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|a| a.room_id))
    }

    /// Open the channel for `room_id`, feeding the log generation `epoch`.
    pub async fn open(&self, room_id: RoomId, epoch: u64) -> Result<(), ChatError> {
        self.close().await;

        set_state(&self.state, ChannelState::Opening);
        let channel = match connect(&*self.backend, &self.config, &self.state, room_id).await {
            Ok(channel) => channel,
            Err((attempts, reason)) => {
                tracing::error!(%room_id, attempts, error = %reason, "could not open push channel");
                set_state(&self.state, ChannelState::Failed);
                return Err(ChatError::SubscriptionDegraded {
                    room_id,
                    attempts,
                    reason,
                });
            }
        };

        set_state(&self.state, ChannelState::Open);
        tracing::info!(%room_id, epoch, "push channel open");

        let pump = Pump {
            backend: self.backend.clone(),
            config: self.config.clone(),
            log: self.log.clone(),
            state: self.state.clone(),
            room_id,
            epoch,
        };
        let task = tokio::spawn(pump.run(channel));
        if let Ok(mut active) = self.active.lock() {
            *active = Some(Active { room_id, task });
        }
        Ok(())
    }

    /// Tear down the current channel. Idempotent.
    pub async fn close(&self) {
        let active = self.active.lock().ok().and_then(|mut active| active.take());
        if let Some(Active { room_id, task }) = active {
            set_state(&self.state, ChannelState::Closing);
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::warn!(%room_id, "push channel task failed: {e}"),
            }
            tracing::info!(%room_id, "push channel closed");
        }
        set_state(&self.state, ChannelState::Idle);
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(active) = active.take() {
                active.task.abort();
            }
        }
    }
}

fn set_state(state: &watch::Sender<ChannelState>, next: ChannelState) {
    let prev = state.send_replace(next.clone());
    if prev != next {
        tracing::debug!(from = ?prev, to = ?next, "channel state");
    }
}

/// Try to open a channel with per-attempt timeout and backoff between
/// attempts. On failure returns the attempt count and the last error.
async fn connect(
    backend: &dyn ChatBackend,
    config: &ChatConfig,
    state: &watch::Sender<ChannelState>,
    room_id: RoomId,
) -> Result<PushChannel, (u32, BackendError)> {
    let max_attempts = config.subscribe_max_attempts.max(1);
    let mut last = BackendError::Timeout;
    for attempt in 1..=max_attempts {
        match tokio::time::timeout(config.subscribe_timeout(), backend.subscribe(room_id)).await {
            Ok(Ok(channel)) => return Ok(channel),
            Ok(Err(e)) => last = e,
            Err(_) => last = BackendError::Timeout,
        }
        tracing::warn!(%room_id, attempt, error = %last, "push channel attempt failed");
        set_state(state, ChannelState::Degraded { attempt });
        if attempt < max_attempts {
            tokio::time::sleep(config.reconnect_delay(attempt)).await;
        }
    }
    Err((max_attempts, last))
}

struct Pump {
    backend: Arc<dyn ChatBackend>,
    config: Arc<ChatConfig>,
    log: Arc<SharedLog>,
    state: Arc<watch::Sender<ChannelState>>,
    room_id: RoomId,
    epoch: u64,
}

impl Pump {
    async fn run(self, mut channel: PushChannel) {
        let room_id = self.room_id;
        loop {
            while let Some(change) = channel.next_change().await {
                if !self.apply(change) {
                    tracing::debug!(%room_id, "log moved on; stopping pump");
                    return;
                }
            }

            tracing::warn!(%room_id, "push channel dropped; reconnecting");
            set_state(&self.state, ChannelState::Degraded { attempt: 0 });
            channel = match connect(&*self.backend, &self.config, &self.state, room_id).await {
                Ok(channel) => channel,
                Err((attempts, reason)) => {
                    tracing::error!(%room_id, attempts, error = %reason, "giving up on push channel");
                    set_state(&self.state, ChannelState::Failed);
                    return;
                }
            };
            if !self.resync().await {
                return;
            }
            set_state(&self.state, ChannelState::Open);
            tracing::info!(%room_id, "push channel restored");
        }
    }

    /// Returns false once the log belongs to another epoch.
    fn apply(&self, change: MessageChange) -> bool {
        if let Err(e) = change.validate(self.room_id) {
            tracing::warn!(room_id = %self.room_id, op = change.op(), "dropping invalid change: {e}");
            return true;
        }
        self.log
            .with_store(self.epoch, |store| match change {
                MessageChange::Insert { message } => {
                    store.merge_remote(message);
                }
                MessageChange::Update { message } => {
                    store.apply_update(message);
                }
                MessageChange::Delete { message_ids, .. } => {
                    store.apply_delete(&message_ids);
                }
            })
            .is_some()
    }

    /// Fetch the recent window and merge what was missed while degraded.
    async fn resync(&self) -> bool {
        match self
            .backend
            .recent_messages(self.room_id, self.config.history_limit)
            .await
        {
            Ok(messages) => match self.log.with_store(self.epoch, |store| store.merge_all(messages)) {
                Some(merged) => {
                    tracing::debug!(room_id = %self.room_id, merged, "resynced after reconnect");
                    true
                }
                None => false,
            },
            Err(e) => {
                tracing::warn!(room_id = %self.room_id, error = %e, "resync failed");
                true
            }
        }
    }
}
