//! Upstream session management
//!
//! Exactly one producer task runs per watched channel: never zero while the
//! channel has subscribers, never more than one, and none after the last
//! subscriber leaves. Reference counts are driven by the subscription
//! registry through `acquire`/`release`.
//!
//! Producer output leaves this module one way only, as `UpdateEnvelope`s on
//! the bus returned by `SessionManager::new`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::models::{ChannelId, ClientId, GameSnapshot, SessionStatus, UpdateEnvelope};
use crate::providers::{PollOutcome, ProducerHandle, UpstreamProducer};

struct SessionWorker {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Progress of a session start, shared with everyone waiting on it
#[derive(Debug, Clone, PartialEq, Eq)]
enum StartOutcome {
    Pending,
    Started,
    Failed(String),
}

struct ChannelSession {
    status: SessionStatus,
    last_known_state: GameSnapshot,
    reference_count: usize,
    /// Generation of the current producer; stale output carries an older one
    epoch: u64,
    worker: Option<SessionWorker>,
    /// Outcome of the latest start, awaited by subscribers joining mid-start
    start: Option<watch::Receiver<StartOutcome>>,
    /// Deferred stop scheduled after the last subscriber left
    linger: Option<JoinHandle<()>>,
}

impl ChannelSession {
    fn idle() -> Self {
        Self {
            status: SessionStatus::Idle,
            last_known_state: GameSnapshot::new(),
            reference_count: 0,
            epoch: 0,
            worker: None,
            start: None,
            linger: None,
        }
    }
}

/// Session work scheduled by a reference count change
///
/// The work itself already runs on its own task: dropping the transition
/// neither cancels it nor leaves the session half-started. `wait` reports
/// the outcome to callers that care.
#[must_use = "call wait() to learn whether the session started"]
pub struct SessionTransition {
    channel: ChannelId,
    pending: Pending,
}

enum Pending {
    Ready,
    Starting(watch::Receiver<StartOutcome>),
    Stopping(JoinHandle<()>),
}

impl SessionTransition {
    fn ready(channel: &ChannelId) -> Self {
        Self {
            channel: channel.clone(),
            pending: Pending::Ready,
        }
    }

    fn joining(channel: &ChannelId, start: Option<&watch::Receiver<StartOutcome>>) -> Self {
        Self {
            channel: channel.clone(),
            pending: start.map_or(Pending::Ready, |rx| Pending::Starting(rx.clone())),
        }
    }

    /// Whether nothing remains to be waited for
    pub fn is_ready(&self) -> bool {
        matches!(self.pending, Pending::Ready)
    }

    /// Wait for the scheduled start or stop to finish
    ///
    /// Fails with `SessionStartFailed` when the start this transition waits
    /// on did not come up.
    pub async fn wait(self) -> Result<()> {
        match self.pending {
            Pending::Ready => Ok(()),
            Pending::Stopping(task) => {
                if let Err(e) = task.await {
                    warn!(channel = %self.channel, error = %e, "Session stop task ended abnormally");
                }
                Ok(())
            }
            Pending::Starting(mut rx) => {
                let outcome = match rx.wait_for(|o| *o != StartOutcome::Pending).await {
                    Ok(outcome) => outcome.clone(),
                    Err(_) => StartOutcome::Failed("start task ended before reporting".to_string()),
                };
                match outcome {
                    StartOutcome::Failed(reason) => Err(RelayError::SessionStartFailed {
                        channel: self.channel,
                        reason,
                    }),
                    _ => Ok(()),
                }
            }
        }
    }
}

/// Owner of every channel's upstream producer task
pub struct SessionManager {
    config: RelayConfig,
    producer: Arc<dyn UpstreamProducer>,
    sessions: Mutex<HashMap<ChannelId, ChannelSession>>,
    updates: mpsc::UnboundedSender<UpdateEnvelope>,
    next_epoch: AtomicU64,
}

impl SessionManager {
    /// Create a manager and the receiving end of its update bus
    pub fn new(
        config: RelayConfig,
        producer: Arc<dyn UpstreamProducer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<UpdateEnvelope>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            producer,
            sessions: Mutex::new(HashMap::new()),
            updates,
            next_epoch: AtomicU64::new(1),
        });
        (manager, rx)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Count one more subscriber and make sure the channel's session runs
    ///
    /// `live_subscribers` is the registry's count after the registration; a
    /// mismatch with the local count forces a full restart of the session.
    /// Never suspends, so the registry calls it inside its critical section
    /// and waits on the returned transition after leaving it.
    pub fn acquire(self: &Arc<Self>, channel: &ChannelId, live_subscribers: usize) -> SessionTransition {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(channel.clone())
            .or_insert_with(ChannelSession::idle);

        session.reference_count += 1;
        if let Some(linger) = session.linger.take() {
            linger.abort();
            debug!(channel = %channel, "Subscriber returned, pending teardown cancelled");
        }

        if session.reference_count != live_subscribers {
            error!(
                channel = %channel,
                counted = session.reference_count,
                live = live_subscribers,
                "Subscriber accounting drift on acquire, restarting session"
            );
            session.reference_count = live_subscribers;
            return self.schedule_restart(channel, session);
        }
        self.ensure_started(channel, session)
    }

    /// Count one subscriber less; stop the session when none remain
    ///
    /// Never suspends; see `acquire`.
    pub fn release(self: &Arc<Self>, channel: &ChannelId, live_subscribers: usize) -> SessionTransition {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(channel) else {
            if live_subscribers > 0 {
                error!(
                    channel = %channel,
                    live = live_subscribers,
                    "Release for untracked channel with live subscribers"
                );
            }
            return SessionTransition::ready(channel);
        };

        session.reference_count = session.reference_count.saturating_sub(1);
        let drifted = session.reference_count != live_subscribers;
        if drifted {
            error!(
                channel = %channel,
                counted = session.reference_count,
                live = live_subscribers,
                "Subscriber accounting drift on release"
            );
            session.reference_count = live_subscribers;
        }

        if session.reference_count > 0 {
            if drifted {
                self.schedule_restart(channel, session)
            } else {
                SessionTransition::ready(channel)
            }
        } else if session.status == SessionStatus::Idle {
            sessions.remove(channel);
            SessionTransition::ready(channel)
        } else if !self.config.linger.is_zero() && session.status.is_active() {
            let epoch = session.epoch;
            let manager = Arc::downgrade(self);
            let lingering = channel.clone();
            let delay = self.config.linger;
            session.linger = Some(tokio::spawn(async move {
                time::sleep(delay).await;
                if let Some(manager) = manager.upgrade() {
                    manager.expire_linger(&lingering, epoch).await;
                }
            }));
            debug!(channel = %channel, linger_secs = delay.as_secs_f64(), "Last subscriber left, teardown deferred");
            SessionTransition::ready(channel)
        } else {
            match begin_stop(session) {
                Some((worker, epoch)) => self.schedule_stop(channel, worker, epoch),
                None => SessionTransition::ready(channel),
            }
        }
    }

    async fn expire_linger(&self, channel: &ChannelId, epoch: u64) {
        let pending = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(channel) else {
                return;
            };
            if session.reference_count > 0 || session.epoch != epoch {
                return;
            }
            // This task is the linger; detach rather than abort it
            session.linger.take();
            begin_stop(session)
        };
        if let Some((worker, epoch)) = pending {
            info!(channel = %channel, "Linger expired with no subscribers");
            self.finish_stop(channel, worker, epoch).await;
        }
    }

    /// Launch the channel's producer and wait for its first successful fetch
    ///
    /// Joins the start already in flight when the session is starting and
    /// returns at once when it is running. On failure the session returns to
    /// idle and `SessionStartFailed` is returned. The start runs on its own
    /// task and completes even if this future is dropped.
    pub async fn start_session(self: &Arc<Self>, channel: &ChannelId) -> Result<()> {
        let transition = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .entry(channel.clone())
                .or_insert_with(ChannelSession::idle);
            self.ensure_started(channel, session)
        };
        transition.wait().await
    }

    fn ensure_started(self: &Arc<Self>, channel: &ChannelId, session: &mut ChannelSession) -> SessionTransition {
        match session.status {
            SessionStatus::Running => SessionTransition::ready(channel),
            SessionStatus::Starting => SessionTransition::joining(channel, session.start.as_ref()),
            SessionStatus::Idle | SessionStatus::Stopping => self.schedule_start(channel, session, None),
        }
    }

    fn schedule_restart(self: &Arc<Self>, channel: &ChannelId, session: &mut ChannelSession) -> SessionTransition {
        let stopping = begin_stop(session);
        self.schedule_start(channel, session, stopping)
    }

    /// Move the session to `Starting` under a fresh epoch and spawn the start
    ///
    /// `stopping` is a previous producer to wind down before launching.
    fn schedule_start(
        self: &Arc<Self>,
        channel: &ChannelId,
        session: &mut ChannelSession,
        stopping: Option<(Option<SessionWorker>, u64)>,
    ) -> SessionTransition {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (outcome, rx) = watch::channel(StartOutcome::Pending);
        session.status = SessionStatus::Starting;
        session.epoch = epoch;
        session.last_known_state.clear();
        session.start = Some(rx.clone());

        let manager = Arc::clone(self);
        let starting = channel.clone();
        tokio::spawn(async move {
            if let Some((worker, old_epoch)) = stopping {
                manager.finish_stop(&starting, worker, old_epoch).await;
            }
            let result = match manager.launch(&starting, epoch).await {
                Ok(()) => StartOutcome::Started,
                Err(reason) => StartOutcome::Failed(reason),
            };
            outcome.send_replace(result);
        });

        SessionTransition {
            channel: channel.clone(),
            pending: Pending::Starting(rx),
        }
    }

    fn schedule_stop(
        self: &Arc<Self>,
        channel: &ChannelId,
        worker: Option<SessionWorker>,
        epoch: u64,
    ) -> SessionTransition {
        let manager = Arc::clone(self);
        let stopping = channel.clone();
        let task = tokio::spawn(async move {
            manager.finish_stop(&stopping, worker, epoch).await;
        });
        SessionTransition {
            channel: channel.clone(),
            pending: Pending::Stopping(task),
        }
    }

    /// Body of a start: first fetch under `start_timeout`, then the poll loop
    async fn launch(self: &Arc<Self>, channel: &ChannelId, epoch: u64) -> std::result::Result<(), String> {
        info!(channel = %channel, epoch, producer = self.producer.name(), "Starting upstream session");

        let launched = match time::timeout(self.config.start_timeout, self.launch_producer(channel)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "first fetch timed out after {:?}",
                self.config.start_timeout
            )),
        };

        let orphaned = {
            let mut sessions = self.sessions.lock();
            let current = sessions
                .get_mut(channel)
                .filter(|s| s.epoch == epoch && s.status == SessionStatus::Starting);

            match (launched, current) {
                (Ok((handle, first)), Some(session)) => {
                    session.status = SessionStatus::Running;
                    if let PollOutcome::Update(fields) = first {
                        session.last_known_state.extend(fields.clone());
                        self.publish(UpdateEnvelope::new(channel.clone(), fields, epoch));
                    }

                    let (cancel, cancel_rx) = watch::channel(false);
                    let task = tokio::spawn(run_producer(
                        Arc::downgrade(self),
                        Arc::clone(&self.producer),
                        handle,
                        epoch,
                        self.config.poll_interval,
                        cancel_rx,
                    ));
                    session.worker = Some(SessionWorker { cancel, task });

                    info!(channel = %channel, epoch, "Upstream session running");
                    return Ok(());
                }
                (Ok((handle, _)), None) => handle,
                (Err(reason), current) => {
                    let unwatched = current.map_or(false, |session| {
                        session.status = SessionStatus::Idle;
                        session.reference_count == 0
                    });
                    if unwatched {
                        sessions.remove(channel);
                    }
                    warn!(channel = %channel, epoch, reason = %reason, "Upstream session failed to start");
                    return Err(reason);
                }
            }
        };

        debug!(channel = %channel, epoch, "Session stopped while starting, discarding producer");
        self.producer.stop(orphaned).await;
        Ok(())
    }

    async fn launch_producer(
        &self,
        channel: &ChannelId,
    ) -> std::result::Result<(ProducerHandle, PollOutcome), String> {
        let mut handle = self
            .producer
            .start(channel)
            .await
            .map_err(|e| format!("{:#}", e))?;
        match self.producer.poll(&mut handle).await {
            Ok(first) => Ok((handle, first)),
            Err(e) => {
                self.producer.stop(handle).await;
                Err(format!("{:#}", e))
            }
        }
    }

    /// Stop the channel's producer and discard its state
    ///
    /// Cancellation is cooperative; a producer still busy after the stop
    /// grace period is abandoned and anything it produces later is dropped.
    /// The stop runs on its own task and completes even if this future is
    /// dropped.
    pub async fn stop_session(self: &Arc<Self>, channel: &ChannelId) {
        let transition = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(channel).and_then(begin_stop) {
                Some((worker, epoch)) => self.schedule_stop(channel, worker, epoch),
                None => SessionTransition::ready(channel),
            }
        };
        let _ = transition.wait().await;
    }

    async fn finish_stop(&self, channel: &ChannelId, worker: Option<SessionWorker>, epoch: u64) {
        info!(channel = %channel, epoch, "Stopping upstream session");

        if let Some(worker) = worker {
            let mut task = worker.task;
            if time::timeout(self.config.stop_grace_period, &mut task)
                .await
                .is_err()
            {
                task.abort();
                warn!(
                    channel = %channel,
                    epoch,
                    grace_secs = self.config.stop_grace_period.as_secs_f64(),
                    "Producer did not stop within grace period, abandoned"
                );
            }
        }

        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(channel) {
            if session.epoch == epoch && session.status == SessionStatus::Stopping {
                session.status = SessionStatus::Idle;
                session.last_known_state.clear();
                if session.reference_count == 0 {
                    sessions.remove(channel);
                }
            }
        }
        debug!(channel = %channel, epoch, "Upstream session idle");
    }

    /// Record a producer update and forward it to the broadcaster
    ///
    /// Returns false when the update came from a stale or stopped session.
    fn on_update(&self, channel: &ChannelId, epoch: u64, fields: GameSnapshot) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions
            .get_mut(channel)
            .filter(|s| s.epoch == epoch && s.status == SessionStatus::Running)
        else {
            debug!(channel = %channel, epoch, "Discarding update from stale session");
            return false;
        };
        session.last_known_state.extend(fields.clone());
        self.publish(UpdateEnvelope::new(channel.clone(), fields, epoch));
        true
    }

    /// Queue the channel's full state for one client on the update bus
    ///
    /// The state is read and queued under the same lock `on_update` takes,
    /// so the snapshot lands behind every delta it already contains and
    /// ahead of every later one. Returns false when there is no state yet.
    pub fn queue_snapshot(&self, channel: &ChannelId, client: &ClientId) -> bool {
        let sessions = self.sessions.lock();
        let Some(session) = sessions
            .get(channel)
            .filter(|s| s.status == SessionStatus::Running && !s.last_known_state.is_empty())
        else {
            return false;
        };
        self.publish(UpdateEnvelope::snapshot(
            channel.clone(),
            session.last_known_state.clone(),
            session.epoch,
            client.clone(),
        ));
        true
    }

    fn publish(&self, envelope: UpdateEnvelope) {
        if self.updates.send(envelope).is_err() {
            debug!("Update bus closed, envelope dropped");
        }
    }

    pub fn status(&self, channel: &ChannelId) -> SessionStatus {
        self.sessions
            .lock()
            .get(channel)
            .map(|s| s.status)
            .unwrap_or(SessionStatus::Idle)
    }

    pub fn reference_count(&self, channel: &ChannelId) -> usize {
        self.sessions
            .lock()
            .get(channel)
            .map(|s| s.reference_count)
            .unwrap_or(0)
    }

    /// Current full state of a running session, if it has seen any data
    pub fn last_known_state(&self, channel: &ChannelId) -> Option<GameSnapshot> {
        self.sessions
            .lock()
            .get(channel)
            .filter(|s| s.status == SessionStatus::Running && !s.last_known_state.is_empty())
            .map(|s| s.last_known_state.clone())
    }

    /// Whether an envelope of this epoch still belongs to the running session
    pub fn is_current(&self, channel: &ChannelId, epoch: u64) -> bool {
        self.sessions
            .lock()
            .get(channel)
            .map(|s| s.epoch == epoch && s.status == SessionStatus::Running)
            .unwrap_or(false)
    }

    pub fn active_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.status.is_active())
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Stop every session, e.g. on process shutdown
    pub async fn shutdown(self: &Arc<Self>) {
        let channels: Vec<ChannelId> = self.sessions.lock().keys().cloned().collect();
        info!(sessions = channels.len(), "Shutting down upstream sessions");
        for channel in &channels {
            self.stop_session(channel).await;
        }
        self.sessions.lock().clear();
    }
}

/// Move a starting or running session to `Stopping` and signal its worker
///
/// Returns the worker to wind down and the epoch being stopped, or `None`
/// when there is nothing to stop.
fn begin_stop(session: &mut ChannelSession) -> Option<(Option<SessionWorker>, u64)> {
    if matches!(session.status, SessionStatus::Idle | SessionStatus::Stopping) {
        return None;
    }
    session.status = SessionStatus::Stopping;
    if let Some(linger) = session.linger.take() {
        linger.abort();
    }
    let worker = session.worker.take();
    if let Some(worker) = &worker {
        worker.cancel.send_replace(true);
    }
    Some((worker, session.epoch))
}

/// Poll loop of one session's producer
///
/// Cancellation is only observed between polls so an in-flight fetch is
/// never interrupted here; `stop_session` enforces the grace period.
async fn run_producer(
    manager: Weak<SessionManager>,
    producer: Arc<dyn UpstreamProducer>,
    mut handle: ProducerHandle,
    epoch: u64,
    poll_interval: std::time::Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let channel = handle.channel.clone();
    let mut ticker = time::interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }

        let outcome = producer.poll(&mut handle).await;
        if *cancel.borrow() {
            debug!(channel = %channel, epoch, "Discarding poll result after stop signal");
            break;
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };

        match outcome {
            Ok(PollOutcome::Update(fields)) => {
                if consecutive_failures > 0 {
                    info!(channel = %channel, after_failures = consecutive_failures, "Upstream recovered");
                }
                consecutive_failures = 0;
                if !manager.on_update(&channel, epoch, fields) {
                    break;
                }
            }
            Ok(PollOutcome::NoChange) => {
                consecutive_failures = 0;
            }
            Err(e) => {
                consecutive_failures += 1;
                let err = RelayError::UpstreamPollError {
                    channel: channel.clone(),
                    reason: format!("{:#}", e),
                };
                warn!(
                    channel = %channel,
                    consecutive_failures,
                    error = %err,
                    "Upstream poll failed, retrying next tick"
                );
            }
        }
    }

    producer.stop(handle).await;
    debug!(channel = %channel, epoch, "Producer task exited");
}
