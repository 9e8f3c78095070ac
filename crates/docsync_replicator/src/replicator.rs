//! The replicator state machine.

use crate::checkpoint::{self, checkpoint_id};
use crate::config::ReplicatorConfiguration;
use crate::endpoint::Endpoint;
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::pull::pull_pass;
use crate::push::push_pass;
use crate::session::TransferSession;
use crate::status::{
    ActivityLevel, ChangeListener, Direction, DocumentListener, DocumentReplication,
    ReplicatedDocument, ReplicatorStatus,
};
use crate::transport::{Connector, LoopbackConnector, WebSocketConnector};
use docsync_core::{Checkpoint, CoreError, ListenerRegistry, ListenerToken};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Synchronizes a local database with an endpoint.
///
/// `start`, `stop` and `reset_checkpoint` return immediately; the work runs
/// on a dedicated thread, which also invokes the listeners. Dropping the
/// handle does not stop a running replicator.
///
/// # Example
///
/// ```
/// use docsync_core::{Database, MutableDocument};
/// use docsync_replicator::{
///     ActivityLevel, Endpoint, Replicator, ReplicatorConfiguration,
/// };
/// use std::sync::mpsc;
///
/// let local = Database::open_in_memory("local").unwrap();
/// let remote = Database::open_in_memory("remote").unwrap();
/// local.save_document(&mut MutableDocument::new("doc1")).unwrap();
///
/// let config = ReplicatorConfiguration::new(local, Endpoint::local(remote.clone()));
/// let replicator = Replicator::new(config).unwrap();
/// let (tx, rx) = mpsc::channel();
/// let _token = replicator.add_change_listener(move |status| {
///     if status.activity == ActivityLevel::Stopped {
///         let _ = tx.send(status.error.clone());
///     }
/// });
/// replicator.start();
/// assert_eq!(rx.recv().unwrap(), None);
/// assert_eq!(remote.count(), 1);
/// ```
#[derive(Clone)]
pub struct Replicator {
    shared: Arc<Shared>,
}

/// State shared between the handle and the worker thread.
pub(crate) struct Shared {
    config: ReplicatorConfiguration,
    checkpoint_id: String,
    connector: Arc<dyn Connector>,
    control: Mutex<Control>,
    wake: Condvar,
    status: Mutex<ReplicatorStatus>,
    // Held while a status is published, so deliveries are totally ordered.
    delivery: Mutex<()>,
    change_listeners: Arc<ListenerRegistry<ChangeListener>>,
    document_listeners: Arc<ListenerRegistry<DocumentListener>>,
}

#[derive(Debug, Default)]
struct Control {
    running: bool,
    stop_requested: bool,
    pending_work: bool,
    reset_pending: bool,
}

impl Replicator {
    /// Creates a stopped replicator.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicatorError::InvalidConfig`] if the configuration is
    /// invalid.
    pub fn new(config: ReplicatorConfiguration) -> ReplicatorResult<Self> {
        config.validate()?;
        let connector = match &config.connector {
            Some(connector) => Arc::clone(connector),
            None => default_connector(&config.endpoint),
        };
        let checkpoint_id = checkpoint_id(&config);
        debug!(endpoint = %config.endpoint, checkpoint_id, "replicator created");
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                checkpoint_id,
                connector,
                control: Mutex::new(Control::default()),
                wake: Condvar::new(),
                status: Mutex::new(ReplicatorStatus::stopped()),
                delivery: Mutex::new(()),
                change_listeners: ListenerRegistry::new(),
                document_listeners: ListenerRegistry::new(),
            }),
        })
    }

    /// The configuration.
    pub fn config(&self) -> &ReplicatorConfiguration {
        &self.shared.config
    }

    /// ID of the checkpoint this replicator keeps.
    pub fn checkpoint_id(&self) -> &str {
        &self.shared.checkpoint_id
    }

    /// Current status.
    pub fn status(&self) -> ReplicatorStatus {
        self.shared.status.lock().clone()
    }

    /// Starts replicating. Does nothing unless stopped.
    pub fn start(&self) {
        let mut control = self.shared.control.lock();
        if control.running {
            debug!("start ignored; already running");
            return;
        }
        control.running = true;
        control.stop_requested = false;
        control.pending_work = false;
        let ignore_saved = std::mem::take(&mut control.reset_pending);
        *self.shared.status.lock() = ReplicatorStatus {
            activity: ActivityLevel::Connecting,
            ..ReplicatorStatus::stopped()
        };

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("docsync-replicator".into())
            .spawn(move || shared.run(ignore_saved));
        if let Err(err) = spawned {
            warn!(error = %err, "cannot spawn replicator thread");
            control.running = false;
            control.reset_pending = ignore_saved;
            let mut status = self.shared.status.lock();
            status.activity = ActivityLevel::Stopped;
            status.error = Some(ReplicatorError::InvalidState(format!(
                "cannot spawn replicator thread: {err}"
            )));
        }
    }

    /// Requests a stop. Does nothing when stopped.
    ///
    /// The worker finishes the batch in flight, then reports
    /// [`ActivityLevel::Stopped`] exactly once.
    pub fn stop(&self) {
        let mut control = self.shared.control.lock();
        if !control.running || control.stop_requested {
            return;
        }
        control.stop_requested = true;
        self.shared.wake.notify_all();
        info!(endpoint = %self.shared.config.endpoint, "stop requested");
    }

    /// Discards the saved checkpoint so the next start replicates from the
    /// beginning, ignoring the peer's copy too.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicatorError::InvalidState`] while running.
    pub fn reset_checkpoint(&self) -> ReplicatorResult<()> {
        let mut control = self.shared.control.lock();
        if control.running {
            return Err(ReplicatorError::InvalidState(
                "cannot reset the checkpoint of a running replicator".into(),
            ));
        }
        control.reset_pending = true;
        self.shared
            .config
            .database
            .checkpoints()
            .reset(&self.shared.checkpoint_id);
        info!(checkpoint_id = %self.shared.checkpoint_id, "checkpoint reset requested");
        Ok(())
    }

    /// Registers a status listener.
    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        self.shared.change_listeners.add(None, Box::new(listener))
    }

    /// Registers a listener for replicated document batches.
    pub fn add_document_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&DocumentReplication) + Send + Sync + 'static,
    {
        self.shared.document_listeners.add(None, Box::new(listener))
    }
}

impl fmt::Debug for Replicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("endpoint", &self.shared.config.endpoint.to_string())
            .field("checkpoint_id", &self.shared.checkpoint_id)
            .field("status", &self.status())
            .finish()
    }
}

fn default_connector(endpoint: &Endpoint) -> Arc<dyn Connector> {
    match endpoint {
        Endpoint::LocalDatabase(target) => Arc::new(LoopbackConnector::for_database(target.clone())),
        Endpoint::Url(_) => Arc::new(WebSocketConnector::new()),
    }
}

impl Shared {
    pub(crate) fn config(&self) -> &ReplicatorConfiguration {
        &self.config
    }

    pub(crate) fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.control.lock().stop_requested
    }

    fn run(self: Arc<Self>, mut ignore_saved: bool) {
        info!(endpoint = %self.config.endpoint, checkpoint_id = %self.checkpoint_id, "replicator started");
        self.publish();

        let watches = self.watch_commits();
        let error = match self.config.database.checkpoints().lease(&self.checkpoint_id) {
            Ok(_lease) => self.run_leased(&mut ignore_saved).err(),
            Err(CoreError::CheckpointBusy { checkpoint_id }) => {
                warn!(checkpoint_id, "another replicator owns this pairing");
                Some(ReplicatorError::CheckpointBusy { checkpoint_id })
            }
            Err(err) => Some(err.into()),
        };
        drop(watches);

        self.finish(error, ignore_saved);
    }

    /// Wakes a continuous replicator when either side commits.
    fn watch_commits(self: &Arc<Self>) -> Vec<ListenerToken> {
        if !self.config.continuous {
            return Vec::new();
        }
        let mut watches = Vec::new();
        if self.config.replicator_type.is_push() {
            let weak = Arc::downgrade(self);
            watches.push(self.config.database.observe_commits(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.signal_work();
                }
            }));
        }
        if let (true, Endpoint::LocalDatabase(target)) =
            (self.config.replicator_type.is_pull(), &self.config.endpoint)
        {
            let weak = Arc::downgrade(self);
            watches.push(target.observe_commits(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.signal_work();
                }
            }));
        }
        watches
    }

    fn run_leased(&self, ignore_saved: &mut bool) -> ReplicatorResult<()> {
        let mut failures = 0u32;
        loop {
            if self.is_stopping() {
                return Ok(());
            }
            let err = match self.run_session(ignore_saved, &mut failures) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => err,
                Err(err) => {
                    warn!(error = %err, "replication failed");
                    return Err(err);
                }
            };

            failures += 1;
            if !self.config.retry.should_retry(failures, self.config.continuous) {
                warn!(failures, error = %err, "giving up after repeated failures");
                return Err(err);
            }
            let delay = self.config.retry.delay_for_attempt(failures);
            warn!(failures, ?delay, error = %err, "replication interrupted; retrying");
            self.set_status(|status| {
                status.activity = ActivityLevel::Offline;
                status.error = Some(err);
            });
            if self.sleep(delay) {
                return Ok(());
            }
            self.set_status(|status| status.activity = ActivityLevel::Connecting);
        }
    }

    fn run_session(&self, ignore_saved: &mut bool, failures: &mut u32) -> ReplicatorResult<()> {
        let client_id = self.config.database.uuid().to_string();
        let mut session = TransferSession::open(self.connector.as_ref(), &self.config, &client_id)?;
        let store = self.config.database.checkpoints();
        let mut checkpoint =
            checkpoint::load(&store, &mut session, &self.checkpoint_id, *ignore_saved)?;
        *ignore_saved = false;
        *failures = 0;

        self.set_status(|status| {
            status.activity = ActivityLevel::Busy;
            status.error = None;
        });

        self.replicate(&mut session, &mut checkpoint)?;
        if let Err(err) = session.close() {
            debug!(error = %err, "session close failed");
        }
        Ok(())
    }

    fn replicate(
        &self,
        session: &mut TransferSession,
        checkpoint: &mut Checkpoint,
    ) -> ReplicatorResult<()> {
        let direction = self.config.replicator_type;
        loop {
            if direction.is_pull() {
                pull_pass(self, session, checkpoint)?;
            }
            if direction.is_push() {
                push_pass(self, session, checkpoint)?;
            }
            if !self.config.continuous || self.is_stopping() {
                return Ok(());
            }
            self.set_activity(ActivityLevel::Idle);
            if self.wait_for_work(self.config.poll_interval) {
                return Ok(());
            }
        }
    }

    fn signal_work(&self) {
        let mut control = self.control.lock();
        if control.running && !control.pending_work {
            control.pending_work = true;
            self.wake.notify_all();
        }
    }

    /// Waits for a commit, the poll interval or a stop. Returns true on stop.
    fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut control = self.control.lock();
        if !control.stop_requested && !control.pending_work {
            self.wake.wait_for(&mut control, timeout);
        }
        control.pending_work = false;
        control.stop_requested
    }

    /// Sleeps for `delay` unless stopped first. Returns true on stop.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut control = self.control.lock();
        while !control.stop_requested {
            if self.wake.wait_until(&mut control, deadline).timed_out() {
                break;
            }
        }
        control.stop_requested
    }

    pub(crate) fn mark_busy(&self) {
        self.set_activity(ActivityLevel::Busy);
    }

    pub(crate) fn add_discovered(&self, count: u64) {
        self.set_status(|status| status.progress.total += count);
    }

    pub(crate) fn add_completed(&self, count: u64) {
        self.set_status(|status| {
            let progress = &mut status.progress;
            progress.completed = (progress.completed + count).min(progress.total);
        });
    }

    pub(crate) fn notify_documents(&self, direction: Direction, documents: Vec<ReplicatedDocument>) {
        if documents.is_empty() {
            return;
        }
        let replication = DocumentReplication {
            direction,
            documents,
        };
        for registration in self.document_listeners.snapshot() {
            registration.invoke(|listener| listener(&replication));
        }
    }

    fn set_activity(&self, activity: ActivityLevel) {
        if self.status.lock().activity != activity {
            self.set_status(|status| status.activity = activity);
        }
    }

    fn set_status(&self, update: impl FnOnce(&mut ReplicatorStatus)) {
        let _order = self.delivery.lock();
        let snapshot = {
            let mut status = self.status.lock();
            let before = status.activity;
            update(&mut status);
            if status.activity != before {
                debug!(from = ?before, to = ?status.activity, "activity changed");
            }
            status.clone()
        };
        self.deliver(&snapshot);
    }

    fn publish(&self) {
        let _order = self.delivery.lock();
        let snapshot = self.status.lock().clone();
        self.deliver(&snapshot);
    }

    /// Reports the final stopped status and lets the replicator be started
    /// again.
    fn finish(&self, error: Option<ReplicatorError>, reset_pending: bool) {
        let _order = self.delivery.lock();
        let snapshot = {
            let mut control = self.control.lock();
            control.running = false;
            control.stop_requested = false;
            control.pending_work = false;
            control.reset_pending |= reset_pending;
            let mut status = self.status.lock();
            status.activity = ActivityLevel::Stopped;
            if error.is_some() {
                status.error = error;
            }
            status.clone()
        };
        info!(
            endpoint = %self.config.endpoint,
            completed = snapshot.progress.completed,
            error = ?snapshot.error,
            "replicator stopped"
        );
        self.deliver(&snapshot);
    }

    fn deliver(&self, status: &ReplicatorStatus) {
        for registration in self.change_listeners.snapshot() {
            registration.invoke(|listener| listener(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Progress;
    use docsync_core::{Database, MutableDocument};
    use std::sync::mpsc;

    fn replicator() -> (Replicator, Database, Database) {
        let local = Database::open_in_memory("local").unwrap();
        let remote = Database::open_in_memory("remote").unwrap();
        let config = ReplicatorConfiguration::new(local.clone(), Endpoint::local(remote.clone()));
        (Replicator::new(config).unwrap(), local, remote)
    }

    fn run_to_stop(replicator: &Replicator) -> Vec<ReplicatorStatus> {
        let (tx, rx) = mpsc::channel();
        let _token = replicator.add_change_listener(move |status| {
            let _ = tx.send(status.clone());
        });
        replicator.start();
        let mut seen = Vec::new();
        loop {
            let status = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            let stopped = status.activity == ActivityLevel::Stopped;
            seen.push(status);
            if stopped {
                return seen;
            }
        }
    }

    #[test]
    fn new_replicator_is_stopped() {
        let (replicator, _, _) = replicator();
        let status = replicator.status();
        assert_eq!(status.activity, ActivityLevel::Stopped);
        assert_eq!(status.progress, Progress::default());
        assert!(status.error.is_none());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let local = Database::open_in_memory("local").unwrap();
        let config = ReplicatorConfiguration::new(local.clone(), Endpoint::local(local));
        assert!(matches!(
            Replicator::new(config),
            Err(ReplicatorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn one_shot_runs_connecting_busy_stopped() {
        let (replicator, local, remote) = replicator();
        let mut doc = MutableDocument::new("doc1");
        doc.set("name", "Scott");
        local.save_document(&mut doc).unwrap();

        let seen = run_to_stop(&replicator);
        assert_eq!(seen.first().unwrap().activity, ActivityLevel::Connecting);
        assert!(seen.iter().any(|s| s.activity == ActivityLevel::Busy));
        assert!(seen.iter().all(|s| s.activity != ActivityLevel::Idle));
        assert_eq!(
            seen.iter()
                .filter(|s| s.activity == ActivityLevel::Stopped)
                .count(),
            1
        );
        let last = seen.last().unwrap();
        assert!(last.error.is_none());
        assert_eq!(last.progress.completed, last.progress.total);
        assert!(remote.get_document("doc1").unwrap().is_some());
    }

    #[test]
    fn progress_never_decreases() {
        let (replicator, local, _) = replicator();
        for i in 0..25 {
            local
                .save_document(&mut MutableDocument::new(format!("doc{i}")))
                .unwrap();
        }
        let config = replicator.config().clone().with_batch_size(4);
        let replicator = Replicator::new(config).unwrap();

        let seen = run_to_stop(&replicator);
        for pair in seen.windows(2) {
            assert!(pair[1].progress.completed >= pair[0].progress.completed);
            assert!(pair[1].progress.total >= pair[0].progress.total);
        }
        assert_eq!(seen.last().unwrap().progress.completed, 25);
    }

    #[test]
    fn stop_when_stopped_is_a_no_op() {
        let (replicator, _, _) = replicator();
        let (tx, rx) = mpsc::channel();
        let _token = replicator.add_change_listener(move |status| {
            let _ = tx.send(status.activity);
        });
        replicator.stop();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn reset_checkpoint_while_running_fails() {
        let (replicator, _, _) = replicator();
        let config = replicator
            .config()
            .clone()
            .with_continuous(true)
            .with_poll_interval(Duration::from_millis(20));
        let replicator = Replicator::new(config).unwrap();

        let (tx, rx) = mpsc::channel();
        let _token = replicator.add_change_listener(move |status| {
            let _ = tx.send(status.activity);
        });
        replicator.start();
        while rx.recv_timeout(Duration::from_secs(10)).unwrap() != ActivityLevel::Idle {}

        assert!(matches!(
            replicator.reset_checkpoint(),
            Err(ReplicatorError::InvalidState(_))
        ));
        replicator.stop();
        while rx.recv_timeout(Duration::from_secs(10)).unwrap() != ActivityLevel::Stopped {}
        assert!(replicator.reset_checkpoint().is_ok());
    }

    #[test]
    fn removed_listener_is_not_called() {
        let (replicator, _, _) = replicator();
        let (tx, rx) = mpsc::channel();
        let token = replicator.add_change_listener(move |status| {
            let _ = tx.send(status.activity);
        });
        token.remove();
        run_to_stop(&replicator);
        assert!(rx.try_recv().is_err());
    }
}
