//! Session management for the streaming HTTP transport.
//!
//! A [`Session`] is created by a successful `initialize` and carries the
//! protocol [`Connection`] of one logical client across HTTP requests. It is
//! destroyed by an explicit terminate request or evicted by the sweep once it
//! has been idle for longer than the configured timeout.
//!
//! Requests hold a [`SessionLease`] while they run. Leasing checks expiry and
//! extends the session's lifetime under the same lock, and the sweep never
//! evicts a leased session, so a session cannot disappear mid-request.
//! Expiry is also enforced on lookup: an idle session is invalid as soon as
//! the timeout has elapsed, whether or not the sweep has run yet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::mcp::protocol::OutgoingMessage;
use crate::mcp::server::Connection;
use crate::security::RateLimiter;
use crate::telemetry::Telemetry;

/// Default idle timeout for sessions.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Messages buffered per push channel before new ones are dropped.
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug)]
struct Activity {
    last_activity: Instant,
    leases: usize,
}

#[derive(Debug)]
struct ChannelHandle {
    /// `None` for reply streams, which take no broadcasts.
    tx: Option<mpsc::Sender<OutgoingMessage>>,
    closed: CancellationToken,
}

/// Server-side state of one client conversation.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    connection: Arc<Connection>,
    client: Value,
    activity: Mutex<Activity>,
    channels: Mutex<HashMap<u64, ChannelHandle>>,
    next_channel: AtomicU64,
}

impl Session {
    fn new(connection: Arc<Connection>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
            client: connection.client_metadata(),
            connection,
            activity: Mutex::new(Activity {
                last_activity: Instant::now(),
                leases: 0,
            }),
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
        }
    }

    /// The session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the session was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Client metadata captured at `initialize`.
    #[must_use]
    pub const fn client(&self) -> &Value {
        &self.client
    }

    /// The protocol state shared by every request of this session.
    #[must_use]
    pub const fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Time since the session was last used.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.activity.lock().last_activity.elapsed()
    }

    /// Number of open push channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Opens a push channel owned by this session.
    pub fn open_channel(self: &Arc<Self>) -> PushChannel {
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let closed = CancellationToken::new();
        self.channels.lock().insert(
            id,
            ChannelHandle {
                tx: Some(tx.clone()),
                closed: closed.clone(),
            },
        );
        debug!(session = %self.id, channel = id, "Push channel opened");

        PushChannel {
            id,
            session: Arc::clone(self),
            tx,
            rx,
            closed,
        }
    }

    /// Queues a message on every open channel.
    ///
    /// Channels whose receiver is gone are removed. Returns the number of
    /// channels the message was queued on.
    pub fn broadcast(&self, message: &OutgoingMessage) -> usize {
        let mut channels = self.channels.lock();
        let mut delivered = 0;
        channels.retain(|id, handle| {
            let Some(tx) = &handle.tx else {
                return true;
            };
            match tx.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session = %self.id, channel = id, "Push channel full, dropping message");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    /// Closes every channel. Pending messages are discarded.
    fn close_channels(&self) -> usize {
        let channels = std::mem::take(&mut *self.channels.lock());
        for handle in channels.values() {
            handle.closed.cancel();
        }
        channels.len()
    }

    fn release_channel(&self, id: u64) {
        if self.channels.lock().remove(&id).is_some() {
            debug!(session = %self.id, channel = id, "Push channel closed");
        }
    }

    /// Whether the session is idle past `timeout` with no request in flight.
    fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        let activity = self.activity.lock();
        activity.leases == 0 && now.duration_since(activity.last_activity) >= timeout
    }
}

/// One server-to-client stream owned by a session.
///
/// Dropping the channel unregisters it from its session.
#[derive(Debug)]
pub struct PushChannel {
    id: u64,
    session: Arc<Session>,
    tx: mpsc::Sender<OutgoingMessage>,
    rx: mpsc::Receiver<OutgoingMessage>,
    closed: CancellationToken,
}

impl PushChannel {
    /// The channel id, unique within its session.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The owning session.
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// A sender for producing a reply sequence onto this channel.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<OutgoingMessage> {
        self.tx.clone()
    }

    /// Marks the channel as carrying one reply sequence: it ends once every
    /// sender from [`PushChannel::sender`] has been dropped and the queue is drained.
    ///
    /// The channel stays registered under its session, so terminating or
    /// expiring the session still closes it, but it no longer receives
    /// broadcasts.
    #[must_use]
    pub fn into_reply_stream(mut self) -> Self {
        if let Some(handle) = self.session.channels.lock().get_mut(&self.id) {
            handle.tx = None;
        }
        let (closed_tx, _) = mpsc::channel(1);
        self.tx = closed_tx;
        self
    }

    /// Receives the next message; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<OutgoingMessage> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            message = self.rx.recv() => message,
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.session.release_channel(self.id);
    }
}

/// Keeps a session alive while a request uses it.
///
/// Dropping the lease records activity.
#[derive(Debug)]
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    /// The leased session.
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl std::ops::Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut activity = self.session.activity.lock();
        activity.leases = activity.leases.saturating_sub(1);
        activity.last_activity = Instant::now();
    }
}

/// Creates, validates and expires sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    timeout: Duration,
    telemetry: Arc<dyn Telemetry>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.read().len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager that expires sessions idle for longer than `timeout`.
    #[must_use]
    pub fn new(timeout: Duration, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
            telemetry,
        }
    }

    /// The idle timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a session for an initialised connection.
    pub fn create(&self, connection: Arc<Connection>) -> Arc<Session> {
        let session = Arc::new(Session::new(connection));
        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));

        info!(session = %session.id, "Session created");
        self.telemetry.event(
            "session.created",
            json!({ "id": session.id, "client": session.client }),
        );
        session
    }

    /// Leases a session for the duration of a request.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Invalid`] if the id is unknown, terminated or expired.
    pub fn acquire(&self, id: &str) -> Result<SessionLease, SessionError> {
        let invalid = || SessionError::Invalid { id: id.to_string() };
        let now = Instant::now();
        {
            let sessions = self.sessions.read();
            let session = sessions.get(id).ok_or_else(invalid)?;
            let mut activity = session.activity.lock();
            if activity.leases > 0 || now.duration_since(activity.last_activity) < self.timeout {
                activity.leases += 1;
                activity.last_activity = now;
                return Ok(SessionLease {
                    session: Arc::clone(session),
                });
            }
        }

        self.expire(id, now);
        Err(invalid())
    }

    /// Records activity on a session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Invalid`] if the id is unknown, terminated or expired.
    pub fn touch(&self, id: &str) -> Result<(), SessionError> {
        self.acquire(id).map(drop)
    }

    /// Returns `true` if the session exists and has not expired.
    #[must_use]
    pub fn is_valid(&self, id: &str) -> bool {
        self.sessions
            .read()
            .get(id)
            .is_some_and(|s| !s.is_expired(self.timeout, Instant::now()))
    }

    /// Looks up a live session without recording activity.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .get(id)
            .filter(|s| !s.is_expired(self.timeout, Instant::now()))
            .cloned()
    }

    /// Terminates a session, closing its channels.
    ///
    /// Returns `false` if the session did not exist.
    pub fn destroy(&self, id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };
        let channels = session.close_channels();
        info!(session = %id, channels, "Session terminated");
        self.telemetry
            .event("session.terminated", json!({ "id": id, "channels": channels }));
        true
    }

    /// Terminates every session. Used on shutdown so open streams end.
    pub fn close_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.iter().filter(|id| self.destroy(id)).count()
    }

    /// Evicts every idle session whose timeout has elapsed.
    ///
    /// Returns the number of sessions evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.is_expired(self.timeout, now))
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            self.report_expired(session, now);
        }
        expired.len()
    }

    fn expire(&self, id: &str, now: Instant) {
        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(id) {
                Some(session) if session.is_expired(self.timeout, now) => sessions.remove(id),
                _ => None,
            }
        };
        if let Some(session) = removed {
            self.report_expired(&session, now);
        }
    }

    fn report_expired(&self, session: &Session, now: Instant) {
        let channels = session.close_channels();
        let idle = now.duration_since(session.activity.lock().last_activity);
        info!(session = %session.id, idle = ?idle, channels, "Session expired");
        self.telemetry.event(
            "session.expired",
            json!({
                "id": session.id,
                "idleMs": u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                "channels": channels,
            }),
        );
    }

    /// Queues a message on every channel of every session.
    pub fn broadcast(&self, message: &OutgoingMessage) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        sessions.iter().map(|s| s.broadcast(message)).sum()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns `true` if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Runs [`SessionManager::sweep`] every `interval` until `shutdown`.
    ///
    /// Idle rate limiter buckets are pruned on the same schedule.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        limiter: Option<Arc<RateLimiter>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = manager.sweep();
                        if evicted > 0 {
                            debug!(evicted, remaining = manager.len(), "Session sweep");
                        }
                        if let Some(limiter) = &limiter {
                            limiter.prune_idle(manager.timeout);
                        }
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::OutgoingNotification;
    use crate::telemetry::RecordingTelemetry;

    fn manager(timeout_secs: u64) -> (SessionManager, Arc<RecordingTelemetry>) {
        let telemetry = RecordingTelemetry::new();
        let manager = SessionManager::new(Duration::from_secs(timeout_secs), telemetry.clone());
        (manager, telemetry)
    }

    fn notification() -> OutgoingMessage {
        OutgoingNotification::tools_list_changed().into()
    }

    #[tokio::test(start_paused = true)]
    async fn session_valid_until_idle_timeout() {
        let (manager, telemetry) = manager(60);
        let session = manager.create(Arc::new(Connection::new()));
        let id = session.id().to_string();

        assert_eq!(id.len(), 32);
        assert!(manager.is_valid(&id));

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(45)).await;
            manager.touch(&id).unwrap();
        }
        assert!(manager.is_valid(&id));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!manager.is_valid(&id));
        assert_eq!(
            manager.acquire(&id).unwrap_err(),
            SessionError::Invalid { id: id.clone() }
        );
        assert!(manager.is_empty());
        assert_eq!(telemetry.named("session.created").len(), 1);
        assert_eq!(telemetry.named("session.expired")[0]["id"], id);
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique() {
        let (manager, _) = manager(60);
        let a = manager.create(Arc::new(Connection::new()));
        let b = manager.create(Arc::new(Connection::new()));
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn leased_session_survives_sweep() {
        let (manager, _) = manager(10);
        let id = manager.create(Arc::new(Connection::new())).id().to_string();

        let lease = manager.acquire(&id).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.sweep(), 0);
        assert!(manager.is_valid(&id));

        drop(lease);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(manager.sweep(), 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(manager.sweep(), 1);
        assert!(!manager.is_valid(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_closes_channels() {
        let (manager, telemetry) = manager(60);
        let session = manager.create(Arc::new(Connection::new()));
        let mut channel = session.open_channel();
        assert_eq!(session.channel_count(), 1);

        assert!(manager.destroy(session.id()));
        assert!(!manager.destroy(session.id()));
        assert_eq!(channel.recv().await, None);
        assert!(!manager.is_valid(session.id()));
        assert_eq!(telemetry.named("session.terminated")[0]["channels"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_channels_of_expired_sessions() {
        let (manager, _) = manager(5);
        let session = manager.create(Arc::new(Connection::new()));
        let mut channel = session.open_channel();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(manager.sweep(), 1);
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_reaches_open_channels() {
        let (manager, _) = manager(60);
        let first = manager.create(Arc::new(Connection::new()));
        let second = manager.create(Arc::new(Connection::new()));
        let mut a = first.open_channel();
        let mut b = second.open_channel();
        let dropped = second.open_channel();
        drop(dropped);

        assert_eq!(manager.broadcast(&notification()), 2);
        assert_eq!(a.recv().await, Some(notification()));
        assert_eq!(b.recv().await, Some(notification()));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_stream_ends_after_senders_drop() {
        let (manager, _) = manager(60);
        let session = manager.create(Arc::new(Connection::new()));
        let channel = session.open_channel();
        let tx = channel.sender();
        let mut stream = channel.into_reply_stream();
        assert_eq!(session.channel_count(), 1);
        assert_eq!(manager.broadcast(&notification()), 0);

        tx.send(notification()).await.unwrap();
        drop(tx);
        assert_eq!(stream.recv().await, Some(notification()));
        assert_eq!(stream.recv().await, None);
        drop(stream);
        assert_eq!(session.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_ends_pending_reply_stream() {
        let (manager, telemetry) = manager(60);
        let session = manager.create(Arc::new(Connection::new()));
        let channel = session.open_channel();
        let tx = channel.sender();
        let mut stream = channel.into_reply_stream();

        assert!(manager.destroy(session.id()));

        let ended = tokio::time::timeout(Duration::from_millis(200), stream.recv()).await;
        assert_eq!(ended, Ok(None));
        assert_eq!(telemetry.named("session.terminated")[0]["channels"], 1);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_shutdown() {
        let (manager, _) = manager(5);
        let manager = Arc::new(manager);
        let limiter = Arc::new(RateLimiter::new(1.0, 1));
        limiter.check("client").unwrap();
        manager.create(Arc::new(Connection::new()));

        let shutdown = CancellationToken::new();
        let handle = manager.spawn_sweeper(
            Duration::from_secs(1),
            Some(Arc::clone(&limiter)),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(manager.is_empty());
        assert_eq!(limiter.tracked(), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
