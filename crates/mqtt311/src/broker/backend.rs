//! The brokering substrate shared by all connections: session
//! lookup and takeover, publish fan-out, retained messages, and the
//! graceful-close protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mqtt311_protocol::types::Message;
use mqtt311_protocol::{MqttError, Result, TopicTree};

use crate::broker::config::BrokerConfig;
use crate::broker::session::{MemorySession, Session};

/// Identifies one connection for the lifetime of the process.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh connection id.
#[must_use]
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Invoked by the client engine once a dequeued message has completed
/// its QoS exchange, so a durable backend can drop it from the queue.
pub type Ack = Box<dyn FnOnce() + Send + Sync + 'static>;

struct Signals {
    owner: Option<ConnectionId>,
    kill: CancellationToken,
    done: CancellationToken,
}

/// Runtime wrapper around a durable [`Session`]: the bounded FIFO
/// delivery queue, the owning connection, and the level-triggered
/// kill/done signals used for takeover.
pub struct SessionHandle {
    store: Arc<dyn Session>,
    queue_tx: flume::Sender<Message>,
    queue_rx: flume::Receiver<Message>,
    signals: parking_lot::Mutex<Signals>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(store: Arc<dyn Session>, queue_size: usize) -> Self {
        let (queue_tx, queue_rx) = flume::bounded(queue_size);
        Self {
            store,
            queue_tx,
            queue_rx,
            signals: parking_lot::Mutex::new(Signals {
                owner: None,
                kill: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
        }
    }

    /// The durable half of the session.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Session> {
        &self.store
    }

    #[must_use]
    pub fn owner(&self) -> Option<ConnectionId> {
        self.signals.lock().owner
    }

    pub fn set_owner(&self, owner: Option<ConnectionId>) {
        self.signals.lock().owner = owner;
    }

    /// The current kill signal. Once fired, every wait on it returns
    /// immediately.
    #[must_use]
    pub fn kill_token(&self) -> CancellationToken {
        self.signals.lock().kill.clone()
    }

    #[must_use]
    pub fn done_token(&self) -> CancellationToken {
        self.signals.lock().done.clone()
    }

    /// Fires the kill signal for the current owner.
    pub fn kill(&self) {
        self.signals.lock().kill.cancel();
    }

    /// Marks the owning connection as fully terminated.
    pub fn signal_done(&self) {
        self.signals.lock().done.cancel();
    }

    /// Re-arms the kill/done signals for a new owner. The delivery
    /// queue is left untouched so offline messages survive.
    pub fn reuse(&self) {
        let mut signals = self.signals.lock();
        signals.kill = CancellationToken::new();
        signals.done = CancellationToken::new();
    }

    /// Non-blocking queue append, used when the publisher would
    /// otherwise deadlock on its own queue.
    pub fn try_enqueue(&self, message: Message) -> Result<()> {
        self.queue_tx
            .try_send(message)
            .map_err(|_| MqttError::QueueFull)
    }

    /// Blocking queue append for foreign publishers. Gives up when
    /// the session's kill signal fires.
    pub async fn enqueue(&self, message: Message) -> Result<()> {
        let kill = self.kill_token();
        tokio::select! {
            result = self.queue_tx.send_async(message) => {
                result.map_err(|_| MqttError::SessionGone)
            }
            () = kill.cancelled() => Err(MqttError::Killed),
        }
    }

    /// Next queued message; `None` once `close` fires.
    pub async fn dequeue(&self, close: &CancellationToken) -> Result<Option<Message>> {
        let kill = self.kill_token();
        tokio::select! {
            result = self.queue_rx.recv_async() => {
                result.map(Some).map_err(|_| MqttError::SessionGone)
            }
            () = close.cancelled() => Ok(None),
            () = kill.cancelled() => Err(MqttError::Killed),
        }
    }
}

/// Result of a successful [`Backend::setup`].
pub struct Setup {
    pub session: Arc<SessionHandle>,
    /// Whether an existing stored session was resumed.
    pub resumed: bool,
}

impl std::fmt::Debug for Setup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Setup").field("resumed", &self.resumed).finish_non_exhaustive()
    }
}

/// The brokering operations a client engine drives.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Checks the client's credentials. `Ok(false)` rejects the
    /// connection with "not authorized".
    async fn authenticate(&self, user: Option<&str>, password: Option<&[u8]>) -> Result<bool>;

    /// Returns the stored session for `client_id` or creates one,
    /// killing any client currently owning it. An empty id yields a
    /// temporary session that is discarded on disconnect.
    async fn setup(&self, client: ConnectionId, client_id: &str, clean: bool) -> Result<Setup>;

    /// Called once after stored inflight packets have been resent;
    /// the backend may begin feeding missed messages.
    async fn restored(&self, session: &Arc<SessionHandle>) -> Result<()>;

    /// Subscribes the client to a topic. The broker mirrors the
    /// subscription into the session's subscription set itself.
    async fn subscribe(
        &self,
        session: &Arc<SessionHandle>,
        subscription: &mqtt311_protocol::Subscription,
    ) -> Result<()>;

    /// Unsubscribes the client from a topic.
    async fn unsubscribe(&self, session: &Arc<SessionHandle>, topic: &str) -> Result<()>;

    /// Next outbound message for the session, blocking until one is
    /// available. Returns `None` once `close` fires; fails with
    /// [`MqttError::Killed`] when the session is taken over.
    async fn dequeue(
        &self,
        session: &Arc<SessionHandle>,
        close: &CancellationToken,
    ) -> Result<Option<(Message, Option<Ack>)>>;

    /// Forwards `message` to every session with a matching
    /// subscription, including offline durable ones. Appending to the
    /// publisher's own full queue fails with
    /// [`MqttError::QueueFull`] instead of deadlocking.
    async fn publish(&self, client: ConnectionId, message: Message) -> Result<()>;

    /// Stores a retained message at its topic.
    async fn store_retained(&self, message: Message) -> Result<()>;

    /// Removes the retained message at `topic`.
    async fn clear_retained(&self, topic: &str) -> Result<()>;

    /// Enqueues every retained message matching `filter` into the
    /// session's queue.
    async fn queue_retained(&self, session: &Arc<SessionHandle>, filter: &str) -> Result<()>;

    /// Releases ownership when the client goes offline: drops the
    /// client-id mapping, discards a temporary session, and fires the
    /// done signal.
    async fn terminate(
        &self,
        client: ConnectionId,
        client_id: &str,
        session: &Arc<SessionHandle>,
    ) -> Result<()>;

    /// Kills every owned session and waits for all of them to
    /// terminate. Returns whether everything finished within
    /// `timeout`.
    async fn close(&self, timeout: Duration) -> bool;
}

struct BackendState {
    closing: bool,
    active_clients: HashMap<String, ConnectionId>,
    stored_sessions: HashMap<String, Arc<SessionHandle>>,
    temporary_sessions: HashMap<ConnectionId, Arc<SessionHandle>>,
    retained_messages: TopicTree<Message>,
}

/// The reference backend: everything lives in memory.
pub struct MemoryBackend {
    config: BrokerConfig,
    state: AsyncMutex<BackendState>,
    // Serialises CONNECT handling so takeover is atomic with respect
    // to a concurrent CONNECT for the same id. Always acquired before
    // the coarse state lock; held across the bounded kill wait while
    // the state lock is released.
    setup_lock: AsyncMutex<()>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: AsyncMutex::new(BackendState {
                closing: false,
                active_clients: HashMap::new(),
                stored_sessions: HashMap::new(),
                temporary_sessions: HashMap::new(),
                retained_messages: TopicTree::new(),
            }),
            setup_lock: AsyncMutex::new(()),
        }
    }

    fn new_session(&self) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(
            Arc::new(MemorySession::new()),
            self.config.session_queue_size,
        ))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn authenticate(&self, user: Option<&str>, password: Option<&[u8]>) -> Result<bool> {
        let state = self.state.lock().await;
        if state.closing {
            return Err(MqttError::Closing);
        }

        let Some(ref credentials) = self.config.credentials else {
            return Ok(true);
        };
        let (Some(user), Some(password)) = (user, password) else {
            return Ok(false);
        };
        Ok(credentials
            .get(user)
            .is_some_and(|expected| expected.as_bytes() == password))
    }

    async fn setup(&self, client: ConnectionId, client_id: &str, clean: bool) -> Result<Setup> {
        let _setup = self.setup_lock.lock().await;
        let mut state = self.state.lock().await;

        if state.closing {
            return Err(MqttError::Closing);
        }

        if client_id.is_empty() {
            let session = self.new_session();
            session.set_owner(Some(client));
            state.temporary_sessions.insert(client, session.clone());
            return Ok(Setup {
                session,
                resumed: false,
            });
        }

        // Find the session currently holding this client id, stored
        // or temporary.
        let existing = state.stored_sessions.get(client_id).cloned().or_else(|| {
            state
                .active_clients
                .get(client_id)
                .and_then(|conn| state.temporary_sessions.get(conn))
                .cloned()
        });

        if let Some(existing) = existing {
            if existing.owner().is_some() {
                info!(client_id, "taking over session, killing current owner");
                let done = existing.done_token();
                existing.kill();

                // Release the coarse lock so the victim can publish
                // its will and terminate; keep the setup lock so no
                // other CONNECT interleaves.
                drop(state);
                if tokio::time::timeout(self.config.kill_timeout, done.cancelled())
                    .await
                    .is_err()
                {
                    warn!(client_id, "killed client did not exit in time");
                    return Err(MqttError::KillTimeout);
                }
                state = self.state.lock().await;
            }
        }

        if clean {
            state.stored_sessions.remove(client_id);

            let session = self.new_session();
            session.set_owner(Some(client));
            state.temporary_sessions.insert(client, session.clone());
            state.active_clients.insert(client_id.to_string(), client);
            return Ok(Setup {
                session,
                resumed: false,
            });
        }

        if let Some(session) = state.stored_sessions.get(client_id).cloned() {
            session.reuse();
            session.set_owner(Some(client));
            state.active_clients.insert(client_id.to_string(), client);
            return Ok(Setup {
                session,
                resumed: true,
            });
        }

        let session = self.new_session();
        session.set_owner(Some(client));
        state
            .stored_sessions
            .insert(client_id.to_string(), session.clone());
        state.active_clients.insert(client_id.to_string(), client);
        Ok(Setup {
            session,
            resumed: false,
        })
    }

    async fn restored(&self, _session: &Arc<SessionHandle>) -> Result<()> {
        // Missed messages are already sitting in the session queue.
        Ok(())
    }

    async fn subscribe(
        &self,
        _session: &Arc<SessionHandle>,
        _subscription: &mqtt311_protocol::Subscription,
    ) -> Result<()> {
        // The broker adds the subscription to the session itself.
        Ok(())
    }

    async fn unsubscribe(&self, _session: &Arc<SessionHandle>, _topic: &str) -> Result<()> {
        // The broker removes the subscription from the session itself.
        Ok(())
    }

    async fn dequeue(
        &self,
        session: &Arc<SessionHandle>,
        close: &CancellationToken,
    ) -> Result<Option<(Message, Option<Ack>)>> {
        // No lock needed; the queue carries its own synchronisation.
        // Delivery is only acknowledged for QoS 0 here; a durable
        // backend would return an ack that fires on persistence.
        Ok(session.dequeue(close).await?.map(|message| (message, None)))
    }

    async fn publish(&self, client: ConnectionId, message: Message) -> Result<()> {
        let state = self.state.lock().await;

        let sessions = state
            .temporary_sessions
            .values()
            .chain(state.stored_sessions.values());
        for session in sessions {
            if session
                .store()
                .lookup_subscription(&message.topic)?
                .is_none()
            {
                continue;
            }

            if session.owner() == Some(client) {
                // A client publishing into its own queue must not
                // block; a full queue here is the self-deadlock case.
                session.try_enqueue(message.clone())?;
            } else {
                match session.enqueue(message.clone()).await {
                    Ok(()) => {}
                    Err(MqttError::Killed) => {
                        // The target is being taken over; keep the
                        // message if its queue has room.
                        if session.try_enqueue(message.clone()).is_err() {
                            debug!(topic = %message.topic, "queue full on killed session, dropping");
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(())
    }

    async fn store_retained(&self, message: Message) -> Result<()> {
        let mut state = self.state.lock().await;
        let topic = message.topic.clone();
        state.retained_messages.set(&topic, message);
        Ok(())
    }

    async fn clear_retained(&self, topic: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.retained_messages.empty(topic);
        Ok(())
    }

    async fn queue_retained(&self, session: &Arc<SessionHandle>, filter: &str) -> Result<()> {
        let state = self.state.lock().await;
        for message in state.retained_messages.scan(filter) {
            session.try_enqueue(message)?;
        }
        Ok(())
    }

    async fn terminate(
        &self,
        client: ConnectionId,
        client_id: &str,
        session: &Arc<SessionHandle>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        session.set_owner(None);
        state.temporary_sessions.remove(&client);
        if state.active_clients.get(client_id) == Some(&client) {
            state.active_clients.remove(client_id);
        }

        session.signal_done();
        Ok(())
    }

    async fn close(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().await;
        state.closing = true;

        let mut pending = Vec::new();
        for session in state.temporary_sessions.values() {
            session.kill();
            pending.push(session.done_token());
        }
        for session in state.stored_sessions.values() {
            if session.owner().is_some() {
                session.kill();
                pending.push(session.done_token());
            }
        }

        // Release the lock so the killed clients can terminate.
        drop(state);

        if pending.is_empty() {
            return true;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for done in pending {
            if tokio::time::timeout_at(deadline, done.cancelled())
                .await
                .is_err()
            {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt311_protocol::{QoS, Subscription};

    fn backend() -> MemoryBackend {
        MemoryBackend::new(BrokerConfig {
            kill_timeout: Duration::from_millis(50),
            session_queue_size: 4,
            ..BrokerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_authenticate_open_and_credentialed() {
        let open = backend();
        assert!(open.authenticate(None, None).await.unwrap());

        let mut credentials = HashMap::new();
        credentials.insert("alice".to_string(), "secret".to_string());
        let closed = MemoryBackend::new(BrokerConfig::default().with_credentials(credentials));

        assert!(closed
            .authenticate(Some("alice"), Some(b"secret"))
            .await
            .unwrap());
        assert!(!closed
            .authenticate(Some("alice"), Some(b"wrong"))
            .await
            .unwrap());
        assert!(!closed.authenticate(None, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_setup_lifecycles() {
        let backend = backend();

        // Temporary session for an empty client id.
        let temp = backend.setup(1, "", true).await.unwrap();
        assert!(!temp.resumed);

        // Fresh durable session.
        let first = backend.setup(2, "c1", false).await.unwrap();
        assert!(!first.resumed);
        backend.terminate(2, "c1", &first.session).await.unwrap();

        // Resumed durable session.
        let second = backend.setup(3, "c1", false).await.unwrap();
        assert!(second.resumed);
        assert!(Arc::ptr_eq(&first.session, &second.session));
        backend.terminate(3, "c1", &second.session).await.unwrap();

        // Clean session discards the stored one.
        let third = backend.setup(4, "c1", true).await.unwrap();
        assert!(!third.resumed);
        assert!(!Arc::ptr_eq(&first.session, &third.session));
    }

    #[tokio::test]
    async fn test_setup_kills_existing_owner() {
        let backend = Arc::new(backend());

        let first = backend.setup(1, "c1", false).await.unwrap();
        let kill = first.session.kill_token();

        // The victim terminates once killed.
        let victim = {
            let backend = backend.clone();
            let session = first.session.clone();
            tokio::spawn(async move {
                kill.cancelled().await;
                backend.terminate(1, "c1", &session).await.unwrap();
            })
        };

        let second = backend.setup(2, "c1", false).await.unwrap();
        assert!(second.resumed);
        victim.await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_kill_timeout() {
        let backend = backend();
        let _first = backend.setup(1, "c1", false).await.unwrap();

        // Nobody terminates the victim.
        let err = backend.setup(2, "c1", false).await.unwrap_err();
        assert!(matches!(err, MqttError::KillTimeout));
    }

    #[tokio::test]
    async fn test_publish_routes_to_matching_sessions() {
        let backend = backend();
        let a = backend.setup(1, "a", false).await.unwrap().session;
        let b = backend.setup(2, "b", false).await.unwrap().session;

        a.store()
            .save_subscription(&Subscription::new("t/+", QoS::AtMostOnce))
            .unwrap();

        backend
            .publish(2, Message::new("t/x", &b"hi"[..], QoS::AtMostOnce))
            .await
            .unwrap();

        let close = CancellationToken::new();
        let (message, ack) = backend.dequeue(&a, &close).await.unwrap().unwrap();
        assert_eq!(message.topic, "t/x");
        assert!(ack.is_none());

        // b has no subscription and receives nothing.
        close.cancel();
        assert!(backend.dequeue(&b, &close).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_offline_durable_session() {
        let backend = backend();
        let a = backend.setup(1, "a", false).await.unwrap().session;
        a.store()
            .save_subscription(&Subscription::new("t", QoS::AtLeastOnce))
            .unwrap();
        backend.terminate(1, "a", &a).await.unwrap();

        backend
            .publish(9, Message::new("t", &b"x"[..], QoS::AtLeastOnce))
            .await
            .unwrap();

        let resumed = backend.setup(2, "a", false).await.unwrap();
        assert!(resumed.resumed);
        let close = CancellationToken::new();
        let (message, _) = backend.dequeue(&resumed.session, &close).await.unwrap().unwrap();
        assert_eq!(message.topic, "t");
    }

    #[tokio::test]
    async fn test_publish_own_full_queue_fails() {
        let backend = backend();
        let a = backend.setup(1, "a", false).await.unwrap().session;
        a.store()
            .save_subscription(&Subscription::new("t", QoS::AtMostOnce))
            .unwrap();

        // Fill the queue (capacity 4) from the owner itself.
        for _ in 0..4 {
            backend
                .publish(1, Message::new("t", &b"m"[..], QoS::AtMostOnce))
                .await
                .unwrap();
        }
        let err = backend
            .publish(1, Message::new("t", &b"m"[..], QoS::AtMostOnce))
            .await
            .unwrap_err();
        assert!(matches!(err, MqttError::QueueFull));
    }

    #[tokio::test]
    async fn test_retained_store_scan_clear() {
        let backend = backend();
        backend
            .store_retained(Message::new("a/b", &b"r"[..], QoS::AtMostOnce).with_retain(true))
            .await
            .unwrap();

        let session = backend.setup(1, "s", false).await.unwrap().session;
        backend.queue_retained(&session, "a/#").await.unwrap();

        let close = CancellationToken::new();
        let (message, _) = backend.dequeue(&session, &close).await.unwrap().unwrap();
        assert_eq!(message.topic, "a/b");
        assert!(message.retain);

        backend.clear_retained("a/b").await.unwrap();
        backend.queue_retained(&session, "a/#").await.unwrap();
        close.cancel();
        assert!(backend.dequeue(&session, &close).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_waits_for_done() {
        let backend = Arc::new(backend());
        let setup = backend.setup(1, "c1", false).await.unwrap();

        let session = setup.session.clone();
        let kill = session.kill_token();
        let terminator = {
            let backend = backend.clone();
            tokio::spawn(async move {
                kill.cancelled().await;
                backend.terminate(1, "c1", &session).await.unwrap();
            })
        };

        assert!(backend.close(Duration::from_secs(1)).await);
        terminator.await.unwrap();

        // New connections are refused while closing.
        let err = backend.setup(2, "c2", false).await.unwrap_err();
        assert!(matches!(err, MqttError::Closing));
    }

    #[tokio::test]
    async fn test_close_times_out_on_stuck_client() {
        let backend = backend();
        let _setup = backend.setup(1, "c1", false).await.unwrap();
        assert!(!backend.close(Duration::from_millis(20)).await);
    }
}
