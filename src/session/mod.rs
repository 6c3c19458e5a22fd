//! MQTT Session Management
//!
//! A session is NONE (no state anywhere), EPHEMERAL (clean session, lives
//! only as long as its connection) or PERSISTENT (survives disconnects,
//! backed by the durable store).
//!
//! Sessions resident in memory are the ones bound to a local connection.
//! Persistent sessions of offline clients are loaded while messages are
//! queued for them and released afterwards.

mod pending;

pub use pending::{DurablePending, MemoryPending, PendingStore};

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, trace};

use crate::persistence::{decode, encode, keys, DurableStore, StoreError, StoredWillMessage};
use crate::protocol::Will;
use crate::topic::SubscriptionRegistry;

/// Session errors
#[derive(Debug)]
pub enum SessionError {
    /// Durable store failure
    Store(StoreError),
    /// Every packet identifier is part of an unfinished handshake
    MessageIdsExhausted,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Store(e) => write!(f, "store error: {}", e),
            SessionError::MessageIdsExhausted => write!(f, "no free packet identifier"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Store(e) => Some(e),
            SessionError::MessageIdsExhausted => None,
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Session persistence kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Discarded when the connection closes
    Ephemeral,
    /// Survives disconnects
    Persistent,
}

/// Client session
pub struct Session {
    client_id: Arc<str>,
    kind: SessionKind,
    /// Next packet identifier to try, never 0
    next_id: AtomicU16,
    pending: Arc<dyn PendingStore>,
}

impl Session {
    fn new(
        client_id: Arc<str>,
        kind: SessionKind,
        next_id: u16,
        pending: Arc<dyn PendingStore>,
    ) -> Self {
        Self {
            client_id,
            kind,
            next_id: AtomicU16::new(next_id.max(1)),
            pending,
        }
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_persistent(&self) -> bool {
        self.kind == SessionKind::Persistent
    }

    pub fn pending(&self) -> &dyn PendingStore {
        self.pending.as_ref()
    }

    /// The id the counter will try next
    pub fn peek_next_id(&self) -> u16 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Allocate a packet identifier for an outbound message.
    ///
    /// Ids run 1..=65535 and wrap back to 1; ids still awaiting PUBACK,
    /// PUBREC or PUBCOMP are skipped.
    pub async fn next_message_id(&self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let id = self.advance();
            if !self.pending.in_use(id).await? {
                return Ok(id);
            }
        }
        Err(SessionError::MessageIdsExhausted)
    }

    fn advance(&self) -> u16 {
        let step = |id: u16| Some(if id == u16::MAX { 1 } else { id + 1 });
        // fetch_update only fails when the closure returns None
        match self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, step)
        {
            Ok(id) | Err(id) => id.max(1),
        }
    }
}

/// Owns every resident session
pub struct SessionManager {
    store: Arc<dyn DurableStore>,
    registry: Arc<SubscriptionRegistry>,
    sessions: DashMap<Arc<str>, Arc<Session>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn DurableStore>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            store,
            registry,
            sessions: DashMap::new(),
        }
    }

    /// Open a session for a connecting client.
    ///
    /// Returns the session and the CONNACK session-present flag.
    pub async fn open(&self, client_id: &str, clean_session: bool) -> Result<(Arc<Session>, bool)> {
        let client_id: Arc<str> = client_id.into();

        if clean_session {
            self.discard(&client_id).await?;
            let session = Arc::new(Session::new(
                client_id.clone(),
                SessionKind::Ephemeral,
                1,
                Arc::new(MemoryPending::new()),
            ));
            self.sessions.insert(client_id.clone(), session.clone());
            debug!("Opened ephemeral session for {}", client_id);
            return Ok((session, false));
        }

        let resident = self.sessions.get(&client_id).map(|s| s.clone());
        if let Some(existing) = resident {
            if existing.is_persistent() {
                debug!("Resuming resident session for {}", client_id);
                return Ok((existing, true));
            }
            // Ephemeral leftover of a connection that was taken over
            self.discard(&client_id).await?;
        }

        let present = self.store.sismember(keys::SESSIONS, &client_id).await?;
        let next_id = if present {
            self.load_next_id(&client_id).await?
        } else {
            self.store.sadd(keys::SESSIONS, &client_id).await?;
            1
        };

        let session = Arc::new(self.persistent(client_id.clone(), next_id));
        self.flush(&session).await?;
        self.sessions.insert(client_id.clone(), session.clone());

        if present {
            info!("Resumed persistent session for {}", client_id);
        } else {
            debug!("Created persistent session for {}", client_id);
        }
        Ok((session, present))
    }

    /// Wipe every trace of a client's session: resident state, durable
    /// session record, pending deliveries and subscriptions.
    pub async fn discard(&self, client_id: &str) -> Result<()> {
        if let Some((_, resident)) = self.sessions.remove(client_id) {
            resident.pending().clear().await?;
        }
        DurablePending::new(self.store.clone(), client_id)
            .clear()
            .await?;
        self.store.del(&keys::session(client_id)).await?;
        self.store.srem(keys::SESSIONS, client_id).await?;
        self.registry.clear_client_subscriptions(client_id).await?;
        debug!("Discarded session state of {}", client_id);
        Ok(())
    }

    /// Release a session when its connection ends.
    ///
    /// Ephemeral state is dropped; persistent sessions flush their id
    /// counter and forget the stored will.
    pub async fn close(&self, session: &Arc<Session>) -> Result<()> {
        let client_id = session.client_id();
        let was_resident = self
            .sessions
            .remove_if(client_id, |_, s| Arc::ptr_eq(s, session))
            .is_some();

        match session.kind() {
            SessionKind::Ephemeral => {
                if was_resident {
                    session.pending().clear().await?;
                    self.registry.clear_client_subscriptions(client_id).await?;
                }
            }
            SessionKind::Persistent => {
                // A clean-session CONNECT may have discarded it meanwhile
                if !was_resident && !self.store.sismember(keys::SESSIONS, client_id).await? {
                    debug!("Session of {} was discarded, nothing to persist", client_id);
                    return Ok(());
                }
                self.flush(session).await?;
                self.save_will(client_id, None).await?;
            }
        }
        debug!("Closed {:?} session for {}", session.kind(), client_id);
        Ok(())
    }

    /// Persist the id counter of a persistent session
    pub async fn flush(&self, session: &Session) -> Result<()> {
        if session.is_persistent() {
            let next = session.peek_next_id().to_be_bytes();
            self.store
                .hset(
                    &keys::session(session.client_id()),
                    keys::FIELD_NEXT_ID,
                    Bytes::copy_from_slice(&next),
                )
                .await?;
        }
        Ok(())
    }

    /// Record (or clear) the will message of a persistent session
    pub async fn save_will(&self, client_id: &str, will: Option<&Will>) -> Result<()> {
        let key = keys::session(client_id);
        match will {
            Some(will) => {
                let stored = StoredWillMessage::from(will);
                self.store
                    .hset(&key, keys::FIELD_WILL, encode(&stored)?)
                    .await?;
            }
            None => {
                self.store.hdel(&key, keys::FIELD_WILL).await?;
            }
        }
        Ok(())
    }

    /// Remove and return the stored will of a persistent session
    pub async fn take_will(&self, client_id: &str) -> Result<Option<Will>> {
        let key = keys::session(client_id);
        let Some(bytes) = self.store.hget(&key, keys::FIELD_WILL).await? else {
            return Ok(None);
        };
        self.store.hdel(&key, keys::FIELD_WILL).await?;
        let stored: StoredWillMessage = decode(&bytes)?;
        Ok(Some(stored.to_will()?))
    }

    /// Persistent sessions that still hold a will, meaning their last
    /// connection never went through teardown
    pub async fn clients_with_will(&self) -> Result<Vec<String>> {
        let mut clients = Vec::new();
        for client_id in self.store.smembers(keys::SESSIONS).await? {
            if self
                .store
                .hexists(&keys::session(&client_id), keys::FIELD_WILL)
                .await?
            {
                clients.push(client_id);
            }
        }
        Ok(clients)
    }

    /// Drop the resident session of a client that connected to another
    /// broker. Ephemeral state goes with it; persistent state stays in the
    /// store for the new owner.
    pub async fn evict(&self, client_id: &str) -> Result<Option<Arc<Session>>> {
        let Some((_, session)) = self.sessions.remove(client_id) else {
            return Ok(None);
        };
        match session.kind() {
            SessionKind::Ephemeral => {
                session.pending().clear().await?;
                self.registry.apply_remote_clear(client_id);
            }
            SessionKind::Persistent => self.flush(&session).await?,
        }
        debug!("Evicted {:?} session of {}", session.kind(), client_id);
        Ok(Some(session))
    }

    /// Resident session of a client, if any
    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    /// The persistent session of a client that may be offline, loading it
    /// from the store when it is not resident.
    ///
    /// Workers queueing for the same offline client share one loaded
    /// session, and so one id counter. Hand it back with [`release`] once
    /// done.
    ///
    /// [`release`]: SessionManager::release
    pub async fn persistent_session(&self, client_id: &str) -> Result<Option<Arc<Session>>> {
        if let Some(session) = self.get(client_id) {
            return Ok(session.is_persistent().then_some(session));
        }
        if !self.store.sismember(keys::SESSIONS, client_id).await? {
            return Ok(None);
        }

        let next_id = self.load_next_id(client_id).await?;
        let loaded = Arc::new(self.persistent(client_id.into(), next_id));
        let session = self
            .sessions
            .entry(loaded.client_id().clone())
            .or_insert(loaded)
            .clone();
        Ok(session.is_persistent().then_some(session))
    }

    /// Flush a session obtained from [`persistent_session`] and drop it
    /// from memory unless a connection or another worker still holds it.
    ///
    /// [`persistent_session`]: SessionManager::persistent_session
    pub async fn release(&self, session: Arc<Session>) -> Result<()> {
        self.flush(&session).await?;
        // Held only by the map and by this call
        let released = self
            .sessions
            .remove_if(session.client_id(), |_, resident| {
                Arc::ptr_eq(resident, &session) && Arc::strong_count(resident) == 2
            })
            .is_some();
        if released {
            trace!("Released offline session of {}", session.client_id());
        }
        Ok(())
    }

    /// Number of resident sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn persistent(&self, client_id: Arc<str>, next_id: u16) -> Session {
        let pending = Arc::new(DurablePending::new(self.store.clone(), &client_id));
        Session::new(client_id, SessionKind::Persistent, next_id, pending)
    }

    async fn load_next_id(&self, client_id: &str) -> Result<u16> {
        let stored = self
            .store
            .hget(&keys::session(client_id), keys::FIELD_NEXT_ID)
            .await?;
        Ok(stored
            .and_then(|bytes| <[u8; 2]>::try_from(bytes.as_ref()).ok())
            .map(u16::from_be_bytes)
            .unwrap_or(1)
            .max(1))
    }
}
