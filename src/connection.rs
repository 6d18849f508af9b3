//! # OfficeConnection: state wrapper around one bridge session.
//!
//! [`OfficeConnection`] owns the logical bridge to one worker process: the
//! current [`BridgeSession`], an atomic [`ConnectionState`], and the listener
//! list. It is deliberately thin — the handshake itself lives behind
//! [`BridgeTransport`], and all callers serialize through the owning
//! supervisor's lifecycle actor, so at most one `connect()` is ever in flight.
//!
//! ## Disposal is the authoritative signal
//! [`disconnect`](OfficeConnection::disconnect) closes the local endpoint but
//! does **not** flip the state. The state flips to `Disconnected` only when
//! the disposal watcher observes [`BridgeSession::disposed`] — which fires for
//! a local close and a worker crash alike. Restart logic therefore hangs off
//! the `disconnected` listener callback, never off the `disconnect()` caller.
//!
//! ## Rules
//! - Listeners are notified strictly **after** the state flip, in
//!   registration order.
//! - The session reference is cleared **before** the `disconnected`
//!   notification, so a listener that immediately restarts never observes a
//!   stale session.
//! - Each session produces exactly one `disconnected` delivery: normally from
//!   its watcher, or synchronously at the next `connect()` when the watcher
//!   has not run yet (the epoch counter invalidates it).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::error::OfficeError;
use crate::events::{ConnectionEvent, ConnectionEventListener, ConnectionState};
use crate::transport::{BridgeSession, BridgeTransport, ConnectUrl};

const DISCONNECTED: u8 = 0;
const CONNECTED: u8 = 1;

/// Logical bridge to one worker process.
pub struct OfficeConnection {
    url: ConnectUrl,
    transport: Arc<dyn BridgeTransport>,
    state: AtomicU8,
    /// Bumped on every session install and settle; a disposal watcher only
    /// acts when its captured epoch is still current.
    epoch: AtomicU64,
    session: Mutex<Option<Arc<dyn BridgeSession>>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
}

impl OfficeConnection {
    /// Creates a disconnected connection for `url`.
    pub fn new(url: ConnectUrl, transport: Arc<dyn BridgeTransport>) -> Arc<Self> {
        Arc::new(Self {
            url,
            transport,
            state: AtomicU8::new(DISCONNECTED),
            epoch: AtomicU64::new(0),
            session: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Address this connection talks to.
    pub fn url(&self) -> &ConnectUrl {
        &self.url
    }

    /// Current state, read atomically.
    pub fn state(&self) -> ConnectionState {
        if self.state.load(Ordering::SeqCst) == CONNECTED {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// True while a bridge session is established.
    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CONNECTED
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<Arc<dyn BridgeSession>> {
        self.session_slot().clone()
    }

    /// Registers a listener; no removal, listeners live as long as the
    /// connection.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// Performs the bridge handshake and installs the session.
    ///
    /// On success the state flips to `Connected`, listeners are notified, and
    /// a disposal watcher is spawned. On failure the transport error is
    /// returned and the state is left untouched.
    pub async fn connect(self: &Arc<Self>) -> Result<(), OfficeError> {
        let session = self
            .transport
            .open(&self.url)
            .await
            .map_err(|source| OfficeError::Connect { source })?;

        // A previous session whose watcher has not run yet gets its
        // disconnected delivery now, before the new session is visible.
        self.settle_stale_session();

        let epoch = {
            let mut slot = self.session_slot();
            *slot = Some(session.clone());
            self.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.state.store(CONNECTED, Ordering::SeqCst);
        debug!(url = %self.url, "bridge connected");
        self.notify(|listener, event| listener.connected(event));

        let connection = Arc::downgrade(self);
        tokio::spawn(async move {
            session.disposed().await;
            if let Some(connection) = connection.upgrade() {
                connection.on_disposed(epoch);
            }
        });
        Ok(())
    }

    /// Closes the local endpoint.
    ///
    /// The state does not flip here; the disposal watcher flips it and fires
    /// `disconnected` once the session is actually gone.
    pub fn disconnect(&self) {
        if let Some(session) = self.session() {
            debug!(url = %self.url, "closing bridge session");
            session.close();
        }
    }

    /// Watcher entry point: clears the session, flips the state, notifies.
    fn on_disposed(&self, epoch: u64) {
        {
            let mut slot = self.session_slot();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                // Settled at a later connect(); nothing left to report.
                return;
            }
            *slot = None;
        }
        self.state.store(DISCONNECTED, Ordering::SeqCst);
        debug!(url = %self.url, "bridge disposed");
        self.notify(|listener, event| listener.disconnected(event));
    }

    /// Delivers the pending `disconnected` for a session whose watcher lost
    /// the race against a reconnect.
    fn settle_stale_session(&self) {
        let stale = self.session_slot().take();
        if stale.is_some() {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.state.store(DISCONNECTED, Ordering::SeqCst);
            warn!(url = %self.url, "settling undelivered disposal before reconnect");
            self.notify(|listener, event| listener.disconnected(event));
        }
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<Arc<dyn BridgeSession>>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify<F>(&self, deliver: F)
    where
        F: Fn(&dyn ConnectionEventListener, &ConnectionEvent),
    {
        let listeners: Vec<_> = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let event = ConnectionEvent::new(self.url.clone());
        for listener in listeners {
            deliver(listener.as_ref(), &event);
        }
    }
}

/// Listener adapter holding the target weakly, so a connection inside a
/// supervisor inside the target does not form a reference cycle.
pub(crate) struct WeakListener<T: ConnectionEventListener>(pub(crate) Weak<T>);

impl<T: ConnectionEventListener> ConnectionEventListener for WeakListener<T> {
    fn connected(&self, event: &ConnectionEvent) {
        if let Some(target) = self.0.upgrade() {
            target.connected(event);
        }
    }

    fn disconnected(&self, event: &ConnectionEvent) {
        if let Some(target) = self.0.upgrade() {
            target.disconnected(event);
        }
    }
}
