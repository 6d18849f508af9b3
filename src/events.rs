//! # Connection events: how the supervisor layer learns about bridge state.
//!
//! A bridge can be lost at any moment, and disposal may be initiated by
//! either side (a local close or a worker crash look identical from here).
//! Components that must react — the pool entry flipping its availability,
//! the restart logic — therefore subscribe to the connection instead of
//! inspecting it:
//!
//! ```text
//! OfficeConnection ── state flip ──► ConnectionEventListener::connected
//!                                  ► ConnectionEventListener::disconnected
//! ```
//!
//! ## Rules
//! - Listeners are invoked **after** the state flip they report; a listener
//!   that immediately restarts observes the latest state.
//! - Listeners are invoked in registration order.
//! - Callbacks are synchronous and must not block; anything long-running is
//!   handed off (the pool entry forwards restart requests to the lifecycle
//!   actor and returns).

use std::fmt;

use crate::transport::ConnectUrl;

/// Bridge connection state, as tracked by
/// [`OfficeConnection`](crate::OfficeConnection).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live bridge session.
    Disconnected,
    /// A bridge session is established.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Immutable snapshot carried to listener callbacks.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    url: ConnectUrl,
}

impl ConnectionEvent {
    pub(crate) fn new(url: ConnectUrl) -> Self {
        Self { url }
    }

    /// Address of the connection the event belongs to.
    pub fn url(&self) -> &ConnectUrl {
        &self.url
    }
}

/// Receives connection lifecycle notifications.
///
/// Registered via
/// [`OfficeConnection::add_listener`](crate::OfficeConnection::add_listener);
/// there is no removal — listeners live as long as the connection.
pub trait ConnectionEventListener: Send + Sync {
    /// The connection was established; state already reads `Connected`.
    fn connected(&self, event: &ConnectionEvent);

    /// The connection was lost, whether by local close or worker crash; state
    /// already reads `Disconnected` and the session reference is cleared.
    fn disconnected(&self, event: &ConnectionEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_carries_url() {
        let event = ConnectionEvent::new(ConnectUrl::socket(2002));
        assert_eq!(event.url(), &ConnectUrl::socket(2002));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
