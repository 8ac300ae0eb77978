//! Pure connection lifetime state machine
//!
//! not-connected -> connecting -> connected -> closing -> closed, with
//! failed reachable from every live state and stop forcing closing.

use tracing::{error, info, warn};

/// Lifetime of one broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt has been made
    NotConnected,
    /// Resolve + connect in progress
    Connecting,
    /// Socket connected, bytes flowing
    Connected,
    /// Close requested, draining queued output
    Closing,
    /// Closed cleanly
    Closed,
    /// Terminated by a connect, I/O or protocol failure
    Failed(String),
}

/// Events driving [`ConnectionState`] forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectStarted,
    SocketConnected,
    CloseRequested,
    SocketClosed,
    Failure(String),
}

impl ConnectionState {
    /// Terminal states are never left except by a fresh connect
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Determine the next state after an event
    pub fn next(&self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            // A new attempt always restarts the lifecycle
            (_, E::ConnectStarted) => S::Connecting,
            // Terminal states absorb everything else
            (S::Closed, _) => S::Closed,
            (S::Failed(reason), _) => S::Failed(reason.clone()),
            (S::Connecting, E::SocketConnected) => S::Connected,
            (_, E::CloseRequested) => S::Closing,
            (_, E::SocketClosed) => S::Closed,
            (_, E::Failure(reason)) => S::Failed(reason),
            (state, E::SocketConnected) => state.clone(),
        }
    }
}

/// Log a state transition at a level matching its severity
pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Broker connection established");
        }
        (_, ConnectionState::Failed(reason)) => {
            error!("Broker connection failed: {}", reason);
        }
        (ConnectionState::Connected, ConnectionState::Closing) => {
            warn!("Broker connection closing");
        }
        _ => {
            info!("Broker connection state: {:?} -> {:?}", from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = ConnectionState::NotConnected
            .next(ConnectionEvent::ConnectStarted)
            .next(ConnectionEvent::SocketConnected);
        assert_eq!(state, ConnectionState::Connected);

        let state = state
            .next(ConnectionEvent::CloseRequested)
            .next(ConnectionEvent::SocketClosed);
        assert_eq!(state, ConnectionState::Closed);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_close_forced_from_any_live_state() {
        for state in [
            ConnectionState::NotConnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ] {
            assert_eq!(
                state.next(ConnectionEvent::CloseRequested),
                ConnectionState::Closing
            );
        }
    }

    #[test]
    fn test_failure_is_terminal() {
        let failed = ConnectionState::Connecting
            .next(ConnectionEvent::Failure("Connection timed out".to_string()));
        assert_eq!(
            failed,
            ConnectionState::Failed("Connection timed out".to_string())
        );
        assert_eq!(failed.next(ConnectionEvent::SocketConnected), failed);
        assert_eq!(failed.next(ConnectionEvent::CloseRequested), failed);
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_reconnect_restarts_lifecycle() {
        let state = ConnectionState::Failed("read".to_string())
            .next(ConnectionEvent::ConnectStarted);
        assert_eq!(state, ConnectionState::Connecting);
    }

    #[test]
    fn test_socket_connected_only_from_connecting() {
        assert_eq!(
            ConnectionState::Closing.next(ConnectionEvent::SocketConnected),
            ConnectionState::Closing
        );
        assert!(!ConnectionState::Closing.is_connected());
    }
}
