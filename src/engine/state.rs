//! Pure connection state machine and disconnect classification
//!
//! Every state change of a handle goes through [`StateMachine::next_state`], so
//! legality of a transition is decided in one place and can be tested without
//! any I/O. Unsolicited session loss is classified by
//! [`StateMachine::classify_disconnect`], a pure mapping from the observed
//! cause to the reason reported to callbacks.

use crate::transport::TransportError;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Lifecycle state of a client handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Created or cleanly disconnected; may connect
    Init,
    /// Transport open and CONNECT sent, waiting for CONNACK
    Connecting,
    /// CONNACK accepted; publish/subscribe allowed
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Handle deleted; every operation returns `Closed`
    Deinitialized,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ConnectRequested,
    HandshakeSucceeded,
    HandshakeFailed,
    DisconnectRequested,
    SessionEnded,
    Deleted,
}

/// Reason attached to a disconnect event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectType {
    /// Engine shut down on the owner's behalf
    UserRequested,
    /// Broker sent malformed or unexpected data
    BadResponse,
    /// Broker closed the connection
    BrokerDown,
    /// Network became unreachable or keepalive expired
    NetworkDown,
    /// A send or receive call failed
    SndRcvFail,
}

impl fmt::Display for DisconnectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectType::UserRequested => "user_requested",
            DisconnectType::BadResponse => "bad_response",
            DisconnectType::BrokerDown => "broker_down",
            DisconnectType::NetworkDown => "network_down",
            DisconnectType::SndRcvFail => "snd_rcv_fail",
        };
        f.write_str(name)
    }
}

/// What the engine observed when a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Engine shutdown closed the session
    EngineShutdown,
    /// Transport reported end of stream
    PeerClosed,
    /// Broker sent DISCONNECT
    BrokerDisconnect,
    /// Transport call failed
    Transport(TransportError),
    /// No PINGRESP within the response window
    KeepaliveExpired,
    /// Inbound bytes could not be decoded
    Malformed(String),
    /// Well-formed packet not valid in this direction or state
    UnexpectedPacket(String),
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::EngineShutdown => f.write_str("engine shut down"),
            DisconnectCause::PeerClosed => f.write_str("connection closed by broker"),
            DisconnectCause::BrokerDisconnect => f.write_str("broker sent DISCONNECT"),
            DisconnectCause::Transport(error) => write!(f, "transport failure: {error}"),
            DisconnectCause::KeepaliveExpired => f.write_str("no PINGRESP within timeout"),
            DisconnectCause::Malformed(reason) => write!(f, "malformed data: {reason}"),
            DisconnectCause::UnexpectedPacket(name) => write!(f, "unexpected {name} packet"),
        }
    }
}

/// Pure transition and classification logic
pub struct StateMachine;

impl StateMachine {
    /// Next state for `event` in `current`, or `None` when the event is not
    /// legal there (pure function)
    pub fn next_state(current: ConnectionState, event: StateEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use StateEvent::*;
        match (current, event) {
            (Init, ConnectRequested) => Some(Connecting),
            (Connecting, HandshakeSucceeded) => Some(Connected),
            (Connecting | Disconnecting, HandshakeFailed) => Some(Init),
            (Connecting | Connected, DisconnectRequested) => Some(Disconnecting),
            (Connected | Disconnecting, SessionEnded) => Some(Init),
            (Init, Deleted) => Some(Deinitialized),
            _ => None,
        }
    }

    /// Map an observed cause onto the reported disconnect reason (pure function)
    pub fn classify_disconnect(cause: &DisconnectCause) -> DisconnectType {
        match cause {
            DisconnectCause::EngineShutdown => DisconnectType::UserRequested,
            DisconnectCause::PeerClosed | DisconnectCause::BrokerDisconnect => {
                DisconnectType::BrokerDown
            }
            DisconnectCause::Transport(TransportError::Closed) => DisconnectType::BrokerDown,
            DisconnectCause::Transport(TransportError::Unreachable(_)) => {
                DisconnectType::NetworkDown
            }
            DisconnectCause::Transport(_) => DisconnectType::SndRcvFail,
            DisconnectCause::KeepaliveExpired => DisconnectType::NetworkDown,
            DisconnectCause::Malformed(_) | DisconnectCause::UnexpectedPacket(_) => {
                DisconnectType::BadResponse
            }
        }
    }

    /// Whether publish/subscribe/unsubscribe are allowed (pure function)
    pub fn allows_requests(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(handle: &str, from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(handle, "MQTT session established");
            }
            (ConnectionState::Connecting, ConnectionState::Init) => {
                warn!(handle, "MQTT connect attempt failed");
            }
            (ConnectionState::Connected, ConnectionState::Init) => {
                warn!(handle, "MQTT session lost");
            }
            _ => {
                info!(handle, "MQTT handle state: {:?} -> {:?}", from, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_connect_lifecycle() {
        assert_eq!(
            StateMachine::next_state(Init, StateEvent::ConnectRequested),
            Some(Connecting)
        );
        assert_eq!(
            StateMachine::next_state(Connecting, StateEvent::HandshakeSucceeded),
            Some(Connected)
        );
        assert_eq!(
            StateMachine::next_state(Connected, StateEvent::DisconnectRequested),
            Some(Disconnecting)
        );
        assert_eq!(
            StateMachine::next_state(Disconnecting, StateEvent::SessionEnded),
            Some(Init)
        );
    }

    #[test]
    fn test_failed_handshake_returns_to_init() {
        assert_eq!(
            StateMachine::next_state(Connecting, StateEvent::HandshakeFailed),
            Some(Init)
        );
        // a disconnect that interrupted the handshake also lands in Init
        assert_eq!(
            StateMachine::next_state(Disconnecting, StateEvent::HandshakeFailed),
            Some(Init)
        );
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(StateMachine::next_state(Connected, StateEvent::ConnectRequested), None);
        assert_eq!(StateMachine::next_state(Connecting, StateEvent::ConnectRequested), None);
        assert_eq!(StateMachine::next_state(Init, StateEvent::DisconnectRequested), None);
        assert_eq!(StateMachine::next_state(Connected, StateEvent::Deleted), None);
        assert_eq!(
            StateMachine::next_state(Disconnecting, StateEvent::HandshakeSucceeded),
            None
        );
        assert_eq!(StateMachine::next_state(Init, StateEvent::SessionEnded), None);
    }

    #[test]
    fn test_deinitialized_is_terminal() {
        let events = [
            StateEvent::ConnectRequested,
            StateEvent::HandshakeSucceeded,
            StateEvent::HandshakeFailed,
            StateEvent::DisconnectRequested,
            StateEvent::SessionEnded,
            StateEvent::Deleted,
        ];
        assert_eq!(StateMachine::next_state(Init, StateEvent::Deleted), Some(Deinitialized));
        for event in events {
            assert_eq!(StateMachine::next_state(Deinitialized, event), None);
        }
    }

    #[test]
    fn test_disconnect_classification() {
        let cases = [
            (DisconnectCause::PeerClosed, DisconnectType::BrokerDown),
            (DisconnectCause::BrokerDisconnect, DisconnectType::BrokerDown),
            (
                DisconnectCause::Transport(TransportError::Unreachable("no route".into())),
                DisconnectType::NetworkDown,
            ),
            (
                DisconnectCause::Transport(TransportError::Io("reset".into())),
                DisconnectType::SndRcvFail,
            ),
            (
                DisconnectCause::Transport(TransportError::Timeout),
                DisconnectType::SndRcvFail,
            ),
            (DisconnectCause::KeepaliveExpired, DisconnectType::NetworkDown),
            (
                DisconnectCause::Malformed("bad length".into()),
                DisconnectType::BadResponse,
            ),
            (
                DisconnectCause::UnexpectedPacket("CONNACK".into()),
                DisconnectType::BadResponse,
            ),
            (DisconnectCause::EngineShutdown, DisconnectType::UserRequested),
        ];
        for (cause, expected) in cases {
            assert_eq!(StateMachine::classify_disconnect(&cause), expected, "{cause}");
        }
    }

    #[test]
    fn test_only_connected_allows_requests() {
        assert!(StateMachine::allows_requests(Connected));
        for state in [Init, Connecting, Disconnecting, Deinitialized] {
            assert!(!StateMachine::allows_requests(state));
        }
    }
}
