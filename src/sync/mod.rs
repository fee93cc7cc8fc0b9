//! Networking: signaling, typed message exchange, peers, and sync

pub mod connection;
pub mod exchange;
pub mod peer;
pub mod presence;
pub mod relay;
pub mod signaling;
pub mod synchronizer;

pub use connection::{memory_pair, ConnectRequest, Connection, Connector};
pub use exchange::{
    ExchangeEvent, IceCandidate, Message, MessageExchanger, SessionDescription, SignalBody,
};
pub use peer::{
    LoopbackConnector, Peer, PeerChannel, PeerConnector, PeerEvent, PeerHandshake, PeerKey,
    PeerManager, PeerPayload, PeerState, SignalGate, PEER_HIGH_WATER,
};
pub use presence::{DocumentPresence, PresenceEvent, PresenceState};
pub use relay::{LocalConnector, LocalRelay};
pub use signaling::{
    ConnectionState, PeerAddr, Recipient, SignalingClient, SignalingEvent,
};
pub use synchronizer::DocumentSynchronizer;
