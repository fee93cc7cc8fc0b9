//! Typed message exchange over the signaling client
//!
//! The envelope wire format is a CBOR map with a mandatory `type`
//! discriminant. Inbound payloads that fail to parse against the union are
//! dropped with a log line and never reach subscribers; the connection layer
//! is never poisoned by a malformed message.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ShareError, ShareResult};
use crate::sync::signaling::{PeerAddr, Recipient, SignalingClient, SignalingEvent};

use std::sync::Arc;

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// SDP session description carried in a signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    /// "offer" or "answer"
    #[serde(rename = "type")]
    pub kind: String,
    /// The raw SDP payload
    pub sdp: String,
}

/// ICE candidate carried in a signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate line
    pub candidate: String,
    /// Media stream identification tag
    pub sdp_mid: Option<String>,
    /// Media description index
    pub sdp_m_line_index: Option<u32>,
}

/// The tagged-union message schema.
///
/// Wire form is a CBOR map with a `type` discriminant:
/// `request-document`, `document-response`, or `signal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Ask anyone holding a document for a signed export
    #[serde(rename_all = "camelCase")]
    RequestDocument {
        /// The document being requested
        document_id: String,
    },
    /// A signed document export
    DocumentResponse {
        /// Encoded `{header, content, signature}`
        #[serde(with = "serde_bytes")]
        document: Vec<u8>,
    },
    /// Peer-connection signaling, exactly one of `sdp` / `ice` / `bye`
    #[serde(rename_all = "camelCase")]
    Signal {
        /// The document the peer connection is for
        document_id: String,
        /// Session description (offer or answer)
        sdp: Option<SessionDescription>,
        /// ICE candidate
        ice: Option<IceCandidate>,
        /// Teardown marker, always `true` when present
        bye: Option<bool>,
    },
}

/// The single populated body of a `signal` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Sdp(SessionDescription),
    Ice(IceCandidate),
    Bye,
}

impl Message {
    /// Build a signal message from its body
    pub fn signal(document_id: String, body: SignalBody) -> Self {
        let (sdp, ice, bye) = match body {
            SignalBody::Sdp(sdp) => (Some(sdp), None, None),
            SignalBody::Ice(ice) => (None, Some(ice), None),
            SignalBody::Bye => (None, None, Some(true)),
        };
        Message::Signal {
            document_id,
            sdp,
            ice,
            bye,
        }
    }

    /// Encode to the CBOR wire form
    pub fn encode(&self) -> ShareResult<Vec<u8>> {
        self.validate()?;
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)
            .map_err(|e| ShareError::Serialization(format!("Failed to encode message: {}", e)))?;
        Ok(out)
    }

    /// Decode and validate a message from the CBOR wire form
    pub fn decode(bytes: &[u8]) -> ShareResult<Self> {
        let message: Message = ciborium::from_reader(bytes)
            .map_err(|e| ShareError::SchemaRejected(format!("Not a valid message: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    /// Check the structural constraints the derive cannot express
    pub fn validate(&self) -> ShareResult<()> {
        if let Message::Signal { sdp, ice, bye, .. } = self {
            let populated = usize::from(sdp.is_some()) + usize::from(ice.is_some()) + usize::from(bye.is_some());
            if populated != 1 {
                return Err(ShareError::SchemaRejected(format!(
                    "Signal must carry exactly one body, got {}",
                    populated
                )));
            }
            if bye.is_some_and(|b| !b) {
                return Err(ShareError::SchemaRejected(
                    "Signal bye must be true when present".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Extract the signal body, if this is a valid signal message
    pub fn signal_body(&self) -> Option<(&str, SignalBody)> {
        let Message::Signal {
            document_id,
            sdp,
            ice,
            bye,
        } = self
        else {
            return None;
        };
        let body = match (sdp, ice, bye) {
            (Some(sdp), None, None) => SignalBody::Sdp(sdp.clone()),
            (None, Some(ice), None) => SignalBody::Ice(ice.clone()),
            (None, None, Some(true)) => SignalBody::Bye,
            _ => return None,
        };
        Some((document_id, body))
    }
}

/// A schema-valid message together with its sender.
#[derive(Debug, Clone)]
pub struct ExchangeEvent {
    /// Who sent the message
    pub from: PeerAddr,
    /// The decoded message
    pub message: Message,
}

/// Schema-checking dispatcher over a [`SignalingClient`].
///
/// Subscribers only ever observe payloads whose schema parse succeeded.
pub struct MessageExchanger {
    client: Arc<SignalingClient>,
    events: broadcast::Sender<ExchangeEvent>,
    task: JoinHandle<()>,
}

impl MessageExchanger {
    /// Attach an exchanger to a signaling client.
    pub fn new(client: Arc<SignalingClient>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let task = tokio::spawn(Self::dispatch(client.subscribe(), events.clone()));

        Self {
            client,
            events,
            task,
        }
    }

    /// Subscribe to schema-valid inbound messages
    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    /// Validate and send a message.
    pub async fn send_message(&self, message: &Message, to: Option<Recipient>) -> ShareResult<()> {
        let bytes = message.encode()?;
        self.client.send_message(to, bytes).await
    }

    /// The underlying signaling client
    pub fn client(&self) -> &Arc<SignalingClient> {
        &self.client
    }

    async fn dispatch(
        mut signaling: broadcast::Receiver<SignalingEvent>,
        events: broadcast::Sender<ExchangeEvent>,
    ) {
        loop {
            match signaling.recv().await {
                Ok(SignalingEvent::Message { from, data }) => match Message::decode(&data) {
                    Ok(message) => {
                        let _ = events.send(ExchangeEvent { from, message });
                    }
                    Err(e) => {
                        warn!(from = %from.public_key, error = %e, "Dropping invalid message");
                    }
                },
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Exchanger lagged behind signaling events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Signaling event stream closed, exchanger stopping");
                    break;
                }
            }
        }
    }
}

impl Drop for MessageExchanger {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for MessageExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageExchanger").finish_non_exhaustive()
    }
}
