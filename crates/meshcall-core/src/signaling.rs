//! Transport seam for the signaling service.
//!
//! A connector performs the handshake and hands back a [`SignalingChannel`]:
//! the id the server assigned to this connection plus a pair of message
//! queues. The session owns both ends; dropping the outbound sender is how it
//! disconnects.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::credential::Credential;
use crate::errors::MeshError;
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};

/// Queue of frames headed for the signaling server.
pub type Outbound = mpsc::UnboundedSender<ClientMessage>;

/// Queue of frames received from the signaling server. Ends when the
/// transport is gone.
pub type Inbound = mpsc::UnboundedReceiver<ServerMessage>;

#[derive(Debug)]
pub struct SignalingChannel {
    pub connection_id: ConnectionId,
    pub outbound: Outbound,
    pub inbound: Inbound,
}

pub trait SignalingConnector: Send + Sync {
    /// Connect and authenticate. Resolves once the server has accepted or
    /// rejected the connection; a rejection is [`MeshError::Rejected`].
    fn connect(&self, credential: &Credential) -> BoxFuture<'static, Result<SignalingChannel, MeshError>>;
}

/// Send on a possibly detached outbound queue. Returns `false` when the frame
/// was dropped.
pub(crate) fn send(outbound: Option<&Outbound>, message: ClientMessage) -> bool {
    let Some(outbound) = outbound else {
        tracing::debug!("signaling detached, dropping {message:?}");
        return false;
    };
    match outbound.send(message) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("signaling channel closed, dropping {:?}", e.0);
            false
        }
    }
}
