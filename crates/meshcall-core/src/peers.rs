//! Per-participant peer links and their offer/answer/ICE state machine.
//!
//! Glare is avoided by role: the side that was already in the room when a
//! participant appeared is the initiator of that link and the only side that
//! ever sends offers for it. The newcomer only answers.
//!
//! The manager performs no I/O. Each operation returns the [`LinkAction`]s the
//! session has to carry out, in order.

use std::collections::HashMap;

use crate::events::{EventEmitter, LinkState, MeshEvent};
use crate::media::{Connectivity, LocalStream, MediaCommand};
use crate::protocol::{ClientMessage, ConnectionId, IceCandidate, ParticipantIdentity};
use crate::settings::IceServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

/// Where an offer/answer exchange currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    Idle,
    /// Initiator asked the backend for an offer.
    OfferRequested,
    /// Initiator sent its offer and waits for the answer.
    AwaitingAnswer,
    /// Initiator handed the answer to the backend.
    ApplyingAnswer,
    /// A remote offer was handed to the backend; the answer is pending.
    Answering,
}

#[derive(Debug)]
struct PeerLink {
    identity: ParticipantIdentity,
    state: LinkState,
    role: LinkRole,
    negotiation: Negotiation,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
}

/// Read-only view of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub state: LinkState,
    pub role: LinkRole,
    pub negotiation_in_progress: bool,
}

/// Work the session performs on behalf of the manager.
#[derive(Debug, Clone)]
pub enum LinkAction {
    Media(MediaCommand),
    Signal(ClientMessage),
    /// The link failed terminally; its participant leaves the roster.
    Evict(ConnectionId),
}

/// Owns exactly one link per remote connection id.
pub struct PeerLinkManager {
    links: HashMap<ConnectionId, PeerLink>,
    ice_servers: Vec<IceServer>,
    emitter: EventEmitter,
}

impl PeerLinkManager {
    pub fn new(ice_servers: Vec<IceServer>, emitter: EventEmitter) -> Self {
        Self {
            links: HashMap::new(),
            ice_servers,
            emitter,
        }
    }

    /// Create a link for a newly discovered participant.
    ///
    /// Discovering a participant that already has a link is a no-op.
    pub fn discover(
        &mut self,
        identity: ParticipantIdentity,
        role: LinkRole,
        stream: &LocalStream,
    ) -> Vec<LinkAction> {
        let id = identity.connection_id.clone();
        if self.links.contains_key(&id) {
            tracing::debug!("link to {id} already exists, ignoring discovery");
            return Vec::new();
        }

        tracing::info!("creating link to {id} ({}) as {role:?}", identity.display_name);
        self.links.insert(
            id.clone(),
            PeerLink {
                identity,
                state: LinkState::Created,
                role,
                negotiation: Negotiation::Idle,
                remote_description_set: false,
                pending_candidates: Vec::new(),
            },
        );
        self.emit_state(&id, LinkState::Created);

        let mut actions = vec![LinkAction::Media(MediaCommand::Open {
            connection_id: id.clone(),
            ice_servers: self.ice_servers.clone(),
            stream: stream.clone(),
        })];

        self.set_state(&id, LinkState::Negotiating);
        if role == LinkRole::Initiator {
            if let Some(link) = self.links.get_mut(&id) {
                link.negotiation = Negotiation::OfferRequested;
            }
            actions.push(LinkAction::Media(MediaCommand::CreateOffer {
                connection_id: id,
            }));
        }
        actions
    }

    /// The backend produced and set a local offer.
    pub fn on_local_offer(&mut self, id: &ConnectionId, sdp: String) -> Vec<LinkAction> {
        let Some(link) = self.links.get_mut(id) else {
            tracing::debug!("dropping local offer for closed link {id}");
            return Vec::new();
        };
        if link.negotiation != Negotiation::OfferRequested {
            tracing::debug!("dropping unrequested local offer for {id}");
            return Vec::new();
        }
        link.negotiation = Negotiation::AwaitingAnswer;
        vec![LinkAction::Signal(ClientMessage::Offer {
            target_id: id.clone(),
            sdp,
        })]
    }

    /// An offer arrived from `from`.
    ///
    /// Accepted while the link has no exchange in flight: the first offer on a
    /// responder link, or a renegotiation by the remote initiator. An offer
    /// that collides with a local one is dropped; the initiator's offer wins.
    pub fn on_remote_offer(&mut self, from: &ConnectionId, sdp: String) -> Vec<LinkAction> {
        let Some(link) = self.links.get_mut(from) else {
            tracing::debug!("dropping offer from unknown participant {from}");
            return Vec::new();
        };
        if link.negotiation != Negotiation::Idle {
            tracing::warn!(
                "dropping offer from {from}: negotiation already in flight ({:?})",
                link.negotiation
            );
            return Vec::new();
        }
        link.negotiation = Negotiation::Answering;
        if link.state != LinkState::Negotiating {
            self.set_state(from, LinkState::Negotiating);
        }
        vec![LinkAction::Media(MediaCommand::AcceptOffer {
            connection_id: from.clone(),
            sdp,
        })]
    }

    /// The backend produced and set the local answer to a remote offer.
    pub fn on_local_answer(&mut self, id: &ConnectionId, sdp: String) -> Vec<LinkAction> {
        let Some(link) = self.links.get_mut(id) else {
            tracing::debug!("dropping local answer for closed link {id}");
            return Vec::new();
        };
        if link.negotiation != Negotiation::Answering {
            tracing::debug!("dropping unrequested local answer for {id}");
            return Vec::new();
        }
        link.negotiation = Negotiation::Idle;
        self.set_state(id, LinkState::Connected);
        vec![LinkAction::Signal(ClientMessage::Answer {
            target_id: id.clone(),
            sdp,
        })]
    }

    /// An answer arrived from `from`. Only an initiator link waiting for one
    /// accepts it; anything else is discarded without touching the link.
    pub fn on_remote_answer(&mut self, from: &ConnectionId, sdp: String) -> Vec<LinkAction> {
        let Some(link) = self.links.get_mut(from) else {
            tracing::debug!("dropping answer from unknown participant {from}");
            return Vec::new();
        };
        if link.role != LinkRole::Initiator
            || link.state != LinkState::Negotiating
            || link.negotiation != Negotiation::AwaitingAnswer
        {
            tracing::debug!(
                "dropping answer from {from}: link is {:?}/{:?}",
                link.state,
                link.negotiation
            );
            return Vec::new();
        }
        link.negotiation = Negotiation::ApplyingAnswer;
        vec![LinkAction::Media(MediaCommand::AcceptAnswer {
            connection_id: from.clone(),
            sdp,
        })]
    }

    /// The backend applied a remote description. Buffered candidates are
    /// replayed in arrival order.
    pub fn on_remote_description_applied(&mut self, id: &ConnectionId) -> Vec<LinkAction> {
        let Some(link) = self.links.get_mut(id) else {
            tracing::debug!("ignoring remote description for closed link {id}");
            return Vec::new();
        };
        link.remote_description_set = true;
        let actions: Vec<LinkAction> = link
            .pending_candidates
            .drain(..)
            .map(|candidate| {
                LinkAction::Media(MediaCommand::AddIceCandidate {
                    connection_id: id.clone(),
                    candidate,
                })
            })
            .collect();
        if !actions.is_empty() {
            tracing::debug!("replaying {} buffered candidates for {id}", actions.len());
        }

        if link.negotiation == Negotiation::ApplyingAnswer {
            link.negotiation = Negotiation::Idle;
            self.set_state(id, LinkState::Connected);
        }
        actions
    }

    /// A candidate arrived from `from`. Held back until the remote
    /// description is set; dropped when the link no longer exists.
    pub fn on_remote_candidate(&mut self, from: &ConnectionId, candidate: IceCandidate) -> Vec<LinkAction> {
        let Some(link) = self.links.get_mut(from) else {
            tracing::debug!("dropping candidate for unknown link {from}");
            return Vec::new();
        };
        if !link.remote_description_set {
            link.pending_candidates.push(candidate);
            return Vec::new();
        }
        vec![LinkAction::Media(MediaCommand::AddIceCandidate {
            connection_id: from.clone(),
            candidate,
        })]
    }

    /// The backend gathered a local candidate for `id`.
    pub fn on_local_candidate(&mut self, id: &ConnectionId, candidate: IceCandidate) -> Vec<LinkAction> {
        if !self.links.contains_key(id) {
            tracing::debug!("dropping local candidate for closed link {id}");
            return Vec::new();
        }
        vec![LinkAction::Signal(ClientMessage::IceCandidate {
            target_id: id.clone(),
            candidate,
        })]
    }

    pub fn on_connectivity(&mut self, id: &ConnectionId, state: Connectivity) -> Vec<LinkAction> {
        match state {
            Connectivity::Failed | Connectivity::Disconnected => {
                tracing::warn!("link to {id} lost connectivity ({state:?})");
                self.fail(id)
            }
            _ => {
                tracing::debug!("link to {id} connectivity {state:?}");
                Vec::new()
            }
        }
    }

    /// Tear down a link after an unrecoverable failure.
    pub fn fail(&mut self, id: &ConnectionId) -> Vec<LinkAction> {
        if self.links.remove(id).is_none() {
            return Vec::new();
        }
        self.emit_state(id, LinkState::Failed);
        vec![
            LinkAction::Media(MediaCommand::Close {
                connection_id: id.clone(),
            }),
            LinkAction::Evict(id.clone()),
        ]
    }

    /// Close the link to a participant that left. Closing an unknown link is
    /// a no-op.
    pub fn close(&mut self, id: &ConnectionId) -> Vec<LinkAction> {
        if self.links.remove(id).is_none() {
            tracing::debug!("close for unknown link {id} ignored");
            return Vec::new();
        }
        tracing::info!("closing link to {id}");
        self.emit_state(id, LinkState::Closed);
        vec![LinkAction::Media(MediaCommand::Close {
            connection_id: id.clone(),
        })]
    }

    pub fn close_all(&mut self) -> Vec<LinkAction> {
        let mut ids: Vec<ConnectionId> = self.links.keys().cloned().collect();
        ids.sort();
        ids.iter().flat_map(|id| self.close(id)).collect()
    }

    /// Start a new exchange on an initiator link that is connected and idle.
    /// Requests on any other link are coalesced away.
    pub fn renegotiate(&mut self, id: &ConnectionId) -> Vec<LinkAction> {
        let Some(link) = self.links.get_mut(id) else {
            return Vec::new();
        };
        if link.role != LinkRole::Initiator
            || link.state != LinkState::Connected
            || link.negotiation != Negotiation::Idle
        {
            tracing::debug!(
                "renegotiation of {id} skipped ({:?}/{:?}/{:?})",
                link.role,
                link.state,
                link.negotiation
            );
            return Vec::new();
        }
        link.negotiation = Negotiation::OfferRequested;
        self.set_state(id, LinkState::Negotiating);
        vec![LinkAction::Media(MediaCommand::CreateOffer {
            connection_id: id.clone(),
        })]
    }

    pub fn renegotiate_all(&mut self) -> Vec<LinkAction> {
        let mut ids: Vec<ConnectionId> = self.links.keys().cloned().collect();
        ids.sort();
        ids.iter().flat_map(|id| self.renegotiate(id)).collect()
    }

    pub fn identity(&self, id: &ConnectionId) -> Option<&ParticipantIdentity> {
        self.links.get(id).map(|link| &link.identity)
    }

    pub fn state(&self, id: &ConnectionId) -> Option<LinkState> {
        self.links.get(id).map(|link| link.state)
    }

    pub fn role(&self, id: &ConnectionId) -> Option<LinkRole> {
        self.links.get(id).map(|link| link.role)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.links.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// All links, ordered by connection id.
    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut links: Vec<LinkSnapshot> = self
            .links
            .iter()
            .map(|(id, link)| LinkSnapshot {
                connection_id: id.clone(),
                display_name: link.identity.display_name.clone(),
                state: link.state,
                role: link.role,
                negotiation_in_progress: link.negotiation != Negotiation::Idle,
            })
            .collect();
        links.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        links
    }

    fn set_state(&mut self, id: &ConnectionId, state: LinkState) {
        if let Some(link) = self.links.get_mut(id) {
            link.state = state;
            self.emit_state(id, state);
        }
    }

    fn emit_state(&self, id: &ConnectionId, state: LinkState) {
        self.emitter.emit(MeshEvent::LinkStateChanged {
            connection_id: id.clone(),
            state,
        });
    }
}
