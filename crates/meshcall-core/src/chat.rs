use chrono::Utc;

use crate::errors::MeshError;
use crate::events::{EventEmitter, MeshEvent};
use crate::protocol::{ChatMessage, ClientMessage, ParticipantIdentity};
use crate::signaling::{self, Outbound};

/// Above this the badge stops counting.
const BADGE_CAP: u32 = 99;

/// Room chat relayed through the signaling server.
///
/// The log only grows from messages the server relays back, including our
/// own, so every participant sees the same order.
pub struct SessionChat {
    room_id: String,
    local: ParticipantIdentity,
    messages: Vec<ChatMessage>,
    unread: u32,
    panel_open: bool,
    emitter: EventEmitter,
    outbound: Option<Outbound>,
}

impl SessionChat {
    pub fn new(room_id: impl Into<String>, local: ParticipantIdentity, emitter: EventEmitter) -> Self {
        Self {
            room_id: room_id.into(),
            local,
            messages: Vec::new(),
            unread: 0,
            panel_open: false,
            emitter,
            outbound: None,
        }
    }

    pub fn bind(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    pub fn unbind(&mut self) {
        self.outbound = None;
    }

    /// Send a message to the room. It shows up in the log once the server
    /// echoes it back.
    pub fn send(&self, body: &str) -> Result<(), MeshError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(MeshError::Room("empty chat message".into()));
        }
        let message = ChatMessage {
            room_id: self.room_id.clone(),
            sender: self.local.clone(),
            body: body.to_string(),
            timestamp: Utc::now(),
        };
        if !signaling::send(self.outbound.as_ref(), ClientMessage::ChatMessage(message)) {
            return Err(MeshError::Signaling("not connected".into()));
        }
        Ok(())
    }

    /// Append a relayed message. Messages for another room are dropped.
    pub fn receive(&mut self, message: ChatMessage) {
        if message.room_id != self.room_id {
            tracing::debug!("dropping chat message for room {}", message.room_id);
            return;
        }
        let from_self = message.sender.connection_id == self.local.connection_id;
        tracing::debug!("chat message from {}", message.sender.display_name);
        self.messages.push(message.clone());
        self.emitter.emit(MeshEvent::ChatMessageReceived(message));

        if !from_self && !self.panel_open {
            self.unread = self.unread.saturating_add(1);
            self.emitter.emit(MeshEvent::UnreadCountChanged(self.unread));
        }
    }

    pub fn open_panel(&mut self) {
        self.panel_open = true;
        if self.unread != 0 {
            self.unread = 0;
            self.emitter.emit(MeshEvent::UnreadCountChanged(0));
        }
    }

    pub fn close_panel(&mut self) {
        self.panel_open = false;
    }

    pub fn is_panel_open(&self) -> bool {
        self.panel_open
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    /// Badge text for the unread counter, if any.
    pub fn unread_badge(&self) -> Option<String> {
        match self.unread {
            0 => None,
            n if n > BADGE_CAP => Some(format!("{BADGE_CAP}+")),
            n => Some(n.to_string()),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Clear all messages (on teardown).
    pub fn clear(&mut self) {
        self.messages.clear();
        self.unread = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn me() -> ParticipantIdentity {
        ParticipantIdentity::new("me", "Me")
    }

    fn message(from: &str, body: &str) -> ChatMessage {
        ChatMessage {
            room_id: "room-1".into(),
            sender: ParticipantIdentity::new(from, from.to_uppercase()),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn send_does_not_append_locally() {
        let mut chat = SessionChat::new("room-1", me(), EventEmitter::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        chat.bind(tx);
        chat.send("  hello ").unwrap();
        assert!(chat.messages().is_empty());
        match rx.try_recv().unwrap() {
            ClientMessage::ChatMessage(m) => {
                assert_eq!(m.body, "hello");
                assert_eq!(m.sender, me());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blank_messages_are_rejected() {
        let mut chat = SessionChat::new("room-1", me(), EventEmitter::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        chat.bind(tx);
        assert!(chat.send(" \t\n").is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_transport_fails() {
        let chat = SessionChat::new("room-1", me(), EventEmitter::new());
        assert!(matches!(chat.send("hi"), Err(MeshError::Signaling(_))));
    }

    #[test]
    fn messages_for_another_room_are_dropped() {
        let mut chat = SessionChat::new("room-1", me(), EventEmitter::new());
        let mut stray = message("bob", "wrong room");
        stray.room_id = "room-2".into();
        chat.receive(stray);
        assert!(chat.messages().is_empty());
        assert_eq!(chat.unread(), 0);

        chat.receive(message("bob", "right room"));
        assert_eq!(chat.messages().len(), 1);
    }

    #[test]
    fn own_echo_does_not_count_as_unread() {
        let mut chat = SessionChat::new("room-1", me(), EventEmitter::new());
        chat.receive(message("me", "hello"));
        chat.receive(message("bob", "hi"));
        assert_eq!(chat.unread(), 1);
        let bodies: Vec<_> = chat.messages().iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["hello", "hi"]);
        chat.open_panel();
        assert_eq!(chat.unread(), 0);
    }

    #[test]
    fn open_panel_suppresses_unread() {
        let mut chat = SessionChat::new("room-1", me(), EventEmitter::new());
        chat.open_panel();
        chat.receive(message("bob", "hi"));
        assert_eq!(chat.unread(), 0);
        chat.close_panel();
        chat.receive(message("bob", "again"));
        assert_eq!(chat.unread(), 1);
    }

    #[test]
    fn badge_caps_at_ninety_nine() {
        let mut chat = SessionChat::new("room-1", me(), EventEmitter::new());
        assert_eq!(chat.unread_badge(), None);
        for i in 0..99 {
            chat.receive(message("bob", &i.to_string()));
        }
        assert_eq!(chat.unread_badge().as_deref(), Some("99"));
        chat.receive(message("bob", "one more"));
        assert_eq!(chat.unread_badge().as_deref(), Some("99+"));
    }

    #[test]
    fn clear_empties_log_and_counter() {
        let mut chat = SessionChat::new("room-1", me(), EventEmitter::new());
        chat.receive(message("bob", "hi"));
        chat.clear();
        assert!(chat.messages().is_empty());
        assert_eq!(chat.unread(), 0);
    }
}
