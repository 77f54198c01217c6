//! Simulated chat server.
//!
//! `SimServer` is the authoritative message log for any number of rooms. It
//! assigns ids and timestamps, echoes the sender's nonce, broadcasts to every
//! live subscriber of the room, and serves history pages. Faults are
//! scripted: refused or stalled connects, forced disconnects, lost client
//! frames, and history outages.
//!
//! Clients reach it through [`SimTransport`] and [`SimHistory`], cheap
//! handles sharing the same state.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use roomfeed_client::{LinkEvent, TransportLink};
use roomfeed_core::{Author, DisconnectReason, Environment, HistoryError, HistoryRequest};
use roomfeed_proto::{
    ClientNonce, InboundFrame, Message, MessageId, OutboundFrame, RoomId, Timestamp,
};
use tokio::sync::mpsc;

use crate::{
    SimEnv,
    sim_transport::{SimHistory, SimTransport},
};

#[derive(Debug)]
struct ServerState {
    env: SimEnv,
    rooms: HashMap<RoomId, Vec<Message>>,
    next_id: u64,
    last_sent_at: u64,
    subscribers: HashMap<RoomId, Vec<mpsc::Sender<LinkEvent>>>,

    connect_attempts: u32,
    refuse_connects: u32,
    stall_connects: bool,
    drop_client_frames: bool,
    history_available: bool,
    history_requests: Vec<HistoryRequest>,
}

/// Simulated server. Clones share state.
#[derive(Debug, Clone)]
pub struct SimServer {
    state: Arc<Mutex<ServerState>>,
}

impl SimServer {
    /// Empty server stamping messages from `env`'s clock.
    pub fn new(env: SimEnv) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                env,
                rooms: HashMap::new(),
                next_id: 1,
                last_sent_at: 0,
                subscribers: HashMap::new(),
                connect_attempts: 0,
                refuse_connects: 0,
                stall_connects: false,
                drop_client_frames: false,
                history_available: true,
                history_requests: Vec::new(),
            })),
        }
    }

    /// Transport handle whose frames are attributed to `author`.
    pub fn transport_as(&self, author: Author) -> SimTransport {
        SimTransport::new(self.clone(), author)
    }

    /// Transport handle attributed to the default author.
    pub fn transport(&self) -> SimTransport {
        self.transport_as(Author::default())
    }

    /// History API handle.
    pub fn history(&self) -> SimHistory {
        SimHistory::new(self.clone())
    }

    /// Another user posts `body` to `room_id`. Persisted and broadcast.
    pub fn post(&self, room_id: &RoomId, author: &Author, body: &str) -> Message {
        self.accept(room_id, author, body, None)
    }

    /// Store a message exactly as given, without broadcasting.
    pub fn preload(&self, message: Message) {
        let mut state = self.lock();
        if let Some(id) = message.id {
            state.next_id = state.next_id.max(id.0 + 1);
        }
        state.last_sent_at = state.last_sent_at.max(message.sent_at.as_millis());
        state.rooms.entry(message.room_id.clone()).or_default().push(message);
    }

    /// Push a message frame to live subscribers without storing it.
    pub fn deliver(&self, message: &Message) {
        match InboundFrame::Message(message.clone()).encode() {
            Ok(bytes) => self.broadcast(&message.room_id, &LinkEvent::Frame(bytes)),
            Err(e) => tracing::warn!(error = %e, "Cannot encode simulated frame"),
        }
    }

    /// Push raw bytes to live subscribers of `room_id`.
    pub fn deliver_raw(&self, room_id: &RoomId, bytes: bytes::Bytes) {
        self.broadcast(room_id, &LinkEvent::Frame(bytes));
    }

    /// Close every live connection to `room_id`.
    pub fn disconnect_all(&self, room_id: &RoomId, reason: DisconnectReason) {
        let subscribers = self.lock().subscribers.remove(room_id).unwrap_or_default();
        tracing::debug!(room = %room_id, count = subscribers.len(), %reason, "Dropping subscribers");
        for subscriber in subscribers {
            let _ = subscriber.try_send(LinkEvent::Closed(reason));
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next_connects(&self, n: u32) {
        self.lock().refuse_connects = n;
    }

    /// Make connection attempts hang until the client gives up.
    pub fn stall_connects(&self, stall: bool) {
        self.lock().stall_connects = stall;
    }

    /// Silently discard frames sent by clients.
    pub fn drop_client_frames(&self, drop: bool) {
        self.lock().drop_client_frames = drop;
    }

    /// Toggle history outages.
    pub fn set_history_available(&self, available: bool) {
        self.lock().history_available = available;
    }

    /// Connection attempts seen so far.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// History requests seen so far.
    pub fn history_requests(&self) -> Vec<HistoryRequest> {
        self.lock().history_requests.clone()
    }

    /// Live connections to `room_id`.
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.lock()
            .subscribers
            .get(room_id)
            .map_or(0, |subs| subs.iter().filter(|s| !s.is_closed()).count())
    }

    /// Stored log of `room_id` in `sent_at` order.
    pub fn messages(&self, room_id: &RoomId) -> Vec<Message> {
        let mut messages = self.lock().rooms.get(room_id).cloned().unwrap_or_default();
        messages.sort_by_key(|m| (m.sent_at, m.id));
        messages
    }

    pub(crate) fn connect(&self, room_id: &RoomId) -> ConnectOutcome {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return ConnectOutcome::Refused;
        }
        if state.stall_connects {
            return ConnectOutcome::Stalled;
        }

        let (link, outbound, inbound) = TransportLink::channel();

        // Join banner, as the production server sends on accept
        if let Ok(bytes) = InboundFrame::System(format!("Connected to {room_id}")).encode() {
            let _ = inbound.try_send(LinkEvent::Frame(bytes));
        }

        state.subscribers.entry(room_id.clone()).or_default().push(inbound);
        ConnectOutcome::Accepted { link, outbound }
    }

    pub(crate) fn receive(&self, room_id: &RoomId, author: &Author, bytes: &[u8]) {
        if self.lock().drop_client_frames {
            tracing::debug!(room = %room_id, "Dropping client frame");
            return;
        }

        match OutboundFrame::decode(bytes) {
            Ok(OutboundFrame { body, .. }) if body.trim().is_empty() => {
                tracing::debug!(room = %room_id, "Ignoring blank message");
            },
            Ok(OutboundFrame { body, client_nonce }) => {
                self.accept(room_id, author, &body, Some(client_nonce));
            },
            Err(e) => tracing::warn!(room = %room_id, error = %e, "Malformed client frame"),
        }
    }

    pub(crate) fn fetch_history(
        &self,
        request: &HistoryRequest,
    ) -> Result<Vec<Message>, HistoryError> {
        let mut state = self.lock();
        state.history_requests.push(request.clone());

        if !state.history_available {
            return Err(HistoryError::Unavailable {
                status_code: Some(503),
                message: "history offline".to_string(),
            });
        }

        let mut page: Vec<Message> = state
            .rooms
            .get(&request.room_id)
            .map(|log| {
                log.iter()
                    .filter(|m| request.after.is_none_or(|after| m.sent_at > after))
                    .filter(|m| request.before.is_none_or(|before| m.sent_at < before))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        // Newest first, like the production endpoint
        page.sort_by_key(|m| std::cmp::Reverse((m.sent_at, m.id)));
        page.truncate(request.page_size);
        Ok(page)
    }

    fn accept(
        &self,
        room_id: &RoomId,
        author: &Author,
        body: &str,
        client_nonce: Option<ClientNonce>,
    ) -> Message {
        let message = {
            let mut state = self.lock();
            let id = MessageId(state.next_id);
            state.next_id += 1;
            let sent_at = state.env.wall_clock_millis().max(state.last_sent_at + 1);
            state.last_sent_at = sent_at;

            let message = Message {
                id: Some(id),
                room_id: room_id.clone(),
                author_id: author.id.clone(),
                author_display_name: author.display_name.clone(),
                body: body.trim().to_string(),
                sent_at: Timestamp(sent_at),
                client_nonce,
            };
            state.rooms.entry(room_id.clone()).or_default().push(message.clone());
            message
        };

        self.deliver(&message);
        message
    }

    fn broadcast(&self, room_id: &RoomId, event: &LinkEvent) {
        let mut state = self.lock();
        if let Some(subscribers) = state.subscribers.get_mut(room_id) {
            subscribers.retain(|s| !s.is_closed());
            for subscriber in subscribers.iter() {
                if subscriber.try_send(event.clone()).is_err() {
                    tracing::warn!(room = %room_id, "Subscriber backlog full, frame lost");
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) enum ConnectOutcome {
    Accepted { link: TransportLink, outbound: mpsc::Receiver<bytes::Bytes> },
    Refused,
    Stalled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::new("general")
    }

    #[test]
    fn post_assigns_increasing_ids_and_timestamps() {
        let server = SimServer::new(SimEnv::new());
        let a = server.post(&room(), &Author::new("ada", "Ada"), "one");
        let b = server.post(&room(), &Author::new("bob", "Bob"), "two");

        assert!(a.id < b.id);
        assert!(a.sent_at < b.sent_at);
        assert_eq!(server.messages(&room()), vec![a, b]);
    }

    #[test]
    fn history_pages_are_newest_first_and_bounded() {
        let server = SimServer::new(SimEnv::new());
        let author = Author::new("ada", "Ada");
        for i in 0..5 {
            server.post(&room(), &author, &format!("m{i}"));
        }

        let page = server.fetch_history(&HistoryRequest::latest(room(), 2)).unwrap();
        let bodies: Vec<&str> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m4", "m3"]);
    }

    #[test]
    fn history_after_cursor_is_exclusive() {
        let server = SimServer::new(SimEnv::new());
        let author = Author::new("ada", "Ada");
        let first = server.post(&room(), &author, "first");
        let second = server.post(&room(), &author, "second");

        let page = server.fetch_history(&HistoryRequest::since(room(), first.sent_at, 100)).unwrap();
        assert_eq!(page, vec![second]);
    }

    #[test]
    fn outage_is_reported_as_unavailable() {
        let server = SimServer::new(SimEnv::new());
        server.set_history_available(false);

        let err = server.fetch_history(&HistoryRequest::latest(room(), 50)).unwrap_err();
        assert!(matches!(err, HistoryError::Unavailable { status_code: Some(503), .. }));
        assert_eq!(server.history_requests().len(), 1);
    }

    #[test]
    fn client_frames_are_echoed_with_nonce() {
        let server = SimServer::new(SimEnv::new());
        let frame = OutboundFrame { body: " hi ".into(), client_nonce: ClientNonce(5) };

        server.receive(&room(), &Author::new("ada", "Ada"), &frame.encode().unwrap());

        let stored = server.messages(&room());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].body, "hi");
        assert_eq!(stored[0].client_nonce, Some(ClientNonce(5)));
    }

    #[test]
    fn blank_client_frames_are_ignored() {
        let server = SimServer::new(SimEnv::new());
        let frame = OutboundFrame { body: "   ".into(), client_nonce: ClientNonce(6) };

        server.receive(&room(), &Author::new("ada", "Ada"), &frame.encode().unwrap());

        assert!(server.messages(&room()).is_empty());
    }
}
