//! Per-room synchronization coordinator.
//!
//! [`RoomSync`] composes the history loader, the live channel and the message
//! store into one consistent feed. It is the single coordination point for a
//! room: history pages, transport events, timer ticks and local sends all go
//! through `&mut self`, so store mutations are serialized by construction.
//!
//! Like [`LiveChannel`], it performs no I/O. The driver executes the returned
//! [`SyncAction`]s and feeds results back:
//!
//! ```text
//!            FetchHistory{request_id}          Connect / Transmit
//!   driver <──────────────────────── RoomSync ────────────────────> driver
//!     │                                 ^  ^                          │
//!     └── handle_history(request_id) ───┘  └── handle_channel(event) ─┘
//! ```
//!
//! # Invariants
//!
//! - History results are matched by `request_id`. Unknown ids (stale, or
//!   arriving after `close()`) are discarded.
//! - At most one `Changed` action per call, carrying the snapshot after all
//!   mutations of that call.
//! - After `close()` every input returns no actions.

use std::{collections::HashMap, collections::VecDeque, time::Duration};

use roomfeed_proto::{ClientNonce, Message, RoomId, Timestamp};

use crate::{
    channel::{ChannelAction, ChannelConfig, ChannelEvent, ChannelStatus, LiveChannel},
    env::Environment,
    error::SyncError,
    history::{DEFAULT_GAP_FILL_PAGE_SIZE, DEFAULT_PAGE_SIZE, HistoryRequest},
    store::{FailureCause, FeedSnapshot, MessageStore},
};

/// Time a pending message may wait for its server copy.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Local identity stamped on optimistic messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    /// Stable user identifier.
    pub id: String,
    /// Name shown next to messages.
    pub display_name: String,
}

impl Author {
    /// Create an author.
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { id: id.into(), display_name: display_name.into() }
    }
}

impl Default for Author {
    fn default() -> Self {
        Self::new("anonymous", "anonymous")
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Identity for optimistic messages.
    pub author: Author,
    /// Initial history page size.
    pub history_page_size: usize,
    /// Page size for gap fill after reconnect.
    pub gap_fill_page_size: usize,
    /// Confirmation deadline for sent messages.
    pub send_timeout: Duration,
    /// Live channel settings.
    pub channel: ChannelConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            author: Author::default(),
            history_page_size: DEFAULT_PAGE_SIZE,
            gap_fill_page_size: DEFAULT_GAP_FILL_PAGE_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            channel: ChannelConfig::default(),
        }
    }
}

/// Actions the coordinator produces for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Run a history request and report back through
    /// [`RoomSync::handle_history`] with the same `request_id`.
    FetchHistory {
        /// Correlation id.
        request_id: u64,
        /// Page to fetch.
        request: HistoryRequest,
    },
    /// Open the live transport.
    Connect,
    /// Drop the live transport and abort any connect in flight.
    Disconnect,
    /// Write an encoded frame to the live transport.
    Transmit(bytes::Bytes),
    /// Feed changed. Notify change listeners.
    Changed(FeedSnapshot),
    /// Connectivity changed. Notify status listeners.
    Status(ChannelStatus),
    /// Something the caller should know about.
    Failure(SyncError),
}

/// Why a history request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPurpose {
    Initial,
    GapFill,
}

/// Synchronization state for one subscribed room.
pub struct RoomSync<E: Environment> {
    env: E,
    config: SyncConfig,
    store: MessageStore,
    channel: LiveChannel<E::Instant>,
    next_request_id: u64,
    in_flight: HashMap<u64, FetchPurpose>,
    /// Confirmation deadlines in send order. All sends share one timeout, so
    /// the front is always the earliest.
    deadlines: VecDeque<(E::Instant, ClientNonce)>,
    /// Set while the most recent history load has failed.
    history_degraded: bool,
    closed: bool,
}

impl<E: Environment> RoomSync<E> {
    /// Create the coordinator for `room_id`. Nothing happens until
    /// [`Self::start`].
    pub fn new(env: E, room_id: RoomId, config: SyncConfig) -> Self {
        let now = env.now();
        let channel = LiveChannel::new(room_id.clone(), config.channel.clone(), now);
        Self {
            env,
            config,
            store: MessageStore::new(room_id),
            channel,
            next_request_id: 0,
            in_flight: HashMap::new(),
            deadlines: VecDeque::new(),
            history_degraded: false,
            closed: false,
        }
    }

    /// Room this coordinator serves.
    pub fn room_id(&self) -> &RoomId {
        self.channel.room_id()
    }

    /// Current feed.
    pub fn snapshot(&self) -> FeedSnapshot {
        self.store.snapshot()
    }

    /// Current connectivity, flagged when history is unavailable.
    pub fn status(&self) -> ChannelStatus {
        self.decorate(self.channel.status())
    }

    /// Read access to the store.
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// True after [`Self::close`].
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// History requests awaiting a result.
    pub fn pending_fetches(&self) -> usize {
        self.in_flight.len()
    }

    /// Earliest time at which [`Self::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<E::Instant> {
        if self.closed {
            return None;
        }
        let send = self.deadlines.front().map(|(at, _)| *at);
        match (self.channel.next_deadline(), send) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Begin the initial history load and the live subscription.
    pub fn start(&mut self, now: E::Instant) -> Vec<SyncAction> {
        if self.closed {
            return Vec::new();
        }

        let request = HistoryRequest::latest(self.room_id().clone(), self.config.history_page_size);
        let mut actions = vec![self.fetch(FetchPurpose::Initial, request)];
        let channel_actions = self.channel.subscribe(now);
        self.apply(channel_actions, &mut actions);
        actions
    }

    /// Feed a history result back in.
    pub fn handle_history(
        &mut self,
        request_id: u64,
        result: Result<Vec<Message>, SyncError>,
    ) -> Vec<SyncAction> {
        let Some(purpose) = self.in_flight.remove(&request_id) else {
            tracing::debug!(room = %self.room_id(), request_id, "Discarding stale history result");
            return Vec::new();
        };

        match result {
            Ok(page) => {
                let before = self.store.version();
                let mut inserted = 0usize;
                for message in page {
                    if self.store.insert(message).changed() {
                        inserted += 1;
                    }
                }
                tracing::info!(room = %self.room_id(), ?purpose, inserted, "History applied");

                let mut actions = Vec::new();
                self.set_history_degraded(false, &mut actions);
                self.push_changed(before, &mut actions);
                actions
            },
            Err(e) => {
                tracing::warn!(room = %self.room_id(), ?purpose, error = %e, "Continuing live-only");
                let mut actions = Vec::new();
                self.set_history_degraded(true, &mut actions);
                actions.push(SyncAction::Failure(e));
                actions
            },
        }
    }

    /// Feed a transport event in.
    pub fn handle_channel(&mut self, event: ChannelEvent, now: E::Instant) -> Vec<SyncAction> {
        if self.closed {
            return Vec::new();
        }

        let before = self.store.version();
        let channel_actions = self.channel.handle(event, now, &self.env);
        let mut actions = Vec::new();
        self.apply(channel_actions, &mut actions);
        self.push_changed(before, &mut actions);
        actions
    }

    /// Send `body`, generating its nonce.
    ///
    /// # Errors
    ///
    /// See [`Self::send_with_nonce`].
    pub fn send(
        &mut self,
        body: &str,
        now: E::Instant,
    ) -> Result<(ClientNonce, Vec<SyncAction>), SyncError> {
        let nonce = ClientNonce(self.env.random_u128());
        let actions = self.send_with_nonce(nonce, body, now)?;
        Ok((nonce, actions))
    }

    /// Send `body` under `nonce`.
    ///
    /// The optimistic copy is inserted as pending before this returns.
    ///
    /// # Errors
    ///
    /// - `SyncError::EmptyBody` if `body` is blank after trimming
    /// - `SyncError::Closed` after [`Self::close`]
    /// - `SyncError::Protocol` if the frame cannot be encoded
    pub fn send_with_nonce(
        &mut self,
        nonce: ClientNonce,
        body: &str,
        now: E::Instant,
    ) -> Result<Vec<SyncAction>, SyncError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(SyncError::EmptyBody);
        }
        if self.closed {
            return Err(SyncError::Closed);
        }

        let before = self.store.version();
        let channel_actions = self.channel.send_with_nonce(nonce, body)?;

        let optimistic = Message {
            id: None,
            room_id: self.room_id().clone(),
            author_id: self.config.author.id.clone(),
            author_display_name: self.config.author.display_name.clone(),
            body: body.to_string(),
            sent_at: self.local_sent_at(),
            client_nonce: Some(nonce),
        };
        self.store.insert(optimistic);
        self.deadlines.push_back((now + self.config.send_timeout, nonce));
        tracing::debug!(room = %self.room_id(), %nonce, "Sent optimistic message");

        let mut actions = Vec::new();
        self.apply(channel_actions, &mut actions);
        self.push_changed(before, &mut actions);
        Ok(actions)
    }

    /// Process timers: channel timers and send deadlines.
    pub fn tick(&mut self, now: E::Instant) -> Vec<SyncAction> {
        if self.closed {
            return Vec::new();
        }

        let before = self.store.version();
        let channel_actions = self.channel.tick(now, &self.env);
        let mut actions = Vec::new();
        self.apply(channel_actions, &mut actions);

        let mut cancelled = false;
        while let Some(&(at, nonce)) = self.deadlines.front() {
            if at > now {
                break;
            }
            self.deadlines.pop_front();
            if self.store.mark_failed(nonce, FailureCause::SendTimeout) {
                tracing::warn!(room = %self.room_id(), %nonce, "Send timed out");
                // A failed send must not reach the server on the next open
                cancelled |= self.channel.cancel(nonce);
                actions.push(SyncAction::Failure(SyncError::SendTimeout(nonce)));
            }
        }
        if cancelled {
            actions.push(SyncAction::Status(self.status()));
        }

        self.push_changed(before, &mut actions);
        actions
    }

    /// Unsubscribe. Idempotent.
    ///
    /// Closes the channel, forgets in-flight fetches and deadlines, and
    /// discards the store.
    pub fn close(&mut self) -> Vec<SyncAction> {
        if self.closed {
            return Vec::new();
        }

        tracing::info!(room = %self.room_id(), "Closing room");
        self.closed = true;
        self.in_flight.clear();
        self.deadlines.clear();
        self.store = MessageStore::new(self.room_id().clone());

        let mut actions = Vec::new();
        let channel_actions = self.channel.close();
        self.apply(channel_actions, &mut actions);
        actions
    }

    fn fetch(&mut self, purpose: FetchPurpose, request: HistoryRequest) -> SyncAction {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.in_flight.insert(request_id, purpose);
        tracing::debug!(room = %self.room_id(), request_id, ?purpose, "Requesting history");
        SyncAction::FetchHistory { request_id, request }
    }

    /// Place optimistic messages at the tail: never before anything the
    /// server has already stamped.
    fn local_sent_at(&self) -> Timestamp {
        let wall = Timestamp(self.env.wall_clock_millis());
        self.store.latest_sent_at().map_or(wall, |latest| latest.max(wall))
    }

    fn apply(&mut self, channel_actions: Vec<ChannelAction>, out: &mut Vec<SyncAction>) {
        for action in channel_actions {
            match action {
                ChannelAction::Connect => out.push(SyncAction::Connect),
                ChannelAction::Disconnect => out.push(SyncAction::Disconnect),
                ChannelAction::Transmit(bytes) => out.push(SyncAction::Transmit(bytes)),
                ChannelAction::StatusChanged(status) => {
                    out.push(SyncAction::Status(self.decorate(status)));
                },
                ChannelAction::Deliver(message) => {
                    self.store.insert(message);
                },
                ChannelAction::Opened { resumed: false } => {},
                ChannelAction::Opened { resumed: true } => {
                    let room_id = self.room_id().clone();
                    let request = match self.store.latest_sent_at() {
                        Some(after) => {
                            HistoryRequest::since(room_id, after, self.config.gap_fill_page_size)
                        },
                        None => HistoryRequest::latest(room_id, self.config.history_page_size),
                    };
                    out.push(self.fetch(FetchPurpose::GapFill, request));
                },
                ChannelAction::BackpressureDropped(nonce) => {
                    self.store.mark_failed(nonce, FailureCause::BackpressureDropped);
                    out.push(SyncAction::Failure(SyncError::BackpressureDropped(nonce)));
                },
            }
        }
    }

    fn decorate(&self, status: ChannelStatus) -> ChannelStatus {
        ChannelStatus { history_degraded: self.history_degraded, ..status }
    }

    fn set_history_degraded(&mut self, degraded: bool, out: &mut Vec<SyncAction>) {
        if self.history_degraded != degraded {
            self.history_degraded = degraded;
            out.push(SyncAction::Status(self.status()));
        }
    }

    fn push_changed(&self, before: u64, out: &mut Vec<SyncAction>) {
        if self.store.version() != before {
            out.push(SyncAction::Changed(self.store.snapshot()));
        }
    }
}

impl<E: Environment> std::fmt::Debug for RoomSync<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSync")
            .field("room_id", self.room_id())
            .field("state", &self.channel.state())
            .field("messages", &self.store.len())
            .field("in_flight", &self.in_flight.len())
            .field("history_degraded", &self.history_degraded)
            .field("closed", &self.closed)
            .finish()
    }
}
