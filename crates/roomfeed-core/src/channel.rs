//! Live channel state machine.
//!
//! Manages one live subscription per room: connection lifecycle, reconnect
//! backoff, handshake timeout, outbound queueing, and inbound framing. Uses
//! the action pattern: methods take time as input and return actions for the
//! driver to execute. This keeps the state machine pure (no I/O, no timers of
//! its own) and makes testing straightforward.
//!
//! # State Machine
//!
//! ```text
//!          subscribe        handshake ok
//! ┌──────┐ ───────> ┌────────────┐ ──────> ┌──────┐
//! │ Idle │          │ Connecting │         │ Open │
//! └──────┘          └────────────┘ <─┐     └──────┘
//!                     │  ^           │        │ close / error
//!    handshake failed │  │ backoff   │        │
//!    or timed out     v  │ elapsed   │        v
//!                   ┌──────────────┐ │
//!                   │ Reconnecting │<┴────────┘
//!                   └──────────────┘
//!
//! Any state ── unsubscribe ──> Closed (terminal)
//! ```
//!
//! # Invariants
//!
//! - `Closed` is terminal: every input after `close()` returns no actions.
//! - The attempt counter resets only after an `Open` period longer than
//!   [`ChannelConfig::stable_open_period`]; brief flaps continue the same
//!   backoff sequence.
//! - Queued frames are transmitted in original order on reaching `Open`.

use std::{collections::VecDeque, ops::Sub, time::Duration};

use bytes::Bytes;
use roomfeed_proto::{ClientNonce, InboundFrame, Message, OutboundFrame, RoomId};

use crate::{
    backoff::BackoffConfig,
    env::Environment,
    error::{DisconnectReason, SyncError},
};

/// Time allowed for the transport handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open period after which the backoff attempt counter resets.
pub const DEFAULT_STABLE_OPEN_PERIOD: Duration = Duration::from_secs(5);

/// Outbound frames held while not `Open`.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Created, not yet subscribed.
    Idle,
    /// Transport handshake in progress.
    Connecting,
    /// Live.
    Open,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Unsubscribed. Terminal.
    Closed,
}

/// Most recent problem seen on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastError {
    /// Connection was lost or never established.
    Disconnected(DisconnectReason),
    /// Server reported an error frame; the connection stayed up.
    Server(String),
}

/// Connectivity snapshot delivered through the status stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Current state.
    pub state: ChannelState,
    /// Consecutive failed attempts in the current backoff sequence.
    pub attempt: u32,
    /// Most recent problem, cleared on a successful handshake.
    pub last_error: Option<LastError>,
    /// Frames waiting for `Open`.
    pub queued: usize,
    /// The last history load failed; the feed may be missing older
    /// messages. The channel itself always reports false here.
    pub history_degraded: bool,
}

/// Channel configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Handshake timeout while `Connecting`.
    pub handshake_timeout: Duration,
    /// Open period that counts as stable for backoff reset.
    pub stable_open_period: Duration,
    /// Outbound queue capacity while not `Open`.
    pub queue_capacity: usize,
    /// Reconnect delays.
    pub backoff: BackoffConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stable_open_period: DEFAULT_STABLE_OPEN_PERIOD,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Transport events the driver feeds into the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The transport connected.
    HandshakeCompleted,
    /// The transport refused or failed to connect.
    HandshakeFailed,
    /// Raw frame bytes from the transport.
    FrameReceived(Bytes),
    /// The transport went away.
    TransportClosed(DisconnectReason),
}

/// Actions returned by the channel state machine.
///
/// The driver executes these actions:
/// - `Connect`: open a transport connection for the room
/// - `Disconnect`: drop the transport connection (and any connect in flight)
/// - `Transmit`: write the frame to the open connection
///
/// The rest are notifications for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Open a transport connection.
    Connect,
    /// Drop the transport connection.
    Disconnect,
    /// Write this encoded frame.
    Transmit(Bytes),
    /// Inbound message for the store.
    Deliver(Message),
    /// Channel reached `Open`. `resumed` is true if it had been open before.
    Opened {
        /// True when this open follows an earlier open (reconnect).
        resumed: bool,
    },
    /// Status changed.
    StatusChanged(ChannelStatus),
    /// A queued frame was evicted unsent.
    BackpressureDropped(ClientNonce),
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    nonce: ClientNonce,
    bytes: Bytes,
}

/// Live channel state machine for one room.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
#[derive(Debug)]
pub struct LiveChannel<I> {
    room_id: RoomId,
    config: ChannelConfig,
    state: ChannelState,
    /// When the current state was entered.
    state_since: I,
    attempt: u32,
    retry_at: Option<I>,
    last_error: Option<LastError>,
    queue: VecDeque<QueuedFrame>,
    has_opened: bool,
}

impl<I> LiveChannel<I>
where
    I: Copy + Ord + Sub<Output = Duration> + std::ops::Add<Duration, Output = I>,
{
    /// Create a channel in [`ChannelState::Idle`].
    pub fn new(room_id: RoomId, config: ChannelConfig, now: I) -> Self {
        Self {
            room_id,
            config,
            state: ChannelState::Idle,
            state_since: now,
            attempt: 0,
            retry_at: None,
            last_error: None,
            queue: VecDeque::new(),
            has_opened: false,
        }
    }

    /// Room this channel serves.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Consecutive failed attempts in the current backoff sequence.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the next reconnect attempt is due, if one is scheduled.
    pub fn retry_at(&self) -> Option<I> {
        self.retry_at
    }

    /// Frames waiting for `Open`.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Current connectivity snapshot.
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            state: self.state,
            attempt: self.attempt,
            last_error: self.last_error.clone(),
            queued: self.queue.len(),
            history_degraded: false,
        }
    }

    /// Earliest time at which [`Self::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<I> {
        match self.state {
            ChannelState::Connecting => Some(self.state_since + self.config.handshake_timeout),
            ChannelState::Reconnecting => self.retry_at,
            ChannelState::Open if self.attempt > 0 => {
                Some(self.state_since + self.config.stable_open_period)
            },
            _ => None,
        }
    }

    /// Start connecting. Only valid from `Idle`.
    pub fn subscribe(&mut self, now: I) -> Vec<ChannelAction> {
        if self.state != ChannelState::Idle {
            tracing::warn!(room = %self.room_id, state = ?self.state, "Ignoring repeated subscribe");
            return Vec::new();
        }

        tracing::info!(room = %self.room_id, "Subscribing");
        self.transition(ChannelState::Connecting, now);
        vec![self.status_action(), ChannelAction::Connect]
    }

    /// Process a transport event.
    pub fn handle<E>(&mut self, event: ChannelEvent, now: I, env: &E) -> Vec<ChannelAction>
    where
        E: Environment,
    {
        match (self.state, event) {
            (ChannelState::Closed, event) => {
                tracing::debug!(room = %self.room_id, ?event, "Dropping event after close");
                Vec::new()
            },

            (ChannelState::Connecting, ChannelEvent::HandshakeCompleted) => self.open(now),

            (ChannelState::Connecting, ChannelEvent::HandshakeFailed) => {
                self.reconnect(DisconnectReason::HandshakeFailed, now, env)
            },

            (ChannelState::Connecting | ChannelState::Open, ChannelEvent::TransportClosed(reason)) => {
                self.reconnect(reason, now, env)
            },

            (ChannelState::Open, ChannelEvent::FrameReceived(bytes)) => {
                self.handle_frame(&bytes, now, env)
            },

            (state, event) => {
                tracing::debug!(room = %self.room_id, ?state, ?event, "Ignoring stale event");
                Vec::new()
            },
        }
    }

    /// Process timers: handshake timeout, backoff expiry, stable-open reset.
    pub fn tick<E>(&mut self, now: I, env: &E) -> Vec<ChannelAction>
    where
        E: Environment,
    {
        match self.state {
            ChannelState::Connecting => {
                if now - self.state_since >= self.config.handshake_timeout {
                    tracing::warn!(room = %self.room_id, "Handshake timed out");
                    return self.reconnect(DisconnectReason::HandshakeTimeout, now, env);
                }
                Vec::new()
            },
            ChannelState::Reconnecting => match self.retry_at {
                Some(at) if at <= now => {
                    tracing::info!(room = %self.room_id, attempt = self.attempt, "Reconnecting");
                    self.retry_at = None;
                    self.transition(ChannelState::Connecting, now);
                    vec![self.status_action(), ChannelAction::Connect]
                },
                _ => Vec::new(),
            },
            ChannelState::Open => {
                if self.reset_if_stable(now) {
                    vec![self.status_action()]
                } else {
                    Vec::new()
                }
            },
            ChannelState::Idle | ChannelState::Closed => Vec::new(),
        }
    }

    /// Send a message body, generating its client nonce.
    ///
    /// Never blocks: the frame is transmitted if `Open`, otherwise queued.
    ///
    /// # Errors
    ///
    /// - `SyncError::Closed` after `close()`
    /// - `SyncError::Protocol` if the frame cannot be encoded
    pub fn send<E>(
        &mut self,
        body: &str,
        env: &E,
    ) -> Result<(ClientNonce, Vec<ChannelAction>), SyncError>
    where
        E: Environment,
    {
        let nonce = ClientNonce(env.random_u128());
        let actions = self.send_with_nonce(nonce, body)?;
        Ok((nonce, actions))
    }

    /// Send a message body under a caller-chosen nonce.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send`].
    pub fn send_with_nonce(
        &mut self,
        nonce: ClientNonce,
        body: &str,
    ) -> Result<Vec<ChannelAction>, SyncError> {
        if self.state == ChannelState::Closed {
            return Err(SyncError::Closed);
        }

        let bytes = OutboundFrame { body: body.to_string(), client_nonce: nonce }.encode()?;

        if self.state == ChannelState::Open {
            return Ok(vec![ChannelAction::Transmit(bytes)]);
        }

        self.queue.push_back(QueuedFrame { nonce, bytes });

        let mut actions = Vec::new();
        while self.queue.len() > self.config.queue_capacity {
            if let Some(dropped) = self.queue.pop_front() {
                tracing::warn!(room = %self.room_id, nonce = %dropped.nonce, "Outbound queue full");
                actions.push(ChannelAction::BackpressureDropped(dropped.nonce));
            }
        }

        tracing::debug!(room = %self.room_id, %nonce, queued = self.queue.len(), "Queued frame");
        Ok(actions)
    }

    /// Drop the queued frame carrying `nonce` so it is never transmitted.
    ///
    /// Returns false if no such frame is queued (already transmitted, or
    /// never sent through this channel).
    pub fn cancel(&mut self, nonce: ClientNonce) -> bool {
        let Some(idx) = self.queue.iter().position(|q| q.nonce == nonce) else {
            return false;
        };
        self.queue.remove(idx);
        tracing::debug!(room = %self.room_id, %nonce, queued = self.queue.len(), "Cancelled frame");
        true
    }

    /// Unsubscribe. Cancels all timers and drops queued frames.
    pub fn close(&mut self) -> Vec<ChannelAction> {
        if self.state == ChannelState::Closed {
            return Vec::new();
        }

        tracing::info!(room = %self.room_id, "Closing channel");
        self.state = ChannelState::Closed;
        self.retry_at = None;
        self.queue.clear();
        vec![ChannelAction::Disconnect, self.status_action()]
    }

    fn open(&mut self, now: I) -> Vec<ChannelAction> {
        let resumed = self.has_opened;
        self.has_opened = true;
        self.last_error = None;
        self.transition(ChannelState::Open, now);

        tracing::info!(
            room = %self.room_id,
            resumed,
            flushing = self.queue.len(),
            "Channel open"
        );

        let mut actions = vec![self.status_action()];
        actions.extend(self.queue.drain(..).map(|q| ChannelAction::Transmit(q.bytes)));
        actions.push(ChannelAction::Opened { resumed });
        actions
    }

    fn reconnect<E>(&mut self, reason: DisconnectReason, now: I, env: &E) -> Vec<ChannelAction>
    where
        E: Environment,
    {
        self.reset_if_stable(now);

        let delay = self.config.backoff.delay(self.attempt, env.random_unit());
        self.attempt = self.attempt.saturating_add(1);
        self.retry_at = Some(now + delay);
        self.last_error = Some(LastError::Disconnected(reason));
        self.transition(ChannelState::Reconnecting, now);

        tracing::warn!(
            room = %self.room_id,
            %reason,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Connection lost, backing off"
        );

        vec![ChannelAction::Disconnect, self.status_action()]
    }

    fn handle_frame<E>(&mut self, bytes: &[u8], now: I, env: &E) -> Vec<ChannelAction>
    where
        E: Environment,
    {
        match InboundFrame::decode(bytes) {
            Ok(InboundFrame::Message(message)) => vec![ChannelAction::Deliver(message)],
            Ok(InboundFrame::Error(reason)) => {
                tracing::warn!(room = %self.room_id, %reason, "Server error frame");
                self.last_error = Some(LastError::Server(reason));
                vec![self.status_action()]
            },
            Ok(InboundFrame::System(text)) => {
                tracing::debug!(room = %self.room_id, %text, "System notice");
                Vec::new()
            },
            Err(e) => {
                tracing::warn!(room = %self.room_id, error = %e, "Undecodable frame");
                self.reconnect(DisconnectReason::ProtocolError, now, env)
            },
        }
    }

    /// Reset the attempt counter if the channel has been open long enough.
    fn reset_if_stable(&mut self, now: I) -> bool {
        if self.state == ChannelState::Open
            && self.attempt > 0
            && now - self.state_since >= self.config.stable_open_period
        {
            tracing::debug!(room = %self.room_id, "Connection stable, resetting backoff");
            self.attempt = 0;
            return true;
        }
        false
    }

    fn transition(&mut self, state: ChannelState, now: I) {
        self.state = state;
        self.state_since = now;
    }

    fn status_action(&self) -> ChannelAction {
        ChannelAction::StatusChanged(self.status())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Instant,
    };

    use roomfeed_proto::{MessageId, Timestamp};

    use super::*;

    #[derive(Clone)]
    struct TestEnv {
        counter: Arc<AtomicU64>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self { counter: Arc::new(AtomicU64::new(1)) }
        }
    }

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn wall_clock_millis(&self) -> u64 {
            0
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            // Deterministic, distinct per call
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = (n as u8).wrapping_add(i as u8);
            }
        }
    }

    fn exact_config() -> ChannelConfig {
        ChannelConfig {
            backoff: BackoffConfig { jitter: 0.0, ..BackoffConfig::default() },
            ..ChannelConfig::default()
        }
    }

    fn open_channel(env: &TestEnv, t0: Instant) -> LiveChannel<Instant> {
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);
        channel.handle(ChannelEvent::HandshakeCompleted, t0, env);
        channel
    }

    fn message_frame(id: u64) -> Bytes {
        InboundFrame::Message(Message {
            id: Some(MessageId(id)),
            room_id: RoomId::new("general"),
            author_id: "u".into(),
            author_display_name: "u".into(),
            body: "b".into(),
            sent_at: Timestamp(id),
            client_nonce: None,
        })
        .encode()
        .unwrap()
    }

    #[test]
    fn channel_lifecycle() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        assert_eq!(channel.state(), ChannelState::Idle);

        let actions = channel.subscribe(t0);
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert!(actions.contains(&ChannelAction::Connect));

        let actions = channel.handle(ChannelEvent::HandshakeCompleted, t0, &env);
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(actions.contains(&ChannelAction::Opened { resumed: false }));

        let actions = channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(actions[0], ChannelAction::Disconnect);
    }

    #[test]
    fn repeated_subscribe_is_ignored() {
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);
        assert!(channel.subscribe(t0).is_empty());
    }

    #[test]
    fn handshake_timeout_schedules_reconnect() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);

        assert!(channel.tick(t0 + Duration::from_secs(9), &env).is_empty());

        let t1 = t0 + DEFAULT_HANDSHAKE_TIMEOUT;
        let actions = channel.tick(t1, &env);
        assert_eq!(channel.state(), ChannelState::Reconnecting);
        assert_eq!(actions[0], ChannelAction::Disconnect);
        assert_eq!(channel.retry_at(), Some(t1 + Duration::from_millis(500)));
        assert_eq!(
            channel.status().last_error,
            Some(LastError::Disconnected(DisconnectReason::HandshakeTimeout))
        );
    }

    #[test]
    fn backoff_expiry_reconnects() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);
        channel.handle(ChannelEvent::HandshakeFailed, t0, &env);

        assert!(channel.tick(t0 + Duration::from_millis(499), &env).is_empty());

        let actions = channel.tick(t0 + Duration::from_millis(500), &env);
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert!(actions.contains(&ChannelAction::Connect));
        assert_eq!(channel.retry_at(), None);
    }

    #[test]
    fn brief_flap_keeps_backoff_sequence() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);
        channel.handle(ChannelEvent::HandshakeFailed, t0, &env);
        assert_eq!(channel.attempt(), 1);

        let t1 = t0 + Duration::from_millis(500);
        channel.tick(t1, &env);
        channel.handle(ChannelEvent::HandshakeCompleted, t1, &env);

        // Drops after 1s of open: not stable, so the sequence continues.
        let t2 = t1 + Duration::from_secs(1);
        channel.handle(ChannelEvent::TransportClosed(DisconnectReason::NetworkError), t2, &env);
        assert_eq!(channel.attempt(), 2);
        assert_eq!(channel.retry_at(), Some(t2 + Duration::from_secs(1)));
    }

    #[test]
    fn stable_open_resets_backoff() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);
        channel.handle(ChannelEvent::HandshakeFailed, t0, &env);
        let t1 = t0 + Duration::from_millis(500);
        channel.tick(t1, &env);
        channel.handle(ChannelEvent::HandshakeCompleted, t1, &env);

        assert_eq!(channel.next_deadline(), Some(t1 + DEFAULT_STABLE_OPEN_PERIOD));
        let actions = channel.tick(t1 + DEFAULT_STABLE_OPEN_PERIOD, &env);
        assert_eq!(channel.attempt(), 0);
        assert_eq!(actions.len(), 1);

        let t2 = t1 + Duration::from_secs(20);
        channel.handle(ChannelEvent::TransportClosed(DisconnectReason::RemoteClose), t2, &env);
        assert_eq!(channel.retry_at(), Some(t2 + Duration::from_millis(500)));
    }

    #[test]
    fn send_while_connecting_is_flushed_in_order_on_open() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);

        let (n1, a1) = channel.send("one", &env).unwrap();
        let (n2, a2) = channel.send("two", &env).unwrap();
        assert!(a1.is_empty() && a2.is_empty());
        assert_eq!(channel.queued(), 2);

        let actions = channel.handle(ChannelEvent::HandshakeCompleted, t0, &env);
        let sent: Vec<ClientNonce> = actions
            .iter()
            .filter_map(|a| match a {
                ChannelAction::Transmit(bytes) => {
                    Some(OutboundFrame::decode(bytes).unwrap().client_nonce)
                },
                _ => None,
            })
            .collect();

        assert_eq!(sent, vec![n1, n2]);
        assert_eq!(channel.queued(), 0);
    }

    #[test]
    fn send_while_open_transmits_immediately() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = open_channel(&env, t0);

        let (_, actions) = channel.send("hi", &env).unwrap();
        assert!(matches!(actions.as_slice(), [ChannelAction::Transmit(_)]));
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);

        let (first, _) = channel.send("0", &env).unwrap();
        for i in 1..DEFAULT_QUEUE_CAPACITY {
            channel.send(&i.to_string(), &env).unwrap();
        }
        assert_eq!(channel.queued(), DEFAULT_QUEUE_CAPACITY);

        let (_, actions) = channel.send("overflow", &env).unwrap();
        assert_eq!(actions, vec![ChannelAction::BackpressureDropped(first)]);
        assert_eq!(channel.queued(), DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn inbound_frames_are_decoded() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = open_channel(&env, t0);

        let actions = channel.handle(ChannelEvent::FrameReceived(message_frame(1)), t0, &env);
        assert!(matches!(actions.as_slice(), [ChannelAction::Deliver(m)] if m.id == Some(MessageId(1))));

        let system = InboundFrame::System("Connected to general".into()).encode().unwrap();
        assert!(channel.handle(ChannelEvent::FrameReceived(system), t0, &env).is_empty());
    }

    #[test]
    fn error_frame_keeps_connection_open() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = open_channel(&env, t0);

        let frame = InboundFrame::Error("rate limited".into()).encode().unwrap();
        channel.handle(ChannelEvent::FrameReceived(frame), t0, &env);

        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.status().last_error, Some(LastError::Server("rate limited".into())));
    }

    #[test]
    fn garbage_frame_is_protocol_error() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = open_channel(&env, t0);

        let actions =
            channel.handle(ChannelEvent::FrameReceived(Bytes::from_static(&[0xff, 0x00])), t0, &env);

        assert_eq!(channel.state(), ChannelState::Reconnecting);
        assert_eq!(actions[0], ChannelAction::Disconnect);
        assert_eq!(
            channel.status().last_error,
            Some(LastError::Disconnected(DisconnectReason::ProtocolError))
        );
    }

    #[test]
    fn reopen_is_reported_as_resumed() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = open_channel(&env, t0);

        channel.handle(ChannelEvent::TransportClosed(DisconnectReason::RemoteClose), t0, &env);
        let t1 = t0 + Duration::from_millis(500);
        channel.tick(t1, &env);
        let actions = channel.handle(ChannelEvent::HandshakeCompleted, t1, &env);

        assert!(actions.contains(&ChannelAction::Opened { resumed: true }));
    }

    #[test]
    fn closed_channel_ignores_everything() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);
        channel.handle(ChannelEvent::HandshakeFailed, t0, &env);
        assert!(channel.retry_at().is_some());

        channel.close();
        assert_eq!(channel.retry_at(), None);
        assert_eq!(channel.next_deadline(), None);

        let later = t0 + Duration::from_secs(60);
        assert!(channel.tick(later, &env).is_empty());
        assert!(channel.handle(ChannelEvent::HandshakeCompleted, later, &env).is_empty());
        assert!(channel.close().is_empty());
        assert_eq!(channel.send("late", &env).unwrap_err(), SyncError::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn close_drops_queued_frames() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);
        channel.send("pending", &env).unwrap();

        channel.close();
        assert_eq!(channel.queued(), 0);
    }

    #[test]
    fn cancelled_frame_is_not_flushed() {
        let env = TestEnv::new();
        let t0 = Instant::now();
        let mut channel = LiveChannel::new(RoomId::new("general"), exact_config(), t0);
        channel.subscribe(t0);

        let (stale, _) = channel.send("stale", &env).unwrap();
        let (fresh, _) = channel.send("fresh", &env).unwrap();

        assert!(channel.cancel(stale));
        assert!(!channel.cancel(stale));
        assert_eq!(channel.queued(), 1);

        let actions = channel.handle(ChannelEvent::HandshakeCompleted, t0, &env);
        let sent: Vec<ClientNonce> = actions
            .iter()
            .filter_map(|a| match a {
                ChannelAction::Transmit(bytes) => {
                    Some(OutboundFrame::decode(bytes).unwrap().client_nonce)
                },
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![fresh]);
    }
}
