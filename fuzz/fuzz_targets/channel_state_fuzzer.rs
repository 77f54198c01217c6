//! Fuzz target for the LiveChannel state machine
//!
//! # Strategy
//!
//! - Arbitrary interleavings of transport events, timer ticks, sends and
//!   close, with time advancing by fuzzer-chosen steps
//! - Inbound frames are raw fuzzer bytes, so most are undecodable
//!
//! # Invariants
//!
//! - A retry is scheduled exactly while `Reconnecting`
//! - The outbound queue never exceeds its capacity
//! - Frames are only transmitted while `Open`
//! - After close, every input is ignored

#![no_main]

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomfeed_core::{
    ChannelAction, ChannelConfig, ChannelEvent, ChannelState, DisconnectReason, Environment,
    LiveChannel, SyncError,
};
use roomfeed_proto::RoomId;

#[derive(Clone)]
struct FuzzEnv {
    counter: Arc<AtomicU64>,
}

impl Environment for FuzzEnv {
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
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = (n as u8).wrapping_mul(31).wrapping_add(i as u8);
        }
    }
}

#[derive(Debug, Clone, Arbitrary)]
enum ChannelOp {
    HandshakeCompleted,
    HandshakeFailed,
    Closed(u8),
    Frame(Vec<u8>),
    Tick { advance_ms: u16 },
    Send(String),
    Close,
}

fn reason(n: u8) -> DisconnectReason {
    match n % 3 {
        0 => DisconnectReason::RemoteClose,
        1 => DisconnectReason::NetworkError,
        _ => DisconnectReason::ProtocolError,
    }
}

fuzz_target!(|ops: Vec<ChannelOp>| {
    let env = FuzzEnv { counter: Arc::new(AtomicU64::new(0)) };
    let config = ChannelConfig { queue_capacity: 4, ..ChannelConfig::default() };
    let capacity = config.queue_capacity;

    let mut now = Instant::now();
    let mut channel = LiveChannel::new(RoomId::new("general"), config, now);
    channel.subscribe(now);

    for op in ops {
        let was_closed = channel.state() == ChannelState::Closed;

        let actions = match op {
            ChannelOp::HandshakeCompleted => {
                channel.handle(ChannelEvent::HandshakeCompleted, now, &env)
            },
            ChannelOp::HandshakeFailed => channel.handle(ChannelEvent::HandshakeFailed, now, &env),
            ChannelOp::Closed(n) => {
                channel.handle(ChannelEvent::TransportClosed(reason(n)), now, &env)
            },
            ChannelOp::Frame(bytes) => {
                channel.handle(ChannelEvent::FrameReceived(bytes.into()), now, &env)
            },
            ChannelOp::Tick { advance_ms } => {
                now += Duration::from_millis(u64::from(advance_ms));
                channel.tick(now, &env)
            },
            ChannelOp::Send(body) => match channel.send(&body, &env) {
                Ok((_, actions)) => actions,
                Err(SyncError::Closed) => {
                    assert_eq!(channel.state(), ChannelState::Closed);
                    Vec::new()
                },
                Err(_) => Vec::new(),
            },
            ChannelOp::Close => channel.close(),
        };

        if was_closed {
            assert!(actions.is_empty(), "closed channel produced {actions:?}");
            assert_eq!(channel.state(), ChannelState::Closed);
        }

        assert_eq!(
            channel.retry_at().is_some(),
            channel.state() == ChannelState::Reconnecting,
            "retry scheduled outside Reconnecting"
        );
        assert!(channel.queued() <= capacity);

        if actions.iter().any(|a| matches!(a, ChannelAction::Transmit(_))) {
            assert_eq!(channel.state(), ChannelState::Open, "transmitted while not open");
        }
    }
});
