//! Runtime tests against the simulated server.
//!
//! Every test runs on a paused Tokio clock: backoff delays, handshake
//! timeouts and send deadlines elapse instantly and deterministically.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use roomfeed_client::{
    Author, ChannelState, ChannelStatus, DeliveryStatus, FeedSnapshot, LastError, LinkEvent,
    LiveTransport, RoomHandle, SyncClient, SyncConfig, SyncError, TransportError, TransportLink,
};
use roomfeed_core::{DisconnectReason, FailureCause};
use roomfeed_harness::{SimEnv, SimServer};
use roomfeed_proto::RoomId;
use tokio::sync::{mpsc, watch};

fn room() -> RoomId {
    RoomId::new("general")
}

fn ada() -> Author {
    Author::new("ada", "Ada")
}

fn client(env: &SimEnv, server: &SimServer) -> SyncClient<SimEnv> {
    let config = SyncConfig { author: ada(), ..SyncConfig::default() };
    SyncClient::new(env.clone(), server.history(), server.transport_as(ada()), config)
}

async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(pred))
        .await
        .expect("condition not reached")
        .expect("room task ended")
        .clone()
}

async fn wait_open(handle: &RoomHandle<SimEnv>) -> ChannelStatus {
    wait_for(&mut handle.status_updates(), |s| s.state == ChannelState::Open).await
}

fn bodies(snapshot: &FeedSnapshot) -> Vec<String> {
    snapshot.messages().map(|m| m.body.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn subscribe_loads_history_then_follows_live() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    let bob = Author::new("bob", "Bob");
    server.post(&room(), &bob, "one");
    server.post(&room(), &bob, "two");

    let mut handle = client(&env, &server).subscribe(room());
    let mut changes = handle.changes();

    wait_for(&mut changes, |s| s.len() == 2).await;
    wait_open(&handle).await;

    server.post(&room(), &bob, "three");
    let snapshot = wait_for(&mut changes, |s| s.len() == 3).await;

    assert_eq!(bodies(&snapshot), vec!["one", "two", "three"]);
    assert!(snapshot.entries().iter().all(|e| e.status == DeliveryStatus::Confirmed));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn send_before_open_shows_pending_then_confirmed() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    let mut handle = client(&env, &server).subscribe(room());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    handle.on_change(move |snapshot| {
        let statuses: Vec<DeliveryStatus> = snapshot.entries().iter().map(|e| e.status).collect();
        sink.lock().unwrap().push(statuses);
    });

    let nonce = handle.send("  hello  ").unwrap();
    let snapshot = wait_for(&mut handle.changes(), |s| {
        s.entries().iter().any(|e| e.status == DeliveryStatus::Confirmed)
    })
    .await;

    assert_eq!(snapshot.len(), 1);
    let entry = &snapshot.entries()[0];
    assert_eq!(entry.message.body, "hello");
    assert_eq!(entry.message.client_nonce, Some(nonce));
    assert_eq!(entry.message.author_id, "ada");
    assert!(entry.message.id.is_some());

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&Vec::new()), "listener is primed with the current feed");
    assert!(seen.contains(&vec![DeliveryStatus::Pending]));
    assert_eq!(seen.last(), Some(&vec![DeliveryStatus::Confirmed]));

    assert_eq!(server.messages(&room()).len(), 1);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_fills_gap_exactly_once() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    let bob = Author::new("bob", "Bob");
    server.post(&room(), &bob, "before");

    let mut handle = client(&env, &server).subscribe(room());
    let mut changes = handle.changes();
    wait_for(&mut changes, |s| s.len() == 1).await;
    wait_open(&handle).await;
    let last_known = handle.snapshot().messages().last().map(|m| m.sent_at).unwrap();

    server.disconnect_all(&room(), DisconnectReason::NetworkError);
    server.post(&room(), &bob, "missed");

    let snapshot = wait_for(&mut changes, |s| s.len() == 2).await;
    assert_eq!(bodies(&snapshot), vec!["before", "missed"]);

    wait_open(&handle).await;
    assert_eq!(server.connect_attempts(), 2);

    let requests = server.history_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].after, Some(last_known));

    server.post(&room(), &bob, "after");
    let snapshot = wait_for(&mut changes, |s| s.len() == 3).await;
    assert_eq!(bodies(&snapshot), vec!["before", "missed", "after"]);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refused_connects_back_off_until_accepted() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    server.refuse_next_connects(3);

    let handle = client(&env, &server).subscribe(room());
    let status = wait_open(&handle).await;

    assert_eq!(server.connect_attempts(), 4);
    assert_eq!(status.attempt, 3);
    assert_eq!(status.last_error, None);

    // Stable for long enough, the backoff sequence starts over
    let status = wait_for(&mut handle.status_updates(), |s| s.attempt == 0).await;
    assert_eq!(status.state, ChannelState::Open);
}

#[tokio::test(start_paused = true)]
async fn stalled_handshake_times_out_and_retries() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    server.stall_connects(true);

    let handle = client(&env, &server).subscribe(room());
    tokio::time::sleep(Duration::from_millis(10_100)).await;

    let status = handle.status();
    assert_eq!(status.state, ChannelState::Reconnecting);
    assert_eq!(
        status.last_error,
        Some(LastError::Disconnected(DisconnectReason::HandshakeTimeout))
    );

    server.stall_connects(false);
    wait_open(&handle).await;
    assert_eq!(server.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_send_fails_after_timeout() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    server.drop_client_frames(true);

    let handle = client(&env, &server).subscribe(room());
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    handle.on_failure(move |e| sink.lock().unwrap().push(e.clone()));
    wait_open(&handle).await;

    let nonce = handle.send("into the void").unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(*failures.lock().unwrap(), vec![SyncError::SendTimeout(nonce)]);
    let entry = handle.snapshot().entries()[0].clone();
    assert_eq!(entry.status, DeliveryStatus::Failed(FailureCause::SendTimeout));
    assert!(server.messages(&room()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn history_outage_keeps_live_feed() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    server.set_history_available(false);

    let handle = client(&env, &server).subscribe(room());
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    handle.on_failure(move |e| sink.lock().unwrap().push(e.clone()));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    handle.on_status(move |s| sink.lock().unwrap().push(s.clone()));
    wait_open(&handle).await;

    server.post(&room(), &Author::new("bob", "Bob"), "live only");
    let snapshot = wait_for(&mut handle.changes(), |s| s.len() == 1).await;

    assert_eq!(bodies(&snapshot), vec!["live only"]);
    let failures = failures.lock().unwrap().clone();
    assert!(matches!(
        failures.as_slice(),
        [SyncError::HistoryUnavailable { status_code: Some(503), .. }]
    ));

    let status = handle.status();
    assert_eq!(status.state, ChannelState::Open);
    assert!(status.history_degraded);
    let statuses = statuses.lock().unwrap().clone();
    assert!(statuses.iter().any(|s| s.history_degraded), "listeners never saw the outage");
    assert!(statuses.last().is_some_and(|s| s.history_degraded));
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_cancels_pending_timers() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    server.refuse_next_connects(u32::MAX);

    let mut handle = client(&env, &server).subscribe(room());
    let calls = Arc::new(AtomicUsize::new(0));
    let on_status = Arc::clone(&calls);
    handle.on_status(move |_| {
        on_status.fetch_add(1, Ordering::SeqCst);
    });
    let on_change = Arc::clone(&calls);
    handle.on_change(move |_| {
        on_change.fetch_add(1, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(server.connect_attempts() >= 2);

    handle.shutdown().await;
    assert!(handle.is_closed());
    assert_eq!(handle.status().state, ChannelState::Closed);

    let attempts = server.connect_attempts();
    let fetches = server.history_requests().len();
    let notified = calls.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(server.connect_attempts(), attempts);
    assert_eq!(server.history_requests().len(), fetches);
    assert_eq!(calls.load(Ordering::SeqCst), notified);
    assert_eq!(handle.send("too late"), Err(SyncError::Closed));
}

#[tokio::test(start_paused = true)]
async fn blank_sends_are_rejected_locally() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    let handle = client(&env, &server).subscribe(room());

    assert_eq!(handle.send(" \t\n"), Err(SyncError::EmptyBody));
    wait_open(&handle).await;

    assert!(handle.snapshot().is_empty());
    assert!(server.messages(&room()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn rooms_are_independent() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    let client = client(&env, &server);
    let random = RoomId::new("random");

    let general = client.subscribe(room());
    let mut other = client.subscribe(random.clone());
    wait_open(&general).await;
    wait_open(&other).await;

    server.post(&random, &Author::new("bob", "Bob"), "elsewhere");
    wait_for(&mut other.changes(), |s| s.len() == 1).await;
    other.shutdown().await;

    assert!(general.snapshot().is_empty());
    assert_eq!(general.status().state, ChannelState::Open);
    assert_eq!(server.subscriber_count(&room()), 1);
}

#[tokio::test(start_paused = true)]
async fn undecodable_frame_forces_reconnect() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    let handle = client(&env, &server).subscribe(room());
    wait_open(&handle).await;

    server.deliver_raw(&room(), Bytes::from_static(&[0xff, 0x00]));
    let status = wait_for(&mut handle.status_updates(), |s| s.state != ChannelState::Open).await;
    assert_eq!(status.last_error, Some(LastError::Disconnected(DisconnectReason::ProtocolError)));

    wait_open(&handle).await;
    assert_eq!(server.connect_attempts(), 2);

    server.post(&room(), &Author::new("bob", "Bob"), "still here");
    let snapshot = wait_for(&mut handle.changes(), |s| s.len() == 1).await;
    assert_eq!(bodies(&snapshot), vec!["still here"]);
}

/// Accepts every connection, then never reads what the client writes.
struct StuckTransport {
    connects: Arc<AtomicUsize>,
    held: Mutex<Vec<(mpsc::Receiver<Bytes>, mpsc::Sender<LinkEvent>)>>,
}

#[async_trait]
impl LiveTransport for StuckTransport {
    async fn connect(&self, _room_id: &RoomId) -> Result<TransportLink, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (link, outbound, inbound) = TransportLink::channel();
        self.held.lock().unwrap().push((outbound, inbound));
        Ok(link)
    }
}

#[tokio::test(start_paused = true)]
async fn full_outbound_buffer_drops_link_instead_of_blocking() {
    let env = SimEnv::new();
    let server = SimServer::new(env.clone());
    let connects = Arc::new(AtomicUsize::new(0));
    let transport = StuckTransport { connects: Arc::clone(&connects), held: Mutex::new(Vec::new()) };
    let config = SyncConfig { author: ada(), ..SyncConfig::default() };
    let client = SyncClient::new(env.clone(), server.history(), transport, config);
    let mut handle = client.subscribe(room());
    wait_open(&handle).await;

    for i in 0..70 {
        handle.send(&format!("message {i}")).unwrap();
    }
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(connects.load(Ordering::SeqCst) >= 2, "stuck link was never dropped");
    assert_eq!(handle.status().state, ChannelState::Open);
    assert_eq!(handle.snapshot().len(), 70);

    tokio::time::timeout(Duration::from_secs(60), handle.shutdown())
        .await
        .expect("room task stuck on a full link");
}
