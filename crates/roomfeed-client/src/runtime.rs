//! Tokio runtime for room synchronization.
//!
//! [`SyncClient::subscribe`] spawns one task per room. The task owns the
//! [`RoomSync`] state machine, the current transport link and every listener,
//! and multiplexes all inputs through a single `tokio::select!` loop:
//!
//! - commands from the [`RoomHandle`] (send, listener registration,
//!   unsubscribe)
//! - history results from spawned fetch tasks
//! - connection results from spawned connect tasks
//! - frames and close notifications from the open link
//! - the next timer deadline reported by the state machine
//!
//! Fetches and connects run as separate tasks so a slow server never stalls
//! the loop. Outbound frames are handed to the link without waiting: a link
//! whose buffer is full is dropped and the channel reconnects. Unsubscribing aborts them, drops the link and ends the loop.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use roomfeed_core::{
    ChannelEvent, ChannelStatus, DisconnectReason, Environment, FeedSnapshot, HistoryApi,
    HistoryLoader, HistoryRequest, RoomSync, SyncAction, SyncConfig, SyncError,
};
use roomfeed_proto::{ClientNonce, Message, RoomId};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::{AbortHandle, JoinHandle},
};

use crate::transport::{LinkEvent, LiveTransport, TransportError, TransportLink};

/// Called with every new feed snapshot.
pub type ChangeListener = Box<dyn FnMut(&FeedSnapshot) + Send + 'static>;

/// Called on every connectivity change.
pub type StatusListener = Box<dyn FnMut(&ChannelStatus) + Send + 'static>;

/// Called for failures the caller may act on (failed sends, history outage).
pub type FailureListener = Box<dyn FnMut(&SyncError) + Send + 'static>;

/// Entry point: subscribes to rooms.
pub struct SyncClient<E: Environment> {
    env: E,
    history: Arc<dyn HistoryApi>,
    transport: Arc<dyn LiveTransport>,
    config: SyncConfig,
}

impl<E: Environment> Clone for SyncClient<E> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            history: Arc::clone(&self.history),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }
    }
}

impl<E: Environment> SyncClient<E> {
    /// Create a client from its collaborators.
    pub fn new<H, T>(env: E, history: H, transport: T, config: SyncConfig) -> Self
    where
        H: HistoryApi,
        T: LiveTransport,
    {
        Self { env, history: Arc::new(history), transport: Arc::new(transport), config }
    }

    /// Configuration applied to new subscriptions.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribe to a room.
    ///
    /// Starts the initial history load and the live connection in the
    /// background and returns immediately. Must be called within a Tokio
    /// runtime.
    pub fn subscribe(&self, room_id: RoomId) -> RoomHandle<E> {
        let sync = RoomSync::new(self.env.clone(), room_id.clone(), self.config.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(sync.snapshot());
        let (status_tx, status_rx) = watch::channel(sync.status());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        let task = RoomTask {
            sync,
            env: self.env.clone(),
            history: Arc::clone(&self.history),
            transport: Arc::clone(&self.transport),
            commands: command_rx,
            fetch_tx,
            fetch_results: fetch_rx,
            connect_tx,
            connect_results: connect_rx,
            fetches: Vec::new(),
            connecting: None,
            generation: 0,
            link: None,
            snapshot_tx,
            status_tx,
            change_listeners: Vec::new(),
            status_listeners: Vec::new(),
            failure_listeners: Vec::new(),
        };

        tracing::info!(room = %room_id, "Subscribed");
        let task = tokio::spawn(task.run());

        RoomHandle {
            room_id,
            env: self.env.clone(),
            commands: command_tx,
            closed: AtomicBool::new(false),
            snapshot: snapshot_rx,
            status: status_rx,
            task: Some(task),
        }
    }
}

enum Command {
    OnChange(ChangeListener),
    OnStatus(StatusListener),
    OnFailure(FailureListener),
    Send { nonce: ClientNonce, body: String },
    Unsubscribe,
}

/// Caller's handle to one room subscription.
///
/// Dropping the handle unsubscribes.
pub struct RoomHandle<E: Environment> {
    room_id: RoomId,
    env: E,
    commands: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
    snapshot: watch::Receiver<FeedSnapshot>,
    status: watch::Receiver<ChannelStatus>,
    task: Option<JoinHandle<()>>,
}

impl<E: Environment> RoomHandle<E> {
    /// Subscribed room.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Register a change listener. It is called once right away with the
    /// current snapshot, then after every mutation.
    pub fn on_change<F>(&self, listener: F)
    where
        F: FnMut(&FeedSnapshot) + Send + 'static,
    {
        self.command(Command::OnChange(Box::new(listener)));
    }

    /// Register a status listener. It is called once right away with the
    /// current status, then on every change.
    pub fn on_status<F>(&self, listener: F)
    where
        F: FnMut(&ChannelStatus) + Send + 'static,
    {
        self.command(Command::OnStatus(Box::new(listener)));
    }

    /// Register a failure listener.
    pub fn on_failure<F>(&self, listener: F)
    where
        F: FnMut(&SyncError) + Send + 'static,
    {
        self.command(Command::OnFailure(Box::new(listener)));
    }

    /// Send a message. Never blocks.
    ///
    /// The returned nonce identifies the optimistic entry, which appears in
    /// the feed as pending before the next change notification completes.
    /// Later failures (timeout, queue overflow) arrive through
    /// [`Self::on_failure`].
    ///
    /// # Errors
    ///
    /// - `SyncError::EmptyBody` if `body` is blank after trimming
    /// - `SyncError::Closed` after [`Self::unsubscribe`]
    pub fn send(&self, body: &str) -> Result<ClientNonce, SyncError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(SyncError::EmptyBody);
        }
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let nonce = ClientNonce(self.env.random_u128());
        self.commands
            .send(Command::Send { nonce, body: body.to_string() })
            .map_err(|_| SyncError::Closed)?;
        Ok(nonce)
    }

    /// Latest feed snapshot.
    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Latest connectivity status.
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Watch channel of feed snapshots.
    pub fn changes(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshot.clone()
    }

    /// Watch channel of connectivity status.
    pub fn status_updates(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Tear the subscription down. Idempotent.
    pub fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(room = %self.room_id, "Unsubscribing");
        let _ = self.commands.send(Command::Unsubscribe);
    }

    /// True once unsubscribed or the room task has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.commands.is_closed()
    }

    /// Unsubscribe and wait for the room task to finish.
    pub async fn shutdown(&mut self) {
        self.unsubscribe();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(room = %self.room_id, error = %e, "Room task ended abnormally");
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(room = %self.room_id, "Room task gone, dropping command");
        }
    }
}

impl<E: Environment> Drop for RoomHandle<E> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<E: Environment> std::fmt::Debug for RoomHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

type FetchResult = (u64, Result<Vec<Message>, SyncError>);
type ConnectResult = (u64, Result<TransportLink, TransportError>);

/// The single coordination point for one room.
struct RoomTask<E: Environment> {
    sync: RoomSync<E>,
    env: E,
    history: Arc<dyn HistoryApi>,
    transport: Arc<dyn LiveTransport>,

    commands: mpsc::UnboundedReceiver<Command>,
    fetch_tx: mpsc::UnboundedSender<FetchResult>,
    fetch_results: mpsc::UnboundedReceiver<FetchResult>,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_results: mpsc::UnboundedReceiver<ConnectResult>,

    fetches: Vec<AbortHandle>,
    connecting: Option<AbortHandle>,
    /// Bumped on every connect and disconnect; stale connect results carry
    /// an older value and are dropped.
    generation: u64,
    link: Option<TransportLink>,

    snapshot_tx: watch::Sender<FeedSnapshot>,
    status_tx: watch::Sender<ChannelStatus>,
    change_listeners: Vec<ChangeListener>,
    status_listeners: Vec<StatusListener>,
    failure_listeners: Vec<FailureListener>,
}

impl<E: Environment> RoomTask<E> {
    async fn run(mut self) {
        let actions = self.sync.start(self.env.now());
        self.execute(actions);

        while !self.sync.is_closed() {
            let deadline = self.sync.next_deadline();

            let actions = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.sync.close(),
                },
                Some((request_id, result)) = self.fetch_results.recv() => {
                    self.sync.handle_history(request_id, result)
                },
                Some((generation, result)) = self.connect_results.recv() => {
                    self.handle_connected(generation, result)
                },
                event = next_link_event(&mut self.link) => self.handle_link_event(event),
                () = wait_until(&self.env, deadline) => {
                    let now = self.env.now();
                    self.sync.tick(now)
                },
            };

            self.execute(actions);
        }

        for fetch in self.fetches.drain(..) {
            fetch.abort();
        }
        tracing::debug!(room = %self.sync.room_id(), "Room task finished");
    }

    fn handle_command(&mut self, command: Command) -> Vec<SyncAction> {
        match command {
            Command::OnChange(mut listener) => {
                listener(&self.sync.snapshot());
                self.change_listeners.push(listener);
                Vec::new()
            },
            Command::OnStatus(mut listener) => {
                listener(&self.sync.status());
                self.status_listeners.push(listener);
                Vec::new()
            },
            Command::OnFailure(listener) => {
                self.failure_listeners.push(listener);
                Vec::new()
            },
            Command::Send { nonce, body } => {
                let now = self.env.now();
                match self.sync.send_with_nonce(nonce, &body, now) {
                    Ok(actions) => actions,
                    Err(e) => vec![SyncAction::Failure(e)],
                }
            },
            Command::Unsubscribe => self.sync.close(),
        }
    }

    fn handle_connected(
        &mut self,
        generation: u64,
        result: Result<TransportLink, TransportError>,
    ) -> Vec<SyncAction> {
        if generation != self.generation {
            tracing::debug!(room = %self.sync.room_id(), generation, "Dropping stale connection");
            return Vec::new();
        }

        self.connecting = None;
        let now = self.env.now();
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.sync.handle_channel(ChannelEvent::HandshakeCompleted, now)
            },
            Err(e) => {
                tracing::warn!(room = %self.sync.room_id(), error = %e, "Connect failed");
                self.sync.handle_channel(ChannelEvent::HandshakeFailed, now)
            },
        }
    }

    fn handle_link_event(&mut self, event: Option<LinkEvent>) -> Vec<SyncAction> {
        let now = self.env.now();
        match event {
            Some(LinkEvent::Frame(bytes)) => {
                self.sync.handle_channel(ChannelEvent::FrameReceived(bytes), now)
            },
            Some(LinkEvent::Closed(reason)) => {
                self.link = None;
                self.sync.handle_channel(ChannelEvent::TransportClosed(reason), now)
            },
            None => {
                self.link = None;
                let reason = DisconnectReason::NetworkError;
                self.sync.handle_channel(ChannelEvent::TransportClosed(reason), now)
            },
        }
    }

    fn execute(&mut self, actions: Vec<SyncAction>) {
        let mut queue: VecDeque<SyncAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                SyncAction::FetchHistory { request_id, request } => {
                    self.spawn_fetch(request_id, request);
                },
                SyncAction::Connect => self.spawn_connect(),
                SyncAction::Disconnect => self.disconnect(),
                SyncAction::Transmit(bytes) => {
                    let delivered = match &self.link {
                        Some(link) => match link.outbound.try_send(bytes) {
                            Ok(()) => true,
                            Err(TrySendError::Full(_)) => {
                                tracing::warn!(
                                    room = %self.sync.room_id(),
                                    "Transport not draining frames, dropping link"
                                );
                                false
                            },
                            Err(TrySendError::Closed(_)) => false,
                        },
                        None => {
                            tracing::debug!(room = %self.sync.room_id(), "No link for frame");
                            true
                        },
                    };

                    if !delivered {
                        self.disconnect();
                        let now = self.env.now();
                        let event = ChannelEvent::TransportClosed(DisconnectReason::NetworkError);
                        queue.extend(self.sync.handle_channel(event, now));
                    }
                },
                SyncAction::Changed(snapshot) => {
                    for listener in &mut self.change_listeners {
                        listener(&snapshot);
                    }
                    self.snapshot_tx.send_replace(snapshot);
                },
                SyncAction::Status(status) => {
                    for listener in &mut self.status_listeners {
                        listener(&status);
                    }
                    self.status_tx.send_replace(status);
                },
                SyncAction::Failure(error) => {
                    for listener in &mut self.failure_listeners {
                        listener(&error);
                    }
                },
            }
        }
    }

    fn spawn_fetch(&mut self, request_id: u64, request: HistoryRequest) {
        let history = Arc::clone(&self.history);
        let results = self.fetch_tx.clone();

        let handle = tokio::spawn(async move {
            let result = HistoryLoader::fetch(history.as_ref(), &request).await;
            let _ = results.send((request_id, result));
        });

        self.fetches.retain(|h| !h.is_finished());
        self.fetches.push(handle.abort_handle());
    }

    fn spawn_connect(&mut self) {
        if let Some(previous) = self.connecting.take() {
            previous.abort();
        }
        self.generation += 1;

        let generation = self.generation;
        let transport = Arc::clone(&self.transport);
        let room_id = self.sync.room_id().clone();
        let results = self.connect_tx.clone();

        let handle = tokio::spawn(async move {
            let result = transport.connect(&room_id).await;
            let _ = results.send((generation, result));
        });
        self.connecting = Some(handle.abort_handle());
    }

    fn disconnect(&mut self) {
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
        }
        self.generation += 1;
        self.link = None;
    }
}

async fn next_link_event(link: &mut Option<TransportLink>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until<E: Environment>(env: &E, deadline: Option<E::Instant>) {
    match deadline {
        Some(at) => {
            let now = env.now();
            if at > now {
                env.sleep(at - now).await;
            }
        },
        None => std::future::pending().await,
    }
}
