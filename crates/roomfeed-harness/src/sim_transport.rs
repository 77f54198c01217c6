//! Collaborator handles onto a [`SimServer`].

use async_trait::async_trait;
use roomfeed_client::{LiveTransport, TransportError, TransportLink};
use roomfeed_core::{Author, HistoryApi, HistoryError, HistoryRequest};
use roomfeed_proto::{Message, RoomId};

use crate::sim_server::{ConnectOutcome, SimServer};

/// [`LiveTransport`] backed by a [`SimServer`].
///
/// Each accepted connection spawns a task that feeds client frames into the
/// server until the client drops the link.
#[derive(Debug, Clone)]
pub struct SimTransport {
    server: SimServer,
    author: Author,
}

impl SimTransport {
    pub(crate) fn new(server: SimServer, author: Author) -> Self {
        Self { server, author }
    }
}

#[async_trait]
impl LiveTransport for SimTransport {
    async fn connect(&self, room_id: &RoomId) -> Result<TransportLink, TransportError> {
        match self.server.connect(room_id) {
            ConnectOutcome::Accepted { link, mut outbound } => {
                let server = self.server.clone();
                let author = self.author.clone();
                let room_id = room_id.clone();
                tokio::spawn(async move {
                    while let Some(bytes) = outbound.recv().await {
                        server.receive(&room_id, &author, &bytes);
                    }
                });
                Ok(link)
            },
            ConnectOutcome::Refused => {
                Err(TransportError::Rejected("refused by simulation".to_string()))
            },
            ConnectOutcome::Stalled => std::future::pending().await,
        }
    }
}

/// [`HistoryApi`] backed by a [`SimServer`].
#[derive(Debug, Clone)]
pub struct SimHistory {
    server: SimServer,
}

impl SimHistory {
    pub(crate) fn new(server: SimServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl HistoryApi for SimHistory {
    async fn fetch(&self, request: &HistoryRequest) -> Result<Vec<Message>, HistoryError> {
        tokio::task::yield_now().await;
        self.server.fetch_history(request)
    }
}
