//! History loading.
//!
//! The history service is an external collaborator behind [`HistoryApi`].
//! [`HistoryLoader`] wraps it with the acceptance rules every page goes
//! through before it reaches the store: rows without a server id, rows for
//! another room, and rows at or before the gap-fill watermark are dropped.
//!
//! A page is requested with an optional `before` or `after` cursor:
//!
//! - Initial load: newest `page_size` messages, no cursor.
//! - Gap fill after reconnect: `after` = newest confirmed `sent_at` held.
//!
//! Pages may arrive in any order; the store sorts.

use async_trait::async_trait;
use roomfeed_proto::{Message, RoomId, Timestamp};

use crate::error::{HistoryError, SyncError};

/// Page size for the initial load.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Page size for gap fill after a reconnect.
pub const DEFAULT_GAP_FILL_PAGE_SIZE: usize = 100;

/// One page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    /// Room to read.
    pub room_id: RoomId,
    /// Only messages strictly older than this.
    pub before: Option<Timestamp>,
    /// Only messages strictly newer than this.
    pub after: Option<Timestamp>,
    /// Maximum rows.
    pub page_size: usize,
}

impl HistoryRequest {
    /// Newest `page_size` messages.
    pub fn latest(room_id: RoomId, page_size: usize) -> Self {
        Self { room_id, before: None, after: None, page_size }
    }

    /// Up to `page_size` messages newer than `after`.
    pub fn since(room_id: RoomId, after: Timestamp, page_size: usize) -> Self {
        Self { room_id, before: None, after: Some(after), page_size }
    }

    /// Up to `page_size` messages older than `before`.
    pub fn older_than(room_id: RoomId, before: Timestamp, page_size: usize) -> Self {
        Self { room_id, before: Some(before), after: None, page_size }
    }
}

/// Source of past messages for a room.
#[async_trait]
pub trait HistoryApi: Send + Sync + 'static {
    /// Fetch one page. Order of the returned rows is unspecified.
    async fn fetch(&self, request: &HistoryRequest) -> Result<Vec<Message>, HistoryError>;
}

/// Applies acceptance rules to history pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryLoader;

impl HistoryLoader {
    /// Load the newest `page_size` messages for `room_id`.
    ///
    /// # Errors
    ///
    /// `SyncError::HistoryUnavailable` if the collaborator fails.
    pub async fn load<H>(
        api: &H,
        room_id: RoomId,
        page_size: usize,
    ) -> Result<Vec<Message>, SyncError>
    where
        H: HistoryApi + ?Sized,
    {
        Self::fetch(api, &HistoryRequest::latest(room_id, page_size)).await
    }

    /// Load up to `page_size` messages newer than `after`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::load`].
    pub async fn load_since<H>(
        api: &H,
        room_id: RoomId,
        after: Timestamp,
        page_size: usize,
    ) -> Result<Vec<Message>, SyncError>
    where
        H: HistoryApi + ?Sized,
    {
        Self::fetch(api, &HistoryRequest::since(room_id, after, page_size)).await
    }

    /// Execute `request` and filter the page.
    ///
    /// # Errors
    ///
    /// Same as [`Self::load`].
    pub async fn fetch<H>(api: &H, request: &HistoryRequest) -> Result<Vec<Message>, SyncError>
    where
        H: HistoryApi + ?Sized,
    {
        match api.fetch(request).await {
            Ok(rows) => {
                let fetched = rows.len();
                let accepted = Self::accept(request, rows);
                if accepted.len() < fetched {
                    tracing::warn!(
                        room = %request.room_id,
                        dropped = fetched - accepted.len(),
                        "Dropped history rows outside the request"
                    );
                }
                tracing::debug!(
                    room = %request.room_id,
                    fetched,
                    accepted = accepted.len(),
                    "History page loaded"
                );
                Ok(accepted)
            },
            Err(e) => {
                tracing::warn!(room = %request.room_id, error = %e, "History fetch failed");
                Err(e.into())
            },
        }
    }

    /// Drop rows the store must never see from a history page.
    pub fn accept(request: &HistoryRequest, rows: Vec<Message>) -> Vec<Message> {
        rows.into_iter()
            .filter(|m| m.id.is_some())
            .filter(|m| m.room_id == request.room_id)
            .filter(|m| request.after.is_none_or(|after| m.sent_at > after))
            .filter(|m| request.before.is_none_or(|before| m.sent_at < before))
            .collect()
    }
}
