//! Terminal rendering of feed snapshots and status changes.

use std::collections::HashMap;

use roomfeed_client::{ChannelState, ChannelStatus, DeliveryStatus, FeedEntry, FeedSnapshot, LastError};
use roomfeed_proto::{ClientNonce, MessageId, Timestamp};

/// Identity of a feed row across snapshots.
///
/// Nonce first, so a pending row keeps its identity once confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Nonce(ClientNonce),
    Id(MessageId),
}

fn row_key(entry: &FeedEntry) -> Option<RowKey> {
    entry
        .message
        .client_nonce
        .map(RowKey::Nonce)
        .or(entry.message.id.map(RowKey::Id))
}

/// Turns successive snapshots into the lines not yet printed.
#[derive(Debug, Default)]
pub struct FeedPrinter {
    printed: HashMap<RowKey, DeliveryStatus>,
}

impl FeedPrinter {
    /// Lines for rows that are new, plus rows that have just failed.
    ///
    /// A pending row that gets confirmed is not printed again.
    pub fn render(&mut self, snapshot: &FeedSnapshot) -> Vec<String> {
        self.render_entries(snapshot.entries())
    }

    fn render_entries(&mut self, entries: &[FeedEntry]) -> Vec<String> {
        let mut lines = Vec::new();
        for entry in entries {
            let Some(key) = row_key(entry) else { continue };

            let reprint = match self.printed.insert(key, entry.status) {
                None => true,
                Some(previous) => {
                    previous != entry.status && matches!(entry.status, DeliveryStatus::Failed(_))
                },
            };
            if reprint {
                lines.push(format_entry(entry));
            }
        }
        lines
    }
}

/// `[hh:mm:ss] name: body`, with a delivery marker for local rows.
pub fn format_entry(entry: &FeedEntry) -> String {
    let message = &entry.message;
    let marker = match entry.status {
        DeliveryStatus::Confirmed => "",
        DeliveryStatus::Pending => " (pending)",
        DeliveryStatus::Failed(_) => " (failed)",
    };
    format!(
        "[{}] {}: {}{marker}",
        clock_time(message.sent_at),
        message.author_display_name,
        message.body
    )
}

/// One-line connectivity summary.
pub fn format_status(status: &ChannelStatus) -> String {
    let state = match status.state {
        ChannelState::Idle => "idle",
        ChannelState::Connecting => "connecting",
        ChannelState::Open => "connected",
        ChannelState::Reconnecting => "reconnecting",
        ChannelState::Closed => "closed",
    };

    let mut line = format!("-- {state}");
    if status.attempt > 0 && status.state != ChannelState::Open {
        line.push_str(&format!(" (attempt {})", status.attempt));
    }
    match &status.last_error {
        Some(LastError::Disconnected(reason)) => line.push_str(&format!(": {reason}")),
        Some(LastError::Server(reason)) => line.push_str(&format!(": server said {reason}")),
        None => {},
    }
    if status.queued > 0 {
        line.push_str(&format!(", {} queued", status.queued));
    }
    if status.history_degraded {
        line.push_str(", history unavailable");
    }
    line
}

/// UTC wall-clock time of day.
fn clock_time(sent_at: Timestamp) -> String {
    let secs = sent_at.as_millis() / 1000;
    format!("{:02}:{:02}:{:02}", (secs / 3600) % 24, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use roomfeed_client::{DisconnectReason, FailureCause};
    use roomfeed_proto::{Message, RoomId};

    use super::*;

    fn entry(id: Option<u64>, nonce: Option<u128>, status: DeliveryStatus) -> FeedEntry {
        FeedEntry {
            message: Message {
                id: id.map(MessageId),
                room_id: RoomId::new("general"),
                author_id: "ada".into(),
                author_display_name: "Ada".into(),
                body: "hello".into(),
                // 13:45:07 UTC
                sent_at: Timestamp(1_700_000_000_000 - 1_700_000_000_000 % 86_400_000 + 49_507_000),
                client_nonce: nonce.map(ClientNonce),
            },
            status,
        }
    }

    #[test]
    fn formats_confirmed_and_local_rows() {
        let confirmed = entry(Some(1), None, DeliveryStatus::Confirmed);
        assert_eq!(format_entry(&confirmed), "[13:45:07] Ada: hello");

        let pending = entry(None, Some(7), DeliveryStatus::Pending);
        assert_eq!(format_entry(&pending), "[13:45:07] Ada: hello (pending)");

        let failed = entry(None, Some(7), DeliveryStatus::Failed(FailureCause::SendTimeout));
        assert_eq!(format_entry(&failed), "[13:45:07] Ada: hello (failed)");
    }

    #[test]
    fn confirmation_is_not_reprinted() {
        let mut printer = FeedPrinter::default();

        let first = printer.render_entries(&[entry(None, Some(7), DeliveryStatus::Pending)]);
        assert_eq!(first.len(), 1);

        let second =
            printer.render_entries(&[entry(Some(3), Some(7), DeliveryStatus::Confirmed)]);
        assert!(second.is_empty());
    }

    #[test]
    fn failure_is_reprinted_once() {
        let mut printer = FeedPrinter::default();
        printer.render_entries(&[entry(None, Some(7), DeliveryStatus::Pending)]);

        let failed = entry(None, Some(7), DeliveryStatus::Failed(FailureCause::SendTimeout));
        assert_eq!(printer.render_entries(&[failed.clone()]).len(), 1);
        assert!(printer.render_entries(&[failed]).is_empty());
    }

    #[test]
    fn status_line_names_state_and_reason() {
        let status = ChannelStatus {
            state: ChannelState::Reconnecting,
            attempt: 2,
            last_error: Some(LastError::Disconnected(DisconnectReason::NetworkError)),
            queued: 1,
            history_degraded: false,
        };
        assert_eq!(format_status(&status), "-- reconnecting (attempt 2): network-error, 1 queued");
    }

    #[test]
    fn status_line_flags_missing_history() {
        let status = ChannelStatus {
            state: ChannelState::Open,
            attempt: 0,
            last_error: None,
            queued: 0,
            history_degraded: true,
        };
        assert_eq!(format_status(&status), "-- connected, history unavailable");
    }
}
