//! Fuzz target for MessageStore
//!
//! # Strategy
//!
//! - Tiny id, nonce and timestamp domains to force collisions
//! - Confirmed copies, local copies, foreign-room rows and unusable rows
//!   (neither id nor nonce)
//! - Failure marks interleaved with inserts
//!
//! # Invariants
//!
//! - Snapshot is sorted by `sent_at`
//! - No two entries share an id; no two entries share a nonce
//! - Version changes exactly when an operation reports a change
//! - Rows for another room, or with neither id nor nonce, are rejected

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomfeed_core::{FailureCause, InsertOutcome, MessageStore};
use roomfeed_proto::{ClientNonce, Message, MessageId, RoomId, Timestamp};

#[derive(Debug, Clone, Arbitrary)]
enum StoreOp {
    /// A confirmed row echoes nonce `id` when `echoes` is set, so a nonce
    /// always belongs to at most one server id.
    Insert { id: Option<u8>, echoes: bool, nonce: Option<u8>, sent_at: u8, foreign: bool },
    MarkFailed { nonce: u8, timeout: bool },
}

fuzz_target!(|ops: Vec<StoreOp>| {
    let room = RoomId::new("general");
    let mut store = MessageStore::new(room.clone());

    for op in ops {
        let before = store.version();

        let changed = match op {
            StoreOp::Insert { id, echoes, nonce, sent_at, foreign } => {
                let id = id.map(|id| id % 16);
                let nonce = match id {
                    Some(id) => echoes.then_some(id),
                    None => nonce.map(|n| n % 16),
                };
                let unusable = id.is_none() && nonce.is_none();
                let message = Message {
                    id: id.map(|id| MessageId(u64::from(id))),
                    room_id: if foreign { RoomId::new("random") } else { room.clone() },
                    author_id: "fuzz".to_string(),
                    author_display_name: "Fuzz".to_string(),
                    body: String::new(),
                    sent_at: Timestamp(u64::from(sent_at % 8)),
                    client_nonce: nonce.map(|n| ClientNonce(u128::from(n))),
                };

                let outcome = store.insert(message);
                if foreign || unusable {
                    assert_eq!(outcome, InsertOutcome::Rejected);
                }
                outcome.changed()
            },
            StoreOp::MarkFailed { nonce, timeout } => {
                let cause =
                    if timeout { FailureCause::SendTimeout } else { FailureCause::BackpressureDropped };
                store.mark_failed(ClientNonce(u128::from(nonce % 16)), cause)
            },
        };

        assert_eq!(store.version() != before, changed, "version must track changes");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), store.len());

        let messages: Vec<&Message> = snapshot.messages().collect();
        assert!(messages.windows(2).all(|w| w[0].sent_at <= w[1].sent_at), "unsorted");

        let mut ids: Vec<MessageId> = messages.iter().filter_map(|m| m.id).collect();
        let count = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), count, "duplicate id");

        let mut nonces: Vec<ClientNonce> = messages.iter().filter_map(|m| m.client_nonce).collect();
        let count = nonces.len();
        nonces.sort();
        nonces.dedup();
        assert_eq!(nonces.len(), count, "duplicate nonce");
    }
});
