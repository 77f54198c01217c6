//! Ordered, deduplicated message log for one room.
//!
//! [`MessageStore`] is a pure data structure: no I/O, no clock, no locking.
//! The coordinator owns it exclusively and serializes every mutation.
//!
//! # Ordering
//!
//! Entries are sorted by `(sent_at, tiebreak)` ascending, where the tiebreak
//! puts confirmed entries (by [`MessageId`]) before local entries (by
//! [`ClientNonce`]) that share a timestamp.
//!
//! # Invariants
//!
//! - Uniqueness: no two entries share a [`MessageId`], and no two local
//!   entries share a [`ClientNonce`].
//! - Commutativity: applying the same set of candidates in any order yields
//!   the same final sequence. Duplicates collapse, and ordering depends only
//!   on message content, never on arrival order.
//! - Idempotence: re-inserting a message whose id is present never changes
//!   the snapshot. The one exception is an echo carrying the nonce that a
//!   stored history copy lacks: the echo's copy replaces it.

use std::{
    cell::OnceCell,
    collections::HashMap,
    sync::Arc,
};

use roomfeed_proto::{ClientNonce, Message, MessageId, RoomId, Timestamp};

/// Why an optimistic message was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCause {
    /// No confirmation arrived before the send deadline.
    SendTimeout,
    /// Dropped from the outbound queue before it was ever transmitted.
    BackpressureDropped,
}

/// Delivery state of a feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    /// Sent locally, awaiting the server copy.
    Pending,
    /// Server copy received.
    Confirmed,
    /// Given up on. The user may resend.
    Failed(FailureCause),
}

/// One row of the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    /// The message as last seen.
    pub message: Message,
    /// Delivery state.
    pub status: DeliveryStatus,
}

/// Result of [`MessageStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry added.
    Inserted,
    /// A local entry was replaced by (or collapsed into) its server copy.
    Reconciled,
    /// Already known. Nothing changed.
    Duplicate,
    /// Not storable here: wrong room, or neither `id` nor `client_nonce`.
    Rejected,
}

impl InsertOutcome {
    /// True if the store was mutated.
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Reconciled)
    }
}

/// Immutable view of the feed at one point in time.
///
/// Cloning is O(1); the entries are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSnapshot {
    version: u64,
    entries: Arc<[FeedEntry]>,
}

impl FeedSnapshot {
    /// Store version this snapshot was taken at. Strictly increases with
    /// every mutation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Entries in feed order.
    #[must_use]
    pub fn entries(&self) -> &[FeedEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the feed is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over messages in feed order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Tiebreak {
    Confirmed(MessageId),
    Local(ClientNonce),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct SortKey {
    sent_at: Timestamp,
    tiebreak: Tiebreak,
}

#[derive(Debug, Clone)]
struct Slot {
    key: SortKey,
    entry: FeedEntry,
}

/// Ordered, deduplicated message log for one room.
#[derive(Debug)]
pub struct MessageStore {
    room_id: RoomId,
    slots: Vec<Slot>,
    /// Server timestamp of every confirmed entry, by id.
    ids: HashMap<MessageId, Timestamp>,
    /// Sort key of the entry currently carrying each nonce.
    nonces: HashMap<ClientNonce, SortKey>,
    version: u64,
    snapshot: OnceCell<FeedSnapshot>,
}

impl MessageStore {
    /// Create an empty store for `room_id`.
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            slots: Vec::new(),
            ids: HashMap::new(),
            nonces: HashMap::new(),
            version: 0,
            snapshot: OnceCell::new(),
        }
    }

    /// Room this store holds.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Mutation counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Confirmed entry with `id`, if present.
    pub fn get(&self, id: MessageId) -> Option<&FeedEntry> {
        let sent_at = *self.ids.get(&id)?;
        let key = SortKey { sent_at, tiebreak: Tiebreak::Confirmed(id) };
        self.position(key).map(|idx| &self.slots[idx].entry)
    }

    /// Delivery status of the entry carrying `nonce`, if any.
    pub fn status_of(&self, nonce: ClientNonce) -> Option<DeliveryStatus> {
        let key = self.nonces.get(&nonce)?;
        self.position(*key).map(|idx| self.slots[idx].entry.status)
    }

    /// Newest server timestamp among confirmed entries.
    pub fn latest_sent_at(&self) -> Option<Timestamp> {
        self.slots
            .iter()
            .rev()
            .find(|s| matches!(s.key.tiebreak, Tiebreak::Confirmed(_)))
            .map(|s| s.key.sent_at)
    }

    /// Insert a candidate message.
    ///
    /// - Confirmed candidate (has `id`): ignored if the id is known, unless
    ///   it brings the nonce the stored copy lacks. If its nonce matches a
    ///   local entry, that entry is promoted in place and adopts the server
    ///   `id` and `sent_at`, moving only if its sort position changed.
    ///   Otherwise inserted in sorted position.
    /// - Local candidate (no `id`): inserted as `Pending` unless its nonce is
    ///   already known.
    pub fn insert(&mut self, candidate: Message) -> InsertOutcome {
        if candidate.room_id != self.room_id {
            tracing::warn!(
                expected = %self.room_id,
                actual = %candidate.room_id,
                "Rejecting message for another room"
            );
            return InsertOutcome::Rejected;
        }

        match candidate.id {
            Some(id) => self.insert_confirmed(id, candidate),
            None => self.insert_local(candidate),
        }
    }

    /// Transition a pending entry to `Failed`.
    ///
    /// Returns false (no-op) if the nonce is unknown, already failed, or
    /// already confirmed.
    pub fn mark_failed(&mut self, nonce: ClientNonce, cause: FailureCause) -> bool {
        let Some(key) = self.nonces.get(&nonce).copied() else {
            return false;
        };
        let Some(idx) = self.position(key) else {
            return false;
        };

        let entry = &mut self.slots[idx].entry;
        if entry.status != DeliveryStatus::Pending {
            return false;
        }

        entry.status = DeliveryStatus::Failed(cause);
        self.bump();
        true
    }

    /// Current ordered sequence.
    ///
    /// Built once per version; repeated calls without an intervening mutation
    /// return the same shared snapshot.
    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot
            .get_or_init(|| FeedSnapshot {
                version: self.version,
                entries: self.slots.iter().map(|s| s.entry.clone()).collect(),
            })
            .clone()
    }

    fn insert_confirmed(&mut self, id: MessageId, message: Message) -> InsertOutcome {
        let nonce = message.client_nonce;

        if let Some(&sent_at) = self.ids.get(&id) {
            let Some(nonce) = nonce else {
                return InsertOutcome::Duplicate;
            };

            // The server copy is already here, so a local entry with this
            // nonce is a ghost. Remember the nonce either way so a later
            // local insert collapses too.
            let removed = self.remove_local(nonce);
            let key = SortKey { sent_at, tiebreak: Tiebreak::Confirmed(id) };
            self.nonces.entry(nonce).or_insert(key);

            // The echo carries the nonce a nonce-less history copy lacks;
            // keep the echo whichever arrived first.
            let adopted = match self.position(key) {
                Some(idx)
                    if self.slots[idx].entry.message.client_nonce.is_none()
                        && self.nonces.get(&nonce) == Some(&key) =>
                {
                    self.slots[idx].entry.message = Message { sent_at, ..message };
                    true
                },
                _ => false,
            };

            if removed || adopted {
                self.bump();
                return InsertOutcome::Reconciled;
            }
            return InsertOutcome::Duplicate;
        }

        let key = SortKey { sent_at: message.sent_at, tiebreak: Tiebreak::Confirmed(id) };
        let entry = FeedEntry { message, status: DeliveryStatus::Confirmed };

        let local_idx = nonce
            .and_then(|n| self.nonces.get(&n).copied())
            .filter(|k| matches!(k.tiebreak, Tiebreak::Local(_)))
            .and_then(|k| self.position(k));

        let outcome = match local_idx {
            Some(idx) => {
                self.replace_at(idx, Slot { key, entry });
                InsertOutcome::Reconciled
            },
            None => {
                self.insert_sorted(Slot { key, entry });
                InsertOutcome::Inserted
            },
        };

        self.ids.insert(id, key.sent_at);
        if let Some(nonce) = nonce {
            self.nonces.insert(nonce, key);
        }
        self.bump();
        outcome
    }

    fn insert_local(&mut self, message: Message) -> InsertOutcome {
        let Some(nonce) = message.client_nonce else {
            tracing::warn!("Rejecting message with neither id nor client nonce");
            return InsertOutcome::Rejected;
        };
        if self.nonces.contains_key(&nonce) {
            return InsertOutcome::Duplicate;
        }

        let key = SortKey { sent_at: message.sent_at, tiebreak: Tiebreak::Local(nonce) };
        let entry = FeedEntry { message, status: DeliveryStatus::Pending };
        self.insert_sorted(Slot { key, entry });
        self.nonces.insert(nonce, key);
        self.bump();
        InsertOutcome::Inserted
    }

    /// Remove the local entry carrying `nonce`. Returns true if one existed.
    fn remove_local(&mut self, nonce: ClientNonce) -> bool {
        let Some(key) = self.nonces.get(&nonce).copied() else {
            return false;
        };
        if !matches!(key.tiebreak, Tiebreak::Local(_)) {
            return false;
        }
        let Some(idx) = self.position(key) else {
            return false;
        };

        self.slots.remove(idx);
        self.nonces.remove(&nonce);
        true
    }

    /// Replace the slot at `idx`, keeping the index if order allows.
    fn replace_at(&mut self, idx: usize, slot: Slot) {
        let fits_left = idx == 0 || self.slots[idx - 1].key < slot.key;
        let fits_right = idx + 1 >= self.slots.len() || slot.key < self.slots[idx + 1].key;

        if fits_left && fits_right {
            self.slots[idx] = slot;
        } else {
            self.slots.remove(idx);
            self.insert_sorted(slot);
        }
    }

    fn insert_sorted(&mut self, slot: Slot) {
        let idx = self.slots.partition_point(|s| s.key < slot.key);
        self.slots.insert(idx, slot);
    }

    fn position(&self, key: SortKey) -> Option<usize> {
        self.slots.binary_search_by(|s| s.key.cmp(&key)).ok()
    }

    fn bump(&mut self) {
        self.version += 1;
        self.snapshot.take();
    }
}
