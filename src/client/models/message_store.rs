use crate::common::models::{DeliveryState, Message, MessageKind};
use log::debug;

/// Two messages with the same sender and content closer together than this
/// are the same logical message.
pub const DEDUP_WINDOW_MS: i64 = 1000;

/// Order in which `messages()` hands entries to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presentation {
    /// Inverted chat list: newest at index 0.
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message: Message,
    pub delivery: DeliveryState,
}

/// What a single merge did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// A pending optimistic entry adopted the server's id and timestamp.
    Reconciled,
    Duplicate,
    /// JOIN frames are never stored.
    Ignored,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Reconciled)
    }
}

pub fn is_duplicate(a: &Message, b: &Message) -> bool {
    if a.id == b.id {
        return true;
    }
    a.kind == b.kind
        && a.sender == b.sender
        && a.content == b.content
        && (a.timestamp - b.timestamp).num_milliseconds().abs() < DEDUP_WINDOW_MS
}

/// Deduplicated, time-ordered messages of one room.
///
/// Entries are kept in ascending timestamp order; every mutation re-applies a
/// stable sort so that messages with equal timestamps keep arrival order.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Vec<StoredMessage>,
    presentation: Presentation,
    revision: u64,
}

impl MessageStore {
    pub fn new(presentation: Presentation) -> Self {
        Self {
            entries: Vec::new(),
            presentation,
            revision: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advances only when the visible contents changed.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn presentation(&self) -> Presentation {
        self.presentation
    }

    /// Entries in presentation order.
    pub fn messages(&self) -> Vec<&StoredMessage> {
        match self.presentation {
            Presentation::OldestFirst => self.entries.iter().collect(),
            Presentation::NewestFirst => self.entries.iter().rev().collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&StoredMessage> {
        self.entries.iter().find(|e| e.message.id == id)
    }

    pub fn newest(&self) -> Option<&StoredMessage> {
        self.entries.last()
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.delivery == DeliveryState::Pending)
            .count()
    }

    /// Merges one message received on the live socket.
    pub fn merge_realtime(&mut self, message: Message) -> MergeOutcome {
        let outcome = self.absorb(message);
        if outcome.changed() {
            self.resort();
        }
        outcome
    }

    /// Merges a history page. The first page (`append == false`) replaces the
    /// contents except unconfirmed sends; later pages only add entries not
    /// already present. Returns the number of net-new messages.
    pub fn merge_history_page(&mut self, messages: Vec<Message>, append: bool) -> usize {
        if !append {
            return self.replace(messages);
        }

        let mut added = 0;
        let mut changed = false;
        for message in messages {
            let outcome = self.absorb(message);
            if outcome == MergeOutcome::Inserted {
                added += 1;
            }
            changed |= outcome.changed();
        }

        if changed {
            self.resort();
        } else {
            debug!("[STORE] History page brought nothing new");
        }
        added
    }

    /// Stores a message we just sent, before the server has confirmed it.
    /// Only an exact id clash is rejected: the user may legitimately send the
    /// same text twice in a row.
    pub fn insert_optimistic(&mut self, message: Message) -> bool {
        if message.kind == MessageKind::Join || self.get(&message.id).is_some() {
            return false;
        }
        self.entries.push(StoredMessage {
            message,
            delivery: DeliveryState::Pending,
        });
        self.resort();
        true
    }

    /// Appends a locally synthesized notice.
    pub fn push_local(&mut self, message: Message) {
        self.entries.push(StoredMessage {
            message,
            delivery: DeliveryState::Confirmed,
        });
        self.resort();
    }

    fn replace(&mut self, messages: Vec<Message>) -> usize {
        let mut fresh: Vec<StoredMessage> = Vec::with_capacity(messages.len());
        for message in messages {
            if message.kind == MessageKind::Join
                || fresh.iter().any(|e| is_duplicate(&e.message, &message))
            {
                continue;
            }
            fresh.push(StoredMessage {
                message,
                delivery: DeliveryState::Confirmed,
            });
        }
        // Unconfirmed sends survive unless the page already holds their copy.
        let pending: Vec<StoredMessage> = self
            .entries
            .iter()
            .filter(|e| e.delivery == DeliveryState::Pending)
            .filter(|e| !fresh.iter().any(|f| is_duplicate(&f.message, &e.message)))
            .cloned()
            .collect();
        fresh.extend(pending);
        fresh.sort_by_key(|e| e.message.timestamp);

        if fresh == self.entries {
            return 0;
        }

        let added = fresh
            .iter()
            .filter(|e| !self.entries.iter().any(|old| is_duplicate(&old.message, &e.message)))
            .count();
        self.entries = fresh;
        self.revision += 1;
        added
    }

    /// Inserts or reconciles without sorting.
    fn absorb(&mut self, message: Message) -> MergeOutcome {
        if message.kind == MessageKind::Join {
            return MergeOutcome::Ignored;
        }

        match self.find_match(&message) {
            Some(idx) if self.entries[idx].delivery == DeliveryState::Pending => {
                let entry = &mut self.entries[idx];
                debug!(
                    "[STORE] Reconciled optimistic message {} with server copy {}",
                    entry.message.id, message.id
                );
                entry.message.id = message.id;
                entry.message.timestamp = message.timestamp;
                entry.delivery = DeliveryState::Confirmed;
                MergeOutcome::Reconciled
            }
            Some(_) => MergeOutcome::Duplicate,
            None => {
                self.entries.push(StoredMessage {
                    message,
                    delivery: DeliveryState::Confirmed,
                });
                MergeOutcome::Inserted
            }
        }
    }

    /// Exact id first, then a pending echo, then any fuzzy duplicate.
    fn find_match(&self, message: &Message) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.id == message.id)
            .or_else(|| {
                self.entries.iter().position(|e| {
                    e.delivery == DeliveryState::Pending && is_duplicate(&e.message, message)
                })
            })
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|e| is_duplicate(&e.message, message))
            })
    }

    fn resort(&mut self) {
        self.entries.sort_by_key(|e| e.message.timestamp);
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn msg(id: &str, sender: &str, content: &str, offset_ms: i64) -> Message {
        Message {
            id: id.to_string(),
            room_id: "42".to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: base() + Duration::milliseconds(offset_ms),
            kind: MessageKind::Chat,
        }
    }

    fn assert_sorted(store: &MessageStore) {
        let stamps: Vec<_> = store.messages().iter().map(|e| e.message.timestamp).collect();
        let descending = stamps.windows(2).all(|w| w[0] >= w[1]);
        assert!(descending, "store not in newest-first order: {:?}", stamps);
    }

    #[test]
    fn same_id_is_merged_once() {
        let mut store = MessageStore::default();
        assert_eq!(store.merge_realtime(msg("1", "bob", "hi", 0)), MergeOutcome::Inserted);
        assert_eq!(store.merge_realtime(msg("1", "bob", "hi", 0)), MergeOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn near_identical_messages_collapse() {
        let mut store = MessageStore::default();
        store.merge_realtime(msg("a", "bob", "hi", 0));
        assert_eq!(store.merge_realtime(msg("b", "bob", "hi", 999)), MergeOutcome::Duplicate);
        assert_eq!(store.len(), 1);

        // outside the window, or from someone else, it is a new message
        store.merge_realtime(msg("c", "bob", "hi", 1000));
        store.merge_realtime(msg("d", "carol", "hi", 0));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn system_notices_never_collapse_into_chat() {
        let mut store = MessageStore::default();
        store.merge_realtime(msg("a", "bob", "bye", 0));
        let mut notice = msg("b", "bob", "bye", 10);
        notice.kind = MessageKind::System;
        assert_eq!(store.merge_realtime(notice), MergeOutcome::Inserted);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn join_frames_are_not_stored() {
        let mut store = MessageStore::default();
        let mut join = msg("j", "bob", "bob joined the chat", 0);
        join.kind = MessageKind::Join;
        assert_eq!(store.merge_realtime(join.clone()), MergeOutcome::Ignored);
        assert_eq!(store.merge_history_page(vec![join], true), 0);
        assert!(store.is_empty());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn every_merge_keeps_time_order() {
        let mut store = MessageStore::default();
        store.merge_realtime(msg("5", "a", "five", 5000));
        store.merge_realtime(msg("1", "a", "one", 1000));
        store.merge_history_page(vec![msg("3", "a", "three", 3000), msg("9", "a", "nine", 9000)], true);
        store.insert_optimistic(msg("local", "me", "mine", 4000));
        store.merge_realtime(msg("2", "a", "two", 2000));
        assert_sorted(&store);

        let ids: Vec<&str> = store.messages().iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, vec!["9", "5", "local", "3", "2", "1"]);
    }

    #[test]
    fn oldest_first_presentation() {
        let mut store = MessageStore::new(Presentation::OldestFirst);
        store.merge_realtime(msg("2", "a", "two", 2000));
        store.merge_realtime(msg("1", "a", "one", 1000));
        let ids: Vec<&str> = store.messages().iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn first_page_replaces_contents() {
        let mut store = MessageStore::default();
        store.merge_realtime(msg("old", "a", "stale", 0));
        let added = store.merge_history_page(
            vec![msg("2", "a", "two", 2000), msg("1", "a", "one", 1000), msg("1", "a", "one", 1000)],
            false,
        );
        assert_eq!(added, 2);
        assert_eq!(store.len(), 2);
        assert!(store.get("old").is_none());
        assert_sorted(&store);
    }

    #[test]
    fn first_page_keeps_unconfirmed_sends() {
        let mut store = MessageStore::default();
        store.merge_realtime(msg("live", "bob", "early bird", 500));
        store.insert_optimistic(msg("local1", "alice", "still sending", 3000));
        store.insert_optimistic(msg("local2", "alice", "already stored", 4000));

        let added = store.merge_history_page(
            vec![msg("1", "a", "one", 1000), msg("77", "alice", "already stored", 4100)],
            false,
        );
        assert_eq!(added, 1);
        assert_eq!(store.len(), 3);
        assert!(store.get("live").is_none());
        assert_eq!(store.get("local1").unwrap().delivery, DeliveryState::Pending);
        assert!(store.get("local2").is_none());
        assert_eq!(store.get("77").unwrap().delivery, DeliveryState::Confirmed);
        assert_eq!(store.pending_count(), 1);
        assert_sorted(&store);
    }

    #[test]
    fn overlapping_page_does_not_grow_store() {
        let mut store = MessageStore::default();
        let page: Vec<Message> = (0..10).map(|i| msg(&i.to_string(), "a", &format!("m{}", i), i * 1000)).collect();
        store.merge_history_page(page.clone(), false);
        let revision = store.revision();

        assert_eq!(store.merge_history_page(page, true), 0);
        assert_eq!(store.len(), 10);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn optimistic_echo_reconciles_with_server_copy() {
        let mut store = MessageStore::default();
        store.merge_realtime(msg("x", "bob", "yo", 0));
        let before = store.len();

        assert!(store.insert_optimistic(msg("local1", "alice", "hi", 1000)));
        assert_eq!(store.pending_count(), 1);

        let outcome = store.merge_realtime(msg("server99", "alice", "hi", 1200));
        assert_eq!(outcome, MergeOutcome::Reconciled);
        assert_eq!(store.len(), before + 1);
        assert_eq!(store.pending_count(), 0);

        let entry = store.get("server99").expect("adopted server id");
        assert_eq!(entry.delivery, DeliveryState::Confirmed);
        assert_eq!(entry.message.timestamp, base() + Duration::milliseconds(1200));
    }

    #[test]
    fn repeated_sends_reconcile_one_by_one() {
        let mut store = MessageStore::default();
        store.insert_optimistic(msg("l1", "alice", "ok", 0));
        store.insert_optimistic(msg("l2", "alice", "ok", 300));
        assert_eq!(store.len(), 2);

        store.merge_realtime(msg("s1", "alice", "ok", 50));
        store.merge_realtime(msg("s2", "alice", "ok", 350));
        assert_eq!(store.len(), 2);
        assert_eq!(store.pending_count(), 0);
        assert!(store.get("s1").is_some() && store.get("s2").is_some());
    }

    #[test]
    fn history_copy_confirms_pending_echo() {
        let mut store = MessageStore::default();
        store.insert_optimistic(msg("local1", "alice", "hi", 1000));
        let added = store.merge_history_page(vec![msg("55", "alice", "hi", 1100)], true);
        assert_eq!(added, 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.pending_count(), 0);
    }
}
