//! Ordered, duplicate-free message sequence.
//!
//! Every mutation keeps the sequence sorted by `(inserted_at, id)` ascending
//! and rejects ids already present.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use murmur_types::Message;

/// Where an accepted message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// At the tail: the normal case for live inserts.
    Appended,
    /// Older than the tail; placed at `index` by the comparator.
    Reordered { index: usize },
}

#[derive(Debug, Clone, Default)]
pub struct OrderedMessages {
    messages: Vec<Message>,
    ids: HashSet<Uuid>,
}

impl OrderedMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn first(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// `inserted_at` of the oldest held message.
    pub fn oldest_cursor(&self) -> Option<DateTime<Utc>> {
        self.first().map(|m| m.inserted_at)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    /// Inserts one message at its sorted position. `None` if the id is held.
    pub fn insert(&mut self, message: Message) -> Option<Placement> {
        if !self.ids.insert(message.id) {
            return None;
        }

        let appends = self
            .messages
            .last()
            .is_none_or(|tail| tail.cmp_order(&message) == Ordering::Less);
        if appends {
            self.messages.push(message);
            return Some(Placement::Appended);
        }

        let index = self
            .messages
            .partition_point(|m| m.cmp_order(&message) == Ordering::Less);
        self.messages.insert(index, message);
        Some(Placement::Reordered { index })
    }

    /// Merges a chronological page in front of the sequence. Returns how many
    /// messages were new.
    ///
    /// Pages fetched with an exclusive cursor are disjoint from what is held,
    /// so the common path is a single splice. Anything overlapping falls back
    /// to per-message sorted insertion.
    pub fn prepend_page(&mut self, page: Vec<Message>) -> usize {
        let mut seen = HashSet::with_capacity(page.len());
        let fresh: Vec<Message> = page
            .into_iter()
            .filter(|m| !self.ids.contains(&m.id) && seen.insert(m.id))
            .collect();

        let disjoint = match (fresh.last(), self.messages.first()) {
            (Some(newest), Some(oldest)) => newest.cmp_order(oldest) == Ordering::Less,
            _ => true,
        };

        if disjoint && is_chronological(&fresh) {
            let added = fresh.len();
            self.ids.extend(fresh.iter().map(|m| m.id));
            self.messages.splice(0..0, fresh);
            return added;
        }

        self.merge(fresh)
    }

    /// Inserts every message of `page` at its sorted position.
    pub fn merge(&mut self, page: Vec<Message>) -> usize {
        page.into_iter()
            .filter_map(|m| self.insert(m))
            .count()
    }

    /// Replaces the whole sequence with `page` (deduplicated, sorted).
    pub fn reset(&mut self, page: Vec<Message>) {
        self.clear();
        self.merge(page);
    }

    #[cfg(test)]
    pub(crate) fn check_invariant(&self) -> bool {
        let sorted = self
            .messages
            .windows(2)
            .all(|w| w[0].cmp_order(&w[1]) == Ordering::Less);
        sorted && self.ids.len() == self.messages.len()
    }
}

/// Turns a newest-first store page into chronological order.
pub fn into_chronological(mut page: Vec<Message>) -> Vec<Message> {
    page.reverse();
    if !is_chronological(&page) {
        page.sort_by(Message::cmp_order);
    }
    page
}

fn is_chronological(messages: &[Message]) -> bool {
    messages.is_sorted_by(|a, b| a.cmp_order(b) != Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(id: u128, secs: i64) -> Message {
        Message {
            id: Uuid::from_u128(id),
            channel_id: Uuid::nil(),
            author_id: Uuid::nil(),
            author_display_name: "bob".into(),
            body: format!("m{}", id),
            inserted_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn ids(seq: &OrderedMessages) -> Vec<u128> {
        seq.as_slice().iter().map(|m| m.id.as_u128()).collect()
    }

    #[test]
    fn insert_appends_newer_and_reorders_older() {
        let mut seq = OrderedMessages::new();
        assert_eq!(seq.insert(msg(1, 10)), Some(Placement::Appended));
        assert_eq!(seq.insert(msg(3, 30)), Some(Placement::Appended));
        assert_eq!(
            seq.insert(msg(2, 20)),
            Some(Placement::Reordered { index: 1 })
        );
        assert_eq!(ids(&seq), vec![1, 2, 3]);
        assert!(seq.check_invariant());
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let mut seq = OrderedMessages::new();
        seq.insert(msg(1, 10));
        assert_eq!(seq.insert(msg(1, 10)), None);
        // Same id with a different timestamp is still the same message.
        assert_eq!(seq.insert(msg(1, 99)), None);
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let mut seq = OrderedMessages::new();
        seq.insert(msg(5, 10));
        assert_eq!(
            seq.insert(msg(4, 10)),
            Some(Placement::Reordered { index: 0 })
        );
        assert_eq!(seq.insert(msg(6, 10)), Some(Placement::Appended));
        assert_eq!(ids(&seq), vec![4, 5, 6]);
    }

    #[test]
    fn prepend_disjoint_page_splices_in_front() {
        let mut seq = OrderedMessages::new();
        seq.merge(vec![msg(10, 100), msg(11, 110)]);

        let added = seq.prepend_page(vec![msg(1, 10), msg(2, 20)]);
        assert_eq!(added, 2);
        assert_eq!(ids(&seq), vec![1, 2, 10, 11]);
        assert_eq!(seq.oldest_cursor(), Some(Utc.timestamp_opt(10, 0).unwrap()));
        assert!(seq.check_invariant());
    }

    #[test]
    fn prepend_overlapping_page_deduplicates() {
        let mut seq = OrderedMessages::new();
        seq.merge(vec![msg(2, 20), msg(3, 30)]);

        let added = seq.prepend_page(vec![msg(1, 10), msg(2, 20), msg(2, 20), msg(25, 25)]);
        assert_eq!(added, 2);
        assert_eq!(ids(&seq), vec![1, 2, 25, 3]);
        assert!(seq.check_invariant());
    }

    #[test]
    fn chronological_reverses_store_order() {
        let page = vec![msg(3, 30), msg(2, 20), msg(1, 10)];
        let ordered = into_chronological(page);
        let got: Vec<u128> = ordered.iter().map(|m| m.id.as_u128()).collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn chronological_sorts_misordered_pages() {
        let page = vec![msg(2, 20), msg(3, 30), msg(1, 10)];
        let ordered = into_chronological(page);
        let got: Vec<u128> = ordered.iter().map(|m| m.id.as_u128()).collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn reset_replaces_everything() {
        let mut seq = OrderedMessages::new();
        seq.merge(vec![msg(1, 10), msg(2, 20)]);
        seq.reset(vec![msg(9, 90), msg(8, 80)]);
        assert_eq!(ids(&seq), vec![8, 9]);
        assert!(!seq.contains(&Uuid::from_u128(1)));
    }
}
