//! # Play Queue
//!
//! Ordered list of queue entries with a current pointer, repeat mode and a
//! shuffled view.
//!
//! Entries are addressed by their slot id (`playlistItem<n>`), never by
//! position: positions shift on every insert, move and removal. Slot ids
//! come from a counter owned by the queue and are never handed out twice.
//!
//! Shuffling keeps a copy of the sorted order. Additions and removals made
//! while shuffled are applied to both orders so that un-shuffling restores
//! the sorted order including them. Moves only reorder the shuffled view
//! and are lost when un-shuffling.

use bridge_traits::{QueueEntry, RepeatMode, ShuffleMode};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;

const SLOT_ID_PREFIX: &str = "playlistItem";

#[derive(Debug)]
pub struct PlayQueue {
    entries: Vec<QueueEntry>,
    /// Sorted order, kept only while shuffled.
    sorted: Option<Vec<QueueEntry>>,
    current_slot_id: Option<String>,
    repeat_mode: RepeatMode,
    next_slot: u64,
    rng: ChaCha8Rng,
}

impl Default for PlayQueue {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PlayQueue {
    /// `seed` fixes the shuffle order; `None` seeds from the thread rng.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };

        Self {
            entries: Vec::new(),
            sorted: None,
            current_slot_id: None,
            repeat_mode: RepeatMode::RepeatNone,
            next_slot: 0,
            rng,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Entries in play order (shuffled order when shuffled).
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat_mode
    }

    pub fn shuffle_mode(&self) -> ShuffleMode {
        if self.sorted.is_some() {
            ShuffleMode::Shuffle
        } else {
            ShuffleMode::Sorted
        }
    }

    pub fn current_slot_id(&self) -> Option<&str> {
        self.current_slot_id.as_deref()
    }

    pub fn current_index(&self) -> Option<usize> {
        let slot_id = self.current_slot_id.as_deref()?;
        self.index_of(slot_id)
    }

    pub fn entry(&self, slot_id: &str) -> Option<&QueueEntry> {
        self.index_of(slot_id).map(|index| &self.entries[index])
    }

    pub fn index_of(&self, slot_id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.slot_id == slot_id)
    }

    /// Entry that plays after the current one, honouring the repeat mode.
    ///
    /// With nothing current, the first entry.
    pub fn get_next_item(&self) -> Option<(usize, &QueueEntry)> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }

        let index = match self.current_index() {
            None => 0,
            Some(current) => match self.repeat_mode {
                RepeatMode::RepeatOne => current,
                RepeatMode::RepeatAll => (current + 1) % len,
                RepeatMode::RepeatNone => current + 1,
            },
        };

        self.entries.get(index).map(|entry| (index, entry))
    }

    /// Entry that played before the current one, honouring the repeat mode.
    ///
    /// With nothing current, the last entry.
    pub fn get_previous_item(&self) -> Option<(usize, &QueueEntry)> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }

        let index = match self.current_index() {
            None => Some(len - 1),
            Some(current) => match self.repeat_mode {
                RepeatMode::RepeatOne => Some(current),
                RepeatMode::RepeatAll => Some(current.checked_sub(1).unwrap_or(len - 1)),
                RepeatMode::RepeatNone => current.checked_sub(1),
            },
        }?;

        self.entries.get(index).map(|entry| (index, entry))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Replace the queue. Clears the current pointer, the repeat mode and
    /// any shuffle. Returns the slot ids in order.
    pub fn set_playlist(&mut self, entries: Vec<QueueEntry>) -> Vec<String> {
        self.entries.clear();
        self.sorted = None;
        self.current_slot_id = None;
        self.repeat_mode = RepeatMode::RepeatNone;

        let entries = self.assign_slot_ids(entries);
        let slot_ids = entries.iter().map(|e| e.slot_id.clone()).collect();
        self.entries = entries;
        slot_ids
    }

    /// Append to the end. Returns the new slot ids.
    pub fn queue(&mut self, entries: Vec<QueueEntry>) -> Vec<String> {
        let entries = self.assign_slot_ids(entries);
        let slot_ids = entries.iter().map(|e| e.slot_id.clone()).collect();

        if let Some(sorted) = self.sorted.as_mut() {
            sorted.extend(entries.iter().cloned());
        }
        self.entries.extend(entries);
        slot_ids
    }

    /// Insert right after the current entry, or append when nothing is
    /// current. Returns the new slot ids.
    pub fn queue_next(&mut self, entries: Vec<QueueEntry>) -> Vec<String> {
        let Some(current_slot_id) = self.current_slot_id.clone() else {
            return self.queue(entries);
        };
        let Some(current) = self.index_of(&current_slot_id) else {
            return self.queue(entries);
        };

        let entries = self.assign_slot_ids(entries);
        let slot_ids = entries.iter().map(|e| e.slot_id.clone()).collect();

        if let Some(sorted) = self.sorted.as_mut() {
            let at = sorted
                .iter()
                .position(|e| e.slot_id == current_slot_id)
                .map(|i| i + 1)
                .unwrap_or(sorted.len());
            sorted.splice(at..at, entries.iter().cloned());
        }
        self.entries.splice(current + 1..current + 1, entries);
        slot_ids
    }

    /// Remove entries by slot id. Returns the ids actually removed and
    /// whether the current entry was among them; in that case the current
    /// pointer is cleared.
    pub fn remove_from_playlist(&mut self, slot_ids: &[String]) -> (Vec<String>, bool) {
        let targets: HashSet<&str> = slot_ids.iter().map(String::as_str).collect();

        let removed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| targets.contains(e.slot_id.as_str()))
            .map(|e| e.slot_id.clone())
            .collect();

        self.entries.retain(|e| !targets.contains(e.slot_id.as_str()));
        if let Some(sorted) = self.sorted.as_mut() {
            sorted.retain(|e| !targets.contains(e.slot_id.as_str()));
        }

        let removed_current = self
            .current_slot_id
            .as_deref()
            .map(|current| targets.contains(current))
            .unwrap_or(false);
        if removed_current {
            self.current_slot_id = None;
        }

        (removed, removed_current)
    }

    /// Move an entry to `new_index` (clamped to the end). Returns `None`
    /// when the slot id is unknown.
    pub fn move_playlist_item(&mut self, slot_id: &str, new_index: usize) -> Option<usize> {
        let old_index = self.index_of(slot_id)?;
        let entry = self.entries.remove(old_index);
        let new_index = new_index.min(self.entries.len());
        self.entries.insert(new_index, entry);
        Some(new_index)
    }

    /// Point the queue at `slot_id`. Returns `false` when it is unknown.
    pub fn set_playlist_item(&mut self, slot_id: &str) -> bool {
        if self.index_of(slot_id).is_some() {
            self.current_slot_id = Some(slot_id.to_string());
            true
        } else {
            false
        }
    }

    /// Point the queue at the entry at `index`.
    pub fn set_playlist_index(&mut self, index: usize) -> Option<&QueueEntry> {
        let entry = self.entries.get(index)?;
        self.current_slot_id = Some(entry.slot_id.clone());
        Some(entry)
    }

    pub fn clear_current(&mut self) {
        self.current_slot_id = None;
    }

    /// Empty the queue. With `keep_current`, the current entry survives
    /// as the only entry.
    pub fn clear(&mut self, keep_current: bool) -> Vec<String> {
        let keep = if keep_current {
            self.current_slot_id.clone()
        } else {
            None
        };

        let removed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| Some(&e.slot_id) != keep.as_ref())
            .map(|e| e.slot_id.clone())
            .collect();

        self.entries.retain(|e| Some(&e.slot_id) == keep.as_ref());
        self.sorted = None;
        if keep.is_none() {
            self.current_slot_id = None;
        }
        removed
    }

    pub fn set_repeat_mode(&mut self, mode: RepeatMode) {
        self.repeat_mode = mode;
    }

    pub fn set_shuffle_mode(&mut self, mode: ShuffleMode) {
        match mode {
            ShuffleMode::Shuffle => self.shuffle(),
            ShuffleMode::Sorted => self.unshuffle(),
        }
    }

    /// Reshuffle. The current entry (or the first one) leads the new order.
    fn shuffle(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        if self.sorted.is_none() {
            self.sorted = Some(self.entries.clone());
        }

        let lead_index = self.current_index().unwrap_or(0);
        let lead = self.entries.remove(lead_index);
        self.entries.shuffle(&mut self.rng);
        self.entries.insert(0, lead);
    }

    fn unshuffle(&mut self) {
        if let Some(sorted) = self.sorted.take() {
            self.entries = sorted;
        }
    }

    fn assign_slot_ids(&mut self, entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
        let mut taken: HashSet<String> = self.entries.iter().map(|e| e.slot_id.clone()).collect();

        entries
            .into_iter()
            .map(|mut entry| {
                if !entry.has_slot_id() || taken.contains(&entry.slot_id) {
                    entry.slot_id = self.generate_slot_id();
                }
                taken.insert(entry.slot_id.clone());
                entry
            })
            .collect()
    }

    fn generate_slot_id(&mut self) -> String {
        let slot_id = format!("{}{}", SLOT_ID_PREFIX, self.next_slot);
        self.next_slot += 1;
        slot_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::{ItemKind, MediaType, PlayableItem};

    fn entries(ids: &[&str]) -> Vec<QueueEntry> {
        ids.iter()
            .map(|id| QueueEntry::new(PlayableItem::new(*id, ItemKind::Audio, MediaType::Audio)))
            .collect()
    }

    fn item_ids(queue: &PlayQueue) -> Vec<String> {
        queue
            .entries()
            .iter()
            .map(|e| e.item.id.clone().unwrap_or_default())
            .collect()
    }

    fn assert_unique(queue: &PlayQueue) {
        let ids: HashSet<&str> = queue.entries().iter().map(|e| e.slot_id.as_str()).collect();
        assert_eq!(ids.len(), queue.len());
    }

    #[test]
    fn test_set_playlist_resets_state() {
        let mut queue = PlayQueue::new(Some(1));
        queue.set_playlist(entries(&["a", "b"]));
        queue.set_playlist_index(1);
        queue.set_repeat_mode(RepeatMode::RepeatAll);

        let slots = queue.set_playlist(entries(&["c", "d", "e"]));

        assert_eq!(slots, vec!["playlistItem2", "playlistItem3", "playlistItem4"]);
        assert!(queue.current_index().is_none());
        assert_eq!(queue.repeat_mode(), RepeatMode::RepeatNone);
    }

    #[test]
    fn test_queue_next_inserts_after_current() {
        let mut queue = PlayQueue::new(Some(1));
        queue.set_playlist(entries(&["a", "b", "c"]));
        queue.set_playlist_index(0);

        queue.queue_next(entries(&["x", "y"]));

        assert_eq!(item_ids(&queue), vec!["a", "x", "y", "b", "c"]);
    }

    #[test]
    fn test_queue_next_without_current_appends() {
        let mut queue = PlayQueue::new(Some(1));
        queue.set_playlist(entries(&["a"]));

        queue.queue_next(entries(&["x"]));

        assert_eq!(item_ids(&queue), vec!["a", "x"]);
    }

    #[test]
    fn test_duplicate_items_get_distinct_slots() {
        let mut queue = PlayQueue::new(Some(1));
        queue.set_playlist(entries(&["a", "a"]));
        let copy = queue.entries()[0].clone();
        queue.queue(vec![copy]);

        assert_eq!(queue.len(), 3);
        assert_unique(&queue);
    }

    #[test]
    fn test_slot_ids_unique_after_mutations() {
        let mut queue = PlayQueue::new(Some(3));
        queue.set_playlist(entries(&["a", "b", "c"]));
        queue.set_playlist_index(1);
        queue.queue(entries(&["d"]));
        queue.queue_next(entries(&["e", "f"]));
        let first = queue.entries()[0].slot_id.clone();
        queue.remove_from_playlist(&[first]);
        let last = queue.entries()[queue.len() - 1].slot_id.clone();
        queue.move_playlist_item(&last, 0);
        queue.queue(entries(&["g"]));
        queue.clear(true);
        queue.queue(entries(&["h", "i"]));

        assert_unique(&queue);
        // Counter never rewinds.
        assert_eq!(queue.entries().last().unwrap().slot_id, "playlistItem8");
    }

    #[test]
    fn test_remove_current_clears_pointer() {
        let mut queue = PlayQueue::new(Some(1));
        let slots = queue.set_playlist(entries(&["a", "b", "c"]));
        queue.set_playlist_item(&slots[1]);

        let (removed, removed_current) =
            queue.remove_from_playlist(&[slots[1].clone(), "missing".to_string()]);

        assert_eq!(removed, vec![slots[1].clone()]);
        assert!(removed_current);
        assert!(queue.current_slot_id().is_none());
        assert_eq!(item_ids(&queue), vec!["a", "c"]);
    }

    #[test]
    fn test_move_preserves_other_order() {
        let mut queue = PlayQueue::new(Some(1));
        let slots = queue.set_playlist(entries(&["a", "b", "c", "d"]));

        assert_eq!(queue.move_playlist_item(&slots[3], 1), Some(1));
        assert_eq!(item_ids(&queue), vec!["a", "d", "b", "c"]);

        assert_eq!(queue.move_playlist_item("playlistItem99", 0), None);
        assert_eq!(item_ids(&queue), vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn test_next_item_repeat_semantics() {
        let mut queue = PlayQueue::new(Some(1));
        queue.set_playlist(entries(&["a", "b", "c"]));
        queue.set_playlist_index(2);

        queue.set_repeat_mode(RepeatMode::RepeatAll);
        assert_eq!(queue.get_next_item().map(|(i, _)| i), Some(0));

        queue.set_repeat_mode(RepeatMode::RepeatNone);
        assert!(queue.get_next_item().is_none());

        queue.set_repeat_mode(RepeatMode::RepeatOne);
        let (index, entry) = queue.get_next_item().unwrap();
        assert_eq!(index, 2);
        assert_eq!(entry.item.id.as_deref(), Some("c"));
    }

    #[test]
    fn test_previous_item_repeat_semantics() {
        let mut queue = PlayQueue::new(Some(1));
        queue.set_playlist(entries(&["a", "b", "c"]));
        queue.set_playlist_index(0);

        assert!(queue.get_previous_item().is_none());

        queue.set_repeat_mode(RepeatMode::RepeatAll);
        assert_eq!(queue.get_previous_item().map(|(i, _)| i), Some(2));

        queue.set_repeat_mode(RepeatMode::RepeatOne);
        assert_eq!(queue.get_previous_item().map(|(i, _)| i), Some(0));
    }

    #[test]
    fn test_next_previous_without_current() {
        let mut queue = PlayQueue::new(Some(1));
        assert!(queue.get_next_item().is_none());

        queue.set_playlist(entries(&["a", "b", "c"]));
        assert_eq!(queue.get_next_item().map(|(i, _)| i), Some(0));
        assert_eq!(queue.get_previous_item().map(|(i, _)| i), Some(2));
    }

    #[test]
    fn test_shuffle_keeps_current_first_and_unshuffle_restores() {
        let ids: Vec<String> = (0..20).map(|i| format!("item-{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let mut queue = PlayQueue::new(Some(42));
        let slots = queue.set_playlist(entries(&refs));
        queue.set_playlist_item(&slots[5]);

        queue.set_shuffle_mode(ShuffleMode::Shuffle);
        assert_eq!(queue.shuffle_mode(), ShuffleMode::Shuffle);
        assert_eq!(queue.entries()[0].slot_id, slots[5]);
        assert_eq!(queue.current_index(), Some(0));
        assert_ne!(item_ids(&queue), ids);

        queue.set_shuffle_mode(ShuffleMode::Sorted);
        assert_eq!(item_ids(&queue), ids);
        assert_eq!(queue.current_index(), Some(5));
    }

    #[test]
    fn test_same_seed_same_order() {
        let build = || {
            let mut queue = PlayQueue::new(Some(7));
            queue.set_playlist(entries(&["a", "b", "c", "d", "e", "f"]));
            queue.set_shuffle_mode(ShuffleMode::Shuffle);
            item_ids(&queue)
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_additions_while_shuffled_survive_unshuffle() {
        let mut queue = PlayQueue::new(Some(9));
        let slots = queue.set_playlist(entries(&["a", "b", "c"]));
        queue.set_playlist_item(&slots[0]);
        queue.set_shuffle_mode(ShuffleMode::Shuffle);

        queue.queue(entries(&["d"]));
        queue.queue_next(entries(&["x"]));
        queue.remove_from_playlist(&[slots[2].clone()]);

        queue.set_shuffle_mode(ShuffleMode::Sorted);
        assert_eq!(item_ids(&queue), vec!["a", "x", "b", "d"]);
    }

    #[test]
    fn test_moves_while_shuffled_are_dropped_by_unshuffle() {
        let mut queue = PlayQueue::new(Some(3));
        let slots = queue.set_playlist(entries(&["a", "b", "c", "d"]));
        queue.set_playlist_item(&slots[0]);
        queue.set_shuffle_mode(ShuffleMode::Shuffle);

        queue.move_playlist_item(&slots[3], 0);
        assert_eq!(queue.entries()[0].slot_id, slots[3]);

        queue.set_shuffle_mode(ShuffleMode::Sorted);
        assert_eq!(item_ids(&queue), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_clear_keeping_current() {
        let mut queue = PlayQueue::new(Some(1));
        let slots = queue.set_playlist(entries(&["a", "b", "c"]));
        queue.set_playlist_item(&slots[1]);

        let removed = queue.clear(true);

        assert_eq!(removed, vec![slots[0].clone(), slots[2].clone()]);
        assert_eq!(queue.current_slot_id(), Some(slots[1].as_str()));

        queue.clear(false);
        assert!(queue.is_empty());
        assert!(queue.current_slot_id().is_none());
    }
}
