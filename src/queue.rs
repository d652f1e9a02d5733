use crate::model::{RepeatMode, Track};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

#[derive(Debug, Clone, PartialEq)]
struct QueueEntry {
    key: u64,
    track: Track,
}

/// Ordered playback sequence.
///
/// `current` is `None` exactly when the queue is empty. While shuffled, `original`
/// holds the pre-shuffle order so that turning shuffle off restores it; every edit
/// is applied to both orders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayQueue {
    entries: Vec<QueueEntry>,
    original: Option<Vec<QueueEntry>>,
    current: Option<usize>,
    next_key: u64,
}

/// Queue state captured by [`PlayQueue::clear`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueUndo {
    queue: PlayQueue,
}

impl PlayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_shuffled(&self) -> bool {
        self.original.is_some()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.and_then(|idx| self.get(idx))
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.entries.get(index).map(|entry| &entry.track)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.entries.iter().map(|entry| &entry.track)
    }

    pub fn to_vec(&self) -> Vec<Track> {
        self.tracks().cloned().collect()
    }

    /// Tracks in pre-shuffle order, or the active order when not shuffled.
    pub fn original_order(&self) -> Vec<Track> {
        self.original
            .as_ref()
            .unwrap_or(&self.entries)
            .iter()
            .map(|entry| entry.track.clone())
            .collect()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks().map(|track| track.id.clone()).collect()
    }

    pub fn replace(&mut self, tracks: Vec<Track>, index: usize, shuffle: bool, rng: &mut SmallRng) {
        let entries: Vec<QueueEntry> = tracks
            .into_iter()
            .map(|track| self.make_entry(track))
            .collect();
        self.entries = entries;
        self.original = None;
        self.current = if self.entries.is_empty() {
            None
        } else {
            Some(index.min(self.entries.len() - 1))
        };
        if shuffle {
            self.shuffle_active(rng);
        }
    }

    pub fn set_current(&mut self, index: usize) -> bool {
        if index >= self.entries.len() {
            return false;
        }
        self.current = Some(index);
        true
    }

    pub fn set_shuffle(&mut self, enabled: bool, rng: &mut SmallRng) {
        match (enabled, self.is_shuffled()) {
            (true, false) => self.shuffle_active(rng),
            (false, true) => self.unshuffle(),
            _ => {}
        }
    }

    pub fn toggle_shuffle(&mut self, rng: &mut SmallRng) -> bool {
        let enabled = !self.is_shuffled();
        self.set_shuffle(enabled, rng);
        enabled
    }

    /// Index natural playback would move to once the current track ends.
    pub fn upcoming_index(&self, repeat: RepeatMode) -> Option<usize> {
        let current = self.current?;
        match repeat {
            RepeatMode::One => Some(current),
            _ if current + 1 < self.entries.len() => Some(current + 1),
            RepeatMode::All => Some(0),
            RepeatMode::Off => None,
        }
    }

    pub fn append(&mut self, tracks: Vec<Track>) {
        for track in tracks {
            let entry = self.make_entry(track);
            if let Some(original) = self.original.as_mut() {
                original.push(entry.clone());
            }
            self.entries.push(entry);
        }
        if self.current.is_none() && !self.entries.is_empty() {
            self.current = Some(0);
        }
    }

    /// Inserts right after the current track.
    pub fn insert_next(&mut self, track: Track) {
        let entry = self.make_entry(track);
        let Some(current) = self.current else {
            if let Some(original) = self.original.as_mut() {
                original.push(entry.clone());
            }
            self.entries.push(entry);
            self.current = Some(0);
            return;
        };

        if let Some(original) = self.original.as_mut() {
            let current_key = self.entries[current].key;
            let at = original
                .iter()
                .position(|candidate| candidate.key == current_key)
                .map_or(original.len(), |pos| pos + 1);
            original.insert(at, entry.clone());
        }
        self.entries.insert(current + 1, entry);
    }

    /// Removes the entry at `index`. The current track cannot be removed.
    pub fn remove(&mut self, index: usize) -> Option<Track> {
        let current = self.current?;
        if index == current || index >= self.entries.len() {
            return None;
        }

        let removed = self.entries.remove(index);
        if let Some(original) = self.original.as_mut() {
            original.retain(|entry| entry.key != removed.key);
        }
        if index < current {
            self.current = Some(current - 1);
        }
        Some(removed.track)
    }

    /// Inverse of [`PlayQueue::remove`].
    pub fn insert(&mut self, track: Track, index: usize) -> usize {
        let entry = self.make_entry(track);
        let at = index.min(self.entries.len());
        if let Some(original) = self.original.as_mut() {
            let original_at = at.min(original.len());
            original.insert(original_at, entry.clone());
        }
        self.entries.insert(at, entry);
        self.current = match self.current {
            Some(current) if at <= current => Some(current + 1),
            Some(current) => Some(current),
            None => Some(0),
        };
        at
    }

    /// Collapses the queue to the current track, or empties it when only one entry
    /// remains. Returns the prior state, or `None` when there was nothing to clear.
    pub fn clear(&mut self) -> Option<QueueUndo> {
        if self.entries.is_empty() {
            return None;
        }
        let undo = QueueUndo {
            queue: self.clone(),
        };

        match self.current {
            Some(current) if self.entries.len() > 1 => {
                let kept = self.entries.swap_remove(current);
                if self.original.is_some() {
                    self.original = Some(vec![kept.clone()]);
                }
                self.entries = vec![kept];
                self.current = Some(0);
            }
            _ => {
                self.entries.clear();
                self.original = None;
                self.current = None;
            }
        }
        Some(undo)
    }

    pub fn restore(&mut self, undo: QueueUndo) {
        let next_key = self.next_key.max(undo.queue.next_key);
        *self = undo.queue;
        self.next_key = next_key;
    }

    fn make_entry(&mut self, track: Track) -> QueueEntry {
        let key = self.next_key;
        self.next_key += 1;
        QueueEntry { key, track }
    }

    fn shuffle_active(&mut self, rng: &mut SmallRng) {
        let original = self.entries.clone();
        match self.current {
            Some(current) => {
                let playing = self.entries.remove(current);
                self.entries.shuffle(rng);
                self.entries.insert(0, playing);
                self.current = Some(0);
            }
            None => self.entries.shuffle(rng),
        }
        self.original = Some(original);
    }

    fn unshuffle(&mut self) {
        let Some(original) = self.original.take() else {
            return;
        };
        let playing = self
            .current
            .and_then(|idx| self.entries.get(idx))
            .map(|entry| (entry.key, entry.track.id.clone()));

        self.entries = original;
        self.current = if self.entries.is_empty() {
            None
        } else {
            let found = playing.and_then(|(key, id)| {
                self.entries
                    .iter()
                    .position(|entry| entry.key == key)
                    .or_else(|| self.entries.iter().position(|entry| entry.track.id == id))
            });
            Some(found.unwrap_or(0))
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prop_assert;
    use proptest::prop_assert_eq;
    use rand::SeedableRng;

    fn tracks(ids: &[&str]) -> Vec<Track> {
        ids.iter().map(|id| Track::new(*id, *id)).collect()
    }

    fn ids(queue: &PlayQueue) -> Vec<String> {
        queue.track_ids()
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    #[test]
    fn replace_clamps_index_and_tracks_current() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b", "c"]), 9, false, &mut rng());
        assert_eq!(queue.current_index(), Some(2));
        assert_eq!(queue.current().map(|t| t.id.as_str()), Some("c"));
    }

    #[test]
    fn insert_next_into_empty_shuffled_queue_survives_unshuffle() {
        let mut queue = PlayQueue::new();
        queue.set_shuffle(true, &mut rng());
        queue.insert_next(Track::new("solo", "solo"));
        assert_eq!(queue.original_order().len(), 1);

        queue.set_shuffle(false, &mut rng());
        assert_eq!(ids(&queue), vec!["solo"]);
        assert_eq!(queue.current_index(), Some(0));
    }

    #[test]
    fn shuffle_puts_current_first_and_keeps_all_tracks() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b", "c", "d", "e"]), 2, false, &mut rng());
        queue.set_shuffle(true, &mut rng());

        assert_eq!(queue.current_index(), Some(0));
        assert_eq!(queue.current().map(|t| t.id.as_str()), Some("c"));
        let mut sorted = ids(&queue);
        sorted.sort();
        assert_eq!(sorted, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn unshuffle_restores_order_and_current() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b", "c", "d"]), 1, false, &mut rng());
        queue.toggle_shuffle(&mut rng());
        queue.set_current(3);
        let playing = queue.current().map(|t| t.id.clone());

        queue.toggle_shuffle(&mut rng());
        assert_eq!(ids(&queue), vec!["a", "b", "c", "d"]);
        assert_eq!(queue.current().map(|t| t.id.clone()), playing);
    }

    #[test]
    fn edits_while_shuffled_survive_unshuffle() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b", "c"]), 0, true, &mut rng());
        queue.append(tracks(&["d"]));
        queue.insert_next(Track::new("n", "n"));
        let victim = ids(&queue)
            .iter()
            .position(|id| id == "b")
            .expect("b queued");
        assert_eq!(queue.remove(victim).map(|t| t.id), Some(String::from("b")));

        queue.toggle_shuffle(&mut rng());
        assert_eq!(ids(&queue), vec!["a", "n", "c", "d"]);
        assert_eq!(queue.current_index(), Some(0));
    }

    #[test]
    fn unshuffle_falls_back_to_first_when_current_is_unknown() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b"]), 1, true, &mut rng());
        queue.original = Some(vec![QueueEntry {
            key: 99,
            track: Track::new("z", "z"),
        }]);
        queue.toggle_shuffle(&mut rng());
        assert_eq!(queue.current_index(), Some(0));
        assert_eq!(ids(&queue), vec!["z"]);
    }

    #[test]
    fn remove_rejects_current_and_shifts_index() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b", "c"]), 1, false, &mut rng());

        assert_eq!(queue.remove(1), None);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.remove(0).map(|t| t.id), Some(String::from("a")));
        assert_eq!(queue.current_index(), Some(0));
        assert_eq!(queue.current().map(|t| t.id.as_str()), Some("b"));
    }

    #[test]
    fn insert_undoes_remove() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b", "c"]), 2, false, &mut rng());
        let removed = queue.remove(0).expect("removable");
        queue.insert(removed, 0);
        assert_eq!(ids(&queue), vec!["a", "b", "c"]);
        assert_eq!(queue.current_index(), Some(2));
    }

    #[test]
    fn insert_next_lands_after_current() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b", "c"]), 0, false, &mut rng());
        queue.insert_next(Track::new("x", "x"));
        assert_eq!(ids(&queue), vec!["a", "x", "b", "c"]);
    }

    #[test]
    fn clear_collapses_to_current_and_undo_restores() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b", "c"]), 1, false, &mut rng());

        let undo = queue.clear().expect("cleared");
        assert_eq!(ids(&queue), vec!["b"]);
        assert_eq!(queue.current_index(), Some(0));

        queue.restore(undo);
        assert_eq!(ids(&queue), vec!["a", "b", "c"]);
        assert_eq!(queue.current_index(), Some(1));
    }

    #[test]
    fn clear_single_entry_empties() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a"]), 0, false, &mut rng());
        assert!(queue.clear().is_some());
        assert!(queue.is_empty());
        assert_eq!(queue.current_index(), None);
        assert!(queue.clear().is_none());
    }

    #[test]
    fn upcoming_follows_repeat_mode() {
        let mut queue = PlayQueue::new();
        queue.replace(tracks(&["a", "b"]), 1, false, &mut rng());
        assert_eq!(queue.upcoming_index(RepeatMode::Off), None);
        assert_eq!(queue.upcoming_index(RepeatMode::All), Some(0));
        assert_eq!(queue.upcoming_index(RepeatMode::One), Some(1));
        queue.set_current(0);
        assert_eq!(queue.upcoming_index(RepeatMode::Off), Some(1));
    }

    proptest::proptest! {
        #[test]
        fn shuffle_round_trip_restores_order(len in 1usize..40, current in 0usize..40, seed in 0u64..1000) {
            let names: Vec<String> = (0..len).map(|n| format!("t{n}")).collect();
            let mut queue = PlayQueue::new();
            queue.replace(
                names.iter().map(|id| Track::new(id.as_str(), id.as_str())).collect(),
                current,
                false,
                &mut rng(),
            );
            let before = queue.current().map(|t| t.id.clone());
            let mut shuffler = SmallRng::seed_from_u64(seed);

            queue.toggle_shuffle(&mut shuffler);
            prop_assert_eq!(queue.current_index(), Some(0));
            queue.toggle_shuffle(&mut shuffler);

            prop_assert_eq!(queue.track_ids(), names);
            prop_assert_eq!(queue.current().map(|t| t.id.clone()), before);
        }

        #[test]
        fn queue_invariants_hold_after_random_ops(ops in proptest::collection::vec((0u8..8, 0usize..12), 1..200)) {
            let mut queue = PlayQueue::new();
            let mut shuffler = rng();
            let mut undo = None;
            let mut counter = 0;

            for (op, arg) in ops {
                counter += 1;
                let fresh = Track::new(format!("n{counter}"), "n");
                match op {
                    0 => queue.append(vec![fresh]),
                    1 => queue.insert_next(fresh),
                    2 => {
                        let _ = queue.remove(arg);
                    }
                    3 => {
                        queue.insert(fresh, arg);
                    }
                    4 => {
                        queue.toggle_shuffle(&mut shuffler);
                    }
                    5 => {
                        queue.set_current(arg);
                    }
                    6 => undo = queue.clear(),
                    _ => {
                        if let Some(saved) = undo.take() {
                            queue.restore(saved);
                        }
                    }
                }

                match queue.current_index() {
                    Some(idx) => prop_assert!(idx < queue.len()),
                    None => prop_assert!(queue.is_empty()),
                }
                prop_assert_eq!(queue.original_order().len(), queue.len());
            }
        }
    }
}
