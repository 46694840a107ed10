//! Reference-counted arena for event entries.
//!
//! Every event entry flowing through the dispatcher lives in this pool and
//! is addressed by an [`EventId`].  The refcount tracks how many places
//! hold the entry: the inbound queue's base reference, one per dispatch
//! entry, and possibly the key-repeat state.  Counts are only touched with
//! the dispatcher lock held; an entry is freed exactly when its count
//! drops to zero, releasing a motion entry's whole sample chain with it.

use crate::core::event::{
    ConfigurationChange, EventEntry, KeyEvent, MotionEvent, MotionSample, MAX_POINTERS,
};

/// Handle to a pooled event entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u32);

#[derive(Debug)]
struct Slot {
    ref_count: u32,
    entry: EventEntry,
}

#[derive(Debug, Default)]
pub struct EventPool {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    live: usize,
}

impl EventPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn obtain_configuration_change(&mut self, change: ConfigurationChange) -> EventId {
        self.insert(EventEntry::ConfigurationChange(change))
    }

    pub fn obtain_key(&mut self, key: KeyEvent) -> EventId {
        self.insert(EventEntry::Key(key))
    }

    pub fn obtain_motion(&mut self, motion: MotionEvent) -> EventId {
        debug_assert!(!motion.samples.is_empty());
        debug_assert!(motion.pointer_ids.len() <= MAX_POINTERS);
        debug_assert!(motion.samples[0].pointer_coords.len() == motion.pointer_ids.len());
        self.insert(EventEntry::Motion(motion))
    }

    /// Add one reference to an entry.
    pub fn retain(&mut self, id: EventId) {
        self.slot_mut(id).ref_count += 1;
    }

    /// Drop one reference; frees the entry when the count reaches zero.
    /// Returns true if the entry was freed.
    pub fn release(&mut self, id: EventId) -> bool {
        let slot = self.slot_mut(id);
        debug_assert!(slot.ref_count > 0);
        slot.ref_count -= 1;
        if slot.ref_count == 0 {
            self.slots[id.0 as usize] = None;
            self.free.push(id.0);
            self.live -= 1;
            true
        } else {
            false
        }
    }

    pub fn ref_count(&self, id: EventId) -> u32 {
        self.slot(id).ref_count
    }

    pub fn get(&self, id: EventId) -> &EventEntry {
        &self.slot(id).entry
    }

    pub fn get_mut(&mut self, id: EventId) -> &mut EventEntry {
        &mut self.slot_mut(id).entry
    }

    /// The entry as a key event.  Panics if it is not one; callers dispatch
    /// on [`EventEntry::kind`] first.
    pub fn key(&self, id: EventId) -> &KeyEvent {
        match self.get(id) {
            EventEntry::Key(key) => key,
            other => panic!("expected key entry, found {:?}", other.kind()),
        }
    }

    pub fn key_mut(&mut self, id: EventId) -> &mut KeyEvent {
        match self.get_mut(id) {
            EventEntry::Key(key) => key,
            other => panic!("expected key entry, found {:?}", other.kind()),
        }
    }

    /// The entry as a motion event.  Panics if it is not one.
    pub fn motion(&self, id: EventId) -> &MotionEvent {
        match self.get(id) {
            EventEntry::Motion(motion) => motion,
            other => panic!("expected motion entry, found {:?}", other.kind()),
        }
    }

    pub fn motion_mut(&mut self, id: EventId) -> &mut MotionEvent {
        match self.get_mut(id) {
            EventEntry::Motion(motion) => motion,
            other => panic!("expected motion entry, found {:?}", other.kind()),
        }
    }

    /// Append a sample at the tail of a motion entry's chain.
    pub fn append_motion_sample(&mut self, id: EventId, sample: MotionSample) {
        let motion = self.motion_mut(id);
        debug_assert!(sample.pointer_coords.len() == motion.pointer_ids.len());
        motion.samples.push(sample);
    }

    /// Number of live entries, for leak assertions in tests.
    pub fn live_entries(&self) -> usize {
        self.live
    }

    fn insert(&mut self, entry: EventEntry) -> EventId {
        let slot = Slot {
            ref_count: 1,
            entry,
        };
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                EventId(index)
            }
            None => {
                self.slots.push(Some(slot));
                EventId((self.slots.len() - 1) as u32)
            }
        }
    }

    fn slot(&self, id: EventId) -> &Slot {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("event entry already released")
    }

    fn slot_mut(&mut self, id: EventId) -> &mut Slot {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("event entry already released")
    }
}
