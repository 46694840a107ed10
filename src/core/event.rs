//! Input event data model.
//!
//! Defines the event payloads that flow through the dispatcher (keys,
//! motions, configuration changes), the motion sample chain, and the
//! transient views handed to the policy for target resolution.

use bitflags::bitflags;

/// Identifier of the input device an event originated from.
pub type DeviceId = i32;

/// Maximum number of simultaneous pointers carried by one motion event.
pub const MAX_POINTERS: usize = 10;

// ============================================================================
// Constants
// ============================================================================

/// Key event actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
    /// Several complete key strokes reported as one event.
    Multiple,
}

/// Motion event actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAction {
    Down,
    Up,
    Move,
    Cancel,
    Outside,
    PointerDown,
    PointerUp,
}

bitflags! {
    /// Per-key-event flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyFlags: u32 {
        /// The key stroke should be treated as if the key had never gone
        /// down: delivered so the consumer can unwind its key-down state.
        const CANCELED = 0x20;
    }
}

/// Input source classes, reported by the reader drivers.
pub mod source {
    pub const UNKNOWN: u32 = 0x0000;
    pub const KEYBOARD: u32 = 0x0101;
    pub const DPAD: u32 = 0x0201;
    pub const TOUCHSCREEN: u32 = 0x1002;
    pub const TRACKBALL: u32 = 0x1_0004;
}

/// Key codes referenced by the dispatcher itself.
pub mod keycode {
    pub const DPAD_UP: i32 = 19;
    pub const DPAD_DOWN: i32 = 20;
    pub const DPAD_LEFT: i32 = 21;
    pub const DPAD_RIGHT: i32 = 22;
}

/// Movement keys are the directional-pad group; they are the keys trimmed
/// from the inbound queue when an app switch is imminent.
pub fn is_movement_key(key_code: i32) -> bool {
    key_code == keycode::DPAD_UP
        || key_code == keycode::DPAD_DOWN
        || key_code == keycode::DPAD_LEFT
        || key_code == keycode::DPAD_RIGHT
}

// ============================================================================
// Event payloads
// ============================================================================

/// A single pointer position with its touch attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointerCoords {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub size: f32,
}

/// One motion sample: a timestamp plus coordinates for every pointer.
///
/// `pointer_coords.len()` always equals the owning event's pointer count.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSample {
    pub event_time: i64,
    pub pointer_coords: Vec<PointerCoords>,
}

/// Device configuration snapshot delivered on configuration changes.
#[derive(Debug, Clone, Copy)]
pub struct ConfigurationChange {
    pub event_time: i64,
    pub touch_screen_config: i32,
    pub keyboard_config: i32,
    pub navigation_config: i32,
}

/// A key press or release.
#[derive(Debug, Clone)]
pub struct KeyEvent {
    pub event_time: i64,
    pub device_id: DeviceId,
    pub source: u32,
    pub policy_flags: u32,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: i32,
    pub repeat_count: i32,
    pub down_time: i64,
}

/// A pointer/touch motion event owning its sample chain.
///
/// `samples` is never empty: the first sample is created together with the
/// event and batching appends strictly at the tail, so sample times are
/// non-decreasing along the chain.
#[derive(Debug, Clone)]
pub struct MotionEvent {
    pub event_time: i64,
    pub device_id: DeviceId,
    pub source: u32,
    pub policy_flags: u32,
    pub action: MotionAction,
    pub meta_state: i32,
    pub edge_flags: i32,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: i64,
    pub pointer_ids: Vec<i32>,
    pub samples: Vec<MotionSample>,
}

impl MotionEvent {
    pub fn pointer_count(&self) -> usize {
        self.pointer_ids.len()
    }

    pub fn first_sample(&self) -> &MotionSample {
        &self.samples[0]
    }

    pub fn last_sample(&self) -> &MotionSample {
        &self.samples[self.samples.len() - 1]
    }
}

/// An entry in the inbound queue or referenced by dispatch state.
#[derive(Debug, Clone)]
pub enum EventEntry {
    ConfigurationChange(ConfigurationChange),
    Key(KeyEvent),
    Motion(MotionEvent),
}

/// Discriminant of an [`EventEntry`], for dispatch without borrowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ConfigurationChange,
    Key,
    Motion,
}

impl EventEntry {
    pub fn kind(&self) -> EventKind {
        match self {
            EventEntry::ConfigurationChange(_) => EventKind::ConfigurationChange,
            EventEntry::Key(_) => EventKind::Key,
            EventEntry::Motion(_) => EventKind::Motion,
        }
    }

    pub fn event_time(&self) -> i64 {
        match self {
            EventEntry::ConfigurationChange(change) => change.event_time,
            EventEntry::Key(key) => key.event_time,
            EventEntry::Motion(motion) => motion.event_time,
        }
    }

    pub fn policy_flags(&self) -> u32 {
        match self {
            EventEntry::ConfigurationChange(_) => 0,
            EventEntry::Key(key) => key.policy_flags,
            EventEntry::Motion(motion) => motion.policy_flags,
        }
    }
}

// ============================================================================
// Policy-facing views
// ============================================================================

/// Snapshot of a key event passed to the policy for target resolution.
#[derive(Debug, Clone, Copy)]
pub struct KeyEventView {
    pub device_id: DeviceId,
    pub source: u32,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: i32,
    pub scan_code: i32,
    pub meta_state: i32,
    pub repeat_count: i32,
    pub down_time: i64,
    pub event_time: i64,
}

impl KeyEventView {
    pub fn new(key: &KeyEvent) -> Self {
        Self {
            device_id: key.device_id,
            source: key.source,
            action: key.action,
            flags: key.flags,
            key_code: key.key_code,
            scan_code: key.scan_code,
            meta_state: key.meta_state,
            repeat_count: key.repeat_count,
            down_time: key.down_time,
            event_time: key.event_time,
        }
    }
}

/// Snapshot of a motion event passed to the policy for target resolution.
///
/// Carries the coordinates of the first pointer of the first sample, which
/// is what target selection keys on.
#[derive(Debug, Clone, Copy)]
pub struct MotionEventView {
    pub device_id: DeviceId,
    pub source: u32,
    pub action: MotionAction,
    pub edge_flags: i32,
    pub meta_state: i32,
    pub x: f32,
    pub y: f32,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: i64,
    pub event_time: i64,
    pub pointer_count: usize,
}

impl MotionEventView {
    pub fn new(motion: &MotionEvent) -> Self {
        let first = motion.first_sample();
        Self {
            device_id: motion.device_id,
            source: motion.source,
            action: motion.action,
            edge_flags: motion.edge_flags,
            meta_state: motion.meta_state,
            x: first.pointer_coords[0].x,
            y: first.pointer_coords[0].y,
            x_precision: motion.x_precision,
            y_precision: motion.y_precision,
            down_time: motion.down_time,
            event_time: motion.event_time,
            pointer_count: motion.pointer_count(),
        }
    }
}
