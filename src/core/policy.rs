//! Dispatch policy interface.
//!
//! The policy owns everything the core does not: which windows receive an
//! event, whether key repeat is allowed and how fast, and what to do with
//! configuration and lid switch notifications.  Implementations are
//! plugged in at dispatcher construction; the core never calls back into a
//! producer thread.

use std::time::Duration;

use bitflags::bitflags;

use crate::core::channel::InputChannel;
use crate::core::event::{KeyEventView, MotionEventView};
use crate::prelude::*;

bitflags! {
    /// Per-target delivery adjustments.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TargetFlags: u32 {
        /// Completion of this dispatch gates the start of later inbound
        /// events.  At most one sync entry sits in a connection's outbound
        /// queue, always at the tail.
        const SYNC = 0x01;
        /// Deliver the motion as ACTION_OUTSIDE (touch landed outside the
        /// target window).
        const OUTSIDE = 0x02;
        /// Deliver as canceled: keys gain FLAG_CANCELED, motions become
        /// ACTION_CANCEL.
        const CANCEL = 0x04;
    }
}

/// One resolved delivery target for an event.
#[derive(Debug, Clone)]
pub struct InputTarget {
    pub channel: Arc<InputChannel>,
    pub flags: TargetFlags,
    /// Added to motion coordinates to translate into the target window's
    /// coordinate space.
    pub x_offset: f32,
    pub y_offset: f32,
    /// How long the consumer may take to acknowledge before it is declared
    /// not responding.  `None` disables the timeout.
    pub timeout: Option<Duration>,
}

/// Policy consulted by the dispatcher core.
pub trait DispatchPolicy: Send + Sync {
    /// Whether synthetic key repeat may run at all.  Checked every
    /// dispatch iteration; repeat state is dropped while disallowed.
    fn allow_key_repeat(&self) -> bool;

    /// Delay before the first synthetic repeat and between repeats, in
    /// nanoseconds.
    fn key_repeat_timeout(&self) -> i64;

    fn notify_configuration_changed(
        &self,
        event_time: i64,
        touch_screen_config: i32,
        keyboard_config: i32,
        navigation_config: i32,
    );

    /// Lid switch notifications bypass the inbound queue and are delivered
    /// synchronously from the producer thread.
    fn notify_lid_switch_changed(&self, event_time: i64, open: bool);

    /// Resolve the target windows for a key event.
    fn key_event_targets(
        &self,
        event: &KeyEventView,
        policy_flags: u32,
        targets: &mut Vec<InputTarget>,
    );

    /// Resolve the target windows for a motion event.
    fn motion_event_targets(
        &self,
        event: &MotionEventView,
        policy_flags: u32,
        targets: &mut Vec<InputTarget>,
    );
}
