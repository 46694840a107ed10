//! Per-consumer connection state.
//!
//! A connection tracks one registered input channel: its delivery status,
//! the outbound queue of dispatch entries, the armed timeout, and the
//! timestamps behind the latency figures reported on ANR and recovery.

use std::time::Duration;

use crate::core::channel::InputChannel;
use crate::core::errors::ChannelError;
use crate::core::policy::{InputTarget, TargetFlags};
use crate::core::pool::EventId;
use crate::core::queue::{LinkedQueue, NodeId};
use crate::core::time::nanos_to_millis;
use crate::prelude::*;

/// Delivery status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Delivering events normally.
    Normal,
    /// The transport failed; the connection stays registered but inert
    /// until it is unregistered.
    Broken,
    /// The consumer missed its acknowledgment deadline; cleared when a
    /// finished signal eventually arrives.
    NotResponding,
    /// Unregistered and scheduled for teardown.
    Zombie,
}

/// One event queued for delivery to one connection.
///
/// Holds a counted reference to the pooled event entry plus the target
/// adjustments resolved by the policy.  For motions, `head_sample` is
/// where publishing resumes after a buffer-full split and `tail_sample`
/// is the first sample that did not fit and waits for the next cycle.
#[derive(Debug)]
pub struct DispatchEntry {
    pub event: EventId,
    pub target_flags: TargetFlags,
    pub x_offset: f32,
    pub y_offset: f32,
    pub timeout: Option<Duration>,
    pub in_progress: bool,
    pub head_sample: Option<usize>,
    pub tail_sample: Option<usize>,
}

impl DispatchEntry {
    pub fn new(event: EventId, target: &InputTarget) -> Self {
        Self {
            event,
            target_flags: target.flags,
            x_offset: target.x_offset,
            y_offset: target.y_offset,
            timeout: target.timeout,
            in_progress: false,
            head_sample: None,
            tail_sample: None,
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    pub status: ConnectionStatus,
    pub channel: Arc<InputChannel>,
    pub outbound: LinkedQueue<DispatchEntry>,
    /// Deadline for the in-flight dispatch cycle; `i64::MAX` when unarmed.
    pub next_timeout_time: i64,
    pub last_event_time: i64,
    pub last_dispatch_time: i64,
    pub last_anr_time: i64,
}

impl Connection {
    pub fn new(channel: Arc<InputChannel>) -> Self {
        Self {
            status: ConnectionStatus::Normal,
            channel,
            outbound: LinkedQueue::new(),
            next_timeout_time: i64::MAX,
            last_event_time: i64::MAX,
            last_dispatch_time: i64::MAX,
            last_anr_time: i64::MAX,
        }
    }

    pub fn initialize(&self) -> Result<(), ChannelError> {
        self.channel.initialize()
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// Whether a synchronous dispatch is queued or in flight.  The sync
    /// entry, when present, is always the tail of the outbound queue.
    pub fn has_pending_sync_target(&self) -> bool {
        self.outbound
            .back()
            .map_or(false, |entry| entry.target_flags.contains(TargetFlags::SYNC))
    }

    /// Locate the queued dispatch entry wrapping `event`, scanning from
    /// the tail since streaming targets the most recent motion.
    pub fn find_queued_dispatch_entry_for_event(&self, event: EventId) -> Option<NodeId> {
        self.outbound
            .iter_rev()
            .find(|(_, entry)| entry.event == event)
            .map(|(id, _)| id)
    }

    /// Milliseconds since the in-flight event was generated.
    pub fn event_latency_millis(&self, now: i64) -> f64 {
        nanos_to_millis(now.saturating_sub(self.last_event_time))
    }

    /// Milliseconds since the in-flight event was dispatched.
    pub fn dispatch_latency_millis(&self, now: i64) -> f64 {
        nanos_to_millis(now.saturating_sub(self.last_dispatch_time))
    }

    /// Milliseconds since the connection entered the not-responding state.
    pub fn anr_latency_millis(&self, now: i64) -> f64 {
        nanos_to_millis(now.saturating_sub(self.last_anr_time))
    }
}
