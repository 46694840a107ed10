//! The input event dispatcher core.
//!
//! A single worker thread loops [`Dispatcher::dispatch_once`]: it services
//! connection timeouts, pulls at most one inbound event per iteration,
//! asks the policy for targets, and writes the event into each target's
//! channel.  Producer threads feed the inbound queue through the
//! `notify_*` intake paths, which also coalesce move samples (batching)
//! and push samples into an in-flight motion dispatch (streaming).
//!
//! One mutex serializes all dispatcher state.  The worker only drops it
//! while blocked in the poll loop, and producers wake the loop only when
//! they turn the inbound queue from empty to non-empty.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::thread::JoinHandle;

use crate::core::channel::{InputChannel, PublishedKey, PublishedMotion};
use crate::core::connection::{Connection, ConnectionStatus, DispatchEntry};
use crate::core::errors::{ChannelError, RegisterError};
use crate::core::event::{
    is_movement_key, ConfigurationChange, EventEntry, EventKind, KeyAction, KeyEvent,
    KeyEventView, KeyFlags, MotionAction, MotionEvent, MotionEventView,
};
use crate::core::looper::{FdEvents, Looper};
use crate::core::policy::{DispatchPolicy, InputTarget, TargetFlags};
use crate::core::pool::{EventId, EventPool};
use crate::core::queue::LinkedQueue;
use crate::core::time::{poll_timeout_millis, Clock, MonotonicClock};
use crate::prelude::*;

// ============================================================================
// Observer
// ============================================================================

/// Hooks fired at dispatch-cycle boundaries, for the surrounding system
/// (window manager, ANR dialogs).  All methods default to no-ops.
pub trait DispatchObserver: Send + Sync {
    fn on_dispatch_cycle_started(&self, _channel: &str) {}
    fn on_dispatch_cycle_finished(&self, _channel: &str, _recovered_from_anr: bool) {}
    fn on_dispatch_cycle_anr(&self, _channel: &str) {}
    fn on_dispatch_cycle_broken(&self, _channel: &str) {}
}

struct NoopObserver;

impl DispatchObserver for NoopObserver {}

// ============================================================================
// Dispatcher state
// ============================================================================

/// Pending synthetic key repeat.
///
/// `last_key` holds a counted reference to the most recent key-down entry;
/// `next_repeat_time` of `i64::MAX` means the device driver repeats on its
/// own and no synthesis happens.
struct KeyRepeatState {
    last_key: Option<EventId>,
    next_repeat_time: i64,
}

struct DispatcherState {
    pool: EventPool,
    inbound: LinkedQueue<EventId>,
    connections: HashMap<RawFd, Connection>,
    /// Connections with a non-empty outbound queue, in activation order.
    /// Timeouts are tracked only for these.
    active: Vec<RawFd>,
    key_repeat: KeyRepeatState,
    /// Targets resolved for the event currently being dispatched.  Not
    /// cleared between cycles: the streaming path reuses it, relying on
    /// the sync gate to keep it current.
    current_targets: Vec<InputTarget>,
}

impl DispatcherState {
    fn new() -> Self {
        Self {
            pool: EventPool::new(),
            inbound: LinkedQueue::new(),
            connections: HashMap::new(),
            active: Vec::new(),
            key_repeat: KeyRepeatState {
                last_key: None,
                next_repeat_time: i64::MAX,
            },
            current_targets: Vec::new(),
        }
    }
}

/// The core input event dispatcher.
pub struct Dispatcher {
    policy: Arc<dyn DispatchPolicy>,
    observer: Arc<dyn DispatchObserver>,
    clock: Arc<dyn Clock>,
    looper: Looper,
    state: Mutex<DispatcherState>,
    self_ref: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(policy: Arc<dyn DispatchPolicy>) -> std::io::Result<Arc<Self>> {
        Self::with_hooks(policy, Arc::new(NoopObserver), Arc::new(MonotonicClock::new()))
    }

    /// Construct with an explicit observer and clock.
    pub fn with_hooks(
        policy: Arc<dyn DispatchPolicy>,
        observer: Arc<dyn DispatchObserver>,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Arc<Self>> {
        let looper = Looper::new()?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            policy,
            observer,
            clock,
            looper,
            state: Mutex::new(DispatcherState::new()),
            self_ref: self_ref.clone(),
        }))
    }

    /// Wake the dispatch thread out of its poll.
    pub fn wake(&self) {
        self.looper.wake();
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    /// Run one iteration of the dispatch loop: service timeouts, dispatch
    /// at most one event, then sleep until the next deadline or wakeup.
    pub fn dispatch_once(&self) {
        let allow_key_repeat = self.policy.allow_key_repeat();

        let current_time;
        let mut next_wakeup_time = i64::MAX;
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            current_time = self.clock.now();

            // Drop repeat state whenever repeats are disallowed, even if
            // the next event is not a key: a repeat armed before the
            // device went to sleep must not fire on wakeup.
            if !allow_key_repeat {
                Self::reset_key_repeat(state);
            }

            // Process timeouts for all active connections and note whether
            // any synchronous dispatch is still pending.
            let mut has_pending_sync_target = false;
            let mut i = 0;
            while i < state.active.len() {
                let fd = state.active[i];
                let Some(connection) = state.connections.get(&fd) else {
                    state.active.remove(i);
                    continue;
                };
                let connection_timeout_time = connection.next_timeout_time;
                if connection_timeout_time <= current_time
                    && self.timeout_dispatch_cycle(state, current_time, fd)
                {
                    // The connection deactivated and left the active list;
                    // the same index now holds the next one.
                    continue;
                }
                if connection_timeout_time < next_wakeup_time {
                    next_wakeup_time = connection_timeout_time;
                }
                if let Some(connection) = state.connections.get(&fd) {
                    if connection.has_pending_sync_target() {
                        has_pending_sync_target = true;
                    }
                }
                i += 1;
            }

            // While a sync target is mid-flight no new inbound event may
            // start, preserving ordering of synchronous events across
            // windows.
            if !has_pending_sync_target {
                if state.inbound.is_empty() {
                    if state.key_repeat.last_key.is_some() {
                        if current_time >= state.key_repeat.next_repeat_time {
                            self.process_key_repeat(state, current_time);
                            return;
                        }
                        if state.key_repeat.next_repeat_time < next_wakeup_time {
                            next_wakeup_time = state.key_repeat.next_repeat_time;
                        }
                    }
                } else {
                    let id = state.inbound.pop_front().unwrap();
                    match state.pool.get(id).kind() {
                        EventKind::ConfigurationChange => {
                            self.process_configuration_changed(state, current_time, id)
                        }
                        EventKind::Key => self.process_key(state, current_time, id),
                        EventKind::Motion => self.process_motion(state, current_time, id),
                    }
                    state.pool.release(id);
                    return;
                }
            }
        }

        let timeout_millis = poll_timeout_millis(current_time, next_wakeup_time);
        self.looper.poll_once(timeout_millis);
    }

    // =========================================================================
    // Inbound event processing
    // =========================================================================

    fn process_configuration_changed(&self, state: &mut DispatcherState, _now: i64, id: EventId) {
        let change = match state.pool.get(id) {
            EventEntry::ConfigurationChange(change) => *change,
            _ => return,
        };
        tracing::debug!(
            event_time = change.event_time,
            touch_screen = change.touch_screen_config,
            keyboard = change.keyboard_config,
            navigation = change.navigation_config,
            "process configuration change"
        );
        self.policy.notify_configuration_changed(
            change.event_time,
            change.touch_screen_config,
            change.keyboard_config,
            change.navigation_config,
        );
    }

    fn process_key(&self, state: &mut DispatcherState, now: i64, id: EventId) {
        let (action, key_code, event_time) = {
            let key = state.pool.key(id);
            tracing::debug!(
                device_id = key.device_id,
                key_code = key.key_code,
                action = ?key.action,
                event_time = key.event_time,
                "process key"
            );
            (key.action, key.key_code, key.event_time)
        };

        if action == KeyAction::Down {
            let driver_repeat = state
                .key_repeat
                .last_key
                .map_or(false, |last| state.pool.key(last).key_code == key_code);
            if driver_repeat {
                // Two identical downs in a row: the device driver repeats
                // on its own, so count the repeat and never synthesize.
                let prior = state.pool.key(state.key_repeat.last_key.unwrap()).repeat_count;
                state.pool.key_mut(id).repeat_count = prior + 1;
                Self::reset_key_repeat(state);
                state.key_repeat.next_repeat_time = i64::MAX;
            } else {
                Self::reset_key_repeat(state);
                state.key_repeat.next_repeat_time =
                    event_time.saturating_add(self.policy.key_repeat_timeout());
            }
            state.key_repeat.last_key = Some(id);
            state.pool.retain(id);
        } else {
            Self::reset_key_repeat(state);
        }

        self.identify_targets_and_dispatch_key(state, now, id);
    }

    /// Synthesize one key repeat after the repeat timeout expired,
    /// mutating the retained entry in place when nothing else still
    /// references it.
    fn process_key_repeat(&self, state: &mut DispatcherState, now: i64) {
        let entry = state.key_repeat.last_key.unwrap();
        let id = if state.pool.ref_count(entry) == 1 {
            state.pool.key_mut(entry).repeat_count += 1;
            entry
        } else {
            let mut repeat = state.pool.key(entry).clone();
            repeat.repeat_count += 1;
            let id = state.pool.obtain_key(repeat);
            state.key_repeat.last_key = Some(id);
            state.pool.release(entry);
            id
        };
        {
            let key = state.pool.key_mut(id);
            key.event_time = now;
            key.down_time = now;
            key.policy_flags = 0;
        }
        state.key_repeat.next_repeat_time = now.saturating_add(self.policy.key_repeat_timeout());

        {
            let key = state.pool.key(id);
            tracing::debug!(
                device_id = key.device_id,
                key_code = key.key_code,
                repeat_count = key.repeat_count,
                "process key repeat"
            );
        }

        self.identify_targets_and_dispatch_key(state, now, id);
    }

    fn process_motion(&self, state: &mut DispatcherState, now: i64, id: EventId) {
        {
            let motion = state.pool.motion(id);
            tracing::debug!(
                device_id = motion.device_id,
                action = ?motion.action,
                samples = motion.samples.len(),
                event_time = motion.event_time,
                "process motion"
            );
        }
        self.identify_targets_and_dispatch_motion(state, now, id);
    }

    // =========================================================================
    // Target resolution
    // =========================================================================

    fn identify_targets_and_dispatch_key(&self, state: &mut DispatcherState, now: i64, id: EventId) {
        let (view, policy_flags) = {
            let key = state.pool.key(id);
            (KeyEventView::new(key), key.policy_flags)
        };
        state.current_targets.clear();
        self.policy
            .key_event_targets(&view, policy_flags, &mut state.current_targets);
        self.dispatch_event_to_current_targets(state, now, id, false);
    }

    fn identify_targets_and_dispatch_motion(
        &self,
        state: &mut DispatcherState,
        now: i64,
        id: EventId,
    ) {
        let (view, policy_flags) = {
            let motion = state.pool.motion(id);
            (MotionEventView::new(motion), motion.policy_flags)
        };
        state.current_targets.clear();
        self.policy
            .motion_event_targets(&view, policy_flags, &mut state.current_targets);
        self.dispatch_event_to_current_targets(state, now, id, false);
    }

    fn dispatch_event_to_current_targets(
        &self,
        state: &mut DispatcherState,
        now: i64,
        event: EventId,
        resume_with_appended_sample: bool,
    ) {
        let targets = state.current_targets.clone();
        for target in &targets {
            let fd = target.channel.receive_fd();
            if state.connections.contains_key(&fd) {
                self.prepare_dispatch_cycle(state, now, fd, event, target, resume_with_appended_sample);
            } else {
                tracing::warn!(
                    channel = target.channel.name(),
                    "policy requested delivery to an input channel that is not registered"
                );
            }
        }
    }

    // =========================================================================
    // Dispatch cycle FSM
    // =========================================================================

    fn prepare_dispatch_cycle(
        &self,
        state: &mut DispatcherState,
        now: i64,
        fd: RawFd,
        event: EventId,
        target: &InputTarget,
        resume_with_appended_sample: bool,
    ) {
        let was_empty = {
            let DispatcherState {
                connections, pool, ..
            } = &mut *state;
            let Some(connection) = connections.get_mut(&fd) else {
                return;
            };

            // Queue nothing at all for a connection that is broken, not
            // responding, or being torn down.
            if connection.status != ConnectionStatus::Normal {
                tracing::debug!(
                    channel = connection.name(),
                    status = ?connection.status,
                    "dropping event, channel is not in a deliverable state"
                );
                return;
            }

            let was_empty = connection.outbound.is_empty();

            // A freshly appended motion sample first tries to ride the
            // dispatch entry already queued for the same motion event.
            if !was_empty && resume_with_appended_sample {
                if let Some(node) = connection.find_queued_dispatch_entry_for_event(event) {
                    let (in_progress, has_tail) = {
                        let entry = connection.outbound.get(node).unwrap();
                        (entry.in_progress, entry.tail_sample.is_some())
                    };
                    if !in_progress {
                        // Still waiting behind earlier events; the sample
                        // is on the chain and goes out with the entry.
                        tracing::debug!(
                            channel = connection.name(),
                            "not streaming, motion event not yet dispatched"
                        );
                        return;
                    }
                    if has_tail {
                        // The staging buffer filled up earlier; the next
                        // cycle picks the new sample up from the tail.
                        tracing::debug!(
                            channel = connection.name(),
                            "not streaming, a sample tail is already pending"
                        );
                        return;
                    }
                    let (sample_index, sample_time, coords) = {
                        let motion = pool.motion(event);
                        let index = motion.samples.len() - 1;
                        let sample = &motion.samples[index];
                        (index, sample.event_time, sample.pointer_coords.clone())
                    };
                    match connection.channel.append_motion_sample(sample_time, &coords) {
                        Ok(()) => {
                            tracing::debug!(
                                channel = connection.name(),
                                "streamed new motion sample"
                            );
                            return;
                        }
                        Err(ChannelError::BufferFull) => {
                            tracing::debug!(
                                channel = connection.name(),
                                "could not stream, staging buffer is full"
                            );
                        }
                        Err(ChannelError::Consumed) => {
                            tracing::debug!(
                                channel = connection.name(),
                                "could not stream, event already consumed"
                            );
                        }
                        Err(error) => {
                            tracing::debug!(
                                channel = connection.name(),
                                %error,
                                "could not stream motion sample"
                            );
                        }
                    }
                    // Failed to stream; leave the sample as a tail for the
                    // next dispatch cycle of this entry.
                    connection.outbound.get_mut(node).unwrap().tail_sample = Some(sample_index);
                    return;
                }
            }

            // New event for this connection.
            pool.retain(event);
            let mut entry = DispatchEntry::new(event, target);
            if resume_with_appended_sample {
                // The consumer already consumed the motion event, so the
                // old dispatch entry is gone.  Start the new cycle at the
                // appended sample rather than the front of the chain.
                tracing::debug!(
                    channel = connection.name(),
                    "new dispatch cycle for samples appended after consumption"
                );
                entry.head_sample = Some(pool.motion(event).samples.len() - 1);
            }
            connection.outbound.push_back(entry);
            was_empty
        };

        if was_empty {
            Self::activate_connection(state, fd);
            self.start_dispatch_cycle(state, now, fd);
        }
    }

    /// Publish the head of the outbound queue and arm its timeout.
    ///
    /// Preconditions: the connection is NORMAL, its outbound queue is
    /// non-empty, and the head entry is not in progress.
    fn start_dispatch_cycle(&self, state: &mut DispatcherState, now: i64, fd: RawFd) {
        let publish_result = {
            let DispatcherState {
                connections, pool, ..
            } = &mut *state;
            let Some(connection) = connections.get_mut(&fd) else {
                return;
            };
            debug_assert_eq!(connection.status, ConnectionStatus::Normal);
            debug_assert!(!connection.outbound.is_empty());
            tracing::debug!(channel = connection.name(), "start dispatch cycle");
            Self::publish_head_entry(connection, pool)
        };

        if publish_result.is_err() {
            self.abort_dispatch_cycle(state, now, fd, true);
            return;
        }

        let DispatcherState {
            connections, pool, ..
        } = &mut *state;
        let Some(connection) = connections.get_mut(&fd) else {
            return;
        };
        let (event_time, timeout) = {
            let entry = connection.outbound.front().unwrap();
            (pool.get(entry.event).event_time(), entry.timeout)
        };
        connection.outbound.front_mut().unwrap().in_progress = true;
        connection.last_event_time = event_time;
        connection.last_dispatch_time = now;
        connection.next_timeout_time = match timeout {
            Some(timeout) => now.saturating_add(timeout.as_nanos() as i64),
            None => i64::MAX,
        };
        self.on_dispatch_cycle_started(now, connection);
    }

    fn publish_head_entry(
        connection: &mut Connection,
        pool: &EventPool,
    ) -> Result<(), ChannelError> {
        let head_id = connection.outbound.front_id().unwrap();
        let (event, target_flags, x_offset, y_offset, head_sample) = {
            let entry = connection.outbound.front().unwrap();
            debug_assert!(!entry.in_progress);
            (
                entry.event,
                entry.target_flags,
                entry.x_offset,
                entry.y_offset,
                entry.head_sample,
            )
        };

        match pool.get(event) {
            EventEntry::Key(key) => {
                let mut flags = key.flags;
                if target_flags.contains(TargetFlags::CANCEL) {
                    flags |= KeyFlags::CANCELED;
                }
                let published = PublishedKey {
                    device_id: key.device_id,
                    source: key.source,
                    action: key.action,
                    flags,
                    key_code: key.key_code,
                    scan_code: key.scan_code,
                    meta_state: key.meta_state,
                    repeat_count: key.repeat_count,
                    down_time: key.down_time,
                    event_time: key.event_time,
                };
                if let Err(error) = connection.channel.publish_key_event(&published) {
                    tracing::error!(
                        channel = connection.name(),
                        %error,
                        "could not publish key event"
                    );
                    return Err(error);
                }
            }
            EventEntry::Motion(motion) => {
                let mut action = motion.action;
                if target_flags.contains(TargetFlags::OUTSIDE) {
                    action = MotionAction::Outside;
                }
                if target_flags.contains(TargetFlags::CANCEL) {
                    action = MotionAction::Cancel;
                }
                let header = PublishedMotion {
                    device_id: motion.device_id,
                    source: motion.source,
                    action,
                    edge_flags: motion.edge_flags,
                    meta_state: motion.meta_state,
                    x_offset,
                    y_offset,
                    x_precision: motion.x_precision,
                    y_precision: motion.y_precision,
                    down_time: motion.down_time,
                    pointer_ids: motion.pointer_ids.clone(),
                };

                // A previous cycle may have been cut short by a full
                // staging buffer; resume from the recorded head sample.
                let first = head_sample.unwrap_or(0);
                let sample = &motion.samples[first];
                if let Err(error) = connection.channel.publish_motion_event(
                    &header,
                    sample.event_time,
                    &sample.pointer_coords,
                ) {
                    tracing::error!(
                        channel = connection.name(),
                        %error,
                        "could not publish motion event"
                    );
                    return Err(error);
                }

                let mut tail = None;
                for index in first + 1..motion.samples.len() {
                    let sample = &motion.samples[index];
                    match connection
                        .channel
                        .append_motion_sample(sample.event_time, &sample.pointer_coords)
                    {
                        Ok(()) => {}
                        Err(ChannelError::BufferFull) => {
                            tracing::debug!(
                                channel = connection.name(),
                                "staging buffer full, remaining samples go out next cycle"
                            );
                            tail = Some(index);
                            break;
                        }
                        Err(error) => {
                            tracing::error!(
                                channel = connection.name(),
                                %error,
                                "could not append motion sample"
                            );
                            return Err(error);
                        }
                    }
                }
                connection.outbound.get_mut(head_id).unwrap().tail_sample = tail;
            }
            EventEntry::ConfigurationChange(_) => {
                unreachable!("configuration changes are never dispatched to connections")
            }
        }

        if let Err(error) = connection.channel.send_dispatch_signal() {
            tracing::error!(
                channel = connection.name(),
                %error,
                "could not send dispatch signal"
            );
            return Err(error);
        }
        Ok(())
    }

    /// Consumer acknowledged the in-flight event: recover from ANR if
    /// needed, reset the publisher, then finish or resume the head entry
    /// and start the next cycle if more is queued.
    fn finish_dispatch_cycle(&self, state: &mut DispatcherState, now: i64, fd: RawFd) {
        enum Step {
            Done,
            ResetFailed,
            Drain,
        }

        let step = {
            let Some(connection) = state.connections.get_mut(&fd) else {
                return;
            };
            if connection.status == ConnectionStatus::Broken {
                Step::Done
            } else {
                tracing::debug!(
                    channel = connection.name(),
                    since_event_ms = connection.event_latency_millis(now),
                    since_dispatch_ms = connection.dispatch_latency_millis(now),
                    "finish dispatch cycle"
                );
                connection.next_timeout_time = i64::MAX;

                let recovered = connection.status == ConnectionStatus::NotResponding;
                if recovered {
                    connection.status = ConnectionStatus::Normal;
                }
                self.on_dispatch_cycle_finished(now, connection, recovered);

                // Reset now so the publisher can release staging resources
                // while waiting for the next cycle.
                match connection.channel.reset() {
                    Ok(()) => Step::Drain,
                    Err(error) => {
                        tracing::error!(
                            channel = connection.name(),
                            %error,
                            "could not reset publisher"
                        );
                        Step::ResetFailed
                    }
                }
            }
        };
        match step {
            Step::Done => return,
            Step::ResetFailed => {
                self.abort_dispatch_cycle(state, now, fd, true);
                return;
            }
            Step::Drain => {}
        }

        loop {
            enum Next {
                Release(EventId),
                Restart,
                Empty,
            }

            let next = {
                let Some(connection) = state.connections.get_mut(&fd) else {
                    return;
                };
                match connection.outbound.front_mut() {
                    None => Next::Empty,
                    Some(head) if head.in_progress => {
                        if head.tail_sample.is_some() {
                            // Undispatched samples remain: reuse the entry
                            // and start a new cycle from the tail.
                            head.head_sample = head.tail_sample.take();
                            head.in_progress = false;
                            Next::Restart
                        } else {
                            let entry = connection.outbound.pop_front().unwrap();
                            Next::Release(entry.event)
                        }
                    }
                    // A head that is not in progress means the in-flight
                    // entry was aborted out from under us; just start the
                    // next one.
                    Some(_) => Next::Restart,
                }
            };

            match next {
                Next::Release(event) => {
                    state.pool.release(event);
                }
                Next::Restart => {
                    self.start_dispatch_cycle(state, now, fd);
                    return;
                }
                Next::Empty => break,
            }
        }

        Self::deactivate_connection(state, fd);
    }

    /// Declare the connection not responding: abort its outbound queue and
    /// wait for a late finished signal to recover it.  Returns whether the
    /// connection was deactivated.
    fn timeout_dispatch_cycle(&self, state: &mut DispatcherState, now: i64, fd: RawFd) -> bool {
        let Some(connection) = state.connections.get_mut(&fd) else {
            return false;
        };
        if connection.status != ConnectionStatus::Normal {
            return false;
        }
        tracing::debug!(channel = connection.name(), "timeout dispatch cycle");
        connection.status = ConnectionStatus::NotResponding;
        connection.last_anr_time = now;
        let deactivated = self.abort_dispatch_cycle(state, now, fd, false);
        if let Some(connection) = state.connections.get(&fd) {
            self.on_dispatch_cycle_anr(now, connection);
        }
        deactivated
    }

    /// Drop the connection's entire outbound queue.  With `broken` the
    /// connection additionally becomes terminally BROKEN (unless it is a
    /// zombie being torn down, which supersedes).  Returns true unless the
    /// connection was already broken.
    fn abort_dispatch_cycle(
        &self,
        state: &mut DispatcherState,
        now: i64,
        fd: RawFd,
        broken: bool,
    ) -> bool {
        let DispatcherState {
            connections,
            pool,
            active,
            ..
        } = &mut *state;
        let Some(connection) = connections.get_mut(&fd) else {
            return false;
        };
        if connection.status == ConnectionStatus::Broken {
            return false;
        }
        tracing::debug!(channel = connection.name(), broken, "abort dispatch cycle");

        connection.next_timeout_time = i64::MAX;
        while let Some(entry) = connection.outbound.pop_front() {
            pool.release(entry.event);
        }
        active.retain(|&active_fd| active_fd != fd);

        if broken && connection.status != ConnectionStatus::Zombie {
            connection.status = ConnectionStatus::Broken;
            self.on_dispatch_cycle_broken(now, connection);
        }
        true
    }

    fn activate_connection(state: &mut DispatcherState, fd: RawFd) {
        if !state.active.contains(&fd) {
            state.active.push(fd);
        }
    }

    fn deactivate_connection(state: &mut DispatcherState, fd: RawFd) {
        state.active.retain(|&active_fd| active_fd != fd);
    }

    fn reset_key_repeat(state: &mut DispatcherState) {
        if let Some(last) = state.key_repeat.last_key.take() {
            state.pool.release(last);
        }
    }

    // =========================================================================
    // Receive callback
    // =========================================================================

    /// Invoked by the poll loop when a connection's finished-signal fd is
    /// ready.  Returns whether to keep the fd registered.
    fn handle_receive_callback(&self, fd: RawFd, events: FdEvents) -> bool {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        if !state.connections.contains_key(&fd) {
            tracing::error!(fd, ?events, "spurious receive callback for unknown input channel");
            return false;
        }
        let now = self.clock.now();

        if events.intersects(FdEvents::ERROR | FdEvents::HANGUP | FdEvents::INVALID) {
            tracing::error!(
                channel = state.connections[&fd].name(),
                ?events,
                "consumer closed input channel or an error occurred"
            );
            self.abort_dispatch_cycle(state, now, fd, true);
            return false;
        }
        if !events.contains(FdEvents::INPUT) {
            tracing::warn!(
                channel = state.connections[&fd].name(),
                ?events,
                "spurious receive callback for unhandled poll event"
            );
            return true;
        }

        if let Err(error) = state.connections[&fd].channel.receive_finished_signal() {
            tracing::error!(
                channel = state.connections[&fd].name(),
                %error,
                "failed to receive finished signal"
            );
            self.abort_dispatch_cycle(state, now, fd, true);
            return false;
        }

        self.finish_dispatch_cycle(state, now, fd);
        true
    }

    // =========================================================================
    // Producer intake
    // =========================================================================

    pub fn notify_configuration_changed(
        &self,
        event_time: i64,
        touch_screen_config: i32,
        keyboard_config: i32,
        navigation_config: i32,
    ) {
        tracing::debug!(event_time, "notify configuration changed");
        let was_empty;
        {
            let mut state = self.state.lock().unwrap();
            let id = state.pool.obtain_configuration_change(ConfigurationChange {
                event_time,
                touch_screen_config,
                keyboard_config,
                navigation_config,
            });
            was_empty = state.inbound.is_empty();
            state.inbound.push_back(id);
        }
        if was_empty {
            self.looper.wake();
        }
    }

    /// Lid switch changes skip the queue entirely and go straight to the
    /// policy on the calling thread.
    pub fn notify_lid_switch_changed(&self, event_time: i64, open: bool) {
        tracing::debug!(event_time, open, "notify lid switch changed");
        self.policy.notify_lid_switch_changed(event_time, open);
    }

    /// An app switch is imminent: drop the movement keys that piled up at
    /// the back of the inbound queue, scanning until the first
    /// non-movement key.  Motion entries are traversed untouched.
    pub fn notify_app_switch_coming(&self, event_time: i64) {
        tracing::debug!(event_time, "notify app switch coming");
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let mut cursor = state.inbound.back_id();
        while let Some(node) = cursor {
            let prev = state.inbound.prev_id(node);
            let id = *state.inbound.get(node).unwrap();
            if let EventEntry::Key(key) = state.pool.get(id) {
                if is_movement_key(key.key_code) {
                    tracing::debug!(
                        key_code = key.key_code,
                        action = ?key.action,
                        "dropping queued movement key before app switch"
                    );
                    state.inbound.remove(node);
                    state.pool.release(id);
                } else {
                    break;
                }
            }
            cursor = prev;
        }
    }

    /// Queue a key event.  `repeat_count` is assigned by the dispatcher.
    pub fn notify_key(&self, key: KeyEvent) {
        tracing::debug!(
            device_id = key.device_id,
            key_code = key.key_code,
            action = ?key.action,
            event_time = key.event_time,
            "notify key"
        );
        let was_empty;
        {
            let mut state = self.state.lock().unwrap();
            let mut key = key;
            key.repeat_count = 0;
            let id = state.pool.obtain_key(key);
            was_empty = state.inbound.is_empty();
            state.inbound.push_back(id);
        }
        if was_empty {
            self.looper.wake();
        }
    }

    /// Queue a motion event carrying its first sample.  Move events are
    /// batched onto a compatible pending motion, or streamed into an
    /// in-flight synchronous dispatch, before a new entry is considered.
    pub fn notify_motion(&self, motion: MotionEvent) {
        tracing::debug!(
            device_id = motion.device_id,
            action = ?motion.action,
            pointer_count = motion.pointer_count(),
            event_time = motion.event_time,
            "notify motion"
        );
        debug_assert_eq!(motion.samples.len(), 1);

        let was_empty;
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;

            if motion.action == MotionAction::Move && self.try_batch_or_stream(state, &motion) {
                return;
            }

            was_empty = state.inbound.is_empty();
            let id = state.pool.obtain_motion(motion);
            state.inbound.push_back(id);
        }
        if was_empty {
            self.looper.wake();
        }
    }

    /// Batching and streaming fast paths for move samples.  Returns true
    /// when the sample was absorbed and no new entry is needed.
    fn try_batch_or_stream(&self, state: &mut DispatcherState, motion: &MotionEvent) -> bool {
        // Batching: append to the most recent pending motion for this
        // device.  A non-move or shape-changed motion in between means no
        // more samples can join until a new event starts.
        let mut batch_target = None;
        for (_, &id) in state.inbound.iter_rev() {
            let EventEntry::Motion(queued) = state.pool.get(id) else {
                continue;
            };
            if queued.device_id != motion.device_id {
                continue;
            }
            if queued.action != MotionAction::Move
                || queued.pointer_count() != motion.pointer_count()
            {
                return false;
            }
            batch_target = Some(id);
            break;
        }
        if let Some(id) = batch_target {
            state.pool.append_motion_sample(id, motion.samples[0].clone());
            tracing::debug!(
                device_id = motion.device_id,
                "appended move sample to pending inbound motion"
            );
            return true;
        }

        // Streaming: nothing pending inbound for this device, so look for
        // a synchronously dispatched move among the active connections and
        // push the sample straight through the publisher.  The sync entry
        // of an outbound queue is always its tail, which also guarantees
        // the resolved target set is still the current one.
        let mut stream_target = None;
        for &fd in &state.active {
            let Some(connection) = state.connections.get(&fd) else {
                continue;
            };
            let Some(tail) = connection.outbound.back() else {
                continue;
            };
            if !tail.target_flags.contains(TargetFlags::SYNC) {
                continue;
            }
            let EventEntry::Motion(synced) = state.pool.get(tail.event) else {
                return false;
            };
            if synced.action != MotionAction::Move
                || synced.device_id != motion.device_id
                || synced.pointer_count() != motion.pointer_count()
            {
                return false;
            }
            stream_target = Some(tail.event);
            break;
        }
        if let Some(id) = stream_target {
            // Append exactly once to the shared motion entry, then resume
            // dispatch for every current target.
            state.pool.append_motion_sample(id, motion.samples[0].clone());
            tracing::debug!(
                device_id = motion.device_id,
                "streaming move sample into in-flight sync dispatch"
            );
            let now = self.clock.now();
            self.dispatch_event_to_current_targets(state, now, id, true);
            return true;
        }

        false
    }

    // =========================================================================
    // Channel management
    // =========================================================================

    pub fn register_input_channel(&self, channel: Arc<InputChannel>) -> Result<()> {
        let fd = channel.receive_fd();
        {
            let mut state = self.state.lock().unwrap();
            if state.connections.contains_key(&fd) {
                tracing::warn!(
                    channel = channel.name(),
                    "attempted to register an already registered input channel"
                );
                return Err(RegisterError::AlreadyRegistered(channel.name().to_string()));
            }
            let connection = Connection::new(channel.clone());
            if let Err(source) = connection.initialize() {
                tracing::error!(
                    channel = channel.name(),
                    error = %source,
                    "failed to initialize input publisher"
                );
                return Err(RegisterError::ChannelInit {
                    name: channel.name().to_string(),
                    source,
                });
            }
            state.connections.insert(fd, connection);
        }

        let dispatcher = self.self_ref.clone();
        self.looper.set_callback(
            fd,
            FdEvents::INPUT,
            Box::new(move |fd, events| match dispatcher.upgrade() {
                Some(dispatcher) => dispatcher.handle_receive_callback(fd, events),
                None => false,
            }),
        );
        Ok(())
    }

    pub fn unregister_input_channel(&self, channel: &InputChannel) -> Result<()> {
        let fd = channel.receive_fd();
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            if !state.connections.contains_key(&fd) {
                tracing::warn!(
                    channel = channel.name(),
                    "attempted to unregister an input channel that is not registered"
                );
                return Err(RegisterError::NotRegistered(channel.name().to_string()));
            }
            let now = self.clock.now();
            state.connections.get_mut(&fd).unwrap().status = ConnectionStatus::Zombie;
            self.abort_dispatch_cycle(state, now, fd, true);
            state.connections.remove(&fd);
        }
        self.looper.remove_callback(fd);

        // Removing the connection may have released the sync gate.
        self.looper.wake();
        Ok(())
    }

    // =========================================================================
    // Cycle notifications
    // =========================================================================

    fn on_dispatch_cycle_started(&self, _now: i64, connection: &Connection) {
        self.observer.on_dispatch_cycle_started(connection.name());
    }

    fn on_dispatch_cycle_finished(
        &self,
        now: i64,
        connection: &Connection,
        recovered_from_anr: bool,
    ) {
        if recovered_from_anr {
            tracing::info!(
                channel = connection.name(),
                since_event_ms = connection.event_latency_millis(now),
                since_dispatch_ms = connection.dispatch_latency_millis(now),
                since_anr_ms = connection.anr_latency_millis(now),
                "recovered from ANR"
            );
        }
        self.observer
            .on_dispatch_cycle_finished(connection.name(), recovered_from_anr);
    }

    fn on_dispatch_cycle_anr(&self, now: i64, connection: &Connection) {
        tracing::info!(
            channel = connection.name(),
            since_event_ms = connection.event_latency_millis(now),
            since_dispatch_ms = connection.dispatch_latency_millis(now),
            "not responding"
        );
        self.observer.on_dispatch_cycle_anr(connection.name());
    }

    fn on_dispatch_cycle_broken(&self, _now: i64, connection: &Connection) {
        tracing::error!(
            channel = connection.name(),
            "channel is unrecoverably broken and will be disposed"
        );
        self.observer.on_dispatch_cycle_broken(connection.name());
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

// ============================================================================
// Dispatch thread
// ============================================================================

/// Dedicated worker thread looping [`Dispatcher::dispatch_once`].
pub struct DispatcherThread {
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DispatcherThread {
    pub fn start(dispatcher: Arc<Dispatcher>) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let worker = dispatcher.clone();
        let handle = std::thread::Builder::new()
            .name("input-dispatcher".into())
            .spawn(move || {
                tracing::debug!("dispatch thread running");
                while flag.load(Ordering::Acquire) {
                    worker.dispatch_once();
                }
                tracing::debug!("dispatch thread exiting");
            })?;
        Ok(Self {
            dispatcher,
            running,
            handle: Some(handle),
        })
    }

    /// Signal the thread to exit after its current iteration and join it.
    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.dispatcher.wake();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DispatcherThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests;
