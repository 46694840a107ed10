use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::core::channel::{self, ChannelConsumer, StagedEvent};
use crate::core::event::{keycode, source, MotionSample, PointerCoords};
use crate::core::time::ManualClock;

const MS: i64 = 1_000_000;

// ============================================================================
// Test doubles
// ============================================================================

struct TestPolicy {
    targets: Mutex<Vec<InputTarget>>,
    allow_repeat: AtomicBool,
    repeat_timeout: AtomicI64,
    config_changes: Mutex<Vec<(i64, i32, i32, i32)>>,
    lid_switches: Mutex<Vec<(i64, bool)>>,
}

impl TestPolicy {
    fn new() -> Self {
        Self {
            targets: Mutex::new(Vec::new()),
            allow_repeat: AtomicBool::new(true),
            repeat_timeout: AtomicI64::new(500 * MS),
            config_changes: Mutex::new(Vec::new()),
            lid_switches: Mutex::new(Vec::new()),
        }
    }

    fn set_targets(&self, targets: Vec<InputTarget>) {
        *self.targets.lock().unwrap() = targets;
    }

    fn set_repeat_timeout(&self, timeout: i64) {
        self.repeat_timeout.store(timeout, Ordering::SeqCst);
    }

    fn set_allow_repeat(&self, allow: bool) {
        self.allow_repeat.store(allow, Ordering::SeqCst);
    }
}

impl DispatchPolicy for TestPolicy {
    fn allow_key_repeat(&self) -> bool {
        self.allow_repeat.load(Ordering::SeqCst)
    }

    fn key_repeat_timeout(&self) -> i64 {
        self.repeat_timeout.load(Ordering::SeqCst)
    }

    fn notify_configuration_changed(
        &self,
        event_time: i64,
        touch_screen_config: i32,
        keyboard_config: i32,
        navigation_config: i32,
    ) {
        self.config_changes.lock().unwrap().push((
            event_time,
            touch_screen_config,
            keyboard_config,
            navigation_config,
        ));
    }

    fn notify_lid_switch_changed(&self, event_time: i64, open: bool) {
        self.lid_switches.lock().unwrap().push((event_time, open));
    }

    fn key_event_targets(
        &self,
        _event: &KeyEventView,
        _policy_flags: u32,
        targets: &mut Vec<InputTarget>,
    ) {
        targets.extend(self.targets.lock().unwrap().iter().cloned());
    }

    fn motion_event_targets(
        &self,
        _event: &MotionEventView,
        _policy_flags: u32,
        targets: &mut Vec<InputTarget>,
    ) {
        targets.extend(self.targets.lock().unwrap().iter().cloned());
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Cycle {
    Started(String),
    Finished(String, bool),
    Anr(String),
    Broken(String),
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<Cycle>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<Cycle> {
        self.events.lock().unwrap().clone()
    }
}

impl DispatchObserver for RecordingObserver {
    fn on_dispatch_cycle_started(&self, channel: &str) {
        self.events
            .lock()
            .unwrap()
            .push(Cycle::Started(channel.to_string()));
    }

    fn on_dispatch_cycle_finished(&self, channel: &str, recovered_from_anr: bool) {
        self.events
            .lock()
            .unwrap()
            .push(Cycle::Finished(channel.to_string(), recovered_from_anr));
    }

    fn on_dispatch_cycle_anr(&self, channel: &str) {
        self.events
            .lock()
            .unwrap()
            .push(Cycle::Anr(channel.to_string()));
    }

    fn on_dispatch_cycle_broken(&self, channel: &str) {
        self.events
            .lock()
            .unwrap()
            .push(Cycle::Broken(channel.to_string()));
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    dispatcher: Arc<Dispatcher>,
    policy: Arc<TestPolicy>,
    observer: Arc<RecordingObserver>,
    clock: Arc<ManualClock>,
}

fn fixture() -> Fixture {
    let policy = Arc::new(TestPolicy::new());
    let observer = Arc::new(RecordingObserver::default());
    let clock = Arc::new(ManualClock::new(0));
    let dispatcher = Dispatcher::with_hooks(policy.clone(), observer.clone(), clock.clone())
        .expect("create dispatcher");
    Fixture {
        dispatcher,
        policy,
        observer,
        clock,
    }
}

impl Fixture {
    /// Run one dispatch iteration without risking an indefinite poll.
    fn pump(&self) {
        self.dispatcher.wake();
        self.dispatcher.dispatch_once();
    }

    fn register(&self, capacity: usize) -> (Arc<InputChannel>, ChannelConsumer) {
        self.register_named("window", capacity)
    }

    fn register_named(&self, name: &str, capacity: usize) -> (Arc<InputChannel>, ChannelConsumer) {
        let (input_channel, consumer) = channel::pair(name, capacity).expect("create channel");
        let input_channel = Arc::new(input_channel);
        self.dispatcher
            .register_input_channel(input_channel.clone())
            .expect("register channel");
        (input_channel, consumer)
    }

    fn sync_target(&self, channel: &Arc<InputChannel>, timeout_ms: u64) -> InputTarget {
        InputTarget {
            channel: channel.clone(),
            flags: TargetFlags::SYNC,
            x_offset: 0.0,
            y_offset: 0.0,
            timeout: Some(Duration::from_millis(timeout_ms)),
        }
    }

    /// Verify the active-set bookkeeping: every active connection has a
    /// non-empty outbound queue and vice versa.
    fn assert_active_invariant(&self) {
        let state = self.dispatcher.state.lock().unwrap();
        for fd in &state.active {
            assert!(
                !state.connections[fd].outbound.is_empty(),
                "active connection with empty outbound queue"
            );
        }
        for (fd, connection) in &state.connections {
            if connection.outbound.is_empty() {
                assert!(
                    !state.active.contains(fd),
                    "idle connection left in the active set"
                );
            }
            let in_progress: Vec<_> = connection
                .outbound
                .iter()
                .filter(|(_, entry)| entry.in_progress)
                .map(|(id, _)| id)
                .collect();
            assert!(in_progress.len() <= 1, "multiple entries in progress");
            if let Some(&id) = in_progress.first() {
                assert_eq!(
                    Some(id),
                    connection.outbound.front_id(),
                    "in-progress entry is not the queue head"
                );
            }
        }
    }

    fn live_entries(&self) -> usize {
        self.dispatcher.state.lock().unwrap().pool.live_entries()
    }

    fn inbound_len(&self) -> usize {
        self.dispatcher.state.lock().unwrap().inbound.len()
    }
}

fn ack(consumer: &ChannelConsumer) -> StagedEvent {
    consumer
        .receive_dispatch_signal()
        .expect("dispatch signal expected");
    let staged = consumer.consume().expect("staged event expected");
    consumer
        .send_finished_signal()
        .expect("send finished signal");
    staged
}

fn staged_key(staged: &StagedEvent) -> &channel::PublishedKey {
    match staged {
        StagedEvent::Key(key) => key,
        other => panic!("expected staged key, got {:?}", other),
    }
}

fn staged_motion(staged: &StagedEvent) -> &channel::StagedMotion {
    match staged {
        StagedEvent::Motion(motion) => motion,
        other => panic!("expected staged motion, got {:?}", other),
    }
}

fn key_down(event_time: i64, key_code: i32) -> KeyEvent {
    KeyEvent {
        event_time,
        device_id: 1,
        source: source::KEYBOARD,
        policy_flags: 0,
        action: KeyAction::Down,
        flags: KeyFlags::empty(),
        key_code,
        scan_code: key_code + 8,
        meta_state: 0,
        repeat_count: 0,
        down_time: event_time,
    }
}

fn key_up(event_time: i64, key_code: i32) -> KeyEvent {
    KeyEvent {
        action: KeyAction::Up,
        ..key_down(event_time, key_code)
    }
}

fn move_motion(event_time: i64, device_id: i32, x: f32, y: f32) -> MotionEvent {
    MotionEvent {
        event_time,
        device_id,
        source: source::TOUCHSCREEN,
        policy_flags: 0,
        action: MotionAction::Move,
        meta_state: 0,
        edge_flags: 0,
        x_precision: 1.0,
        y_precision: 1.0,
        down_time: event_time,
        pointer_ids: vec![0],
        samples: vec![MotionSample {
            event_time,
            pointer_coords: vec![PointerCoords {
                x,
                y,
                pressure: 1.0,
                size: 0.1,
            }],
        }],
    }
}

fn down_motion(event_time: i64, device_id: i32, x: f32, y: f32) -> MotionEvent {
    MotionEvent {
        action: MotionAction::Down,
        ..move_motion(event_time, device_id, x, y)
    }
}

// ============================================================================
// Scenario: keys
// ============================================================================

#[test]
fn test_simple_key_down_up() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 500)]);

    f.dispatcher.notify_key(key_down(1_000, 29));
    f.dispatcher.notify_key(key_up(1_020, 29));

    f.pump();
    let down = ack(&consumer);
    assert_eq!(staged_key(&down).action, KeyAction::Down);
    assert_eq!(staged_key(&down).key_code, 29);
    f.assert_active_invariant();

    f.pump(); // finish signal -> down cycle completes
    f.pump(); // key up dispatched
    let up = ack(&consumer);
    assert_eq!(staged_key(&up).action, KeyAction::Up);
    f.pump(); // finish signal -> up cycle completes

    assert_eq!(
        f.observer.events(),
        vec![
            Cycle::Started("window".into()),
            Cycle::Finished("window".into(), false),
            Cycle::Started("window".into()),
            Cycle::Finished("window".into(), false),
        ]
    );
    // Key up reset the repeat state; every entry is released.
    assert_eq!(f.live_entries(), 0);
    f.assert_active_invariant();
}

#[test]
fn test_sync_gate_holds_back_inbound() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 500)]);

    f.dispatcher.notify_key(key_down(0, 29));
    f.dispatcher.notify_key(key_up(20, 29));

    f.pump();
    assert_eq!(f.inbound_len(), 1);

    // Without a finished signal the sync gate stays closed: the key up
    // must not start dispatching.
    f.pump();
    f.pump();
    assert_eq!(f.inbound_len(), 1);
    assert_eq!(f.observer.events().len(), 1);

    consumer.consume().expect("down staged");
    consumer.send_finished_signal().expect("finish");
    f.pump();
    f.pump();
    assert_eq!(f.inbound_len(), 0);
}

#[test]
fn test_key_repeat_synthesis() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 5_000)]);
    f.policy.set_repeat_timeout(50 * MS);

    f.dispatcher.notify_key(key_down(0, 29));
    f.pump();
    assert_eq!(staged_key(&ack(&consumer)).repeat_count, 0);
    f.pump(); // finish

    f.clock.set(60 * MS);
    f.pump(); // synthesize first repeat
    let first = ack(&consumer);
    assert_eq!(staged_key(&first).repeat_count, 1);
    assert_eq!(staged_key(&first).event_time, 60 * MS);
    assert_eq!(staged_key(&first).down_time, 60 * MS);
    f.pump(); // finish

    f.clock.set(120 * MS);
    f.pump(); // second repeat, re-armed 50ms after the first
    let second = ack(&consumer);
    assert_eq!(staged_key(&second).repeat_count, 2);
    assert_eq!(staged_key(&second).event_time, 120 * MS);
    f.pump();
}

#[test]
fn test_driver_repeat_disables_synthesis() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 5_000)]);
    f.policy.set_repeat_timeout(50 * MS);

    f.dispatcher.notify_key(key_down(0, 29));
    f.pump();
    ack(&consumer);
    f.pump();

    // Second identical down before the repeat timeout: the driver is
    // auto-repeating.
    f.dispatcher.notify_key(key_down(40 * MS, 29));
    f.pump();
    let repeated = ack(&consumer);
    assert_eq!(staged_key(&repeated).repeat_count, 1);
    f.pump();

    {
        let state = f.dispatcher.state.lock().unwrap();
        assert_eq!(state.key_repeat.next_repeat_time, i64::MAX);
    }

    // Long after any repeat timeout, nothing is synthesized.
    f.clock.set(10_000 * MS);
    f.pump();
    f.pump();
    let started = f
        .observer
        .events()
        .iter()
        .filter(|event| matches!(event, Cycle::Started(_)))
        .count();
    assert_eq!(started, 2);
}

#[test]
fn test_repeat_state_dropped_while_disallowed() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 5_000)]);

    f.dispatcher.notify_key(key_down(0, 29));
    f.pump();
    ack(&consumer);
    f.pump();
    {
        let state = f.dispatcher.state.lock().unwrap();
        assert!(state.key_repeat.last_key.is_some());
    }

    f.policy.set_allow_repeat(false);
    f.pump();
    {
        let state = f.dispatcher.state.lock().unwrap();
        assert!(state.key_repeat.last_key.is_none());
    }
    assert_eq!(f.live_entries(), 0);
}

#[test]
fn test_cancel_flag_applied_to_key() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    let mut target = f.sync_target(&channel, 500);
    target.flags |= TargetFlags::CANCEL;
    f.policy.set_targets(vec![target]);

    f.dispatcher.notify_key(key_down(0, 29));
    f.pump();
    let staged = ack(&consumer);
    assert!(staged_key(&staged).flags.contains(KeyFlags::CANCELED));
}

// ============================================================================
// Scenario: motion batching and streaming
// ============================================================================

#[test]
fn test_batching_coalesces_moves() {
    let f = fixture();

    f.dispatcher.notify_motion(move_motion(0, 1, 1.0, 1.0));
    f.dispatcher.notify_motion(move_motion(10, 1, 2.0, 2.0));

    assert_eq!(f.inbound_len(), 1);
    let state = f.dispatcher.state.lock().unwrap();
    let (_, &id) = state.inbound.iter().next().unwrap();
    let motion = state.pool.motion(id);
    assert_eq!(motion.samples.len(), 2);
    assert_eq!(motion.samples[0].event_time, 0);
    assert_eq!(motion.samples[0].pointer_coords[0].x, 1.0);
    assert_eq!(motion.samples[1].event_time, 10);
    assert_eq!(motion.samples[1].pointer_coords[0].x, 2.0);
    assert_eq!(motion.last_sample().event_time, 10);
}

#[test]
fn test_batching_keyed_by_device() {
    let f = fixture();

    f.dispatcher.notify_motion(move_motion(0, 1, 1.0, 1.0));
    f.dispatcher.notify_motion(move_motion(5, 2, 9.0, 9.0));
    f.dispatcher.notify_motion(move_motion(10, 1, 2.0, 2.0));

    // The second device's motion does not break batching for the first.
    assert_eq!(f.inbound_len(), 2);
}

#[test]
fn test_batching_stops_at_incompatible_motion() {
    let f = fixture();

    f.dispatcher.notify_motion(move_motion(0, 1, 1.0, 1.0));
    f.dispatcher.notify_motion(down_motion(5, 1, 1.0, 1.0));
    f.dispatcher.notify_motion(move_motion(10, 1, 2.0, 2.0));

    // A non-move for the same device blocks appending; a new entry is
    // queued instead.
    assert_eq!(f.inbound_len(), 3);
}

#[test]
fn test_streaming_appends_to_in_flight_dispatch() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 500)]);

    f.dispatcher.notify_motion(move_motion(0, 1, 1.0, 1.0));
    f.pump();
    assert_eq!(f.inbound_len(), 0);

    // The dispatch is in progress; a new sample streams through the
    // publisher without creating an inbound entry.
    f.dispatcher.notify_motion(move_motion(10, 1, 2.0, 2.0));
    assert_eq!(f.inbound_len(), 0);
    assert_eq!(f.live_entries(), 1);

    let staged = ack(&consumer);
    let motion = staged_motion(&staged);
    assert_eq!(motion.samples.len(), 2);
    assert_eq!(motion.samples[1].event_time, 10);
    f.pump();
    assert_eq!(f.live_entries(), 0);
}

#[test]
fn test_streaming_requires_sync_move_tail() {
    let f = fixture();
    let (channel, _consumer) = f.register(8);
    let mut target = f.sync_target(&channel, 500);
    target.flags = TargetFlags::empty();
    f.policy.set_targets(vec![target]);

    f.dispatcher.notify_motion(move_motion(0, 1, 1.0, 1.0));
    f.pump();

    // Async tail: streaming must not occur, the sample becomes a new
    // inbound entry.
    f.dispatcher.notify_motion(move_motion(10, 1, 2.0, 2.0));
    assert_eq!(f.inbound_len(), 1);
}

#[test]
fn test_streaming_split_on_full_buffer() {
    let f = fixture();
    let (channel, consumer) = f.register(2);
    f.policy.set_targets(vec![f.sync_target(&channel, 500)]);

    f.dispatcher.notify_motion(move_motion(0, 1, 0.0, 0.0));
    f.pump();
    f.dispatcher.notify_motion(move_motion(10, 1, 1.0, 1.0));
    // Staging holds two samples now; the third cannot fit and is recorded
    // as the tail for the next cycle.
    f.dispatcher.notify_motion(move_motion(20, 1, 2.0, 2.0));

    {
        let state = f.dispatcher.state.lock().unwrap();
        let connection = state.connections.values().next().unwrap();
        let head = connection.outbound.front().unwrap();
        assert!(head.in_progress);
        assert_eq!(head.tail_sample, Some(2));
        assert_eq!(state.pool.motion(head.event).samples.len(), 3);
    }

    let staged = ack(&consumer);
    assert_eq!(staged_motion(&staged).samples.len(), 2);

    // Finishing the first cycle immediately starts a follow-up cycle that
    // publishes the split-off tail.
    f.pump();
    let resumed = ack(&consumer);
    let motion = staged_motion(&resumed);
    assert_eq!(motion.samples.len(), 1);
    assert_eq!(motion.samples[0].event_time, 20);
    assert_eq!(motion.samples[0].pointer_coords[0].x, 2.0);
    f.pump();
    assert_eq!(f.live_entries(), 0);
    f.assert_active_invariant();
}

#[test]
fn test_streaming_after_consumption_starts_new_cycle_at_appended_sample() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 500)]);

    f.dispatcher.notify_motion(move_motion(0, 1, 0.0, 0.0));
    f.pump();

    // The consumer takes the event but has not finished it yet; the
    // streamed sample is refused and parked as the tail.
    consumer.consume().expect("staged motion");
    f.dispatcher.notify_motion(move_motion(10, 1, 1.0, 1.0));
    {
        let state = f.dispatcher.state.lock().unwrap();
        let connection = state.connections.values().next().unwrap();
        assert_eq!(connection.outbound.front().unwrap().tail_sample, Some(1));
    }

    consumer.send_finished_signal().expect("finish");
    f.pump();
    let resumed = ack(&consumer);
    let motion = staged_motion(&resumed);
    assert_eq!(motion.samples.len(), 1);
    assert_eq!(motion.samples[0].event_time, 10);
    f.pump();
    assert_eq!(f.live_entries(), 0);
}

#[test]
fn test_streaming_appends_once_for_multiple_targets() {
    let f = fixture();
    let (channel_a, consumer_a) = f.register_named("window-a", 8);
    let (channel_b, consumer_b) = f.register_named("window-b", 8);
    f.policy.set_targets(vec![
        f.sync_target(&channel_a, 500),
        f.sync_target(&channel_b, 500),
    ]);

    f.dispatcher.notify_motion(move_motion(0, 1, 0.0, 0.0));
    f.pump();

    // One consumer takes its copy early; the other leaves it staged.
    consumer_a.consume().expect("staged motion");

    f.dispatcher.notify_motion(move_motion(10, 1, 1.0, 1.0));

    {
        let state = f.dispatcher.state.lock().unwrap();
        // The shared motion entry grew by exactly one sample.
        let connection_b = state
            .connections
            .values()
            .find(|connection| connection.name() == "window-b")
            .unwrap();
        let event = connection_b.outbound.front().unwrap().event;
        assert_eq!(state.pool.motion(event).samples.len(), 2);
        // Target A could not stream (already consumed) and waits on its
        // recorded tail; target B received the sample directly.
        let connection_a = state
            .connections
            .values()
            .find(|connection| connection.name() == "window-a")
            .unwrap();
        assert_eq!(connection_a.outbound.front().unwrap().tail_sample, Some(1));
    }

    let staged_b = consumer_b.consume().expect("staged motion");
    assert_eq!(staged_motion(&staged_b).samples.len(), 2);
}

#[test]
fn test_streaming_to_target_that_already_finished() {
    let f = fixture();
    let (channel_a, consumer_a) = f.register_named("window-a", 8);
    let (channel_b, consumer_b) = f.register_named("window-b", 8);
    f.policy.set_targets(vec![
        f.sync_target(&channel_a, 500),
        f.sync_target(&channel_b, 500),
    ]);

    f.dispatcher.notify_motion(move_motion(0, 1, 0.0, 0.0));
    f.pump();

    // Window A consumes and acknowledges; its dispatch entry is released
    // while window B still holds the sync tail.
    ack(&consumer_a);
    f.pump();

    f.dispatcher.notify_motion(move_motion(10, 1, 1.0, 1.0));

    // A gets a brand new cycle that starts at the appended sample rather
    // than replaying the one it already consumed.
    let staged_a = consumer_a.consume().expect("staged motion");
    let motion_a = staged_motion(&staged_a);
    assert_eq!(motion_a.samples.len(), 1);
    assert_eq!(motion_a.samples[0].event_time, 10);

    // B streams the sample into its still-open cycle.
    let staged_b = consumer_b.consume().expect("staged motion");
    assert_eq!(staged_motion(&staged_b).samples.len(), 2);
}

#[test]
fn test_motion_offsets_applied_per_target() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    let mut target = f.sync_target(&channel, 500);
    target.x_offset = -30.0;
    target.y_offset = 12.5;
    f.policy.set_targets(vec![target]);

    f.dispatcher.notify_motion(down_motion(0, 1, 100.0, 200.0));
    f.pump();
    let staged = ack(&consumer);
    let motion = staged_motion(&staged);
    assert_eq!(motion.event.x_offset, -30.0);
    assert_eq!(motion.event.y_offset, 12.5);
    assert_eq!(motion.event.action, MotionAction::Down);
}

#[test]
fn test_outside_flag_overrides_motion_action() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    let mut target = f.sync_target(&channel, 500);
    target.flags |= TargetFlags::OUTSIDE;
    f.policy.set_targets(vec![target]);

    f.dispatcher.notify_motion(down_motion(0, 1, 5.0, 5.0));
    f.pump();
    let staged = ack(&consumer);
    assert_eq!(staged_motion(&staged).event.action, MotionAction::Outside);
}

// ============================================================================
// Scenario: ANR, broken channels, teardown
// ============================================================================

#[test]
fn test_anr_and_recovery() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 100)]);
    f.policy.set_repeat_timeout(3_600_000 * MS);

    f.dispatcher.notify_key(key_down(0, 29));
    f.pump();
    f.assert_active_invariant();

    // No acknowledgment before the 100ms deadline.
    f.clock.set(100 * MS);
    f.pump();
    {
        let state = f.dispatcher.state.lock().unwrap();
        let connection = state.connections.values().next().unwrap();
        assert_eq!(connection.status, ConnectionStatus::NotResponding);
        assert!(connection.outbound.is_empty());
        assert!(state.active.is_empty());
    }
    assert_eq!(
        f.observer.events(),
        vec![Cycle::Started("window".into()), Cycle::Anr("window".into())]
    );

    // The consumer eventually comes back and acknowledges.
    f.clock.set(500 * MS);
    consumer.consume().expect("staged key");
    consumer.send_finished_signal().expect("finish");
    f.pump();
    {
        let state = f.dispatcher.state.lock().unwrap();
        let connection = state.connections.values().next().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Normal);
    }
    assert_eq!(
        f.observer.events().last(),
        Some(&Cycle::Finished("window".into(), true))
    );
}

#[test]
fn test_transport_failure_breaks_connection() {
    let f = fixture();
    let (channel, consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 500)]);

    // Kill the consumer half so the dispatch signal write fails.
    drop(consumer);
    f.dispatcher.notify_key(key_down(0, 29));
    f.pump();

    {
        let state = f.dispatcher.state.lock().unwrap();
        let connection = state.connections.values().next().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Broken);
        assert!(connection.outbound.is_empty());
        assert!(state.active.is_empty());
    }
    assert_eq!(f.observer.events(), vec![Cycle::Broken("window".into())]);

    // Finishing a broken connection is a no-op, and a second abort
    // reports that nothing was done.
    let fd = channel.receive_fd();
    let now = f.clock.now();
    {
        let mut guard = f.dispatcher.state.lock().unwrap();
        let state = &mut *guard;
        f.dispatcher.finish_dispatch_cycle(state, now, fd);
        assert!(!f.dispatcher.abort_dispatch_cycle(state, now, fd, true));
        let connection = state.connections.values().next().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Broken);
    }
    assert_eq!(f.observer.events().len(), 1);

    // Only the repeat reference remains until further key activity.
    assert_eq!(f.live_entries(), 1);
}

#[test]
fn test_unregister_aborts_quietly() {
    let f = fixture();
    let (channel, _consumer) = f.register(8);
    f.policy.set_targets(vec![f.sync_target(&channel, 500)]);

    f.dispatcher.notify_key(key_down(0, 29));
    f.pump();

    f.dispatcher
        .unregister_input_channel(&channel)
        .expect("unregister");
    {
        let state = f.dispatcher.state.lock().unwrap();
        assert!(state.connections.is_empty());
        assert!(state.active.is_empty());
    }
    // Deliberate teardown is not a broken-channel event.
    assert!(!f
        .observer
        .events()
        .iter()
        .any(|event| matches!(event, Cycle::Broken(_))));
    // Only the key-repeat reference survives.
    assert_eq!(f.live_entries(), 1);
}

#[test]
fn test_register_and_unregister_misuse() {
    let f = fixture();
    let (channel, _consumer) = f.register(8);

    let err = f
        .dispatcher
        .register_input_channel(channel.clone())
        .unwrap_err();
    assert!(matches!(err, RegisterError::AlreadyRegistered(_)));

    f.dispatcher
        .unregister_input_channel(&channel)
        .expect("unregister");
    let err = f.dispatcher.unregister_input_channel(&channel).unwrap_err();
    assert!(matches!(err, RegisterError::NotRegistered(_)));
}

#[test]
fn test_unregistered_target_is_skipped() {
    let f = fixture();
    let (registered, consumer) = f.register(8);
    let (stranger, _stranger_consumer) = channel::pair("stranger", 8).expect("channel");
    f.policy.set_targets(vec![
        InputTarget {
            channel: Arc::new(stranger),
            flags: TargetFlags::empty(),
            x_offset: 0.0,
            y_offset: 0.0,
            timeout: None,
        },
        f.sync_target(&registered, 500),
    ]);

    f.dispatcher.notify_key(key_down(0, 29));
    f.pump();

    // The unknown channel is skipped, the registered one still receives.
    let staged = ack(&consumer);
    assert_eq!(staged_key(&staged).key_code, 29);
}

// ============================================================================
// Scenario: intake paths
// ============================================================================

#[test]
fn test_configuration_change_reaches_policy() {
    let f = fixture();
    f.dispatcher.notify_configuration_changed(42, 1, 2, 3);
    assert_eq!(f.inbound_len(), 1);
    f.pump();
    assert_eq!(
        f.policy.config_changes.lock().unwrap().as_slice(),
        &[(42, 1, 2, 3)]
    );
    assert_eq!(f.live_entries(), 0);
}

#[test]
fn test_lid_switch_bypasses_queue() {
    let f = fixture();
    f.dispatcher.notify_lid_switch_changed(7, true);
    assert_eq!(f.inbound_len(), 0);
    assert_eq!(f.policy.lid_switches.lock().unwrap().as_slice(), &[(7, true)]);
}

#[test]
fn test_app_switch_trims_trailing_movement_keys() {
    let f = fixture();

    f.dispatcher.notify_key(key_down(0, 29));
    f.dispatcher.notify_key(key_down(10, keycode::DPAD_DOWN));
    f.dispatcher.notify_motion(down_motion(20, 1, 1.0, 1.0));
    f.dispatcher.notify_key(key_down(30, keycode::DPAD_LEFT));

    f.dispatcher.notify_app_switch_coming(40);

    // Both movement keys are dropped; the motion between them is kept and
    // does not stop the scan; the ordinary key ends it.
    let state = f.dispatcher.state.lock().unwrap();
    let kinds: Vec<EventKind> = state
        .inbound
        .iter()
        .map(|(_, &id)| state.pool.get(id).kind())
        .collect();
    assert_eq!(kinds, vec![EventKind::Key, EventKind::Motion]);
    match state.pool.get(*state.inbound.front().unwrap()) {
        EventEntry::Key(key) => assert_eq!(key.key_code, 29),
        other => panic!("expected key at head, got {:?}", other.kind()),
    }
    assert_eq!(state.pool.live_entries(), 2);
}

#[test]
fn test_app_switch_trim_stops_at_ordinary_key() {
    let f = fixture();

    f.dispatcher.notify_key(key_down(0, keycode::DPAD_UP));
    f.dispatcher.notify_key(key_down(10, 29));
    f.dispatcher.notify_key(key_down(20, keycode::DPAD_RIGHT));

    f.dispatcher.notify_app_switch_coming(30);

    // Only the movement key behind the ordinary key is removed.
    let state = f.dispatcher.state.lock().unwrap();
    let codes: Vec<i32> = state
        .inbound
        .iter()
        .map(|(_, &id)| match state.pool.get(id) {
            EventEntry::Key(key) => key.key_code,
            other => panic!("unexpected entry {:?}", other.kind()),
        })
        .collect();
    assert_eq!(codes, vec![keycode::DPAD_UP, 29]);
}

// ============================================================================
// Worker thread
// ============================================================================

#[test]
fn test_dispatcher_thread_end_to_end() {
    let policy = Arc::new(TestPolicy::new());
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher = Dispatcher::with_hooks(
        policy.clone(),
        observer.clone(),
        Arc::new(MonotonicClock::new()),
    )
    .expect("create dispatcher");

    let (input_channel, consumer) = channel::pair("window", 8).expect("channel");
    let input_channel = Arc::new(input_channel);
    dispatcher
        .register_input_channel(input_channel.clone())
        .expect("register");
    policy.set_targets(vec![InputTarget {
        channel: input_channel.clone(),
        flags: TargetFlags::SYNC,
        x_offset: 0.0,
        y_offset: 0.0,
        timeout: Some(Duration::from_secs(5)),
    }]);

    let mut thread = DispatcherThread::start(dispatcher.clone()).expect("start thread");

    dispatcher.notify_key(key_down(0, 29));
    let down = ack(&consumer);
    assert_eq!(staged_key(&down).action, KeyAction::Down);

    dispatcher.notify_key(key_up(10, 29));
    let up = ack(&consumer);
    assert_eq!(staged_key(&up).action, KeyAction::Up);

    // The worker still has to observe the final finished signal.
    let mut drained = false;
    for _ in 0..200 {
        if dispatcher.state.lock().unwrap().pool.live_entries() == 0 {
            drained = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    thread.stop();
    assert!(drained, "dispatcher never drained its event pool");
}
