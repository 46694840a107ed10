use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use tenaya::util::logging;
use tenaya::{
    channel, tlog, Clock, DispatchObserver, DispatchPolicy, Dispatcher, DispatcherConfig,
    DispatcherThread, InputChannel, InputTarget, KeyAction, KeyEvent, KeyEventView, KeyFlags,
    MonotonicClock, MotionAction, MotionEvent, MotionEventView, MotionSample, PointerCoords,
    StagedEvent, TargetFlags,
};

/// Policy that routes every event synchronously to a single focused window.
struct StaticPolicy {
    target: Arc<InputChannel>,
    config: DispatcherConfig,
}

impl DispatchPolicy for StaticPolicy {
    fn allow_key_repeat(&self) -> bool {
        true
    }

    fn key_repeat_timeout(&self) -> i64 {
        self.config.key_repeat_timeout_nanos()
    }

    fn notify_configuration_changed(
        &self,
        event_time: i64,
        touch_screen_config: i32,
        keyboard_config: i32,
        navigation_config: i32,
    ) {
        tracing::info!(
            event_time,
            touch_screen_config,
            keyboard_config,
            navigation_config,
            "configuration changed"
        );
    }

    fn notify_lid_switch_changed(&self, event_time: i64, open: bool) {
        tracing::info!(event_time, open, "lid switch changed");
    }

    fn key_event_targets(
        &self,
        _event: &KeyEventView,
        _policy_flags: u32,
        targets: &mut Vec<InputTarget>,
    ) {
        targets.push(self.focused_target());
    }

    fn motion_event_targets(
        &self,
        _event: &MotionEventView,
        _policy_flags: u32,
        targets: &mut Vec<InputTarget>,
    ) {
        targets.push(self.focused_target());
    }
}

impl StaticPolicy {
    fn focused_target(&self) -> InputTarget {
        InputTarget {
            channel: self.target.clone(),
            flags: TargetFlags::SYNC,
            x_offset: 0.0,
            y_offset: 0.0,
            timeout: Some(self.config.target_timeout),
        }
    }
}

/// Logs dispatch-cycle milestones for the demo service.
struct LoggingObserver;

impl DispatchObserver for LoggingObserver {
    fn on_dispatch_cycle_finished(&self, channel: &str, recovered_from_anr: bool) {
        if recovered_from_anr {
            tracing::info!(channel, "window recovered");
        }
    }

    fn on_dispatch_cycle_anr(&self, channel: &str) {
        tracing::warn!(channel, "window is not responding");
    }

    fn on_dispatch_cycle_broken(&self, channel: &str) {
        tracing::warn!(channel, "window channel broke");
    }
}

fn main() -> Result<()> {
    // Initialize logging
    // Set default log level to info
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,tenaya=debug");
    }
    // Initialize logging with standardized format
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S".to_string(),
        ))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(false)
        .init();

    tlog!(logging::MAIN, "tenaya {} starting", tenaya::version::version());

    let config = DispatcherConfig::default();
    let clock: Arc<MonotonicClock> = Arc::new(MonotonicClock::new());

    // One demo window on an in-process channel pair.
    let (input_channel, consumer) =
        channel::pair("demo-window", config.staging_capacity).context("create input channel")?;
    let input_channel = Arc::new(input_channel);

    let policy = Arc::new(StaticPolicy {
        target: input_channel.clone(),
        config: config.clone(),
    });
    let dispatcher = Dispatcher::with_hooks(policy, Arc::new(LoggingObserver), clock.clone())
        .context("create dispatcher")?;
    dispatcher
        .register_input_channel(input_channel.clone())
        .context("register input channel")?;

    // The consumer side: acknowledge every dispatched event, the way a
    // window's event loop would.
    let consumer_handle = std::thread::Builder::new()
        .name("demo-consumer".into())
        .spawn(move || {
            while consumer.receive_dispatch_signal().is_ok() {
                match consumer.consume() {
                    Ok(StagedEvent::Key(key)) => {
                        tracing::info!(
                            key_code = key.key_code,
                            action = ?key.action,
                            repeat_count = key.repeat_count,
                            "window received key"
                        );
                    }
                    Ok(StagedEvent::Motion(motion)) => {
                        let last = &motion.samples[motion.samples.len() - 1];
                        tracing::info!(
                            action = ?motion.event.action,
                            samples = motion.samples.len(),
                            x = last.pointer_coords[0].x,
                            y = last.pointer_coords[0].y,
                            "window received motion"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(%error, "consume failed");
                        break;
                    }
                }
                if consumer.send_finished_signal().is_err() {
                    break;
                }
            }
            tracing::debug!("demo consumer exiting");
        })
        .context("spawn consumer thread")?;

    let mut worker = DispatcherThread::start(dispatcher.clone()).context("start dispatch thread")?;

    // Scripted input: a key press and release, then a short touch drag.
    let key = KeyEvent {
        event_time: clock.now(),
        device_id: 1,
        source: tenaya::source::KEYBOARD,
        policy_flags: 0,
        action: KeyAction::Down,
        flags: KeyFlags::empty(),
        key_code: 29,
        scan_code: 37,
        meta_state: 0,
        repeat_count: 0,
        down_time: clock.now(),
    };
    dispatcher.notify_key(key.clone());
    std::thread::sleep(Duration::from_millis(20));
    dispatcher.notify_key(KeyEvent {
        event_time: clock.now(),
        action: KeyAction::Up,
        ..key
    });

    let down_time = clock.now();
    for step in 0..5 {
        let action = if step == 0 {
            MotionAction::Down
        } else {
            MotionAction::Move
        };
        dispatcher.notify_motion(MotionEvent {
            event_time: clock.now(),
            device_id: 2,
            source: tenaya::source::TOUCHSCREEN,
            policy_flags: 0,
            action,
            meta_state: 0,
            edge_flags: 0,
            x_precision: 1.0,
            y_precision: 1.0,
            down_time,
            pointer_ids: vec![0],
            samples: vec![MotionSample {
                event_time: clock.now(),
                pointer_coords: vec![PointerCoords {
                    x: 100.0 + 10.0 * step as f32,
                    y: 200.0,
                    pressure: 1.0,
                    size: 0.2,
                }],
            }],
        });
        std::thread::sleep(Duration::from_millis(5));
    }

    dispatcher.notify_configuration_changed(clock.now(), 1, 1, 1);
    dispatcher.notify_lid_switch_changed(clock.now(), true);

    // Let the pipeline drain, then shut down.
    std::thread::sleep(Duration::from_millis(200));
    dispatcher
        .unregister_input_channel(&input_channel)
        .context("unregister input channel")?;
    worker.stop();
    drop(worker);
    drop(dispatcher);
    drop(input_channel);
    consumer_handle
        .join()
        .map_err(|_| anyhow::anyhow!("consumer thread panicked"))?;

    tlog!(logging::MAIN, "tenaya demo complete");
    Ok(())
}
