// Tenaya Input Dispatcher
// Copyright (c) 2026
//
// Core input event dispatcher for a mobile windowing stack.
// Raw input notifications fan out to per-window consumers over
// shared-memory style channels, with move-sample batching/streaming,
// ANR detection, and synthetic key repeat.

pub mod config;
pub mod core;
pub mod prelude;
pub mod util;
pub mod version;

// Re-export the main API at the crate root
pub use crate::config::DispatcherConfig;
pub use crate::core::channel::{
    self, ChannelConsumer, EventTransport, InputChannel, PublishedKey, PublishedMotion,
    StagedEvent, StagedMotion,
};
pub use crate::core::dispatcher::{DispatchObserver, Dispatcher, DispatcherThread};
pub use crate::core::errors::{ChannelError, RegisterError};
pub use crate::core::event::{
    keycode, source, ConfigurationChange, KeyAction, KeyEvent, KeyEventView, KeyFlags,
    MotionAction, MotionEvent, MotionEventView, MotionSample, PointerCoords,
};
pub use crate::core::policy::{DispatchPolicy, InputTarget, TargetFlags};
pub use crate::core::time::{Clock, ManualClock, MonotonicClock};
