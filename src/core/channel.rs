//! Input channel transport.
//!
//! A channel connects the dispatcher (publisher side) to one consumer
//! window in another process.  The publisher stages exactly one event at a
//! time in a bounded buffer, signals the consumer over a dispatch pipe,
//! and learns of consumption through a finished pipe.  The dispatcher keys
//! its connection table on the receive end of the finished pipe.
//!
//! [`EventTransport`] keeps the wire mechanism pluggable; [`pair`] builds
//! the in-process implementation used by the service binary and the tests:
//! an in-memory staging buffer standing in for the shared-memory block,
//! plus two signal pipes.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use rustix::pipe::{pipe_with, PipeFlags};

use crate::core::errors::ChannelError;
use crate::core::event::{DeviceId, KeyAction, KeyFlags, MotionAction, MotionSample, PointerCoords};
use crate::prelude::*;

// ============================================================================
// Published event payloads
// ============================================================================

/// Key event as written to a channel, with target flags already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedKey {
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

/// Motion event header as written to a channel.
///
/// Coordinates travel separately as samples: the first one with
/// [`EventTransport::publish_motion_event`], the rest appended one at a
/// time until the staging buffer fills up.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMotion {
    pub device_id: DeviceId,
    pub source: u32,
    pub action: MotionAction,
    pub edge_flags: i32,
    pub meta_state: i32,
    pub x_offset: f32,
    pub y_offset: f32,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: i64,
    pub pointer_ids: Vec<i32>,
}

/// What the consumer side reads back out of the staging buffer.
#[derive(Debug, Clone)]
pub enum StagedEvent {
    Key(PublishedKey),
    Motion(StagedMotion),
}

#[derive(Debug, Clone)]
pub struct StagedMotion {
    pub event: PublishedMotion,
    pub samples: Vec<MotionSample>,
}

// ============================================================================
// Transport trait
// ============================================================================

/// Publisher-side operations of an input channel.
///
/// All operations must be non-blocking or bounded; the dispatcher invokes
/// them with its lock held.
pub trait EventTransport: Send {
    fn initialize(&mut self) -> Result<(), ChannelError>;
    fn publish_key_event(&mut self, event: &PublishedKey) -> Result<(), ChannelError>;
    fn publish_motion_event(
        &mut self,
        event: &PublishedMotion,
        sample_time: i64,
        coords: &[PointerCoords],
    ) -> Result<(), ChannelError>;
    fn append_motion_sample(
        &mut self,
        sample_time: i64,
        coords: &[PointerCoords],
    ) -> Result<(), ChannelError>;
    fn send_dispatch_signal(&mut self) -> Result<(), ChannelError>;
    fn receive_finished_signal(&mut self) -> Result<(), ChannelError>;
    fn reset(&mut self) -> Result<(), ChannelError>;
}

/// A named input channel endpoint held by the dispatcher.
pub struct InputChannel {
    name: String,
    receive_fd: RawFd,
    transport: Mutex<Box<dyn EventTransport>>,
}

impl InputChannel {
    pub fn new(
        name: impl Into<String>,
        receive_fd: RawFd,
        transport: Box<dyn EventTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            receive_fd,
            transport: Mutex::new(transport),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fd that becomes readable when the consumer signals completion.
    /// This is the channel's identity in the dispatcher's connection table.
    pub fn receive_fd(&self) -> RawFd {
        self.receive_fd
    }

    pub fn initialize(&self) -> Result<(), ChannelError> {
        self.transport.lock().unwrap().initialize()
    }

    pub fn publish_key_event(&self, event: &PublishedKey) -> Result<(), ChannelError> {
        self.transport.lock().unwrap().publish_key_event(event)
    }

    pub fn publish_motion_event(
        &self,
        event: &PublishedMotion,
        sample_time: i64,
        coords: &[PointerCoords],
    ) -> Result<(), ChannelError> {
        self.transport
            .lock()
            .unwrap()
            .publish_motion_event(event, sample_time, coords)
    }

    pub fn append_motion_sample(
        &self,
        sample_time: i64,
        coords: &[PointerCoords],
    ) -> Result<(), ChannelError> {
        self.transport
            .lock()
            .unwrap()
            .append_motion_sample(sample_time, coords)
    }

    pub fn send_dispatch_signal(&self) -> Result<(), ChannelError> {
        self.transport.lock().unwrap().send_dispatch_signal()
    }

    pub fn receive_finished_signal(&self) -> Result<(), ChannelError> {
        self.transport.lock().unwrap().receive_finished_signal()
    }

    pub fn reset(&self) -> Result<(), ChannelError> {
        self.transport.lock().unwrap().reset()
    }
}

impl std::fmt::Debug for InputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputChannel")
            .field("name", &self.name)
            .field("receive_fd", &self.receive_fd)
            .finish()
    }
}

// ============================================================================
// In-process transport
// ============================================================================

#[derive(Debug)]
struct Staging {
    capacity: usize,
    pending: Option<StagedEvent>,
    consumed: bool,
}

impl Staging {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: None,
            consumed: false,
        }
    }
}

struct LocalTransport {
    staging: Arc<Mutex<Staging>>,
    dispatch_tx: OwnedFd,
    finished_rx: OwnedFd,
}

impl EventTransport for LocalTransport {
    fn initialize(&mut self) -> Result<(), ChannelError> {
        let mut staging = self.staging.lock().unwrap();
        staging.pending = None;
        staging.consumed = false;
        Ok(())
    }

    fn publish_key_event(&mut self, event: &PublishedKey) -> Result<(), ChannelError> {
        let mut staging = self.staging.lock().unwrap();
        if staging.pending.is_some() {
            return Err(ChannelError::transport("publisher was not reset"));
        }
        staging.pending = Some(StagedEvent::Key(event.clone()));
        staging.consumed = false;
        Ok(())
    }

    fn publish_motion_event(
        &mut self,
        event: &PublishedMotion,
        sample_time: i64,
        coords: &[PointerCoords],
    ) -> Result<(), ChannelError> {
        let mut staging = self.staging.lock().unwrap();
        if staging.pending.is_some() {
            return Err(ChannelError::transport("publisher was not reset"));
        }
        staging.pending = Some(StagedEvent::Motion(StagedMotion {
            event: event.clone(),
            samples: vec![MotionSample {
                event_time: sample_time,
                pointer_coords: coords.to_vec(),
            }],
        }));
        staging.consumed = false;
        Ok(())
    }

    fn append_motion_sample(
        &mut self,
        sample_time: i64,
        coords: &[PointerCoords],
    ) -> Result<(), ChannelError> {
        let mut staging = self.staging.lock().unwrap();
        let capacity = staging.capacity;
        if staging.consumed {
            return Err(ChannelError::Consumed);
        }
        match staging.pending.as_mut() {
            Some(StagedEvent::Motion(motion)) => {
                if motion.samples.len() >= capacity {
                    return Err(ChannelError::BufferFull);
                }
                motion.samples.push(MotionSample {
                    event_time: sample_time,
                    pointer_coords: coords.to_vec(),
                });
                Ok(())
            }
            Some(StagedEvent::Key(_)) => {
                Err(ChannelError::transport("staged event is not a motion"))
            }
            None => Err(ChannelError::transport("no motion event staged")),
        }
    }

    fn send_dispatch_signal(&mut self) -> Result<(), ChannelError> {
        write_signal(&self.dispatch_tx, b'd')
    }

    fn receive_finished_signal(&mut self) -> Result<(), ChannelError> {
        read_signal(&self.finished_rx)
    }

    fn reset(&mut self) -> Result<(), ChannelError> {
        let mut staging = self.staging.lock().unwrap();
        staging.pending = None;
        staging.consumed = false;
        Ok(())
    }
}

/// Consumer half of an in-process channel pair.
pub struct ChannelConsumer {
    name: String,
    staging: Arc<Mutex<Staging>>,
    dispatch_rx: OwnedFd,
    finished_tx: OwnedFd,
}

impl ChannelConsumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the dispatcher signals that an event is staged.
    pub fn receive_dispatch_signal(&self) -> Result<(), ChannelError> {
        read_signal(&self.dispatch_rx)
    }

    /// Read the staged event, marking it consumed.  Further streamed
    /// samples for it will be rejected with [`ChannelError::Consumed`] and
    /// delivered in the next cycle instead.
    pub fn consume(&self) -> Result<StagedEvent, ChannelError> {
        let mut staging = self.staging.lock().unwrap();
        if staging.consumed {
            return Err(ChannelError::transport("staged event consumed twice"));
        }
        match staging.pending.as_ref() {
            Some(event) => {
                let event = event.clone();
                staging.consumed = true;
                Ok(event)
            }
            None => Err(ChannelError::transport("no event staged")),
        }
    }

    pub fn send_finished_signal(&self) -> Result<(), ChannelError> {
        write_signal(&self.finished_tx, b'f')
    }
}

impl std::fmt::Debug for ChannelConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConsumer")
            .field("name", &self.name)
            .finish()
    }
}

/// Build a connected publisher/consumer channel pair.
///
/// `capacity` bounds how many motion samples fit in the staging buffer at
/// once; appends past it report back-pressure.
pub fn pair(
    name: impl Into<String>,
    capacity: usize,
) -> Result<(InputChannel, ChannelConsumer), ChannelError> {
    let name = name.into();
    let (dispatch_rx, dispatch_tx) =
        pipe_with(PipeFlags::CLOEXEC).map_err(std::io::Error::from)?;
    let (finished_rx, finished_tx) =
        pipe_with(PipeFlags::CLOEXEC).map_err(std::io::Error::from)?;
    let staging = Arc::new(Mutex::new(Staging::new(capacity)));

    let transport = LocalTransport {
        staging: staging.clone(),
        dispatch_tx,
        finished_rx,
    };
    let receive_fd = transport.finished_rx.as_raw_fd();
    let channel = InputChannel::new(name.clone(), receive_fd, Box::new(transport));
    let consumer = ChannelConsumer {
        name,
        staging,
        dispatch_rx,
        finished_tx,
    };
    Ok((channel, consumer))
}

fn write_signal(fd: &OwnedFd, byte: u8) -> Result<(), ChannelError> {
    loop {
        match rustix::io::write(fd, &[byte]) {
            Ok(_) => return Ok(()),
            Err(rustix::io::Errno::INTR) => continue,
            Err(errno) => return Err(ChannelError::Io(errno.into())),
        }
    }
}

fn read_signal(fd: &OwnedFd) -> Result<(), ChannelError> {
    let mut buf = [0u8; 1];
    loop {
        match rustix::io::read(fd, &mut buf) {
            Ok(0) => return Err(ChannelError::transport("input channel closed")),
            Ok(_) => return Ok(()),
            Err(rustix::io::Errno::INTR) => continue,
            Err(errno) => return Err(ChannelError::Io(errno.into())),
        }
    }
}
