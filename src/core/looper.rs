//! Single-threaded poll reactor for the dispatch thread.
//!
//! One thread blocks in [`Looper::poll_once`]; any thread may [`Looper::wake`]
//! it through the internal wake pipe or register per-fd readiness callbacks.
//! A callback returns `true` to stay registered and `false` to be removed;
//! removal on error is what keeps a dead fd from spinning the loop.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use bitflags::bitflags;
use rustix::event::{PollFd, PollFlags};
use rustix::pipe::{pipe_with, PipeFlags};

use crate::prelude::*;

bitflags! {
    /// Readiness events reported to fd callbacks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdEvents: u32 {
        const INPUT = 0x01;
        const ERROR = 0x02;
        const HANGUP = 0x04;
        const INVALID = 0x08;
    }
}

impl FdEvents {
    fn from_poll_flags(flags: PollFlags) -> Self {
        let mut events = FdEvents::empty();
        if flags.contains(PollFlags::IN) {
            events |= FdEvents::INPUT;
        }
        if flags.contains(PollFlags::ERR) {
            events |= FdEvents::ERROR;
        }
        if flags.contains(PollFlags::HUP) {
            events |= FdEvents::HANGUP;
        }
        if flags.contains(PollFlags::NVAL) {
            events |= FdEvents::INVALID;
        }
        events
    }

    fn to_poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.contains(FdEvents::INPUT) {
            flags |= PollFlags::IN;
        }
        // Errors, hangups, and invalid fds are always reported by poll;
        // they cannot be masked out.
        flags
    }
}

/// Callback invoked when a registered fd becomes ready.  Returns whether
/// to keep the registration.
pub type FdCallback = Box<dyn FnMut(RawFd, FdEvents) -> bool + Send>;

pub struct Looper {
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
    callbacks: Mutex<HashMap<RawFd, Registration>>,
}

struct Registration {
    events: FdEvents,
    callback: FdCallback,
}

impl Looper {
    pub fn new() -> std::io::Result<Self> {
        let (wake_rx, wake_tx) = pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)
            .map_err(std::io::Error::from)?;
        Ok(Self {
            wake_rx,
            wake_tx,
            callbacks: Mutex::new(HashMap::new()),
        })
    }

    /// Wake the polling thread.  Safe to call from any thread; a full wake
    /// pipe already guarantees a pending wakeup.
    pub fn wake(&self) {
        loop {
            match rustix::io::write(&self.wake_tx, &[b'w']) {
                Ok(_) => return,
                Err(rustix::io::Errno::AGAIN) => return,
                Err(rustix::io::Errno::INTR) => continue,
                Err(errno) => {
                    tracing::warn!("could not write to wake pipe: {}", errno);
                    return;
                }
            }
        }
    }

    /// Register `callback` for the requested readiness `events` of `fd`.
    /// Replaces any existing registration for the same fd.
    pub fn set_callback(&self, fd: RawFd, events: FdEvents, callback: FdCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .insert(fd, Registration { events, callback });
        self.wake();
    }

    /// Remove the registration for `fd`.  Returns whether one existed.
    pub fn remove_callback(&self, fd: RawFd) -> bool {
        self.callbacks.lock().unwrap().remove(&fd).is_some()
    }

    /// Poll registered fds plus the wake pipe for up to `timeout_millis`
    /// (-1 blocks indefinitely, 0 returns immediately), then run the
    /// callbacks for whatever became ready.
    pub fn poll_once(&self, timeout_millis: i32) {
        let fds: Vec<(RawFd, FdEvents)> = {
            let callbacks = self.callbacks.lock().unwrap();
            callbacks
                .iter()
                .map(|(&fd, registration)| (fd, registration.events))
                .collect()
        };

        // Registrants own the fds and unregister before closing them; a fd
        // closed out from under us reports NVAL and loses its callback.
        let mut poll_fds: Vec<PollFd<'_>> = Vec::with_capacity(fds.len() + 1);
        poll_fds.push(PollFd::new(&self.wake_rx, PollFlags::IN));
        for &(fd, events) in &fds {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            poll_fds.push(PollFd::from_borrowed_fd(borrowed, events.to_poll_flags()));
        }

        match rustix::event::poll(&mut poll_fds, timeout_millis) {
            Ok(_) => {}
            Err(rustix::io::Errno::INTR) => return,
            Err(errno) => {
                tracing::error!("poll failed: {}", errno);
                return;
            }
        }

        let mut ready = Vec::new();
        if !poll_fds[0].revents().is_empty() {
            self.drain_wake_pipe();
        }
        for (index, poll_fd) in poll_fds.iter().enumerate().skip(1) {
            let revents = poll_fd.revents();
            if !revents.is_empty() {
                ready.push((fds[index - 1].0, FdEvents::from_poll_flags(revents)));
            }
        }
        drop(poll_fds);

        for (fd, events) in ready {
            // Take the registration out of the table while it runs so it
            // can freely call back into set_callback/remove_callback.
            let registration = self.callbacks.lock().unwrap().remove(&fd);
            let Some(mut registration) = registration else {
                continue;
            };
            let keep = (registration.callback)(fd, events);
            if keep {
                let mut callbacks = self.callbacks.lock().unwrap();
                callbacks.entry(fd).or_insert(registration);
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 16];
        loop {
            match rustix::io::read(&self.wake_rx, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(rustix::io::Errno::AGAIN) => break,
                Err(rustix::io::Errno::INTR) => continue,
                Err(errno) => {
                    tracing::warn!("could not drain wake pipe: {}", errno);
                    break;
                }
            }
        }
    }

    pub fn wake_fd(&self) -> RawFd {
        self.wake_rx.as_raw_fd()
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper")
            .field("wake_fd", &self.wake_rx.as_raw_fd())
            .finish()
    }
}
