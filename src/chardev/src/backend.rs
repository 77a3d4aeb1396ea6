// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend side of the chardev layer: the driver capability table, the
//! common per-backend state, and the delivery paths a backend uses to
//! reach its bound front-end.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::eventfd::EventFd;

use crate::config::ChardevConfig;
use crate::frontend::{self, FeState};
use crate::mux::MuxDriver;
use crate::{ChardevError, ChardevEvent};

/// Shared handle to a backend.
pub type ChardevRef = Rc<Chardev>;

/// Callback attached to an event-loop watch source. Returning `false`
/// removes the source.
pub type WatchCallback = Box<dyn FnMut(EventSet) -> bool>;

/// Backoff between retries of a partial synchronous write.
const WRITE_RETRY_DELAY: Duration = Duration::from_micros(100);

/// Capability table of a concrete backend implementation.
///
/// `write` is the only mandatory operation. Every optional capability
/// defaults to the sentinel contract the front-end exposes for it:
/// `sync_read` and `add_watch` report the capability as absent, `ioctl`
/// reports not-supported, the msgfd operations report `-1`, and the
/// remaining hooks are no-ops.
pub trait ChardevDriver {
    /// Pushes bytes towards the backend's sink. May write short or fail
    /// with `WouldBlock`; the retry policy lives in [`Chardev::write`].
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Whether the backend implements [`ChardevDriver::sync_read`].
    fn can_sync_read(&self) -> bool {
        false
    }

    /// Blocking read used by [`crate::CharFrontend::read_all`]. Only
    /// called when [`ChardevDriver::can_sync_read`] reports true.
    fn sync_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    /// Backend-specific control operation.
    fn ioctl(&mut self, _cmd: i32, _arg: &mut [u8]) -> Result<(), ChardevError> {
        Err(ChardevError::NotSupported)
    }

    /// Toggles local echo on backends with a terminal notion of it.
    fn set_echo(&mut self, _echo: bool) {}

    /// Informs the backend of the front-end's open state.
    fn set_fe_open(&mut self, _open: bool) {}

    /// Asks the backend to push any buffered input now.
    fn accept_input(&mut self) {}

    /// Drops the backend's connection, if it has one.
    fn disconnect(&mut self) {}

    /// Blocks until the backend is connected.
    fn wait_connected(&mut self) -> Result<(), ChardevError> {
        Ok(())
    }

    /// Receives file descriptors passed over the channel; `-1` when the
    /// backend cannot carry them.
    fn get_msgfds(&mut self, _fds: &mut [RawFd]) -> isize {
        -1
    }

    /// Queues file descriptors for the next write; `-1` when the backend
    /// cannot carry them.
    fn set_msgfds(&mut self, _fds: &[RawFd]) -> isize {
        -1
    }

    /// Creates a poll source for `cond`, returning the effective condition
    /// set, or `None` when the backend cannot be watched.
    fn add_watch(&mut self, _cond: EventSet) -> Option<EventSet> {
        None
    }

    /// Re-evaluates how the backend feeds the installed read handlers.
    fn update_read_handlers(&mut self) {}

    /// Cancels the backend's input poll source, if any.
    fn remove_read_watch(&mut self) {}

    /// Downcast used by the mux-specific front-end paths.
    fn as_mux(&self) -> Option<&MuxDriver> {
        None
    }

    /// Mutable variant of [`ChardevDriver::as_mux`].
    fn as_mux_mut(&mut self) -> Option<&mut MuxDriver> {
        None
    }
}

/// Common state of one backend: its driver plus the bookkeeping shared by
/// every driver kind.
pub struct Chardev {
    label: String,
    be_open: Cell<bool>,
    drop_guest_input: Cell<bool>,
    replay: Cell<bool>,
    driver: RefCell<Box<dyn ChardevDriver>>,
    /// Back-reference to the bound front-end; non-owning. Mux backends
    /// track their bindings in the driver instead.
    pub(crate) be: RefCell<Option<Weak<RefCell<FeState>>>>,
    ctx: LoopContext,
}

impl Chardev {
    /// Creates a backend around `driver`.
    pub fn new(
        label: impl Into<String>,
        driver: Box<dyn ChardevDriver>,
    ) -> Result<ChardevRef, ChardevError> {
        Ok(Rc::new(Chardev {
            label: label.into(),
            be_open: Cell::new(false),
            drop_guest_input: Cell::new(false),
            replay: Cell::new(false),
            driver: RefCell::new(driver),
            be: RefCell::new(None),
            ctx: LoopContext::new().map_err(ChardevError::EventFd)?,
        }))
    }

    /// Creates a backend from its embed-time configuration.
    pub fn with_config(
        config: &ChardevConfig,
        driver: Box<dyn ChardevDriver>,
    ) -> Result<ChardevRef, ChardevError> {
        let chr = Self::new(config.label.clone(), driver)?;
        chr.set_drop_guest_input(config.drop_guest_input);
        Ok(chr)
    }

    /// The backend's diagnostic label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Backend-side open state.
    pub fn be_open(&self) -> bool {
        self.be_open.get()
    }

    /// Whether guest-attached bindings of this backend have their input
    /// suppressed.
    pub fn drop_guest_input(&self) -> bool {
        self.drop_guest_input.get()
    }

    /// Configures guest-input suppression.
    pub fn set_drop_guest_input(&self, drop: bool) {
        self.drop_guest_input.set(drop);
    }

    /// Whether this backend participates in record/playback.
    pub fn replay(&self) -> bool {
        self.replay.get()
    }

    /// Marks this backend as participating in record/playback.
    pub fn set_replay(&self, replay: bool) {
        self.replay.set(replay);
    }

    /// The event-loop context watch sources attach to.
    pub fn loop_ctx(&self) -> &LoopContext {
        &self.ctx
    }

    pub(crate) fn driver(&self) -> std::cell::Ref<'_, Box<dyn ChardevDriver>> {
        self.driver.borrow()
    }

    pub(crate) fn driver_mut(&self) -> std::cell::RefMut<'_, Box<dyn ChardevDriver>> {
        self.driver.borrow_mut()
    }

    /// Writes `buf` to the driver. With `write_all`, partial writes and
    /// `WouldBlock` are retried (with a short sleep) until the buffer is
    /// consumed; otherwise a single driver attempt is made.
    pub fn write(&self, buf: &[u8], write_all: bool) -> io::Result<usize> {
        let mut driver = self.driver.borrow_mut();
        let mut offset = 0;
        while offset < buf.len() {
            match driver.write(&buf[offset..]) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !write_all {
                        break;
                    }
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
                Err(err) => return Err(err),
                Ok(0) => break,
                Ok(written) => {
                    offset += written;
                    if !write_all {
                        break;
                    }
                }
            }
        }
        Ok(offset)
    }

    /// How many bytes the bound front-end can accept right now.
    pub fn be_can_write(&self) -> usize {
        match self.be.borrow().as_ref() {
            Some(fe) => frontend::fe_can_read(fe),
            None => 0,
        }
    }

    /// Feeds input bytes to the bound front-end's read handler.
    pub fn be_write(&self, buf: &[u8]) {
        let fe = self.be.borrow().clone();
        if let Some(fe) = fe {
            frontend::fe_read(&fe, buf);
        }
    }

    /// Raises a backend-side event towards the bound front-end(s), keeping
    /// the backend open state in step. Mux backends broadcast to every
    /// binding.
    pub fn be_event(&self, event: ChardevEvent) {
        match event {
            ChardevEvent::Opened => self.be_open.set(true),
            ChardevEvent::Closed => self.be_open.set(false),
            _ => {}
        }
        let targets = match self.driver.borrow().as_mux() {
            Some(mux) => mux.bindings(),
            None => self.be.borrow().iter().cloned().collect(),
        };
        for fe in targets {
            frontend::fe_send_event(&fe, event);
        }
    }
}

impl fmt::Debug for Chardev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chardev")
            .field("label", &self.label)
            .field("be_open", &self.be_open.get())
            .field("drop_guest_input", &self.drop_guest_input.get())
            .finish()
    }
}

/// A backend's slice of the event loop: the wakeup descriptor and the
/// watch sources attached by [`crate::CharFrontend::add_watch`].
pub struct LoopContext {
    waker: EventFd,
    watches: RefCell<Vec<WatchEntry>>,
    next_tag: Cell<u32>,
}

struct WatchEntry {
    tag: u32,
    cond: EventSet,
    callback: WatchCallback,
}

impl LoopContext {
    fn new() -> io::Result<LoopContext> {
        Ok(LoopContext {
            waker: EventFd::new(libc::EFD_NONBLOCK)?,
            watches: RefCell::new(Vec::new()),
            next_tag: Cell::new(1),
        })
    }

    /// The descriptor the embedding event loop polls to notice wakeups.
    pub fn waker(&self) -> &EventFd {
        &self.waker
    }

    /// Forces the event loop around one more iteration.
    pub fn wake(&self) {
        // A full eventfd counter already guarantees a wakeup.
        let _ = self.waker.write(1);
    }

    pub(crate) fn attach(&self, cond: EventSet, callback: WatchCallback) -> u32 {
        let tag = self.next_tag.get();
        self.next_tag.set(tag + 1);
        self.watches.borrow_mut().push(WatchEntry {
            tag,
            cond,
            callback,
        });
        tag
    }

    /// Detaches a watch source. Returns whether the tag was known.
    pub fn remove_watch(&self, tag: u32) -> bool {
        let mut watches = self.watches.borrow_mut();
        let before = watches.len();
        watches.retain(|entry| entry.tag != tag);
        watches.len() != before
    }

    /// The condition set a live watch was attached with.
    pub fn watch_cond(&self, tag: u32) -> Option<EventSet> {
        self.watches
            .borrow()
            .iter()
            .find(|entry| entry.tag == tag)
            .map(|entry| entry.cond)
    }

    /// Invokes every watch whose condition intersects `ready`. Callbacks
    /// may attach or remove watches; a callback returning `false` removes
    /// its own source.
    pub fn dispatch(&self, ready: EventSet) {
        let mut due = Vec::new();
        {
            let mut watches = self.watches.borrow_mut();
            let mut idx = 0;
            while idx < watches.len() {
                if !(watches[idx].cond & ready).is_empty() {
                    due.push(watches.remove(idx));
                } else {
                    idx += 1;
                }
            }
        }
        for mut entry in due {
            if (entry.callback)(ready & entry.cond) {
                self.watches.borrow_mut().push(entry);
            }
        }
    }
}

impl fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopContext")
            .field("watches", &self.watches.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Driver writing into a shared byte vector, with a configurable
    /// per-call write cap and a one-shot `WouldBlock`.
    struct SinkDriver {
        sink: Rc<RefCell<Vec<u8>>>,
        max_chunk: usize,
        block_once: bool,
    }

    impl ChardevDriver for SinkDriver {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_once {
                self.block_once = false;
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let chunk = buf.len().min(self.max_chunk);
            self.sink.borrow_mut().extend_from_slice(&buf[..chunk]);
            Ok(chunk)
        }
    }

    fn sink_chardev(max_chunk: usize, block_once: bool) -> (ChardevRef, Rc<RefCell<Vec<u8>>>) {
        let sink = Rc::new(RefCell::new(Vec::new()));
        let chr = Chardev::new(
            "sink",
            Box::new(SinkDriver {
                sink: sink.clone(),
                max_chunk,
                block_once,
            }),
        )
        .unwrap();
        (chr, sink)
    }

    #[test]
    fn write_all_retries_partial_writes() {
        let (chr, sink) = sink_chardev(3, true);
        assert_eq!(chr.write(b"0123456789", true).unwrap(), 10);
        assert_eq!(sink.borrow().as_slice(), b"0123456789");
    }

    #[test]
    fn single_attempt_write_stops_early() {
        let (chr, sink) = sink_chardev(3, false);
        assert_eq!(chr.write(b"0123456789", false).unwrap(), 3);
        assert_eq!(sink.borrow().as_slice(), b"012");
    }

    #[test]
    fn blocked_single_attempt_write_reports_nothing_written() {
        let (chr, sink) = sink_chardev(3, true);
        assert_eq!(chr.write(b"abc", false).unwrap(), 0);
        assert!(sink.borrow().is_empty());
    }

    #[test]
    fn be_event_tracks_open_state() {
        let (chr, _) = sink_chardev(16, false);
        assert!(!chr.be_open());
        chr.be_event(ChardevEvent::Opened);
        assert!(chr.be_open());
        chr.be_event(ChardevEvent::Closed);
        assert!(!chr.be_open());
    }

    #[test]
    fn unbound_backend_has_no_reader() {
        let (chr, _) = sink_chardev(16, false);
        assert_eq!(chr.be_can_write(), 0);
        // Input towards a detached backend is discarded, not an error.
        chr.be_write(b"dropped");
    }

    #[test]
    fn watch_registry_attaches_and_dispatches() {
        let (chr, _) = sink_chardev(16, false);
        let hits = Rc::new(Cell::new(0u32));
        let tag = chr.loop_ctx().attach(EventSet::IN, {
            let hits = hits.clone();
            Box::new(move |_| {
                hits.set(hits.get() + 1);
                true
            })
        });
        assert_eq!(chr.loop_ctx().watch_cond(tag), Some(EventSet::IN));

        chr.loop_ctx().dispatch(EventSet::IN);
        chr.loop_ctx().dispatch(EventSet::OUT);
        assert_eq!(hits.get(), 1);

        assert!(chr.loop_ctx().remove_watch(tag));
        chr.loop_ctx().dispatch(EventSet::IN);
        assert_eq!(hits.get(), 1);
        assert!(!chr.loop_ctx().remove_watch(tag));
    }

    #[test]
    fn with_config_applies_the_input_policy() {
        let config = ChardevConfig {
            label: "serial0".into(),
            drop_guest_input: true,
        };
        let chr = Chardev::with_config(
            &config,
            Box::new(SinkDriver {
                sink: Rc::new(RefCell::new(Vec::new())),
                max_chunk: 16,
                block_once: false,
            }),
        )
        .unwrap();
        assert_eq!(chr.label(), "serial0");
        assert!(chr.drop_guest_input());
    }

    #[test]
    fn one_shot_watch_detaches_itself() {
        let (chr, _) = sink_chardev(16, false);
        let tag = chr.loop_ctx().attach(EventSet::IN, Box::new(|_| false));
        chr.loop_ctx().dispatch(EventSet::IN);
        assert_eq!(chr.loop_ctx().watch_cond(tag), None);
    }
}
