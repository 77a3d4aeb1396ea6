// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Front-end side of the chardev layer: the per-device binding and the
//! policies it enforces between a guest device model and its backend.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::process;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::error;
use vclock::Timer;
use vmm_sys_util::epoll::EventSet;

use crate::backend::{ChardevRef, WatchCallback};
use crate::replay::ReplayMode;
use crate::{ChardevContext, ChardevError, ChardevEvent, CHR_READ_BUF_LEN};

/// Capacity probe installed by the guest device: how many input bytes it
/// can accept right now.
pub type CanReadHandler = Box<dyn FnMut() -> usize>;
/// Input delivery installed by the guest device.
pub type ReadHandler = Box<dyn FnMut(&[u8])>;
/// Event delivery installed by the guest device.
pub type EventHandler = Box<dyn FnMut(ChardevEvent)>;
/// Notification that the backend behind the binding was swapped.
pub type BeChangeHandler = Box<dyn FnMut()>;

/// Backoff between retries when a synchronous read reports `WouldBlock`.
const READ_RETRY_DELAY: Duration = Duration::from_micros(100);

#[derive(Default)]
pub(crate) struct Handlers {
    pub(crate) can_read: Option<CanReadHandler>,
    pub(crate) read: Option<ReadHandler>,
    pub(crate) event: Option<EventHandler>,
    pub(crate) be_change: Option<BeChangeHandler>,
}

/// Shared state of one binding. The backend holds a weak reference to it,
/// which is what lets input flow backend-to-device without either side
/// owning the other.
pub(crate) struct FeState {
    chr: Option<ChardevRef>,
    tag: usize,
    is_guest_device: bool,
    fe_open: bool,
    handlers: Rc<RefCell<Handlers>>,
    deferred_open_timer: Option<Timer>,
    ctx: ChardevContext,
}

/// The per-device connector between one guest device model and one
/// backend.
pub struct CharFrontend {
    state: Rc<RefCell<FeState>>,
}

impl CharFrontend {
    /// Creates a detached binding.
    pub fn new(ctx: &ChardevContext) -> CharFrontend {
        CharFrontend {
            state: Rc::new(RefCell::new(FeState {
                chr: None,
                tag: 0,
                is_guest_device: true,
                fe_open: false,
                handlers: Rc::new(RefCell::new(Handlers::default())),
                deferred_open_timer: None,
                ctx: ctx.clone(),
            })),
        }
    }

    /// Attaches the binding to `chr`.
    ///
    /// Fails with device-in-use when a non-mux backend is already bound or
    /// a mux backend is full. On success the binding is Attached(Closed):
    /// no handlers installed, front-end closed, guest-device by default.
    pub fn init(&self, chr: &ChardevRef) -> Result<(), ChardevError> {
        let weak = Rc::downgrade(&self.state);
        let mut tag = 0;
        {
            let mut driver = chr.driver_mut();
            if let Some(mux) = driver.as_mux_mut() {
                tag = mux
                    .attach(weak)
                    .ok_or_else(|| ChardevError::DeviceInUse(chr.label().to_string()))?;
            } else {
                drop(driver);
                let mut be = chr.be.borrow_mut();
                if be.is_some() {
                    return Err(ChardevError::DeviceInUse(chr.label().to_string()));
                }
                *be = Some(weak);
            }
        }

        let mut st = self.state.borrow_mut();
        *st.handlers.borrow_mut() = Handlers::default();
        st.is_guest_device = true;
        st.fe_open = false;
        st.tag = tag;
        st.chr = Some(chr.clone());
        // Open events may have to be delivered outside the call that
        // triggers them; this timer is the only delivery site for those.
        st.deferred_open_timer = Some(st.ctx.clock().new_timer({
            let state = Rc::downgrade(&self.state);
            move || deliver_deferred_open(&state)
        }));
        Ok(())
    }

    /// Detaches the binding: tears down handlers, signals closed, clears
    /// the backend's back-reference (or mux slot). Idempotent once it has
    /// run. `del` additionally releases this binding's reference so a
    /// backend with no other owners is destroyed; with shared ownership
    /// both paths are equivalent.
    pub fn deinit(&self, _del: bool) {
        self.state.borrow_mut().deferred_open_timer = None;

        let chr = self.state.borrow().chr.clone();
        let Some(chr) = chr else {
            return;
        };
        self.set_handlers(None, None, None, None, true);

        {
            let mut be = chr.be.borrow_mut();
            let ours = Rc::downgrade(&self.state);
            if be.as_ref().is_some_and(|weak| weak.ptr_eq(&ours)) {
                *be = None;
            }
        }
        let tag = self.state.borrow().tag;
        if let Some(mux) = chr.driver_mut().as_mux_mut() {
            mux.clear_slot(tag);
        }
        self.state.borrow_mut().chr = None;
    }

    /// Declares this binding a host-side consumer (monitor, debugger), so
    /// the guest-input-suppression policy does not apply to it. Must be
    /// called before any read handlers are installed.
    pub fn mark_non_guest_device(&self) {
        let st = self.state.borrow();
        {
            let handlers = st.handlers.borrow();
            assert!(
                handlers.can_read.is_none() && handlers.read.is_none(),
                "cannot change device kind with read handlers installed"
            );
        }
        drop(st);
        self.state.borrow_mut().is_guest_device = false;
    }

    /// Dispatches an event to the device's event handler, subject to the
    /// open/close and input policies.
    pub fn event(&self, event: ChardevEvent) {
        send_event(&self.state, event);
    }

    /// Writes `buf`, with `write_all` behavior under synchronous I/O. A
    /// detached binding consumes the buffer under io_sync and reports
    /// nothing written otherwise.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let io_sync = self.state.borrow().ctx.io_sync();
        self.do_write(buf, io_sync)
    }

    /// Writes the whole of `buf`, retrying partial writes.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<usize> {
        self.do_write(buf, true)
    }

    fn do_write(&self, buf: &[u8], write_all: bool) -> io::Result<usize> {
        let (chr, io_sync) = {
            let st = self.state.borrow();
            (st.chr.clone(), st.ctx.io_sync())
        };
        let Some(chr) = chr else {
            return Ok(if io_sync { buf.len() } else { 0 });
        };
        let res = chr.write(buf, write_all);
        if io_sync {
            // The pacer model assumes synchronous semantics at the FE
            // boundary: whatever the backend managed, the device saw `len`.
            return Ok(buf.len());
        }
        res
    }

    /// Reads until `buf` is full, the backend reports end of input, or an
    /// error occurs. Transient `WouldBlock` results are retried after a
    /// short sleep. Under replay the log substitutes for (or records) the
    /// backend.
    pub fn read_all(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (chr, is_guest, replay) = {
            let st = self.state.borrow();
            (st.chr.clone(), st.is_guest_device, st.ctx.replay().clone())
        };
        let Some(chr) = chr else {
            return Ok(0);
        };
        if !chr.driver().can_sync_read() {
            return Ok(0);
        }
        if !input_allowed(&chr, is_guest) {
            return Ok(0);
        }
        if chr.replay() && replay.mode() == ReplayMode::Play {
            return replay.load_read(buf);
        }

        let mut offset = 0;
        while offset < buf.len() {
            match chr.driver_mut().sync_read(&mut buf[offset..]) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(READ_RETRY_DELAY);
                }
                Err(err) => {
                    if chr.replay() && replay.mode() == ReplayMode::Record {
                        replay.save_read_error(&err);
                    }
                    return Err(err);
                }
                Ok(0) => break,
                Ok(read) => offset += read,
            }
        }
        if chr.replay() && replay.mode() == ReplayMode::Record {
            replay.save_read(&buf[..offset]);
        }
        Ok(offset)
    }

    /// Issues a backend control operation. Not supported when detached,
    /// when the backend has no ioctl capability, or while the backend
    /// participates in replay.
    pub fn ioctl(&self, cmd: i32, arg: &mut [u8]) -> Result<(), ChardevError> {
        let chr = self.state.borrow().chr.clone();
        let Some(chr) = chr else {
            return Err(ChardevError::NotSupported);
        };
        if chr.replay() {
            return Err(ChardevError::NotSupported);
        }
        let result = chr.driver_mut().ioctl(cmd, arg);
        result
    }

    /// Receives the single file descriptor passed over the channel, if
    /// any. Fatal under replay: the log cannot represent fd passing.
    pub fn get_msgfd(&self) -> RawFd {
        let mut fds = [-1; 1];
        let res = if self.get_msgfds(&mut fds) == 1 {
            fds[0]
        } else {
            -1
        };
        let chr = self.state.borrow().chr.clone();
        if chr.is_some_and(|chr| chr.replay()) {
            error!("replay: fd passing is not supported for serial devices");
            process::exit(1);
        }
        res
    }

    /// Receives file descriptors passed over the channel; `-1` when
    /// detached or unsupported.
    pub fn get_msgfds(&self, fds: &mut [RawFd]) -> isize {
        match self.state.borrow().chr.as_ref() {
            Some(chr) => chr.driver_mut().get_msgfds(fds),
            None => -1,
        }
    }

    /// Queues file descriptors for the next write; `-1` when detached or
    /// unsupported.
    pub fn set_msgfds(&self, fds: &[RawFd]) -> isize {
        match self.state.borrow().chr.as_ref() {
            Some(chr) => chr.driver_mut().set_msgfds(fds),
            None => -1,
        }
    }

    /// Tells the backend the device is ready for more input, and forces
    /// the event loop around so the backend gets a chance to act on it.
    /// The wake is a harmless "re-poll now" hint even for backends without
    /// an accept-input operation.
    pub fn accept_input(&self) {
        let chr = self.state.borrow().chr.clone();
        if let Some(chr) = chr {
            chr.driver_mut().accept_input();
            chr.loop_ctx().wake();
        }
    }

    /// Formats into a bounded scratch buffer and writes it whole.
    pub fn printf(&self, args: fmt::Arguments<'_>) {
        let mut formatted = args.to_string();
        if formatted.len() > CHR_READ_BUF_LEN {
            let mut end = CHR_READ_BUF_LEN;
            while !formatted.is_char_boundary(end) {
                end -= 1;
            }
            formatted.truncate(end);
        }
        let _ = self.write_all(formatted.as_bytes());
    }

    /// The bound backend. Consumers that registered a backend-change
    /// handler must not cache the driver, so this traps for them.
    pub fn get_driver(&self) -> Option<ChardevRef> {
        let st = self.state.borrow();
        assert!(
            st.handlers.borrow().be_change.is_none(),
            "get_driver is unsafe for consumers that support backend hot-swap"
        );
        st.chr.clone()
    }

    /// Whether the binding is attached to a backend.
    pub fn backend_connected(&self) -> bool {
        self.state.borrow().chr.is_some()
    }

    /// Whether the attached backend is open.
    pub fn backend_open(&self) -> bool {
        self.state
            .borrow()
            .chr
            .as_ref()
            .is_some_and(|chr| chr.be_open())
    }

    /// Blocks until the backend is connected.
    pub fn wait_connected(&self) -> Result<(), ChardevError> {
        let chr = self.state.borrow().chr.clone();
        match chr {
            Some(chr) => chr.driver_mut().wait_connected(),
            None => Err(ChardevError::MissingBackend),
        }
    }

    /// Toggles backend echo.
    pub fn set_echo(&self, echo: bool) {
        let chr = self.state.borrow().chr.clone();
        if let Some(chr) = chr {
            chr.driver_mut().set_echo(echo);
        }
    }

    /// Propagates the front-end open state to the backend. A no-op when
    /// the state does not change.
    pub fn set_open(&self, fe_open: bool) {
        let chr = {
            let st = self.state.borrow();
            if st.fe_open == fe_open {
                return;
            }
            st.chr.clone()
        };
        let Some(chr) = chr else {
            return;
        };
        self.state.borrow_mut().fe_open = fe_open;
        chr.driver_mut().set_fe_open(fe_open);
    }

    /// Drops the backend's connection.
    pub fn disconnect(&self) {
        let chr = self.state.borrow().chr.clone();
        if let Some(chr) = chr {
            chr.driver_mut().disconnect();
        }
    }

    /// Attaches an event-loop watch for `cond` on the backend. Returns the
    /// source tag, or 0 when detached, unwatchable, or input-suppressed.
    /// Under synchronous I/O write-readiness is meaningless, so the
    /// writable bit is masked off.
    pub fn add_watch(&self, cond: EventSet, callback: WatchCallback) -> u32 {
        let (chr, is_guest, io_sync) = {
            let st = self.state.borrow();
            (st.chr.clone(), st.is_guest_device, st.ctx.io_sync())
        };
        let Some(chr) = chr else {
            return 0;
        };
        if !input_allowed(&chr, is_guest) {
            return 0;
        }
        let mut cond = cond;
        if io_sync {
            cond.remove(EventSet::OUT);
        }
        let Some(effective) = chr.driver_mut().add_watch(cond) else {
            return 0;
        };
        chr.loop_ctx().attach(effective, callback)
    }

    /// For mux backends, declares this binding the focused one.
    pub fn take_focus(&self) {
        let (chr, tag) = {
            let st = self.state.borrow();
            (st.chr.clone(), st.tag)
        };
        let Some(chr) = chr else {
            return;
        };
        let deliveries = match chr.driver().as_mux() {
            Some(mux) => mux.set_focus(tag),
            None => return,
        };
        for (binding, event) in deliveries {
            fe_send_event(&binding, event);
        }
    }

    /// Installs the device's handler set and drives the binding's
    /// open/close state machine.
    pub fn set_handlers(
        &self,
        can_read: Option<CanReadHandler>,
        read: Option<ReadHandler>,
        event: Option<EventHandler>,
        be_change: Option<BeChangeHandler>,
        set_open: bool,
    ) {
        self.set_handlers_full(can_read, read, event, be_change, set_open, false);
    }

    /// The full state machine, with the mux-descent depth made explicit:
    /// the recursive call the mux makes for its inner binding must not
    /// re-trigger focus stealing or open-event delivery for what is one
    /// logical transition.
    pub(crate) fn set_handlers_full(
        &self,
        can_read: Option<CanReadHandler>,
        read: Option<ReadHandler>,
        event: Option<EventHandler>,
        be_change: Option<BeChangeHandler>,
        set_open: bool,
        mux_reentry: bool,
    ) {
        let chr = self.state.borrow().chr.clone();
        let Some(chr) = chr else {
            return;
        };

        let fe_open =
            can_read.is_some() || read.is_some() || event.is_some() || be_change.is_some();
        if !fe_open {
            chr.driver_mut().remove_read_watch();
        }

        let is_guest = self.state.borrow().is_guest_device;
        let allowed = input_allowed(&chr, is_guest);
        {
            let st = self.state.borrow();
            let mut handlers = st.handlers.borrow_mut();
            if allowed || mux_reentry {
                handlers.can_read = can_read;
                handlers.read = read;
            } else {
                // Suppressed guest input: swallow everything while staying
                // live enough that the backend never stalls on capacity.
                handlers.can_read = can_read.map(|_| Box::new(|| usize::MAX) as CanReadHandler);
                handlers.read = read.map(|_| Box::new(|_: &[u8]| ()) as ReadHandler);
            }
            handlers.event = event;
            handlers.be_change = be_change;
        }

        chr.driver_mut().update_read_handlers();

        if set_open {
            self.set_open(fe_open);
        }

        if fe_open {
            self.take_focus();
            if !mux_reentry {
                let st = self.state.borrow();
                if !openclose_async(&st) {
                    // Deliver OPENED from the timer wheel once this call
                    // has returned, pinned to the current virtual time.
                    let now = st.ctx.clock().now_ns();
                    if let Some(timer) = &st.deferred_open_timer {
                        timer.arm(now);
                    }
                } else if chr.be_open() {
                    // Connecting to an already open backend: make sure this
                    // binding also sees the open event.
                    drop(st);
                    send_event(&self.state, ChardevEvent::Opened);
                }
            }
        } else if !mux_reentry {
            let st = self.state.borrow();
            if !openclose_async(&st) {
                if let Some(timer) = &st.deferred_open_timer {
                    timer.disarm();
                }
            }
        }

        let driver = chr.driver();
        if let Some(mux) = driver.as_mux() {
            mux.set_handlers(fe_open);
        }
    }
}

impl fmt::Debug for CharFrontend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("CharFrontend")
            .field("connected", &st.chr.is_some())
            .field("fe_open", &st.fe_open)
            .field("is_guest_device", &st.is_guest_device)
            .field("tag", &st.tag)
            .finish()
    }
}

/// Open/close events are delivered inline unless synchronous I/O is in
/// effect for a guest device, in which case delivery goes through the
/// deferred-open timer.
fn openclose_async(st: &FeState) -> bool {
    !(st.ctx.io_sync() && st.is_guest_device)
}

/// Input reaches a binding unless the backend suppresses guest input and
/// the binding serves a guest device. For a mux the policy lives on the
/// multiplexed inner backend.
fn input_allowed(chr: &ChardevRef, is_guest_device: bool) -> bool {
    let drop_input = match chr.driver().as_mux() {
        Some(mux) => mux.inner().drop_guest_input(),
        None => chr.drop_guest_input(),
    };
    !(drop_input && is_guest_device)
}

/// Filtered event dispatch shared by the front-end API and the
/// backend-side delivery paths.
fn send_event(state: &Rc<RefCell<FeState>>, event: ChardevEvent) {
    let handlers = {
        let st = state.borrow();
        let Some(chr) = st.chr.as_ref() else {
            return;
        };
        if st.handlers.borrow().event.is_none() {
            return;
        }
        let deliver = match event {
            ChardevEvent::Opened | ChardevEvent::Closed => openclose_async(&st),
            ChardevEvent::Break | ChardevEvent::MuxIn | ChardevEvent::MuxOut => {
                input_allowed(chr, st.is_guest_device)
            }
        };
        if !deliver {
            return;
        }
        st.handlers.clone()
    };
    invoke_event(&handlers, event);
}

/// The deferred-open timer's callback: the one place an asynchronous
/// OPENED is generated.
fn deliver_deferred_open(state: &Weak<RefCell<FeState>>) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let handlers = {
        let st = state.borrow();
        if st.chr.is_none() {
            return;
        }
        st.handlers.clone()
    };
    invoke_event(&handlers, ChardevEvent::Opened);
}

// The handler in flight is taken out of its slot for the duration of the
// call: a callback that reenters set_handlers must neither deadlock on the
// slot nor have its fresh installation clobbered by the restore.

fn invoke_event(handlers: &Rc<RefCell<Handlers>>, event: ChardevEvent) {
    let taken = handlers.borrow_mut().event.take();
    if let Some(mut callback) = taken {
        callback(event);
        let mut slot = handlers.borrow_mut();
        if slot.event.is_none() {
            slot.event = Some(callback);
        }
    }
}

pub(crate) fn fe_can_read(state: &Weak<RefCell<FeState>>) -> usize {
    let Some(state) = state.upgrade() else {
        return 0;
    };
    let handlers = state.borrow().handlers.clone();
    let taken = handlers.borrow_mut().can_read.take();
    match taken {
        Some(mut callback) => {
            let capacity = callback();
            let mut slot = handlers.borrow_mut();
            if slot.can_read.is_none() {
                slot.can_read = Some(callback);
            }
            capacity
        }
        None => 0,
    }
}

pub(crate) fn fe_read(state: &Weak<RefCell<FeState>>, buf: &[u8]) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let handlers = state.borrow().handlers.clone();
    let taken = handlers.borrow_mut().read.take();
    if let Some(mut callback) = taken {
        callback(buf);
        let mut slot = handlers.borrow_mut();
        if slot.read.is_none() {
            slot.read = Some(callback);
        }
    }
}

pub(crate) fn fe_send_event(state: &Weak<RefCell<FeState>>, event: ChardevEvent) {
    if let Some(state) = state.upgrade() {
        send_event(&state, event);
    }
}
