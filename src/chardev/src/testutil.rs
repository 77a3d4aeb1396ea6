// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles shared by the unit tests: a capability-configurable
//! recording driver and a loopback driver.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use pacer::PacerConfig;
use vclock::Clock;
use vmm_sys_util::epoll::EventSet;

use crate::backend::ChardevDriver;
use crate::frontend::EventHandler;
use crate::replay::ReplayMode;
use crate::{ChardevContext, ChardevError, ChardevEvent};

#[derive(Default)]
pub(crate) struct DriverLog {
    pub set_fe_open: Vec<bool>,
    pub echo: Vec<bool>,
    pub watch_conds: Vec<EventSet>,
    pub ioctl_cmds: Vec<i32>,
    pub accept_input: u32,
    pub disconnects: u32,
}

/// Recording driver whose capabilities are toggled per test.
pub(crate) struct TestDriver {
    pub log: Rc<RefCell<DriverLog>>,
    pub sink: Rc<RefCell<Vec<u8>>>,
    /// Chunks served by `sync_read`: `Ok(bytes)` or `Err(errno)`.
    pub source: Rc<RefCell<VecDeque<Result<Vec<u8>, i32>>>>,
    pub sync_read: bool,
    pub watchable: bool,
    pub ioctl_ok: bool,
    pub msgfds: Option<Vec<RawFd>>,
    /// When false every write is refused with a zero-byte result.
    pub accept_writes: bool,
}

impl TestDriver {
    pub fn new() -> TestDriver {
        TestDriver {
            log: Rc::new(RefCell::new(DriverLog::default())),
            sink: Rc::new(RefCell::new(Vec::new())),
            source: Rc::new(RefCell::new(VecDeque::new())),
            sync_read: false,
            watchable: false,
            ioctl_ok: false,
            msgfds: None,
            accept_writes: true,
        }
    }
}

impl ChardevDriver for TestDriver {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.accept_writes {
            return Ok(0);
        }
        self.sink.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn can_sync_read(&self) -> bool {
        self.sync_read
    }

    fn sync_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.source.borrow_mut().pop_front() {
            Some(Ok(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(Err(errno)) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(0),
        }
    }

    fn ioctl(&mut self, cmd: i32, _arg: &mut [u8]) -> Result<(), ChardevError> {
        if !self.ioctl_ok {
            return Err(ChardevError::NotSupported);
        }
        self.log.borrow_mut().ioctl_cmds.push(cmd);
        Ok(())
    }

    fn set_echo(&mut self, echo: bool) {
        self.log.borrow_mut().echo.push(echo);
    }

    fn set_fe_open(&mut self, open: bool) {
        self.log.borrow_mut().set_fe_open.push(open);
    }

    fn accept_input(&mut self) {
        self.log.borrow_mut().accept_input += 1;
    }

    fn disconnect(&mut self) {
        self.log.borrow_mut().disconnects += 1;
    }

    fn get_msgfds(&mut self, fds: &mut [RawFd]) -> isize {
        match &self.msgfds {
            Some(pending) => {
                let len = pending.len().min(fds.len());
                fds[..len].copy_from_slice(&pending[..len]);
                len as isize
            }
            None => -1,
        }
    }

    fn add_watch(&mut self, cond: EventSet) -> Option<EventSet> {
        if !self.watchable {
            return None;
        }
        self.log.borrow_mut().watch_conds.push(cond);
        Some(cond)
    }
}

/// Driver whose writes become its own readable input.
pub(crate) struct LoopbackDriver {
    pub buf: Rc<RefCell<VecDeque<u8>>>,
}

impl LoopbackDriver {
    pub fn new() -> LoopbackDriver {
        LoopbackDriver {
            buf: Rc::new(RefCell::new(VecDeque::new())),
        }
    }
}

impl ChardevDriver for LoopbackDriver {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.borrow_mut().extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn can_sync_read(&self) -> bool {
        true
    }

    fn sync_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pending = self.buf.borrow_mut();
        let len = pending.len().min(buf.len());
        for slot in buf[..len].iter_mut() {
            *slot = pending.pop_front().expect("length checked above");
        }
        Ok(len)
    }
}

pub(crate) fn test_ctx(io_sync: bool) -> (Clock, ChardevContext) {
    let clock = Clock::new();
    let ctx = ChardevContext::new(clock.clone(), &PacerConfig { io_sync }, ReplayMode::Off);
    (clock, ctx)
}

pub(crate) fn replay_ctx(mode: ReplayMode) -> (Clock, ChardevContext) {
    let clock = Clock::new();
    let ctx = ChardevContext::new(clock.clone(), &PacerConfig::default(), mode);
    (clock, ctx)
}

pub(crate) fn event_recorder() -> (EventHandler, Rc<RefCell<Vec<ChardevEvent>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let handler: EventHandler = Box::new({
        let events = events.clone();
        move |event| events.borrow_mut().push(event)
    });
    (handler, events)
}
