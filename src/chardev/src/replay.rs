// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

/// Whether backend I/O is being recorded, replayed, or neither.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplayMode {
    /// Replay is inactive.
    #[default]
    Off,
    /// Backend reads are appended to the log as they happen.
    Record,
    /// Backend reads are served from the log instead of the backend.
    Play,
}

/// In-memory log of the backend reads a replay-enabled chardev performed.
#[derive(Debug)]
pub struct ReplayLog {
    mode: ReplayMode,
    events: RefCell<VecDeque<ReplayEvent>>,
}

#[derive(Debug)]
enum ReplayEvent {
    Read(Vec<u8>),
    ReadError(i32),
}

impl ReplayLog {
    /// Creates a log operating in `mode`.
    pub fn new(mode: ReplayMode) -> Rc<ReplayLog> {
        Rc::new(ReplayLog {
            mode,
            events: RefCell::new(VecDeque::new()),
        })
    }

    /// The mode this log was created in.
    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    /// Number of logged events not yet consumed.
    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    /// Whether the log holds no pending events.
    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    /// Seeds a read for a later playback run.
    pub fn push_read(&self, buf: &[u8]) {
        self.events.borrow_mut().push_back(ReplayEvent::Read(buf.to_vec()));
    }

    pub(crate) fn save_read(&self, buf: &[u8]) {
        self.push_read(buf);
    }

    pub(crate) fn save_read_error(&self, err: &io::Error) {
        self.events
            .borrow_mut()
            .push_back(ReplayEvent::ReadError(err.raw_os_error().unwrap_or(libc::EIO)));
    }

    /// Pops the next logged read into `buf`. An empty log replays as a
    /// zero-length read.
    pub(crate) fn load_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.events.borrow_mut().pop_front() {
            Some(ReplayEvent::Read(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(ReplayEvent::ReadError(errno)) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(0),
        }
    }
}
