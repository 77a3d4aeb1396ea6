// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Character-device front-end layer.
//!
//! A [`CharFrontend`] joins one guest device model to one [`Chardev`]
//! backend and enforces the policies that keep backend-visible side-effects
//! aligned with granted virtual time: synchronous I/O, guest-input
//! suppression, and deferred open-event delivery. The [`MuxDriver`] backend
//! multiplexes one underlying channel across up to [`MAX_MUX`] bindings.
//!
//! All of this runs on the backend's event-loop thread; nothing here is
//! `Send`.

mod backend;
mod config;
mod frontend;
mod mux;
mod replay;
#[cfg(test)]
mod testutil;

use std::fmt;
use std::rc::Rc;

use pacer::PacerConfig;
use vclock::Clock;

pub use crate::backend::{Chardev, ChardevDriver, ChardevRef, LoopContext, WatchCallback};
pub use crate::config::ChardevConfig;
pub use crate::frontend::{
    BeChangeHandler, CanReadHandler, CharFrontend, EventHandler, ReadHandler,
};
pub use crate::mux::MuxDriver;
pub use crate::replay::{ReplayLog, ReplayMode};

/// Maximum number of front-end bindings a mux backend carries.
pub const MAX_MUX: usize = 4;

/// Size of the scratch buffer used by [`CharFrontend::printf`].
pub const CHR_READ_BUF_LEN: usize = 4096;

/// Events exchanged between backends and front-ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChardevEvent {
    /// The backend became ready to carry data.
    Opened,
    /// The backend lost its peer.
    Closed,
    /// A break condition was seen on the line.
    Break,
    /// The binding gained mux focus.
    MuxIn,
    /// The binding lost mux focus.
    MuxOut,
}

/// Errors surfaced by front-end and backend operations.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ChardevError {
    /// device '{0}' is in use
    DeviceInUse(String),
    /// operation not supported by the backend
    NotSupported,
    /// missing associated backend
    MissingBackend,
    /// cannot create the event-loop wakeup descriptor: {0}
    EventFd(std::io::Error),
}

/// Process-wide state every front-end operation consults: the virtual
/// clock, the pacer-owned `io_sync` flag, and the replay facility. Built
/// exactly once at startup and passed through construction.
#[derive(Clone)]
pub struct ChardevContext {
    clock: Clock,
    io_sync: bool,
    replay: Rc<ReplayLog>,
}

impl ChardevContext {
    /// Builds the shared front-end context from the pacer configuration.
    pub fn new(clock: Clock, pacer_config: &PacerConfig, replay_mode: ReplayMode) -> Self {
        ChardevContext {
            clock,
            io_sync: pacer_config.io_sync,
            replay: ReplayLog::new(replay_mode),
        }
    }

    /// The virtual clock deferred open events are scheduled on.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Whether writes must complete synchronously at the front-end
    /// boundary.
    pub fn io_sync(&self) -> bool {
        self.io_sync
    }

    /// The record/playback log.
    pub fn replay(&self) -> &Rc<ReplayLog> {
        &self.replay
    }
}

impl fmt::Debug for ChardevContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChardevContext")
            .field("io_sync", &self.io_sync)
            .field("replay", &self.replay.mode())
            .finish()
    }
}
