// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Shared gate between the pacer and the vCPU execution layer.
///
/// The vCPU layer calls [`Gate::sync`] before every entry into guest
/// execution; the call blocks for as long as the pacer is mid-exchange with
/// the co-simulator, so no guest instruction runs on ungranted virtual time.
#[derive(Clone, Debug)]
pub struct Gate {
    state: Arc<GateState>,
}

#[derive(Debug)]
struct GateState {
    enabled: AtomicBool,
    syncing: Mutex<bool>,
    resumed: Condvar,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Creates a gate in the pre-setup state: pacing not enabled, guest
    /// execution suspended.
    pub fn new() -> Gate {
        Gate {
            state: Arc::new(GateState {
                enabled: AtomicBool::new(false),
                syncing: Mutex::new(true),
                resumed: Condvar::new(),
            }),
        }
    }

    /// Whether external pacing has been set up. Transitions false to true
    /// exactly once, never back.
    pub fn enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Acquire)
    }

    /// Blocks the calling vCPU thread until the current grant interval is
    /// open. Returns immediately while the emulator is running.
    pub fn sync(&self) {
        let mut syncing = self
            .state
            .syncing
            .lock()
            .expect("poisoned external sync lock");
        while *syncing {
            syncing = self
                .state
                .resumed
                .wait(syncing)
                .expect("poisoned external sync lock");
        }
    }

    pub(crate) fn mark_enabled(&self) {
        let was = self.state.enabled.swap(true, Ordering::AcqRel);
        debug_assert!(!was, "external pacing enabled twice");
    }

    /// Suspends guest execution: `sync` callers block from here on.
    pub(crate) fn begin_sync(&self) {
        let mut syncing = self
            .state
            .syncing
            .lock()
            .expect("poisoned external sync lock");
        *syncing = true;
    }

    /// Resumes guest execution and wakes every gated vCPU thread.
    pub(crate) fn end_sync(&self) {
        let mut syncing = self
            .state
            .syncing
            .lock()
            .expect("poisoned external sync lock");
        *syncing = false;
        drop(syncing);
        self.state.resumed.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_syncing(&self) -> bool {
        *self
            .state
            .syncing
            .lock()
            .expect("poisoned external sync lock")
    }
}
