// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Paces the emulator's virtual clock against an external discrete-event
//! simulator.
//!
//! The co-simulator forks this process and publishes a two-word shared
//! region plus three semaphores; from then on the emulator alternates
//! between *run up to the granted horizon* and *exchange with the
//! simulator*. While an exchange is pending no guest instruction may
//! execute: vCPU threads block on the [`Gate`] and the virtual clock is
//! frozen, so no side-effect of ungranted computation can reach device
//! backends.
//!
//! Everything except the [`Gate`] is confined to the event-loop thread.

mod config;
mod gate;
pub mod transport;

use std::cell::RefCell;
use std::process;
use std::rc::{Rc, Weak};

use log::{error, info};
use vclock::{Clock, Timer};

pub use crate::config::PacerConfig;
pub use crate::gate::Gate;
use crate::transport::{SyncTransport, TransportError};

/// Errors raised while setting up or driving the pacing loop. All of them
/// are fatal to the protocol; there is no resynchronization primitive.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PacerError {
    /// sync transport failed: {0}
    Transport(#[from] TransportError),
}

struct PacerInner {
    transport: Box<dyn SyncTransport>,
    clock: Clock,
    /// Virtual time at the start of the current grant interval.
    t: i64,
    sync_timer: Option<Timer>,
    /// Descheduling hook supplied by the guest execution layer.
    kick: Box<dyn FnMut()>,
}

/// The pacing core. Owns the grant cycle; hands out [`Gate`] clones for the
/// vCPU execution layer.
pub struct Pacer {
    inner: Rc<RefCell<PacerInner>>,
    gate: Gate,
    clock: Clock,
}

impl Pacer {
    /// One-shot setup of external pacing. Performs the handshake with the
    /// co-simulator and the first grant exchange; on return the emulator is
    /// running inside its first granted interval.
    ///
    /// Any failure is fatal: it is logged and the process exits non-zero,
    /// leaving no partial initialization behind.
    pub fn setup(
        clock: &Clock,
        transport: Box<dyn SyncTransport>,
        kick: impl FnMut() + 'static,
    ) -> Pacer {
        match Self::try_setup(clock, transport, kick) {
            Ok(pacer) => pacer,
            Err(err) => {
                error!("external simulation setup failed: {err}");
                process::exit(1);
            }
        }
    }

    /// Fallible variant of [`Pacer::setup`] for embedders that own the exit
    /// policy.
    pub fn try_setup(
        clock: &Clock,
        transport: Box<dyn SyncTransport>,
        kick: impl FnMut() + 'static,
    ) -> Result<Pacer, PacerError> {
        let gate = Gate::new();
        gate.mark_enabled();

        let inner = Rc::new(RefCell::new(PacerInner {
            transport,
            clock: clock.clone(),
            t: 0,
            sync_timer: None,
            kick: Box::new(kick),
        }));

        // Keep the machine suspended until the simulator grants time.
        stop_emulator(&inner, &gate);

        {
            let mut pacer = inner.borrow_mut();
            pacer.transport.handshake()?;
            pacer.t = clock.now_ns();
        }

        // The callback reaches the pacer through a weak reference; the
        // timer list must not keep the pacer (or the clock) alive.
        let sync_timer = clock.new_timer({
            let weak = Rc::downgrade(&inner);
            let gate = gate.clone();
            move || sync_func(&weak, &gate)
        });
        inner.borrow_mut().sync_timer = Some(sync_timer);

        schedule_next_event(&inner, &gate)?;
        info!("external simulation pacing enabled");

        Ok(Pacer {
            inner,
            gate,
            clock: clock.clone(),
        })
    }

    /// Whether external pacing is active.
    pub fn enabled(&self) -> bool {
        self.gate.enabled()
    }

    /// A gate clone for a vCPU thread.
    pub fn gate(&self) -> Gate {
        self.gate.clone()
    }

    /// Blocks until the current grant interval is open (the [`Gate`]
    /// primitive, callable from the embedding thread as well).
    pub fn sync(&self) {
        self.gate.sync();
    }

    /// Drives the virtual-timer loop once: sleeps until the next deadline
    /// is due and fires it. Returns whether anything ran.
    pub fn poll(&self) -> bool {
        self.clock.poll()
    }

    /// Virtual time at the start of the current grant interval.
    pub fn interval_start_ns(&self) -> i64 {
        self.inner.borrow().t
    }
}

impl std::fmt::Debug for Pacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pacer")
            .field("enabled", &self.gate.enabled())
            .field("t", &self.inner.borrow().t)
            .finish()
    }
}

/// Timer callback: the granted horizon has been reached. Suspend the
/// machine, then exchange with the simulator for the next interval.
fn sync_func(weak: &Weak<RefCell<PacerInner>>, gate: &Gate) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    stop_emulator(&inner, gate);
    if let Err(err) = schedule_next_event(&inner, gate) {
        error!("external simulation sync failed: {err}");
        process::exit(1);
    }
}

/// Suspends guest progress: gate closed, clock frozen, vCPUs kicked out of
/// their run loops.
fn stop_emulator(inner: &Rc<RefCell<PacerInner>>, gate: &Gate) {
    gate.begin_sync();
    inner.borrow().clock.disable_ticks();
    (inner.borrow_mut().kick)();
}

/// One grant cycle: report elapsed time, request the next advance, wait for
/// the grant, then resume up to the new horizon.
fn schedule_next_event(inner: &Rc<RefCell<PacerInner>>, gate: &Gate) -> Result<(), PacerError> {
    let mut pacer = inner.borrow_mut();
    let clock = pacer.clock.clone();

    let now = clock.now_ns();
    let elapsed = now - pacer.t;
    pacer.t = now;

    // Ask for enough time to reach the earliest armed timer; i64::MAX means
    // "no deadline".
    let requested = clock.deadline_ns().unwrap_or(i64::MAX);
    pacer.transport.send_request(requested, elapsed)?;
    let granted = pacer.transport.recv_grant()?;
    debug_assert!(
        granted <= requested,
        "grant {granted} exceeds request {requested}"
    );

    // The horizon must be in place before any vCPU is released, so a woken
    // thread cannot outrun the grant.
    let horizon = pacer.t.saturating_add(granted);
    pacer
        .sync_timer
        .as_ref()
        .expect("sync timer exists after setup")
        .arm(horizon);
    clock.set_horizon_ns(horizon);
    drop(pacer);

    gate.end_sync();
    clock.enable_ticks();
    Ok(())
}
