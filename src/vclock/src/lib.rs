// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Virtual-clock and virtual-timer subsystem.
//!
//! The emulator's notion of time is a nanosecond counter that advances with
//! the host monotonic clock only while ticks are enabled. Components schedule
//! one-shot [`Timer`]s against that counter; expired timers are run from the
//! event-loop thread via [`Clock::run_expired`] or [`Clock::poll`].
//!
//! The whole subsystem is confined to the event-loop thread ([`Clock`] is a
//! cheap `Rc` handle and is not `Send`).

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::debug;

/// Largest host-sleep slice used by [`Clock::poll`], so a caller rearming
/// timers concurrently with the sleep is picked up promptly.
const MAX_POLL_SLICE: Duration = Duration::from_millis(1);

type TimerCallback = Box<dyn FnMut()>;

struct TimerEntry {
    deadline_ns: Option<i64>,
    callback: Rc<RefCell<TimerCallback>>,
}

struct ClockState {
    /// Virtual nanoseconds accumulated while ticks were enabled.
    offset_ns: i64,
    /// Host instant at which ticks were last enabled; `None` while frozen.
    ticks_base: Option<Instant>,
    /// Ceiling the clock never advances past, regardless of host time.
    horizon_ns: Option<i64>,
}

impl ClockState {
    fn now_ns(&self) -> i64 {
        let raw = match self.ticks_base {
            Some(base) => self.offset_ns.saturating_add(elapsed_ns(base)),
            None => self.offset_ns,
        };
        match self.horizon_ns {
            Some(horizon) => raw.min(horizon),
            None => raw,
        }
    }
}

struct ClockInner {
    state: RefCell<ClockState>,
    timers: RefCell<Vec<Option<TimerEntry>>>,
}

/// Handle to the virtual clock and its timer list.
#[derive(Clone)]
pub struct Clock {
    inner: Rc<ClockInner>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// Creates a clock at virtual time zero with ticks disabled.
    pub fn new() -> Clock {
        Clock {
            inner: Rc::new(ClockInner {
                state: RefCell::new(ClockState {
                    offset_ns: 0,
                    ticks_base: None,
                    horizon_ns: None,
                }),
                timers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Current virtual time in nanoseconds. Monotonically non-decreasing,
    /// and never past the configured horizon.
    pub fn now_ns(&self) -> i64 {
        self.inner.state.borrow().now_ns()
    }

    /// Caps the clock at an absolute virtual time. Host ticks past the
    /// horizon are discarded, so the clock parks exactly at the cap. The
    /// horizon must never move backwards past the current virtual time.
    pub fn set_horizon_ns(&self, horizon_ns: i64) {
        let mut state = self.inner.state.borrow_mut();
        debug_assert!(horizon_ns >= state.now_ns(), "horizon set in the past");
        state.horizon_ns = Some(horizon_ns);
    }

    /// Removes the horizon cap.
    pub fn clear_horizon(&self) {
        self.inner.state.borrow_mut().horizon_ns = None;
    }

    /// Whether the clock is currently advancing with host time.
    pub fn ticks_enabled(&self) -> bool {
        self.inner.state.borrow().ticks_base.is_some()
    }

    /// Starts folding host time into the virtual clock. Idempotent.
    pub fn enable_ticks(&self) {
        let mut state = self.inner.state.borrow_mut();
        if state.ticks_base.is_none() {
            state.ticks_base = Some(Instant::now());
            debug!("virtual clock ticks enabled at {}ns", state.offset_ns);
        }
    }

    /// Freezes the virtual clock at its current value. Idempotent.
    pub fn disable_ticks(&self) {
        let mut state = self.inner.state.borrow_mut();
        if state.ticks_base.is_some() {
            let now = state.now_ns();
            state.ticks_base = None;
            state.offset_ns = now;
            debug!("virtual clock ticks disabled at {now}ns");
        }
    }

    /// Creates a disarmed one-shot timer owned by this clock.
    pub fn new_timer<F: FnMut() + 'static>(&self, callback: F) -> Timer {
        let entry = TimerEntry {
            deadline_ns: None,
            callback: Rc::new(RefCell::new(Box::new(callback))),
        };
        let mut timers = self.inner.timers.borrow_mut();
        let slot = match timers.iter().position(Option::is_none) {
            Some(slot) => {
                timers[slot] = Some(entry);
                slot
            }
            None => {
                timers.push(Some(entry));
                timers.len() - 1
            }
        };
        Timer {
            clock: Rc::downgrade(&self.inner),
            slot,
        }
    }

    /// Relative nanoseconds until the earliest armed deadline, clamped at
    /// zero when already due. `None` when no timer is armed.
    pub fn deadline_ns(&self) -> Option<i64> {
        let earliest = self
            .inner
            .timers
            .borrow()
            .iter()
            .flatten()
            .filter_map(|entry| entry.deadline_ns)
            .min()?;
        Some((earliest - self.now_ns()).max(0))
    }

    /// Runs every timer whose deadline has been reached, earliest first.
    ///
    /// Expired timers are disarmed before their callback runs, so a callback
    /// may rearm its own timer (or any other). Returns whether any fired.
    pub fn run_expired(&self) -> bool {
        let now = self.now_ns();
        let mut due: Vec<(i64, Rc<RefCell<TimerCallback>>)> = Vec::new();
        {
            let mut timers = self.inner.timers.borrow_mut();
            for entry in timers.iter_mut().flatten() {
                if let Some(deadline) = entry.deadline_ns {
                    if deadline <= now {
                        entry.deadline_ns = None;
                        due.push((deadline, entry.callback.clone()));
                    }
                }
            }
        }
        due.sort_by_key(|(deadline, _)| *deadline);
        let fired = !due.is_empty();
        for (_, callback) in due {
            (callback.borrow_mut())();
        }
        fired
    }

    /// Sleeps host time in small slices until the earliest armed deadline is
    /// due, then fires it. Returns `false` without sleeping when no timer is
    /// armed, or when the clock is frozen and cannot reach the deadline.
    pub fn poll(&self) -> bool {
        loop {
            if self.run_expired() {
                return true;
            }
            let Some(relative) = self.deadline_ns() else {
                return false;
            };
            if relative > 0 {
                if !self.can_advance() {
                    return false;
                }
                let wait = Duration::from_nanos(relative.unsigned_abs()).min(MAX_POLL_SLICE);
                std::thread::sleep(wait);
            }
        }
    }

    /// Whether the clock can still make forward progress on its own: ticks
    /// enabled and not parked at the horizon.
    fn can_advance(&self) -> bool {
        let state = self.inner.state.borrow();
        state.ticks_base.is_some() && state.horizon_ns.map_or(true, |h| state.now_ns() < h)
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("now_ns", &self.now_ns())
            .field("ticks_enabled", &self.ticks_enabled())
            .finish()
    }
}

fn elapsed_ns(base: Instant) -> i64 {
    base.elapsed().as_nanos().min(i64::MAX as u128) as i64
}

/// Handle to one one-shot timer. Dropping the handle disarms and frees it.
pub struct Timer {
    clock: Weak<ClockInner>,
    slot: usize,
}

impl Timer {
    /// Arms (or rearms) the timer for an absolute virtual deadline. A
    /// deadline at or before the current virtual time fires on the next
    /// [`Clock::run_expired`] pass, never from within `arm` itself.
    pub fn arm(&self, deadline_ns: i64) {
        self.with_entry(|entry| entry.deadline_ns = Some(deadline_ns));
    }

    /// Disarms the timer without releasing it.
    pub fn disarm(&self) {
        self.with_entry(|entry| entry.deadline_ns = None);
    }

    /// Whether the timer currently has a pending deadline.
    pub fn is_armed(&self) -> bool {
        let mut armed = false;
        self.with_entry(|entry| armed = entry.deadline_ns.is_some());
        armed
    }

    fn with_entry(&self, f: impl FnOnce(&mut TimerEntry)) {
        if let Some(clock) = self.clock.upgrade() {
            if let Some(entry) = clock.timers.borrow_mut()[self.slot].as_mut() {
                f(entry);
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(clock) = self.clock.upgrade() {
            clock.timers.borrow_mut()[self.slot] = None;
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("slot", &self.slot)
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn frozen_clock_does_not_advance() {
        let clock = Clock::new();
        assert_eq!(clock.now_ns(), 0);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(clock.now_ns(), 0);
    }

    #[test]
    fn ticks_advance_and_freeze() {
        let clock = Clock::new();
        clock.enable_ticks();
        // Idempotent; must not rebase the origin.
        clock.enable_ticks();
        std::thread::sleep(Duration::from_millis(2));
        clock.disable_ticks();
        let frozen = clock.now_ns();
        assert!(frozen >= 2_000_000);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(clock.now_ns(), frozen);
        clock.disable_ticks();
        assert_eq!(clock.now_ns(), frozen);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let clock = Clock::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let first = clock.new_timer({
            let order = order.clone();
            move || order.borrow_mut().push(1)
        });
        let second = clock.new_timer({
            let order = order.clone();
            move || order.borrow_mut().push(2)
        });
        second.arm(20);
        first.arm(10);
        clock.enable_ticks();
        while clock.now_ns() < 20 {}
        assert!(clock.run_expired());
        assert_eq!(*order.borrow(), vec![1, 2]);
        assert!(!first.is_armed());
        assert!(!second.is_armed());
    }

    #[test]
    fn deadline_is_relative_and_clamped() {
        let clock = Clock::new();
        assert_eq!(clock.deadline_ns(), None);
        let timer = clock.new_timer(|| ());
        timer.arm(1_000_000);
        assert_eq!(clock.deadline_ns(), Some(1_000_000));
        timer.arm(0);
        assert_eq!(clock.deadline_ns(), Some(0));
    }

    #[test]
    fn callback_may_rearm_itself() {
        let clock = Clock::new();
        let fired = Rc::new(Cell::new(0u32));
        let timer = Rc::new(RefCell::new(None::<Timer>));
        let t = clock.new_timer({
            let fired = fired.clone();
            let timer = timer.clone();
            move || {
                fired.set(fired.get() + 1);
                if fired.get() == 1 {
                    if let Some(t) = timer.borrow().as_ref() {
                        t.arm(0);
                    }
                }
            }
        });
        t.arm(0);
        *timer.borrow_mut() = Some(t);
        assert!(clock.run_expired());
        assert_eq!(fired.get(), 1);
        // The rearm from inside the callback fires on the next pass.
        assert!(clock.run_expired());
        assert_eq!(fired.get(), 2);
        assert!(!clock.run_expired());
    }

    #[test]
    fn drop_disarms() {
        let clock = Clock::new();
        let timer = clock.new_timer(|| panic!("dropped timer must not fire"));
        timer.arm(0);
        drop(timer);
        assert_eq!(clock.deadline_ns(), None);
        assert!(!clock.run_expired());
    }

    #[test]
    fn slot_reuse_does_not_leak_deadlines() {
        let clock = Clock::new();
        let old = clock.new_timer(|| ());
        old.arm(5);
        drop(old);
        let fresh = clock.new_timer(|| ());
        assert!(!fresh.is_armed());
        fresh.arm(7);
        assert_eq!(clock.deadline_ns(), Some(7));
    }

    #[test]
    fn poll_fires_due_timer() {
        let clock = Clock::new();
        let fired = Rc::new(Cell::new(false));
        let timer = clock.new_timer({
            let fired = fired.clone();
            move || fired.set(true)
        });
        timer.arm(500_000);
        clock.enable_ticks();
        assert!(clock.poll());
        assert!(fired.get());
    }

    #[test]
    fn horizon_caps_advancement() {
        let clock = Clock::new();
        clock.set_horizon_ns(1_000_000);
        clock.enable_ticks();
        std::thread::sleep(Duration::from_millis(3));
        assert_eq!(clock.now_ns(), 1_000_000);
        clock.disable_ticks();
        assert_eq!(clock.now_ns(), 1_000_000);
        // Raising the horizon lets the clock move again.
        clock.set_horizon_ns(2_000_000);
        clock.enable_ticks();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(clock.now_ns(), 2_000_000);
    }

    #[test]
    fn zero_length_horizon_pins_the_clock() {
        let clock = Clock::new();
        let fired = Rc::new(Cell::new(false));
        let timer = clock.new_timer({
            let fired = fired.clone();
            move || fired.set(true)
        });
        timer.arm(0);
        clock.set_horizon_ns(0);
        clock.enable_ticks();
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(clock.now_ns(), 0);
        assert!(clock.poll());
        assert!(fired.get());
    }

    #[test]
    fn poll_gives_up_at_the_horizon() {
        let clock = Clock::new();
        let timer = clock.new_timer(|| panic!("timer beyond the horizon fired"));
        timer.arm(2_000_000);
        clock.set_horizon_ns(1_000_000);
        clock.enable_ticks();
        while clock.now_ns() < 1_000_000 {}
        assert!(!clock.poll());
    }

    #[test]
    fn poll_bails_out_when_frozen() {
        let clock = Clock::new();
        let timer = clock.new_timer(|| panic!("frozen clock fired a timer"));
        timer.arm(1_000_000);
        assert!(!clock.poll());
    }
}
