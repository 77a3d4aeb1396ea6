// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The mux backend: one underlying channel shared by up to [`MAX_MUX`]
//! front-end bindings, one of which has focus at a time.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::{Rc, Weak};

use crate::backend::{ChardevDriver, ChardevRef};
use crate::frontend::{self, CharFrontend, FeState};
use crate::{ChardevContext, ChardevError, ChardevEvent, MAX_MUX};

/// Bookkeeping shared between the driver and the routing closures it
/// installs on the inner binding. Slots are append-only: deinit nulls a
/// slot but `cnt` never shrinks, so tags stay stable.
pub(crate) struct MuxState {
    bindings: [Option<Weak<RefCell<FeState>>>; MAX_MUX],
    cnt: usize,
    focus: Option<usize>,
}

/// Backend driver multiplexing an inner chardev across several bindings.
///
/// The mux consumes the inner backend through a front-end binding of its
/// own; installing the outer handlers descends into that inner binding,
/// which is the recursion `set_handlers` guards against with its
/// reentry flag.
pub struct MuxDriver {
    inner: ChardevRef,
    fe: CharFrontend,
    state: Rc<RefCell<MuxState>>,
}

impl MuxDriver {
    /// Creates a mux over `inner`, taking the inner backend's single
    /// binding slot.
    pub fn new(inner: ChardevRef, ctx: &ChardevContext) -> Result<MuxDriver, ChardevError> {
        let fe = CharFrontend::new(ctx);
        fe.init(&inner)?;
        // The inner binding is plumbing, not a guest consumer: events and
        // input must reach the routing handlers, where the per-binding
        // policies of the outer bindings take over.
        fe.mark_non_guest_device();
        Ok(MuxDriver {
            inner,
            fe,
            state: Rc::new(RefCell::new(MuxState {
                bindings: Default::default(),
                cnt: 0,
                focus: None,
            })),
        })
    }

    /// The multiplexed inner backend. The guest-input policy of the mux is
    /// the inner backend's.
    pub fn inner(&self) -> &ChardevRef {
        &self.inner
    }

    /// Number of binding slots handed out so far (freed slots included).
    pub fn count(&self) -> usize {
        self.state.borrow().cnt
    }

    /// The focused slot, if focus was ever taken.
    pub fn focus(&self) -> Option<usize> {
        self.state.borrow().focus
    }

    /// Appends a binding, returning its tag; `None` when every slot has
    /// been handed out.
    pub(crate) fn attach(&mut self, binding: Weak<RefCell<FeState>>) -> Option<usize> {
        let mut state = self.state.borrow_mut();
        if state.cnt >= MAX_MUX {
            return None;
        }
        let tag = state.cnt;
        state.bindings[tag] = Some(binding);
        state.cnt += 1;
        Some(tag)
    }

    /// Nulls a slot on deinit. The slot is never reissued.
    pub(crate) fn clear_slot(&mut self, tag: usize) {
        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.bindings.get_mut(tag) {
            *slot = None;
        }
        if state.focus == Some(tag) {
            state.focus = None;
        }
    }

    /// Live bindings, in slot order.
    pub(crate) fn bindings(&self) -> Vec<Weak<RefCell<FeState>>> {
        self.state.borrow().bindings.iter().flatten().cloned().collect()
    }

    /// Moves focus to `tag`, returning the MUX_OUT/MUX_IN deliveries the
    /// caller performs once no backend borrows are held.
    pub(crate) fn set_focus(&self, tag: usize) -> Vec<(Weak<RefCell<FeState>>, ChardevEvent)> {
        let mut state = self.state.borrow_mut();
        debug_assert!(tag < state.cnt, "focus on a slot never handed out");
        let mut deliveries = Vec::new();
        if let Some(old) = state.focus {
            if let Some(binding) = state.bindings.get(old).and_then(Option::as_ref) {
                deliveries.push((binding.clone(), ChardevEvent::MuxOut));
            }
        }
        state.focus = Some(tag);
        if let Some(binding) = state.bindings.get(tag).and_then(Option::as_ref) {
            deliveries.push((binding.clone(), ChardevEvent::MuxIn));
        }
        deliveries
    }

    /// Installs the routing handlers on the inner binding when an outer
    /// binding opens. Runs as a mux reentry so the descent cannot
    /// re-trigger focus stealing or deferred open delivery. A closing
    /// binding leaves the routing in place: other slots may still be live,
    /// and an unfocused binding receives nothing anyway.
    pub(crate) fn set_handlers(&self, fe_open: bool) {
        if !fe_open {
            return;
        }
        let can_read_state = self.state.clone();
        let read_state = self.state.clone();
        let event_state = self.state.clone();
        self.fe.set_handlers_full(
            Some(Box::new(move || match focused(&can_read_state) {
                Some(binding) => frontend::fe_can_read(&binding),
                None => 0,
            })),
            Some(Box::new(move |buf| {
                if let Some(binding) = focused(&read_state) {
                    frontend::fe_read(&binding, buf);
                }
            })),
            Some(Box::new(move |event| {
                // Every listener hears line events, focused or not.
                let bindings: Vec<_> =
                    event_state.borrow().bindings.iter().flatten().cloned().collect();
                for binding in bindings {
                    frontend::fe_send_event(&binding, event);
                }
            })),
            None,
            false,
            true,
        );
    }
}

fn focused(state: &Rc<RefCell<MuxState>>) -> Option<Weak<RefCell<FeState>>> {
    let state = state.borrow();
    state.focus.and_then(|tag| state.bindings[tag].clone())
}

impl ChardevDriver for MuxDriver {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.fe.write(buf)
    }

    fn accept_input(&mut self) {
        self.fe.accept_input();
    }

    fn as_mux(&self) -> Option<&MuxDriver> {
        Some(self)
    }

    fn as_mux_mut(&mut self) -> Option<&mut MuxDriver> {
        Some(self)
    }
}

impl fmt::Debug for MuxDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("MuxDriver")
            .field("inner", &self.inner.label())
            .field("cnt", &state.cnt)
            .field("focus", &state.focus)
            .finish()
    }
}
