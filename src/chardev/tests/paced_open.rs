// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end check that a mux'd guest binding under synchronous I/O gets
//! its OPENED event from the virtual-timer wheel, inside granted time,
//! never from within the call that opened it.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use chardev::{
    CharFrontend, Chardev, ChardevContext, ChardevDriver, ChardevEvent, MuxDriver, ReplayMode,
};
use pacer::transport::channel_pair;
use pacer::{Pacer, PacerConfig};
use vclock::Clock;

struct NullDriver;

impl ChardevDriver for NullDriver {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }
}

#[test]
fn mux_open_event_arrives_with_granted_time() {
    let clock = Clock::new();
    let (transport, simulator) = channel_pair();
    let simulator_thread = std::thread::spawn(move || {
        simulator.wait_ready().unwrap();
        // First exchange happens before any device timer is armed.
        assert_eq!(simulator.recv_request().unwrap(), (i64::MAX, 0));
        simulator.grant(1_000_000).unwrap();
    });

    let config = PacerConfig { io_sync: true };
    let pacer = Pacer::try_setup(&clock, Box::new(transport), || ()).unwrap();
    let ctx = ChardevContext::new(clock.clone(), &config, ReplayMode::Off);

    let inner = Chardev::new("ttyS0", Box::new(NullDriver)).unwrap();
    let mux = MuxDriver::new(inner, &ctx).unwrap();
    let chr = Chardev::new("mux0", Box::new(mux)).unwrap();

    let fe = CharFrontend::new(&ctx);
    fe.init(&chr).unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));
    fe.set_handlers(
        None,
        None,
        Some(Box::new({
            let events = events.clone();
            move |event| events.borrow_mut().push(event)
        })),
        None,
        true,
    );
    // Taking mux focus delivers MUX_IN inline, but the opening call itself
    // must not deliver OPENED.
    assert_eq!(*events.borrow(), vec![ChardevEvent::MuxIn]);

    // The next event-loop turn delivers the deferred OPENED, at a virtual
    // tick at or after the call, within the granted interval.
    assert!(pacer.poll());
    assert_eq!(
        *events.borrow(),
        vec![ChardevEvent::MuxIn, ChardevEvent::Opened]
    );
    assert!(clock.now_ns() <= 1_000_000);

    simulator_thread.join().unwrap();
    assert!(pacer.enabled());
}
