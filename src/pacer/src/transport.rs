// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transports carrying the time-advance protocol to the co-simulator.
//!
//! The protocol is three primitives over a pair of machine words: one
//! `handshake` post after setup, then per grant cycle one
//! `send_request(requested, elapsed)` followed by one blocking `recv_grant`.
//! [`ShmTransport`] speaks it over the POSIX objects the co-simulator
//! creates before forking us; [`channel_pair`] provides an in-process
//! replacement for tests and embedded simulators.

use std::sync::mpsc;

/// Errors raised while opening or driving a sync transport.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum TransportError {
    /// shm_open of {0} failed: {1}
    ShmOpen(String, std::io::Error),
    /// sem_open of {0} failed: {1}
    SemOpen(String, std::io::Error),
    /// mmap of the sync region failed: {0}
    Mmap(std::io::Error),
    /// semaphore wait failed: {0}
    SemWait(std::io::Error),
    /// semaphore post failed: {0}
    SemPost(std::io::Error),
    /// the simulator side of the channel is gone
    Disconnected,
    /// POSIX shared memory is not supported on this host
    Unsupported,
}

/// One side of the time-advance protocol, as seen from the emulator.
pub trait SyncTransport {
    /// Tells the co-simulator that setup is complete (posts `S_ready`).
    fn handshake(&mut self) -> Result<(), TransportError>;

    /// Publishes the next advance request together with the elapsed time of
    /// the interval that just ended (posts `S_request`).
    fn send_request(&mut self, requested_ns: i64, elapsed_ns: i64) -> Result<(), TransportError>;

    /// Blocks until the co-simulator grants an advance (waits `S_grant`).
    fn recv_grant(&mut self) -> Result<i64, TransportError>;
}

#[cfg(target_os = "linux")]
pub use self::posix::ShmTransport;

#[cfg(target_os = "linux")]
mod posix {
    use std::ffi::CString;
    use std::io;
    use std::ptr;

    use super::{SyncTransport, TransportError};

    /// Name prefix of the shared-memory region created by the co-simulator.
    const SHM_NAME_PREFIX: &str = "/qemu_mem";
    /// Name prefixes of the ready/grant/request semaphores, in role order.
    const SEM_NAME_PREFIXES: [&str; 3] = ["/qemu_sem_a", "/qemu_sem_b", "/qemu_sem_c"];

    const SEM_READY: usize = 0;
    const SEM_GRANT: usize = 1;
    const SEM_REQUEST: usize = 2;

    /// The region holds the request/grant word and the elapsed word.
    const SYNC_REGION_LEN: usize = 2 * std::mem::size_of::<libc::c_long>();

    /// Shared-memory transport over the objects the parent simulator
    /// created under names derived from its pid.
    ///
    /// Opening unlinks every name immediately; the kernel objects stay
    /// alive until both processes detach.
    pub struct ShmTransport {
        words: *mut libc::c_long,
        sems: [*mut libc::sem_t; 3],
    }

    impl ShmTransport {
        /// Opens the region and semaphores published by our parent process.
        pub fn open() -> Result<ShmTransport, TransportError> {
            // SAFETY: getppid cannot fail.
            Self::open_for_parent(unsafe { libc::getppid() })
        }

        fn open_for_parent(parent: libc::pid_t) -> Result<ShmTransport, TransportError> {
            let shm_name = object_name(SHM_NAME_PREFIX, parent);
            // SAFETY: `shm_name` is a valid NUL-terminated string.
            let mem_fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0) };
            if mem_fd < 0 {
                return Err(TransportError::ShmOpen(
                    display_name(&shm_name),
                    io::Error::last_os_error(),
                ));
            }
            // The name is not needed once the object is open; the simulator
            // and the kernel keep the region alive through the mapping.
            // SAFETY: `shm_name` is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(shm_name.as_ptr()) };

            let mut sems = [ptr::null_mut(); 3];
            for (idx, prefix) in SEM_NAME_PREFIXES.iter().enumerate() {
                let sem_name = object_name(prefix, parent);
                // SAFETY: `sem_name` is a valid NUL-terminated string.
                let sem = unsafe { libc::sem_open(sem_name.as_ptr(), libc::O_RDWR) };
                if sem == libc::SEM_FAILED {
                    let err = io::Error::last_os_error();
                    close_all(mem_fd, &sems, ptr::null_mut());
                    return Err(TransportError::SemOpen(display_name(&sem_name), err));
                }
                // SAFETY: `sem_name` is a valid NUL-terminated string.
                unsafe { libc::sem_unlink(sem_name.as_ptr()) };
                sems[idx] = sem;
            }

            // SAFETY: mapping a fresh region of SYNC_REGION_LEN bytes from a
            // descriptor we own; the result is checked below.
            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    SYNC_REGION_LEN,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    mem_fd,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                close_all(mem_fd, &sems, ptr::null_mut());
                return Err(TransportError::Mmap(err));
            }
            // SAFETY: the mapping keeps the region alive without the fd.
            unsafe { libc::close(mem_fd) };

            Ok(ShmTransport {
                words: addr.cast::<libc::c_long>(),
                sems,
            })
        }

        fn post(&self, sem: usize) -> Result<(), TransportError> {
            // SAFETY: `sem` indexes a semaphore opened in `open_for_parent`
            // and not yet closed.
            if unsafe { libc::sem_post(self.sems[sem]) } < 0 {
                return Err(TransportError::SemPost(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn wait(&self, sem: usize) -> Result<(), TransportError> {
            loop {
                // SAFETY: `sem` indexes a semaphore opened in
                // `open_for_parent` and not yet closed.
                if unsafe { libc::sem_wait(self.sems[sem]) } == 0 {
                    return Ok(());
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(TransportError::SemWait(err));
                }
            }
        }
    }

    impl SyncTransport for ShmTransport {
        fn handshake(&mut self) -> Result<(), TransportError> {
            self.post(SEM_READY)
        }

        fn send_request(
            &mut self,
            requested_ns: i64,
            elapsed_ns: i64,
        ) -> Result<(), TransportError> {
            // SAFETY: the mapping is SYNC_REGION_LEN bytes, room for both
            // words; the semaphore discipline makes us the only writer here.
            unsafe {
                self.words.write_volatile(requested_ns as libc::c_long);
                self.words.add(1).write_volatile(elapsed_ns as libc::c_long);
            }
            self.post(SEM_REQUEST)
        }

        fn recv_grant(&mut self) -> Result<i64, TransportError> {
            self.wait(SEM_GRANT)?;
            // SAFETY: the grant post orders the simulator's write of word 0
            // before this read.
            Ok(unsafe { self.words.read_volatile() })
        }
    }

    impl Drop for ShmTransport {
        fn drop(&mut self) {
            close_all(-1, &self.sems, self.words.cast::<libc::c_void>());
        }
    }

    impl std::fmt::Debug for ShmTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ShmTransport").finish()
        }
    }

    fn object_name(prefix: &str, parent: libc::pid_t) -> CString {
        CString::new(format!("{prefix}_{parent}")).expect("object name contains no NUL")
    }

    fn display_name(name: &CString) -> String {
        name.to_string_lossy().into_owned()
    }

    fn close_all(mem_fd: libc::c_int, sems: &[*mut libc::sem_t; 3], words: *mut libc::c_void) {
        if mem_fd >= 0 {
            // SAFETY: the caller passes a descriptor it owns, or -1.
            unsafe { libc::close(mem_fd) };
        }
        for sem in sems {
            if !sem.is_null() {
                // SAFETY: non-null entries were opened by sem_open.
                unsafe { libc::sem_close(*sem) };
            }
        }
        if !words.is_null() {
            // SAFETY: non-null `words` is a live SYNC_REGION_LEN mapping.
            unsafe { libc::munmap(words, SYNC_REGION_LEN) };
        }
    }
}

/// Creates a connected in-process transport pair: the emulator side and the
/// simulator side.
pub fn channel_pair() -> (ChannelTransport, SimulatorPeer) {
    let (request_tx, request_rx) = mpsc::channel();
    let (grant_tx, grant_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    (
        ChannelTransport {
            ready: ready_tx,
            requests: request_tx,
            grants: grant_rx,
        },
        SimulatorPeer {
            ready: ready_rx,
            requests: request_rx,
            grants: grant_tx,
        },
    )
}

/// In-process emulator-side transport backed by channels.
#[derive(Debug)]
pub struct ChannelTransport {
    ready: mpsc::Sender<()>,
    requests: mpsc::Sender<(i64, i64)>,
    grants: mpsc::Receiver<i64>,
}

impl SyncTransport for ChannelTransport {
    fn handshake(&mut self) -> Result<(), TransportError> {
        self.ready.send(()).map_err(|_| TransportError::Disconnected)
    }

    fn send_request(&mut self, requested_ns: i64, elapsed_ns: i64) -> Result<(), TransportError> {
        self.requests
            .send((requested_ns, elapsed_ns))
            .map_err(|_| TransportError::Disconnected)
    }

    fn recv_grant(&mut self) -> Result<i64, TransportError> {
        self.grants.recv().map_err(|_| TransportError::Disconnected)
    }
}

/// The simulator side of an in-process transport pair.
#[derive(Debug)]
pub struct SimulatorPeer {
    ready: mpsc::Receiver<()>,
    requests: mpsc::Receiver<(i64, i64)>,
    grants: mpsc::Sender<i64>,
}

impl SimulatorPeer {
    /// Blocks until the emulator posts its setup handshake.
    pub fn wait_ready(&self) -> Result<(), TransportError> {
        self.ready.recv().map_err(|_| TransportError::Disconnected)
    }

    /// Blocks for the next `(requested_ns, elapsed_ns)` exchange.
    pub fn recv_request(&self) -> Result<(i64, i64), TransportError> {
        self.requests.recv().map_err(|_| TransportError::Disconnected)
    }

    /// Grants the emulator an advance of `granted_ns`.
    pub fn grant(&self, granted_ns: i64) -> Result<(), TransportError> {
        self.grants
            .send(granted_ns)
            .map_err(|_| TransportError::Disconnected)
    }
}
