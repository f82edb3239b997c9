//! Signal handling: process-wide shutdown and forked-worker crash cleanup.

use std::io;
use std::mem;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::admission::{self, PoolState};

/// Set from the SIGINT/SIGTERM handler installed by
/// [`ShutdownSignal::install_os_handlers`].
static OS_SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Pool of the permit a forked child still holds, null once released.
static CHILD_PERMIT: AtomicPtr<PoolState> = AtomicPtr::new(ptr::null_mut());

/// Signals that end a forked worker. Each releases the held permit first.
const CHILD_FATAL_SIGNALS: [libc::c_int; 6] = [
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGSEGV,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGBUS,
];

/// Cooperative shutdown request for the accept loop.
///
/// Clones share the flag. The loop checks it between iterations; in-flight
/// connections are never cancelled and end through their I/O timeouts.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// A signal that has not been requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the accept loop to stop.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown was requested, programmatically or by SIGINT/SIGTERM.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || OS_SHUTDOWN.load(Ordering::SeqCst)
    }

    /// Route SIGINT and SIGTERM to this process's shutdown flag.
    ///
    /// The handlers are installed without `SA_RESTART`, so a readiness wait
    /// blocked in the accept loop returns `EINTR` and the loop notices the
    /// request on its next iteration.
    ///
    /// # Errors
    ///
    /// Returns the OS error if `sigaction` fails.
    pub fn install_os_handlers(&self) -> io::Result<()> {
        let handler = shutdown_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        for signal in [libc::SIGINT, libc::SIGTERM] {
            set_handler(signal, handler)?;
        }
        Ok(())
    }
}

extern "C" fn shutdown_handler(_signal: libc::c_int) {
    OS_SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn child_fatal_handler(_signal: libc::c_int) {
    release_child_permit();
    // Safety: _exit is async-signal-safe.
    unsafe { libc::_exit(1) }
}

fn set_handler(signal: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // Safety: the sigaction struct is fully initialized before use and the
    // handlers only touch atomics and async-signal-safe calls.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Arm crash cleanup in a freshly forked worker.
///
/// SIGHUP is ignored so a closed terminal does not kill the worker. The
/// fatal signals release `permit` (when counted) and exit with status 1.
pub(crate) fn install_child_handlers(permit: Option<*mut PoolState>) {
    CHILD_PERMIT.store(permit.unwrap_or(ptr::null_mut()), Ordering::SeqCst);

    if let Err(e) = set_handler(libc::SIGHUP, libc::SIG_IGN) {
        tracing::debug!(error = %e, "cannot ignore SIGHUP in worker");
    }
    for signal in CHILD_FATAL_SIGNALS {
        let handler = child_fatal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        if let Err(e) = set_handler(signal, handler) {
            tracing::debug!(signal, error = %e, "cannot install worker signal handler");
        }
    }
}

/// Release the forked worker's permit if it is still held.
///
/// Async-signal-safe and idempotent: the pointer is swapped out first.
pub(crate) fn release_child_permit() {
    let state = CHILD_PERMIT.swap(ptr::null_mut(), Ordering::SeqCst);
    if !state.is_null() {
        // Safety: the pointer was armed from a live pool mapping that the
        // child never unmaps.
        unsafe { admission::post_raw(state) };
    }
}
