//! Admission control: a counting permit pool bounding concurrent connections.
//!
//! The pool is a process-shared POSIX semaphore in `MAP_SHARED` memory, so
//! one pool serves every execution strategy:
//!
//! - threads acquire and release through the same mapping,
//! - a forked child inherits the mapping and releases its parent's permit,
//!   even from a signal handler (`sem_post` is async-signal-safe).
//!
//! A disabled controller (unlimited capacity, or single-shot mode) hands out
//! empty permits and never blocks.

use std::io;
use std::mem;
use std::num::NonZeroU32;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kmsd_core::ServerConfig;

/// Pool state shared across `fork()`.
#[repr(C)]
pub(crate) struct PoolState {
    sem: libc::sem_t,
    capacity: u32,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Return one permit to the pool behind `state`.
///
/// Async-signal-safe: only `sem_post` and an atomic add.
///
/// # Safety
///
/// `state` must point to a pool initialized by [`SharedPool::new`] and still
/// mapped in this process.
pub(crate) unsafe fn post_raw(state: *mut PoolState) {
    unsafe {
        (*state).released.fetch_add(1, Ordering::Relaxed);
        libc::sem_post(ptr::addr_of_mut!((*state).sem));
    }
}

/// Owner of the shared mapping in this process.
struct SharedPool {
    state: *mut PoolState,
}

// Safety: the semaphore and counters are designed for concurrent use from
// any thread or process; the pointer itself is never re-seated.
unsafe impl Send for SharedPool {}
unsafe impl Sync for SharedPool {}

const POOL_SIZE: usize = mem::size_of::<PoolState>();

impl SharedPool {
    fn new(capacity: NonZeroU32) -> io::Result<Self> {
        // Safety: an anonymous mapping needs no descriptor; the kernel hands
        // back zeroed pages that stay shared with children forked later.
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                POOL_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let state = mapping.cast::<PoolState>();

        // Safety: state is page-aligned, zeroed and large enough. pshared=1
        // makes the semaphore usable from forked children.
        let rc = unsafe {
            ptr::addr_of_mut!((*state).capacity).write(capacity.get());
            libc::sem_init(
                ptr::addr_of_mut!((*state).sem),
                1,
                capacity.get() as libc::c_uint,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Safety: mapped above with the same size, never shared.
            unsafe { libc::munmap(mapping, POOL_SIZE) };
            return Err(err);
        }
        Ok(Self { state })
    }

    fn wait(&self) -> io::Result<()> {
        loop {
            // Safety: state was initialized in new() and is still mapped.
            let rc = unsafe { libc::sem_wait(ptr::addr_of_mut!((*self.state).sem)) };
            if rc == 0 {
                unsafe { (*self.state).acquired.fetch_add(1, Ordering::Relaxed) };
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn post(&self) {
        // Safety: state is initialized and mapped for our lifetime.
        unsafe { post_raw(self.state) }
    }

    fn stats(&self) -> PermitStats {
        let mut value: libc::c_int = 0;
        // Safety: state is initialized and mapped for our lifetime.
        unsafe {
            libc::sem_getvalue(ptr::addr_of_mut!((*self.state).sem), &mut value);
            PermitStats {
                capacity: (*self.state).capacity,
                available: value.max(0) as u32,
                acquired: (*self.state).acquired.load(Ordering::Relaxed),
                released: (*self.state).released.load(Ordering::Relaxed),
            }
        }
    }
}

impl Drop for SharedPool {
    fn drop(&mut self) {
        // Children that still hold permits keep their own mapping; the
        // semaphore is not destroyed for that reason.
        unsafe { libc::munmap(self.state.cast::<libc::c_void>(), POOL_SIZE) };
    }
}

/// Snapshot of the permit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitStats {
    /// Configured capacity.
    pub capacity: u32,
    /// Permits currently available.
    pub available: u32,
    /// Successful acquisitions since creation.
    pub acquired: u64,
    /// Releases since creation.
    pub released: u64,
}

impl PermitStats {
    /// Permits acquired and not yet released.
    pub fn in_flight(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

/// Counting limiter of concurrently served connections.
///
/// Cloning shares the same pool.
#[derive(Clone)]
pub struct AdmissionController {
    pool: Option<Arc<SharedPool>>,
}

impl AdmissionController {
    /// A controller whose permits are no-ops.
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    /// A controller admitting at most `capacity` connections at once.
    ///
    /// # Errors
    ///
    /// Fails when the shared mapping or the semaphore cannot be created,
    /// for instance when `capacity` exceeds the platform's `SEM_VALUE_MAX`.
    pub fn bounded(capacity: NonZeroU32) -> io::Result<Self> {
        Ok(Self {
            pool: Some(Arc::new(SharedPool::new(capacity)?)),
        })
    }

    /// Build from configuration: disabled when unlimited or in single-shot
    /// mode.
    ///
    /// # Errors
    ///
    /// See [`bounded`](Self::bounded).
    pub fn from_config(config: &ServerConfig) -> io::Result<Self> {
        match config.max_connections {
            Some(capacity) if config.admission_enabled() => Self::bounded(capacity),
            _ => Ok(Self::disabled()),
        }
    }

    /// Whether permits are actually counted.
    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Block until a permit is available and take it.
    ///
    /// Interrupted waits are retried.
    ///
    /// # Errors
    ///
    /// Returns the OS error when waiting on the semaphore fails for any
    /// other reason.
    pub fn acquire(&self) -> io::Result<AdmissionPermit> {
        let Some(pool) = &self.pool else {
            return Ok(AdmissionPermit { pool: None });
        };
        pool.wait()?;
        tracing::trace!("admission permit acquired");
        Ok(AdmissionPermit {
            pool: Some(Arc::clone(pool)),
        })
    }

    /// Snapshot of the pool, `None` when disabled.
    pub fn stats(&self) -> Option<PermitStats> {
        self.pool.as_ref().map(|pool| pool.stats())
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("stats", &self.stats())
            .finish()
    }
}

/// One admitted connection's claim on the pool.
///
/// Released exactly once: explicitly through [`release`](Self::release),
/// implicitly on drop (normal return, early error, or unwinding), or by the
/// forked child that took it over through [`into_shared`](Self::into_shared).
#[must_use = "dropping a permit releases it immediately"]
pub struct AdmissionPermit {
    pool: Option<Arc<SharedPool>>,
}

impl AdmissionPermit {
    /// Whether this permit counts against a pool.
    pub fn is_counted(&self) -> bool {
        self.pool.is_some()
    }

    /// Return the permit to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Give up this process's claim without releasing.
    ///
    /// The fork parent calls this after the child has taken the permit
    /// over; the child releases it.
    pub fn hand_off(mut self) {
        self.pool.take();
    }

    /// Detach the raw pool pointer for a forked child.
    ///
    /// The mapping reference is leaked on purpose: the child leaves through
    /// `_exit` and must keep the pool mapped until its final release.
    pub(crate) fn into_shared(mut self) -> Option<*mut PoolState> {
        self.pool.take().map(|pool| {
            let state = pool.state;
            mem::forget(pool);
            state
        })
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.post();
            tracing::trace!("admission permit released");
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("counted", &self.is_counted())
            .finish()
    }
}
