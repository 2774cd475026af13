//! Reader/writer lock usable by unrelated processes.
//!
//! A mutex, a condition variable and a reader count, all living in the
//! shared mapping. Holding the mutex *is* the write lock; a read lock is
//! just a counted reservation taken and returned under a short mutex hold.
//! There is no writer preference: a writer and the readers race for the
//! mutex and a writer may starve.
//!
//! Shared locks use robust mutexes. When the previous mutex owner died the
//! next acquirer marks the mutex consistent, logs it and proceeds; the
//! guarded data may then be half-written. A reader that dies while holding
//! only its counted reservation cannot be detected and makes every later
//! writer time out.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};

use crate::core::ShmCast;
use crate::errors::{Result, SrError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    fn as_str(&self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

#[repr(C)]
pub struct TimeoutRwLock {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    readers: UnsafeCell<u32>,
}

unsafe impl Send for TimeoutRwLock {}
unsafe impl Sync for TimeoutRwLock {}
unsafe impl ShmCast for TimeoutRwLock {}

/// Absolute `CLOCK_REALTIME` deadline `timeout` from now, the clock the
/// timed pthread calls expect.
fn deadline(timeout: Duration) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };

    let nsec = ts.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    ts.tv_sec = ts
        .tv_sec
        .saturating_add(timeout.as_secs() as libc::time_t)
        .saturating_add((nsec / 1_000_000_000) as libc::time_t);
    ts.tv_nsec = (nsec % 1_000_000_000) as libc::c_long;
    ts
}

impl TimeoutRwLock {
    /// Initializes the lock where it lies.
    ///
    /// # Safety
    ///
    /// `self` must not be in use by anyone, and must not move afterwards.
    pub unsafe fn init(&self, shared: bool) -> Result<()> {
        if (self as *const Self as usize) % mem::align_of::<libc::pthread_mutex_t>() != 0 {
            return Err(SrError::Internal("Mutex address not aligned.".into()));
        }

        let mut mattr: libc::pthread_mutexattr_t = mem::zeroed();
        let ret = libc::pthread_mutexattr_init(&mut mattr);
        if ret != 0 {
            return Err(init_error("mutex attr", ret));
        }
        if shared {
            let ret = libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
            if ret != 0 {
                libc::pthread_mutexattr_destroy(&mut mattr);
                return Err(init_error("mutex attr", ret));
            }
            let ret = libc::pthread_mutexattr_setrobust(&mut mattr, libc::PTHREAD_MUTEX_ROBUST);
            if ret != 0 {
                libc::pthread_mutexattr_destroy(&mut mattr);
                return Err(init_error("mutex attr", ret));
            }
        }
        let ret = libc::pthread_mutex_init(self.mutex.get(), &mattr);
        libc::pthread_mutexattr_destroy(&mut mattr);
        if ret != 0 {
            return Err(init_error("mutex", ret));
        }

        let mut cattr: libc::pthread_condattr_t = mem::zeroed();
        let ret = libc::pthread_condattr_init(&mut cattr);
        if ret != 0 {
            libc::pthread_mutex_destroy(self.mutex.get());
            return Err(init_error("cond attr", ret));
        }
        if shared {
            let ret = libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
            if ret != 0 {
                libc::pthread_condattr_destroy(&mut cattr);
                libc::pthread_mutex_destroy(self.mutex.get());
                return Err(init_error("cond attr", ret));
            }
        }
        let ret = libc::pthread_cond_init(self.cond.get(), &cattr);
        libc::pthread_condattr_destroy(&mut cattr);
        if ret != 0 {
            libc::pthread_mutex_destroy(self.mutex.get());
            return Err(init_error("cond", ret));
        }

        *self.readers.get() = 0;
        Ok(())
    }

    /// A process-local lock on the heap.
    pub fn new_local() -> Result<Arc<TimeoutRwLock>> {
        let lock: Arc<TimeoutRwLock> = Arc::new(unsafe { mem::zeroed() });
        unsafe { lock.init(false)? };
        Ok(lock)
    }

    /// # Safety
    ///
    /// Nobody may hold or wait on the lock, now or later.
    pub unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.mutex.get());
        libc::pthread_cond_destroy(self.cond.get());
    }

    /// Current reader count, read without synchronization. Diagnostics only.
    pub fn readers(&self) -> u32 {
        unsafe { std::ptr::read_volatile(self.readers.get()) }
    }

    fn mutex_timedlock(&self, abs: &libc::timespec, mode: LockMode, func: &str) -> Result<()> {
        let ret = unsafe { libc::pthread_mutex_timedlock(self.mutex.get(), abs) };
        match ret {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                self.recover(func);
                Ok(())
            }
            _ => Err(SrError::lock(func, mode.as_str(), ret)),
        }
    }

    fn recover(&self, func: &str) {
        warn!("Recovered a lock whose owner died, in {}; guarded data may be inconsistent.", func);
        unsafe { libc::pthread_mutex_consistent(self.mutex.get()) };
    }

    fn mutex_unlock(&self) {
        let ret = unsafe { libc::pthread_mutex_unlock(self.mutex.get()) };
        if ret != 0 {
            warn!("Unlocking a mutex failed ({}).", std::io::Error::from_raw_os_error(ret));
        }
    }

    /// Takes the lock. A write lock waits for the mutex and then for the
    /// readers to leave, both within `timeout`. A read lock only needs the
    /// mutex briefly and never waits longer than `read_timeout`.
    ///
    /// A [`SrError::LockTimeout`] leaves the lock untouched, but the state
    /// it guards may belong to a holder that died.
    pub fn lock(&self, timeout: Duration, read_timeout: Duration, mode: LockMode, func: &str) -> Result<()> {
        match mode {
            LockMode::Write => {
                let abs = deadline(timeout);
                self.mutex_timedlock(&abs, mode, func)?;

                let mut ret = 0;
                while ret == 0 && unsafe { *self.readers.get() } > 0 {
                    ret = unsafe { libc::pthread_cond_timedwait(self.cond.get(), self.mutex.get(), &abs) };
                    if ret == libc::EOWNERDEAD {
                        self.recover(func);
                        ret = 0;
                    }
                }
                if ret != 0 {
                    // never keep the mutex on a failed write lock
                    self.mutex_unlock();
                    return Err(SrError::lock(func, mode.as_str(), ret));
                }
                Ok(())
            }
            LockMode::Read => {
                let abs = deadline(timeout.min(read_timeout));
                self.mutex_timedlock(&abs, mode, func)?;
                unsafe { *self.readers.get() += 1 };
                self.mutex_unlock();
                Ok(())
            }
        }
    }

    pub fn unlock(&self, read_timeout: Duration, mode: LockMode, func: &str) {
        if mode == LockMode::Read {
            let abs = deadline(read_timeout);
            if let Err(e) = self.mutex_timedlock(&abs, mode, func) {
                error!("Failed to return a read lock in {}, reader count left as is ({}).", func, e);
                return;
            }
            let readers = unsafe { &mut *self.readers.get() };
            if *readers == 0 {
                error!("Internal error: read unlock without any reader in {}.", func);
            } else {
                *readers -= 1;
            }
        }

        let readers = unsafe { *self.readers.get() };
        assert!(
            mode == LockMode::Read || readers == 0,
            "write lock released with {} readers in {}",
            readers,
            func
        );
        if readers == 0 {
            unsafe { libc::pthread_cond_broadcast(self.cond.get()) };
        }
        self.mutex_unlock();
    }
}

fn init_error(what: &str, ret: libc::c_int) -> SrError {
    SrError::Internal(format!(
        "Initializing pthread {} failed ({}).",
        what,
        std::io::Error::from_raw_os_error(ret)
    ))
}
