use std::ffi::CString;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;
use std::slice;
use std::time::Duration;

use log::{debug, warn};

use crate::errors::{Result, SrError};
use crate::lock::{LockMode, TimeoutRwLock};

pub mod layout;
pub mod path;

/// Types that may be viewed in place inside a mapping: `#[repr(C)]`, valid
/// for every bit pattern a cooperating process can leave behind, and
/// without owned pointers.
pub unsafe trait ShmCast {}

unsafe impl ShmCast for u32 {}
unsafe impl ShmCast for u64 {}

/// Owning handle of one shared-memory object: its descriptor, the current
/// mapping and its length.
///
/// `size` always equals the length of the live mapping and `addr` is
/// non-null iff something is mapped. Nothing outside this type ever keeps a
/// raw address; callers address the mapping by offset and every access
/// resolves against the base of the moment, since a remap may move it.
#[derive(Debug)]
pub struct ShmSegment {
    fd: RawFd,
    addr: *mut u8,
    size: usize,
}

// The handle itself is only moved between threads; concurrent access to the
// mapped bytes goes through the in-segment lock.
unsafe impl Send for ShmSegment {}

impl Default for ShmSegment {
    fn default() -> Self {
        ShmSegment::new()
    }
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SrError::Validation(format!("Path \"{}\" contains a NUL byte.", path.display())))
}

impl ShmSegment {
    /// An unowned handle: no descriptor, nothing mapped.
    pub const fn new() -> ShmSegment {
        ShmSegment {
            fd: -1,
            addr: ptr::null_mut(),
            size: 0,
        }
    }

    /// Opens the object at `path`, creating it when absent, and maps at
    /// least `min_size` bytes. The flag tells whether this call created it,
    /// in which case the caller initializes whatever header lives inside.
    pub fn open_or_create(path: &Path, min_size: usize, perm: u32) -> Result<(ShmSegment, bool)> {
        let c_path = c_path(path)?;
        let mut created = true;
        let mut fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
                perm as libc::c_uint,
            )
        };
        if fd == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
            created = false;
            fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        }
        if fd == -1 {
            return Err(SrError::last_sys("open"));
        }

        let mut shm = ShmSegment {
            fd,
            addr: ptr::null_mut(),
            size: 0,
        };
        let file_size = shm.file_size()?;
        let new_size = if file_size < min_size { Some(min_size) } else { None };
        if let Err(e) = shm.remap(new_size) {
            shm.clear();
            if created {
                if let Err(unlink_err) = fs::remove_file(path) {
                    warn!("Failed to unlink SHM \"{}\" ({}).", path.display(), unlink_err);
                }
            }
            return Err(e);
        }

        if created {
            debug!("Created SHM \"{}\" ({} bytes).", path.display(), shm.size);
        }
        Ok((shm, created))
    }

    /// Opens and maps the object at `path` only if it exists; `None` when it
    /// does not. Never creates, truncates or removes anything.
    pub fn open_existing(path: &Path) -> Result<Option<ShmSegment>> {
        let c_path = c_path(path)?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd == -1 {
            if io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT) {
                return Ok(None);
            }
            return Err(SrError::last_sys("open"));
        }
        let mut shm = ShmSegment {
            fd,
            addr: ptr::null_mut(),
            size: 0,
        };
        shm.remap(None)?;
        Ok(Some(shm))
    }

    /// Brings the mapping in line with the object. Without an explicit size
    /// the current file size is used and nothing is truncated; with one the
    /// object is truncated to it first. Nothing happens when the size is
    /// unchanged.
    pub fn remap(&mut self, new_size: Option<usize>) -> Result<()> {
        let target = match new_size {
            Some(size) => size,
            None => self.file_size()?,
        };
        if target == self.size && (target == 0 || !self.addr.is_null()) {
            return Ok(());
        }

        self.unmap();

        if let Some(size) = new_size {
            if unsafe { libc::ftruncate(self.fd, size as libc::off_t) } == -1 {
                return Err(SrError::last_sys("ftruncate"));
            }
        }
        if target == 0 {
            return Ok(());
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                target,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(SrError::NoMem(format!(
                "Failed to map shared memory ({}).",
                io::Error::last_os_error()
            )));
        }
        self.addr = addr as *mut u8;
        self.size = target;
        Ok(())
    }

    /// Unmaps and closes. Safe to call any number of times.
    pub fn clear(&mut self) {
        self.unmap();
        if self.fd > -1 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }

    fn unmap(&mut self) {
        if !self.addr.is_null() {
            unsafe { libc::munmap(self.addr as *mut libc::c_void, self.size) };
            self.addr = ptr::null_mut();
        }
        self.size = 0;
    }

    fn file_size(&self) -> Result<usize> {
        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut st) } == -1 {
            return Err(SrError::last_sys("fstat"));
        }
        Ok(st.st_size as usize)
    }

    /// Removes the backing object. Processes that still map it keep their
    /// mapping, new opens create a fresh one.
    pub fn unlink(path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|source| SrError::Sys {
            call: "unlink",
            source,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        !self.addr.is_null()
    }

    fn check(&self, offset: usize, len: usize, align: usize) -> Result<*mut u8> {
        if self.addr.is_null() {
            return Err(SrError::Internal("Shared memory is not mapped.".into()));
        }
        let end = offset
            .checked_add(len)
            .ok_or_else(|| SrError::Internal(format!("Offset {} overflows.", offset)))?;
        if end > self.size {
            return Err(SrError::Internal(format!(
                "Access {}..{} is out of the {} mapped bytes.",
                offset, end, self.size
            )));
        }
        let p = unsafe { self.addr.add(offset) };
        if (p as usize) % align != 0 {
            return Err(SrError::Internal(format!("Offset {} is not aligned to {}.", offset, align)));
        }
        Ok(p)
    }

    pub fn at<T: ShmCast>(&self, offset: usize) -> Result<&T> {
        let p = self.check(offset, mem::size_of::<T>(), mem::align_of::<T>())?;
        Ok(unsafe { &*(p as *const T) })
    }

    pub fn at_mut<T: ShmCast>(&mut self, offset: usize) -> Result<&mut T> {
        let p = self.check(offset, mem::size_of::<T>(), mem::align_of::<T>())?;
        Ok(unsafe { &mut *(p as *mut T) })
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let p = self.check(offset, len, 1)?;
        Ok(unsafe { slice::from_raw_parts(p, len) })
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let p = self.check(offset, len, 1)?;
        Ok(unsafe { slice::from_raw_parts_mut(p, len) })
    }

    /// Takes the lock stored at `offset` and returns a guard that keeps the
    /// segment borrowed until it is released.
    pub fn rwlock(
        &mut self,
        offset: usize,
        timeout: Duration,
        read_timeout: Duration,
        mode: LockMode,
        func: &str,
    ) -> Result<SegmentLockGuard<'_>> {
        self.at::<TimeoutRwLock>(offset)?
            .lock(timeout, read_timeout, mode, func)?;
        Ok(SegmentLockGuard {
            shm: self,
            offset,
            read_timeout,
            mode,
            func: func.to_string(),
        })
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A held segment lock. The lock is looked up again on release, so the
/// segment may be remapped while the guard is alive.
pub struct SegmentLockGuard<'a> {
    shm: &'a mut ShmSegment,
    offset: usize,
    read_timeout: Duration,
    mode: LockMode,
    func: String,
}

impl<'a> SegmentLockGuard<'a> {
    #[inline]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    #[inline]
    pub fn shm(&self) -> &ShmSegment {
        &*self.shm
    }

    /// Mutable access is only handed out under a write lock.
    pub fn shm_mut(&mut self) -> Result<&mut ShmSegment> {
        match self.mode {
            LockMode::Write => Ok(&mut *self.shm),
            LockMode::Read => Err(SrError::Internal(format!(
                "Segment modified under a read lock in {}.",
                self.func
            ))),
        }
    }
}

impl<'a> Drop for SegmentLockGuard<'a> {
    fn drop(&mut self) {
        match self.shm.at::<TimeoutRwLock>(self.offset) {
            Ok(lock) => lock.unlock(self.read_timeout, self.mode, &self.func),
            Err(e) => log::error!("Lock of a segment lost before unlocking in {} ({}).", self.func, e),
        }
    }
}
