//! Named pipes subscribers block on until a publisher wakes them.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use crate::config::SrConfig;
use crate::errors::{Result, SrError};

pub fn evpipe_name(num: u32) -> String {
    format!("sr_evpipe{}", num)
}

pub fn evpipe_path(cfg: &SrConfig, num: u32) -> PathBuf {
    cfg.repo_path.join(evpipe_name(num))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SrError::Validation(format!("Path \"{}\" contains a NUL byte.", path.display())))
}

/// Read end of an event pipe.
pub struct EventPipe {
    fd: RawFd,
    path: PathBuf,
}

impl EventPipe {
    /// Creates the pipe, reusing an existing one. It is opened read-write so
    /// the open does not wait for a writer and writers never see `ENXIO`.
    pub fn create(cfg: &SrConfig, num: u32) -> Result<EventPipe> {
        let path = evpipe_path(cfg, num);
        let cpath = c_path(&path)?;
        if unsafe { libc::mkfifo(cpath.as_ptr(), cfg.shm_perm as libc::mode_t) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(SrError::Sys {
                    call: "mkfifo",
                    source: err,
                });
            }
        }
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if fd == -1 {
            return Err(SrError::last_sys("open"));
        }
        debug!("Event pipe \"{}\" ready.", path.display());
        Ok(EventPipe { fd, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits until the pipe is written to or `timeout` expires. Pending
    /// wakeups are drained; returns whether there were any.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(SrError::Sys { call: "poll", source: err });
        }
        if ret == 0 {
            return Ok(false);
        }
        self.drain()?;
        Ok(true)
    }

    fn drain(&self) -> Result<()> {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                continue;
            }
            if n == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(()),
                io::ErrorKind::Interrupted => continue,
                _ => Err(SrError::Sys { call: "read", source: err }),
            };
        }
    }

    /// Closes and unlinks the pipe.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        let cpath = c_path(&path)?;
        if unsafe { libc::unlink(cpath.as_ptr()) } == -1 {
            return Err(SrError::last_sys("unlink"));
        }
        Ok(())
    }
}

impl Drop for EventPipe {
    fn drop(&mut self) {
        if unsafe { libc::close(self.fd) } == -1 {
            warn!("Failed to close event pipe \"{}\" ({}).", self.path.display(), io::Error::last_os_error());
        }
    }
}

/// Wakes the subscriber listening on event pipe `num`. Returns whether a
/// listener had the pipe open.
pub fn notify(cfg: &SrConfig, num: u32) -> Result<bool> {
    let path = evpipe_path(cfg, num);
    let cpath = c_path(&path)?;
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
    if fd == -1 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            // no reader or no pipe, nobody to wake
            Some(libc::ENXIO) | Some(libc::ENOENT) => Ok(false),
            _ => Err(SrError::Sys { call: "open", source: err }),
        };
    }
    let byte = 0u8;
    let n = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if n == -1 && err.kind() != io::ErrorKind::WouldBlock {
        return Err(SrError::Sys { call: "write", source: err });
    }
    Ok(true)
}
