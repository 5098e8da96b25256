//! `EventFdWaker` — interrupts a sleeping poll from foreign threads.
//!
//! Wraps an owned nonblocking eventfd. Coalescing: multiple `notify()`
//! calls before the loop drains result in a single wakeup (eventfd
//! counter semantics).

use std::os::unix::io::RawFd;

use loopnet_core::{LoopError, Result};

pub struct EventFdWaker {
    fd: RawFd,
}

impl EventFdWaker {
    /// Create a new eventfd. The waker owns it and closes it on Drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(LoopError::Os(last_errno()));
        }
        Ok(Self { fd })
    }

    /// The raw descriptor, for the driver to watch.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Ring the waker. Never blocks.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            // EAGAIN means the counter is saturated — a wakeup is already
            // pending, which is all notify() has to guarantee.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(LoopError::Os(errno));
        }
        Ok(())
    }

    /// Reset the counter. Called by the loop thread after waking.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for EventFdWaker {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

pub(crate) fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_then_drain() {
        let waker = EventFdWaker::create().unwrap();
        waker.notify().unwrap();
        waker.notify().unwrap();

        // Coalesced: one readable event, counter 2.
        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(
                waker.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, 8);
        assert_eq!(val, 2);
    }

    #[test]
    fn test_drain_on_empty_does_not_block() {
        let waker = EventFdWaker::create().unwrap();
        waker.drain();
    }
}
