//! `PollDriver` — default `StreamDriver` implementation.
//!
//! Readiness via `libc::poll` over non-blocking fds. No epoll, no
//! io_uring, no platform detection. Safe, portable, works everywhere
//! POSIX poll exists; a higher-throughput backend can replace it behind
//! the same trait.
//!
//! Per-fd bookkeeping lives in an `Entry`: an optional read sink (armed
//! reads), an optional accept sink (listeners), a FIFO write queue with
//! partial-write offsets, and an optional pending shutdown. Close removes
//! the entry immediately and defers the completion to the next poll, so
//! close is observably asynchronous — like every other completion here.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use loopnet_core::{
    AcceptSink, AfterWrite, CloseCallback, Completion, LoopError, ReadOutcome, ReadSink, Result,
    ShutdownCallback, StreamDriver, WriteStatus, SUGGESTED_READ_SIZE,
};

use crate::waker::last_errno;

/// One queued write: the submitted bytes, how much of them the OS has
/// taken so far, and the per-call callback.
struct InflightWrite {
    buf: Bytes,
    sent: usize,
    cb: Option<AfterWrite>,
}

#[derive(Default)]
struct Entry {
    reader: Option<Arc<dyn ReadSink>>,
    acceptor: Option<Arc<dyn AcceptSink>>,
    writes: VecDeque<InflightWrite>,
    shutdown: Option<ShutdownCallback>,
}

pub struct PollDriver {
    entries: HashMap<RawFd, Entry>,
    wake_fd: Option<RawFd>,
    /// Completions produced outside of readiness (cancellations, closes,
    /// immediate shutdowns). Flushed at the top of the next poll.
    ready: Vec<Completion>,
    suggested_read: usize,
}

impl PollDriver {
    pub fn new() -> Self {
        Self::with_read_size(SUGGESTED_READ_SIZE)
    }

    /// Use a custom per-read allocation suggestion.
    pub fn with_read_size(suggested_read: usize) -> Self {
        Self {
            entries: HashMap::new(),
            wake_fd: None,
            ready: Vec::new(),
            suggested_read,
        }
    }

    fn entry_mut(&mut self, fd: RawFd) -> Result<&mut Entry> {
        self.entries.get_mut(&fd).ok_or(LoopError::NotRegistered(fd))
    }

    /// Perform `SHUT_WR` now and queue the completion.
    fn do_shutdown(fd: RawFd, cb: ShutdownCallback, out: &mut Vec<Completion>) {
        let ret = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
        let status = if ret == 0 { 0 } else { last_errno() };
        out.push(Completion::ShutdownDone { cb, status });
    }

    /// One read attempt under the two-phase protocol. Returns the outcome
    /// to deliver with the buffer.
    fn read_once(fd: RawFd, buf: &mut loopnet_core::ReadBuf) -> ReadOutcome {
        let cap = buf.capacity();
        if cap == 0 {
            return ReadOutcome::Empty;
        }
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, cap) };
            if n > 0 {
                return ReadOutcome::Data(n as usize);
            }
            if n == 0 {
                return ReadOutcome::Eof;
            }
            match last_errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return ReadOutcome::Empty,
                err => return ReadOutcome::Err(err),
            }
        }
    }

    /// Drain the write queue as far as the OS allows. Emits a completion
    /// per finished or failed write; runs the pending shutdown once the
    /// queue is empty.
    fn drain_writes(fd: RawFd, entry: &mut Entry, out: &mut Vec<Completion>) {
        while let Some(mut w) = entry.writes.pop_front() {
            let remaining = &w.buf[w.sent..];
            let n = unsafe {
                libc::write(
                    fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };
            if n >= 0 {
                w.sent += n as usize;
                if w.sent == w.buf.len() {
                    out.push(Completion::WriteDone {
                        buf: w.buf,
                        cb: w.cb,
                        status: WriteStatus::Success,
                    });
                    continue;
                }
                // Partial write: the OS buffer is full, keep the offset.
                entry.writes.push_front(w);
                return;
            }
            match last_errno() {
                libc::EINTR => {
                    entry.writes.push_front(w);
                    continue;
                }
                libc::EAGAIN => {
                    entry.writes.push_front(w);
                    return;
                }
                err => {
                    out.push(Completion::WriteDone {
                        buf: w.buf,
                        cb: w.cb,
                        status: WriteStatus::Os(err),
                    });
                    return;
                }
            }
        }
        if let Some(cb) = entry.shutdown.take() {
            Self::do_shutdown(fd, cb, out);
        }
    }
}

impl Default for PollDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDriver for PollDriver {
    fn watch_wake(&mut self, fd: RawFd) -> Result<()> {
        self.wake_fd = Some(fd);
        Ok(())
    }

    fn register(&mut self, fd: RawFd) -> Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(LoopError::Os(last_errno()));
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(LoopError::Os(last_errno()));
        }
        self.entries.insert(fd, Entry::default());
        Ok(())
    }

    fn read_start(&mut self, fd: RawFd, sink: Arc<dyn ReadSink>) -> Result<()> {
        self.entry_mut(fd)?.reader = Some(sink);
        Ok(())
    }

    fn read_stop(&mut self, fd: RawFd) {
        if let Some(entry) = self.entries.get_mut(&fd) {
            entry.reader = None;
        }
    }

    fn is_read_active(&self, fd: RawFd) -> bool {
        self.entries
            .get(&fd)
            .is_some_and(|entry| entry.reader.is_some())
    }

    fn is_closing(&self, fd: RawFd) -> bool {
        // An unknown fd counts as closing: it is either already closed
        // or was never registered, and a close request for it must not
        // be issued.
        !self.entries.contains_key(&fd)
    }

    fn submit_write(&mut self, fd: RawFd, buf: Bytes, cb: Option<AfterWrite>) {
        match self.entries.get_mut(&fd) {
            Some(entry) => entry.writes.push_back(InflightWrite { buf, sent: 0, cb }),
            None => self.ready.push(Completion::WriteDone {
                buf,
                cb,
                status: WriteStatus::Canceled,
            }),
        }
    }

    fn shutdown(&mut self, fd: RawFd, cb: ShutdownCallback) {
        match self.entries.get_mut(&fd) {
            Some(entry) => {
                if entry.shutdown.is_some() {
                    // A shutdown is already pending; a second request is
                    // a caller bug, reported rather than stacked.
                    self.ready.push(Completion::ShutdownDone {
                        cb,
                        status: libc::EINVAL,
                    });
                } else if entry.writes.is_empty() {
                    Self::do_shutdown(fd, cb, &mut self.ready);
                } else {
                    entry.shutdown = Some(cb);
                }
            }
            None => self.ready.push(Completion::ShutdownDone {
                cb,
                status: libc::ENOTCONN,
            }),
        }
    }

    fn close(&mut self, fd: RawFd, cb: CloseCallback) {
        if let Some(entry) = self.entries.remove(&fd) {
            for w in entry.writes {
                self.ready.push(Completion::WriteDone {
                    buf: w.buf,
                    cb: w.cb,
                    status: WriteStatus::Canceled,
                });
            }
            if let Some(scb) = entry.shutdown {
                self.ready.push(Completion::ShutdownDone {
                    cb: scb,
                    status: libc::ECANCELED,
                });
            }
        }
        self.ready.push(Completion::CloseDone { cb });
    }

    fn listen_start(&mut self, fd: RawFd, sink: Arc<dyn AcceptSink>) -> Result<()> {
        self.entry_mut(fd)?.acceptor = Some(sink);
        Ok(())
    }

    fn poll(&mut self, out: &mut Vec<Completion>, timeout: Option<Duration>) -> Result<usize> {
        let before = out.len();
        out.append(&mut self.ready);

        // Don't sleep if completions are already waiting for dispatch.
        let timeout_ms: libc::c_int = if out.len() > before {
            0
        } else {
            timeout.map_or(-1, |d| d.as_millis().min(i32::MAX as u128) as libc::c_int)
        };

        let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(self.entries.len() + 1);
        if let Some(wake) = self.wake_fd {
            pfds.push(libc::pollfd {
                fd: wake,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        for (&fd, entry) in &self.entries {
            let mut events: libc::c_short = 0;
            if entry.reader.is_some() || entry.acceptor.is_some() {
                events |= libc::POLLIN;
            }
            if !entry.writes.is_empty() || entry.shutdown.is_some() {
                events |= libc::POLLOUT;
            }
            if events != 0 {
                pfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }
        }

        let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = last_errno();
            if err == libc::EINTR {
                return Ok(out.len() - before);
            }
            return Err(LoopError::Os(err));
        }

        const READABLE: libc::c_short =
            libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
        const WRITABLE: libc::c_short =
            libc::POLLOUT | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

        for pfd in &pfds {
            if pfd.revents == 0 {
                continue;
            }
            if Some(pfd.fd) == self.wake_fd {
                let mut val: u64 = 0;
                unsafe {
                    libc::read(
                        pfd.fd,
                        &mut val as *mut u64 as *mut libc::c_void,
                        std::mem::size_of::<u64>(),
                    );
                }
                continue;
            }
            let Some(entry) = self.entries.get_mut(&pfd.fd) else {
                continue;
            };

            if pfd.revents & READABLE != 0 {
                if let Some(sink) = entry.acceptor.clone() {
                    out.push(Completion::Incoming { sink });
                }
                if let Some(sink) = entry.reader.clone() {
                    let mut buf = sink.alloc(self.suggested_read);
                    let outcome = Self::read_once(pfd.fd, &mut buf);
                    // End-of-stream and errors disarm the read; the sink
                    // decides what happens next (shutdown, close, ...).
                    if matches!(outcome, ReadOutcome::Eof | ReadOutcome::Err(_)) {
                        entry.reader = None;
                    }
                    out.push(Completion::Read { sink, buf, outcome });
                }
            }

            if pfd.revents & WRITABLE != 0 {
                Self::drain_writes(pfd.fd, entry, out);
            }
        }

        Ok(out.len() - before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc::{channel, Sender};

    /// Collects delivered reads for assertions.
    struct TestSink {
        tx: Sender<(Vec<u8>, ReadOutcome)>,
    }

    impl ReadSink for TestSink {
        fn deliver(&self, buf: loopnet_core::ReadBuf, outcome: ReadOutcome) {
            let data = match outcome {
                ReadOutcome::Data(n) => buf.filled(n).to_vec(),
                _ => Vec::new(),
            };
            self.tx.send((data, outcome)).unwrap();
        }
    }

    fn poll_until(
        driver: &mut PollDriver,
        pred: impl Fn(&Completion) -> bool,
    ) -> Vec<Completion> {
        let mut got = Vec::new();
        for _ in 0..100 {
            let mut out = Vec::new();
            driver
                .poll(&mut out, Some(Duration::from_millis(50)))
                .unwrap();
            let hit = out.iter().any(&pred);
            got.extend(out);
            if hit {
                return got;
            }
        }
        panic!("expected completion did not arrive");
    }

    #[test]
    fn test_write_completes_and_peer_receives() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let mut driver = PollDriver::new();
        driver.register(fd).unwrap();

        let payload = Bytes::from_static(b"hello driver");
        driver.submit_write(fd, payload.clone(), None);

        let got = poll_until(&mut driver, |c| matches!(c, Completion::WriteDone { .. }));
        let Some(Completion::WriteDone { buf, status, .. }) = got
            .into_iter()
            .find(|c| matches!(c, Completion::WriteDone { .. }))
        else {
            unreachable!()
        };
        assert_eq!(status, WriteStatus::Success);
        assert_eq!(buf, payload);

        let mut read_back = vec![0u8; payload.len()];
        b.read_exact(&mut read_back).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn test_two_phase_read_delivers_bytes() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let mut driver = PollDriver::new();
        driver.register(fd).unwrap();
        let (tx, rx) = channel();
        driver.read_start(fd, Arc::new(TestSink { tx })).unwrap();

        b.write_all(b"ping").unwrap();

        let got = poll_until(&mut driver, |c| matches!(c, Completion::Read { .. }));
        for c in got {
            if let Completion::Read { sink, buf, outcome } = c {
                sink.deliver(buf, outcome);
            }
        }
        let (data, outcome) = rx.recv().unwrap();
        assert_eq!(outcome, ReadOutcome::Data(4));
        assert_eq!(data, b"ping");
        assert!(driver.is_read_active(fd));
    }

    #[test]
    fn test_eof_disarms_read() {
        let (a, b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let mut driver = PollDriver::new();
        driver.register(fd).unwrap();
        let (tx, _rx) = channel();
        driver.read_start(fd, Arc::new(TestSink { tx })).unwrap();

        drop(b);

        let got = poll_until(&mut driver, |c| {
            matches!(
                c,
                Completion::Read {
                    outcome: ReadOutcome::Eof,
                    ..
                }
            )
        });
        assert!(!got.is_empty());
        assert!(!driver.is_read_active(fd));
    }

    #[test]
    fn test_close_cancels_queued_write() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let mut driver = PollDriver::new();
        driver.register(fd).unwrap();
        driver.submit_write(fd, Bytes::from_static(b"never sent"), None);
        driver.close(fd, Box::new(|| {}));
        assert!(driver.is_closing(fd));

        let mut out = Vec::new();
        driver
            .poll(&mut out, Some(Duration::from_millis(10)))
            .unwrap();
        let canceled = out.iter().any(|c| {
            matches!(
                c,
                Completion::WriteDone {
                    status: WriteStatus::Canceled,
                    ..
                }
            )
        });
        let closed = out.iter().any(|c| matches!(c, Completion::CloseDone { .. }));
        assert!(canceled);
        assert!(closed);
    }

    #[test]
    fn test_write_to_unknown_fd_is_canceled() {
        let mut driver = PollDriver::new();
        driver.submit_write(999, Bytes::from_static(b"x"), None);

        let mut out = Vec::new();
        driver
            .poll(&mut out, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(out.iter().any(|c| {
            matches!(
                c,
                Completion::WriteDone {
                    status: WriteStatus::Canceled,
                    ..
                }
            )
        }));
    }

    #[test]
    fn test_shutdown_runs_after_queue_drains() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let mut driver = PollDriver::new();
        driver.register(fd).unwrap();
        driver.submit_write(fd, Bytes::from_static(b"last words"), None);
        driver.shutdown(fd, Box::new(|status| assert_eq!(status, 0)));

        let got = poll_until(&mut driver, |c| matches!(c, Completion::ShutdownDone { .. }));
        let write_pos = got
            .iter()
            .position(|c| matches!(c, Completion::WriteDone { .. }))
            .unwrap();
        let shut_pos = got
            .iter()
            .position(|c| matches!(c, Completion::ShutdownDone { .. }))
            .unwrap();
        assert!(write_pos < shut_pos);
        for c in got {
            if let Completion::ShutdownDone { cb, status } = c {
                cb(status);
            }
        }

        // Peer sees the data, then a clean EOF.
        let mut all = Vec::new();
        b.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"last words");
    }

    #[test]
    fn test_large_write_is_split_and_ordered() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let mut driver = PollDriver::new();
        driver.register(fd).unwrap();

        // Big enough to overflow the socket buffer and force partial writes.
        let big = Bytes::from(vec![0xabu8; 4 * 1024 * 1024]);
        let tail = Bytes::from_static(b"tail");
        driver.submit_write(fd, big.clone(), None);
        driver.submit_write(fd, tail.clone(), None);

        let (done_tx, done_rx) = channel();
        let reader = std::thread::spawn(move || {
            let mut all = Vec::new();
            b.read_to_end(&mut all).unwrap();
            done_tx.send(all).unwrap();
        });

        let mut finished = 0;
        for _ in 0..10_000 {
            let mut out = Vec::new();
            driver
                .poll(&mut out, Some(Duration::from_millis(20)))
                .unwrap();
            finished += out
                .iter()
                .filter(|c| matches!(c, Completion::WriteDone { .. }))
                .count();
            if finished == 2 {
                break;
            }
        }
        assert_eq!(finished, 2);
        driver.shutdown(fd, Box::new(|_| {}));
        let mut out = Vec::new();
        driver
            .poll(&mut out, Some(Duration::from_millis(20)))
            .unwrap();

        let all = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        reader.join().unwrap();
        assert_eq!(all.len(), big.len() + tail.len());
        assert_eq!(&all[all.len() - 4..], b"tail");
        assert!(all[..big.len()].iter().all(|&x| x == 0xab));
    }
}
