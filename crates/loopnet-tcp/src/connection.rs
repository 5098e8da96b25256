//! `TcpConnection` — the per-socket state machine.
//!
//! Read completion transitions:
//!
//! ```text
//!  bytes > 0        deliver to message callback            OPEN
//!  nothing read     drop the buffer, no-op                 OPEN
//!  error (not EOF)  connected=false, notify close          CLOSED
//!  end-of-stream    SHUT_WR handshake, notify on finish    CLOSING → CLOSED
//! ```
//!
//! Only the error branch flips `connected`; the end-of-stream branch
//! leaves it untouched while the shutdown handshake runs.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use nix::errno::Errno;

use loopnet_core::{AfterWrite, ReadBuf, ReadOutcome, ReadSink, WriteInfo, WriteStatus};
use loopnet_reactor::LoopHandle;

use crate::element::ConnectionElement;
use crate::error::TcpError;

/// Payload delivery: the connection it arrived on plus the bytes of one
/// read.
pub type MessageCallback = Box<dyn Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync>;

/// Identity-carrying notification (close notify, close complete).
pub type ConnectionCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Per-call close-completion callback.
pub type CloseComplete = Box<dyn FnOnce(&str) + Send>;

pub struct TcpConnection {
    name: String,
    /// True→false only, and only on the loop thread: on a non-EOF read
    /// error. Never back to true.
    connected: AtomicBool,
    /// Non-owning back-reference to the loop: thread-identity tests and
    /// task marshalling. The loop does not own us and we do not own it.
    owner: LoopHandle,
    /// Exclusively owned socket. Released exactly once — when the last
    /// shared owner drops this object, which by protocol happens only
    /// after close-completion has been observed.
    fd: OwnedFd,
    /// For shared-ownership capture in asynchronous closures.
    me: Weak<TcpConnection>,
    /// Callback slots: set at most once by the owner, unset means no-op.
    on_message: OnceLock<MessageCallback>,
    on_close: OnceLock<ConnectionCallback>,
    on_close_complete: OnceLock<ConnectionCallback>,
    /// Weak back-reference into the owning registry. Weak by design:
    /// the registry owns the connection, never the other way around.
    element: OnceLock<Weak<ConnectionElement>>,
}

impl TcpConnection {
    /// Wrap an established socket and immediately arm reads, with this
    /// connection as the read sink. Loop-thread only.
    ///
    /// The driver holds a shared reference to the connection while reads
    /// are armed, so the connection outlives every read notification.
    pub fn new(
        owner: LoopHandle,
        name: impl Into<String>,
        fd: OwnedFd,
        connected: bool,
    ) -> Result<Arc<Self>, TcpError> {
        let conn = Arc::new_cyclic(|me| Self {
            name: name.into(),
            connected: AtomicBool::new(connected),
            owner,
            fd,
            me: me.clone(),
            on_message: OnceLock::new(),
            on_close: OnceLock::new(),
            on_close_complete: OnceLock::new(),
            element: OnceLock::new(),
        });
        let raw = conn.fd.as_raw_fd();
        let sink: Arc<dyn ReadSink> = conn.clone();
        conn.owner.with_driver(|d| {
            d.register(raw)?;
            d.read_start(raw, sink)
        })??;
        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue a write on the driver. Loop-thread only; foreign threads use
    /// [`write_in_loop`](Self::write_in_loop).
    ///
    /// The bytes are owned by the write machinery until completion, then
    /// handed back through [`WriteInfo`]. If the connection is already
    /// disconnected the callback fires synchronously, before this
    /// returns, with `WriteStatus::Disconnected` — the driver is never
    /// touched in that case.
    pub fn write(&self, buf: Bytes, cb: Option<AfterWrite>) -> Result<(), TcpError> {
        if !self.connected.load(Ordering::Acquire) {
            if let Some(cb) = cb {
                cb(WriteInfo {
                    buf,
                    status: WriteStatus::Disconnected,
                });
            }
            return Err(TcpError::Disconnected);
        }
        let raw = self.fd.as_raw_fd();
        self.owner.with_driver(move |d| d.submit_write(raw, buf, cb))?;
        Ok(())
    }

    /// Write from any thread. On the loop thread this is a direct
    /// [`write`](Self::write); otherwise the arguments plus a shared
    /// handle to this connection move into a task that the loop thread
    /// runs later. The caller never blocks — this returns once the task
    /// is queued.
    ///
    /// Writes marshalled from different foreign threads carry no relative
    /// order; each is ordered by when the loop dequeues it.
    pub fn write_in_loop(&self, buf: Bytes, cb: Option<AfterWrite>) {
        if self.owner.is_loop_thread() {
            let _ = self.write(buf, cb);
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        self.owner.spawn(Box::new(move || {
            // The payload (connection handle, bytes, callback) is dropped
            // right here, after the direct write consumed it.
            let _ = me.write(buf, cb);
        }));
    }

    /// Close the connection. Idempotent: reads are stopped only if still
    /// armed, and the close request is issued only if the handle is not
    /// already closing — so a second call is a guarded no-op and exactly
    /// one close-completion fires.
    ///
    /// Callable from any thread; off-loop calls marshal themselves. On
    /// completion the per-call callback (or, if none, the stored
    /// `on_close_complete` slot) receives the identity. The socket fd is
    /// NOT released here: completion means "stop treating this socket as
    /// live", destruction of the last shared owner returns the fd.
    pub fn close(&self, cb: Option<CloseComplete>) {
        if !self.owner.is_loop_thread() {
            let Some(me) = self.me.upgrade() else { return };
            self.owner.spawn(Box::new(move || me.close(cb)));
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let raw = self.fd.as_raw_fd();
        let res = self.owner.with_driver(|d| {
            if d.is_read_active(raw) {
                d.read_stop(raw);
            }
            if !d.is_closing(raw) {
                d.close(raw, Box::new(move || me.close_complete(cb)));
            }
        });
        if let Err(e) = res {
            log::error!("{}: close failed: {}", self.name, e);
        }
    }

    /// Install the payload consumer. First setter wins.
    pub fn set_on_message(&self, cb: MessageCallback) {
        if self.on_message.set(cb).is_err() {
            log::warn!("{}: on_message is already set", self.name);
        }
    }

    /// Install the close notification (fires on abnormal close and after
    /// the graceful shutdown handshake). First setter wins.
    pub fn set_on_close(&self, cb: ConnectionCallback) {
        if self.on_close.set(cb).is_err() {
            log::warn!("{}: on_close is already set", self.name);
        }
    }

    /// Install the default close-completion callback. First setter wins.
    pub fn set_on_close_complete(&self, cb: ConnectionCallback) {
        if self.on_close_complete.set(cb).is_err() {
            log::warn!("{}: on_close_complete is already set", self.name);
        }
    }

    /// Point this connection at its registry entry. Weak on purpose.
    pub fn set_element(&self, element: Weak<ConnectionElement>) {
        if self.element.set(element).is_err() {
            log::warn!("{}: element is already set", self.name);
        }
    }

    /// Look up the registry entry, if it still exists.
    pub fn element(&self) -> Option<Arc<ConnectionElement>> {
        self.element.get().and_then(Weak::upgrade)
    }

    fn notify_close(&self) {
        if let Some(cb) = self.on_close.get() {
            cb(&self.name);
        }
    }

    fn close_complete(&self, cb: Option<CloseComplete>) {
        log::debug!("{}: close complete", self.name);
        match cb {
            Some(cb) => cb(&self.name),
            None => {
                if let Some(cb) = self.on_close_complete.get() {
                    cb(&self.name);
                }
            }
        }
    }
}

impl ReadSink for TcpConnection {
    fn deliver(&self, buf: ReadBuf, outcome: ReadOutcome) {
        match outcome {
            ReadOutcome::Data(n) => {
                if let (Some(cb), Some(me)) = (self.on_message.get(), self.me.upgrade()) {
                    cb(&me, buf.filled(n));
                }
            }
            ReadOutcome::Empty => {}
            ReadOutcome::Err(err) => {
                self.connected.store(false, Ordering::Release);
                log::error!("{}: read failed: {}", self.name, Errno::from_raw(err));
                self.notify_close();
            }
            ReadOutcome::Eof => {
                let Some(me) = self.me.upgrade() else { return };
                let raw = self.fd.as_raw_fd();
                let res = self.owner.with_driver(move |d| {
                    d.shutdown(
                        raw,
                        Box::new(move |status| {
                            if status != 0 {
                                log::warn!(
                                    "{}: shutdown failed: {}",
                                    me.name,
                                    Errno::from_raw(status)
                                );
                            }
                            me.notify_close();
                        }),
                    );
                });
                if let Err(e) = res {
                    log::error!("{}: could not issue shutdown: {}", self.name, e);
                }
            }
        }
        // `buf` drops here — freed on every branch.
    }
}
