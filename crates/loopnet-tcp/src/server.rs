//! `TcpServer` — the accept collaborator.
//!
//! Binds a listening socket, arms accept readiness on the loop, and owns
//! the connection registry: a map of `ConnectionElement`s keyed by the
//! peer's `ip:port` name. The registry is the strong owner of every
//! accepted connection; entries leave the map on close-completion.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use nix::errno::Errno;

use loopnet_core::{AcceptSink, LoopError};
use loopnet_reactor::LoopHandle;

use crate::connection::TcpConnection;
use crate::element::ConnectionElement;
use crate::error::TcpError;

pub type ServerMessageCallback = Box<dyn Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync>;
pub type NewConnectionCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type ConnectionCloseCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct TcpServer {
    handle: LoopHandle,
    listen_fd: OwnedFd,
    port: u16,
    me: Weak<TcpServer>,
    conns: Mutex<HashMap<String, Arc<ConnectionElement>>>,
    on_message: OnceLock<ServerMessageCallback>,
    on_new_connection: OnceLock<NewConnectionCallback>,
    on_connection_close: OnceLock<ConnectionCloseCallback>,
}

impl TcpServer {
    /// Create and bind the listening socket. Pass port 0 for an
    /// ephemeral port; `port()` reports the one actually bound.
    pub fn bind(handle: LoopHandle, port: u16) -> Result<Arc<Self>, TcpError> {
        let (listen_fd, port) = bind_socket(port)?;
        Ok(Arc::new_cyclic(|me| Self {
            handle,
            listen_fd,
            port,
            me: me.clone(),
            conns: Mutex::new(HashMap::new()),
            on_message: OnceLock::new(),
            on_new_connection: OnceLock::new(),
            on_connection_close: OnceLock::new(),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Arm accept readiness. Callable from any thread; off-loop calls
    /// marshal themselves onto the loop.
    pub fn start(&self) {
        if !self.handle.is_loop_thread() {
            let Some(me) = self.me.upgrade() else { return };
            self.handle.spawn(Box::new(move || me.start()));
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let raw = self.listen_fd.as_raw_fd();
        let sink: Arc<dyn AcceptSink> = me;
        let res = self.handle.with_driver(|d| {
            d.register(raw)?;
            d.listen_start(raw, sink)
        });
        match res {
            Ok(Ok(())) => log::info!("listening on port {}", self.port),
            Ok(Err(e)) | Err(e) => log::error!("listen on port {} failed: {}", self.port, e),
        }
    }

    pub fn set_on_message(&self, cb: ServerMessageCallback) {
        if self.on_message.set(cb).is_err() {
            log::warn!("server: on_message is already set");
        }
    }

    pub fn set_on_new_connection(&self, cb: NewConnectionCallback) {
        if self.on_new_connection.set(cb).is_err() {
            log::warn!("server: on_new_connection is already set");
        }
    }

    pub fn set_on_connection_close(&self, cb: ConnectionCloseCallback) {
        if self.on_connection_close.set(cb).is_err() {
            log::warn!("server: on_connection_close is already set");
        }
    }

    /// Close a registered connection by name. Safe to call for unknown
    /// names; closing twice is the connection's guarded no-op.
    pub fn close_connection(&self, name: &str) {
        let element = self
            .conns
            .lock()
            .ok()
            .and_then(|map| map.get(name).cloned());
        if let Some(element) = element {
            element.connection().close(None);
        }
    }

    /// Wire up one accepted socket: connection, callbacks, registry entry.
    fn adopt(&self, name: String, fd: OwnedFd) -> Result<(), TcpError> {
        let conn = TcpConnection::new(self.handle.clone(), name.clone(), fd, true)?;
        let Some(server) = self.me.upgrade() else {
            return Ok(());
        };

        {
            let server = server.clone();
            conn.set_on_message(Box::new(move |c, bytes| {
                if let Some(cb) = server.on_message.get() {
                    cb(c, bytes);
                }
            }));
        }
        {
            // Close notify (abnormal or graceful): retire the connection.
            let server = server.clone();
            conn.set_on_close(Box::new(move |who| {
                log::debug!("{}: connection closed by peer", who);
                server.close_connection(who);
            }));
        }
        {
            let server = server.clone();
            conn.set_on_close_complete(Box::new(move |who| {
                if let Ok(mut map) = server.conns.lock() {
                    map.remove(who);
                }
                if let Some(cb) = server.on_connection_close.get() {
                    cb(who);
                }
            }));
        }

        let element = Arc::new(ConnectionElement::new(name.clone(), conn.clone()));
        conn.set_element(Arc::downgrade(&element));
        if let Ok(mut map) = self.conns.lock() {
            map.insert(name, element);
        }

        if let Some(cb) = self.on_new_connection.get() {
            cb(&conn);
        }
        Ok(())
    }
}

impl AcceptSink for TcpServer {
    /// Drain the accept queue until it would block.
    fn incoming(&self) {
        loop {
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let cfd = unsafe {
                libc::accept4(
                    self.listen_fd.as_raw_fd(),
                    &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut addr_len,
                    libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                )
            };
            if cfd < 0 {
                match Errno::last_raw() {
                    libc::EAGAIN => return,
                    libc::EINTR => continue,
                    err => {
                        log::error!("accept failed: {}", Errno::from_raw(err));
                        return;
                    }
                }
            }

            // TCP_NODELAY on the accepted socket
            unsafe {
                let opt: libc::c_int = 1;
                libc::setsockopt(
                    cfd,
                    libc::IPPROTO_TCP,
                    libc::TCP_NODELAY,
                    &opt as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }

            let name = peer_name(&addr);
            let fd = unsafe { OwnedFd::from_raw_fd(cfd) };
            log::info!("{}: accepted", name);
            if let Err(e) = self.adopt(name, fd) {
                log::error!("failed to adopt connection: {}", e);
            }
        }
    }
}

/// `ip:port` label for an accepted peer.
fn peer_name(addr: &libc::sockaddr_in) -> String {
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    format!("{}:{}", ip, port)
}

/// Socket setup: create, setsockopt, bind, listen. Returns the fd and
/// the bound port.
fn bind_socket(port: u16) -> Result<(OwnedFd, u16), TcpError> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd < 0 {
        return Err(TcpError::Loop(LoopError::Os(Errno::last_raw())));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let raw = fd.as_raw_fd();

    // SO_REUSEADDR + SO_REUSEPORT
    unsafe {
        let opt: libc::c_int = 1;
        libc::setsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &opt as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();

    let ret = unsafe {
        libc::bind(
            raw,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(TcpError::Loop(LoopError::Os(Errno::last_raw())));
    }

    if unsafe { libc::listen(raw, 1024) } != 0 {
        return Err(TcpError::Loop(LoopError::Os(Errno::last_raw())));
    }

    // Learn the port when an ephemeral one was requested.
    let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut bound_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            raw,
            &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut bound_len,
        )
    };
    if ret != 0 {
        return Err(TcpError::Loop(LoopError::Os(Errno::last_raw())));
    }

    Ok((fd, u16::from_be(bound.sin_port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let (_fd, port) = bind_socket(0).unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_peer_name_format() {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_addr.s_addr = u32::from(Ipv4Addr::new(10, 1, 2, 3)).to_be();
        addr.sin_port = 8080u16.to_be();
        assert_eq!(peer_name(&addr), "10.1.2.3:8080");
    }
}
