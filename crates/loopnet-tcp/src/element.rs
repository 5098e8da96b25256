//! Registry entry for an accepted connection.
//!
//! The registry (see `TcpServer`) holds these strongly; each connection
//! points back at its entry weakly. Strong one way, weak the other — no
//! retain cycle, and dropping the entry from the registry is enough to
//! let the connection die once its async closures settle.

use std::sync::Arc;

use crate::connection::TcpConnection;

pub struct ConnectionElement {
    name: String,
    conn: Arc<TcpConnection>,
}

impl ConnectionElement {
    pub fn new(name: impl Into<String>, conn: Arc<TcpConnection>) -> Self {
        Self {
            name: name.into(),
            conn,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<TcpConnection> {
        &self.conn
    }
}
