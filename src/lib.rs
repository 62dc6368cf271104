//! `utcp`: a user-space TCP/IP core. RFC 793 endpoint state machine,
//! retransmission engine, and mutex/condvar concurrency protocol (`tcp`),
//! running over the essential IP plumbing it needs to actually move bytes
//! (`net`): routing, an ARP resolution contract, and a pluggable
//! IP-demultiplex registry. [`Stack`] assembles the two into a running
//! system with a socket-like command surface.

mod config;
mod err;
mod net;
mod stack;
mod tcp;

pub use err::Error;
pub use net::Interface;
pub use stack::Stack;
pub use tcp::Endpoint;

use std::io::{Read, Write};
use std::sync::Arc;

use tcp::PcbId;

/// An established connection: `std::io::Read`/`Write` in terms of the
/// underlying `receive`/`send`, closed on drop.
pub struct TcpStream {
    stack: Arc<Stack>,
    id: PcbId,
}

impl TcpStream {
    fn new(stack: Arc<Stack>, id: PcbId) -> Self {
        TcpStream { stack, id }
    }

    pub fn connect(stack: Arc<Stack>, local: Endpoint, foreign: Endpoint) -> Result<Self, Error> {
        let id = stack.connect(local, foreign)?;
        Ok(TcpStream::new(stack, id))
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stack
            .receive(self.id, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stack
            .send(self.id, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let _ = self.stack.close(self.id);
    }
}

/// A bound listening endpoint. Each call to `accept` arms one fresh LISTEN
/// PCB and blocks until it synchronizes: call it from as many threads as
/// connections should be accepted concurrently.
pub struct TcpListener {
    stack: Arc<Stack>,
    local: Endpoint,
}

impl TcpListener {
    pub fn bind(stack: Arc<Stack>, local: Endpoint) -> Self {
        TcpListener { stack, local }
    }

    pub fn accept(&self) -> Result<TcpStream, Error> {
        let id = self.stack.accept(self.local)?;
        Ok(TcpStream::new(self.stack.clone(), id))
    }
}
