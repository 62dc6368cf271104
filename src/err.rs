/// Errors surfaced across the network plumbing and the TCP user command
/// surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tun/tap error: {0}")]
    Tun(#[from] tidy_tuntap::error::Error),

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("no PCB at id {0}")]
    NoPcb(usize),

    #[error("PCB table exhausted ({0} slots in use)")]
    ResourceExhausted(usize),

    #[error("operation not valid in the current connection state")]
    InvalidState,

    #[error("wait was interrupted")]
    Interrupted,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection refused by peer")]
    ConnectionRefused,

    #[error("user timeout expired before the connection made progress")]
    UserTimeout,

    #[error("retransmit deadline expired waiting for an acknowledgment")]
    RetransmitDeadline,

    #[error("no route to {0}")]
    NoRoute(std::net::Ipv4Addr),

    #[error("i/o error writing to interface: {0}")]
    Io(#[from] std::io::Error),
}
