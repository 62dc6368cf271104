//! Tunable parameters for the TCP/IP core. Kept in one place so tests and
//! runtime code agree on the same constants.

use std::time::Duration;

/// Fixed PCB table capacity.
pub const TCP_PCB_SIZE: usize = 16;

/// Initial retransmission timeout for a freshly queued segment.
pub const TCP_DEFAULT_RTO: Duration = Duration::from_millis(200);

/// Total time a segment may sit unacknowledged before the connection is
/// abandoned.
pub const TCP_RETRANSMIT_DEADLINE: Duration = Duration::from_secs(12);

/// Time a PCB may sit outside TIME-WAIT without reaching ESTABLISHED or
/// CLOSED before the user-timeout timer tears it down.
pub const TCP_USER_TIMEOUT_TIME: Duration = Duration::from_secs(30);

/// Maximum Segment Lifetime; TIME-WAIT lasts 2*MSL.
pub const TCP_MSL: Duration = Duration::from_secs(120);

/// Receive buffer capacity per PCB, large enough to move real data while
/// keeping the `rcv.wnd == free capacity` invariant exact (see DESIGN.md).
pub const TCP_RECV_BUF_SIZE: usize = 4096;

/// Retransmit timer period: walks every non-FREE PCB and emits due segments.
pub const RETRANSMIT_TICK: Duration = Duration::from_millis(100);

/// User-timeout timer period.
pub const USER_TIMEOUT_TICK: Duration = Duration::from_secs(1);

/// TIME-WAIT timer period.
pub const TIME_WAIT_TICK: Duration = Duration::from_secs(1);

/// Poll timeout used by the driver thread between interface descriptor
/// checks; small enough that timers stay responsive.
pub const DRIVER_POLL_MILLIS: i32 = 50;

/// IPv4 header length assumed for MSS derivation (no options emitted).
pub const IP_HEADER_LEN: u16 = 20;

/// TCP header length assumed for MSS derivation (no options emitted).
pub const TCP_HEADER_LEN: u16 = 20;
