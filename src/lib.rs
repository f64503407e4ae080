//! An implementation of the TCP Selective Acknowledgment extension: the
//! [SACK options](https://www.rfc-editor.org/rfc/rfc2018.html) and
//! [conventional SACK-based loss
//! recovery](https://www.rfc-editor.org/rfc/rfc6675.html).
//!
//! This crate is the SACK half of a TCP sender and receiver. The owning
//! stack keeps the connection state machine, congestion-control baseline,
//! and retransmission timers; this crate keeps the scoreboard. It is built
//! around a few cooperating pieces:
//!
//! - [`options`] encodes and decodes the SACK-permitted and SACK options
//!   that appear in the TCP header.
//! - [`Connection`](connection::Connection) holds the subset of a
//!   connection's send state the recovery algorithms read and write: the
//!   unacknowledged segment queue, the RFC 6675 sequence markers, and the
//!   pipe estimate.
//! - [`ooseq`] coalesces out-of-order received segments into the intervals
//!   reported back to the peer.
//! - The loss-recovery engine in [`recovery`] selects segments for
//!   retransmission while the congestion window allows, per the RFC 6675
//!   NextSeg() decision procedure.
//!
//! Everything here runs synchronously inside the owning stack's packet
//! processing path. There are no threads and no timers; the stack drives
//! this crate from its ACK-processing and out-of-order-insertion hooks and
//! puts the segments this crate hands back onto the wire itself.

pub mod config;
pub mod connection;
pub mod ooseq;
pub mod options;
pub mod pipe;
pub mod recovery;
pub mod segment;
pub mod seq;

pub use config::{LossDetection, ReportMode, RetransmitTracking, SackConfig};
pub use connection::{Connection, SendState};
pub use ooseq::SackIntervals;
pub use options::{SackBlock, SackBlocks};
pub use recovery::{RecoveryCategory, Retransmit};
