//! The per-connection state the SACK machinery reads and writes.
//!
//! [`Connection`] is not the whole transmission control block; the owning
//! stack keeps connection setup and teardown, the congestion-control
//! baseline, and the timers. What lives here is the subset those
//! algorithms feed on: the send-window scalars, the unacknowledged
//! segment queue with its sacked/retransmitted flags, the RFC 6675
//! sequence markers bounding the current recovery episode, and the merge
//! table for the receive side.

use crate::config::SackConfig;
use crate::ooseq::SackIntervals;
use crate::options::{self, SackBlock, SackBlocks};
use crate::segment::SendQueue;
use crate::seq::{seq_geq, seq_gt, seq_leq, seq_max};
use tracing::trace;

/// Send-window state owned by the core TCP machinery and shared with the
/// recovery algorithms.
//
//      1         2          3          4
// ----------|----------|----------|----------
//        lastack    snd_nxt    lastack
//                             +snd_wnd
//
// 1 - sequence numbers which have been cumulatively acknowledged
// 2 - sequence numbers of unacknowledged data
// 3 - sequence numbers allowed for new data transmission
// 4 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SendState {
    /// Congestion window
    pub cwnd: u32,
    /// Slow-start threshold
    pub ssthresh: u32,
    /// Maximum segment size
    pub mss: u32,
    /// Next sequence number to be sent
    pub snd_nxt: u32,
    /// The size of the remote TCP's window
    pub snd_wnd: u32,
    /// Highest cumulative acknowledgment received
    pub lastack: u32,
    /// Initial window, the floor for the congestion window
    pub iw: u32,
}

/// A connection's SACK state. Constructed alongside the transmission
/// control block and driven from the stack's ACK-processing path.
#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) cfg: SackConfig,
    pub send: SendState,
    /// The unacknowledged segment queue, the scoreboard of RFC 6675.
    pub(crate) queue: SendQueue,
    /// Bytes queued for transmission but not yet sent.
    pub(crate) unsent_bytes: u32,
    /// Count of segments currently flagged sacked.
    pub(crate) sacked: u32,
    /// Intervals the receive side will report back to the peer.
    pub intervals: SackIntervals,

    // RFC 6675 recovery markers. Monotone for the lifetime of one
    // recovery episode; reset together when the episode ends.
    pub(crate) recovery_point: u32,
    pub(crate) high_sacked: u32,
    pub(crate) high_data: u32,
    pub(crate) high_rxt: u32,
    pub(crate) rescue_rxt: u32,
    /// Highest sequence number known received, for Forward-ACK loss
    /// inference.
    pub(crate) fack: u32,
    /// Estimate of bytes in flight, maintained by SetPipe and the
    /// recovery engine.
    pub(crate) pipe: u32,
    /// Sequence number of the first unacked segment not yet confirmed
    /// recovered; `None` once everything past it is handled.
    pub(crate) cursor: Option<u32>,

    pub(crate) in_fast_recovery: bool,
    pub(crate) in_rto_recovery: bool,
    pub(crate) peer_sack_permitted: bool,
    /// Sequence number an RTT measurement is pending on, cleared whenever
    /// a retransmission makes the measurement ambiguous.
    pub(crate) rtt_sample: Option<u32>,
    /// Sequence numbers retransmitted during this episode, kept when the
    /// re-send-of-retransmissions optimization is enabled.
    pub(crate) tracked_rexmits: Vec<u32>,
}

/// Bound on the retransmission-tracking table; one recovery episode
/// rarely retransmits more distinct segments than this before either
/// recovering or hitting the retransmission timer.
pub(crate) const TRACKED_REXMIT_CAP: usize = 8;

impl Connection {
    pub fn new(cfg: SackConfig, send: SendState) -> Self {
        let below_cumack = send.lastack.wrapping_sub(1);
        Self {
            cfg,
            send,
            queue: SendQueue::new(),
            unsent_bytes: 0,
            sacked: 0,
            intervals: SackIntervals::default(),
            recovery_point: below_cumack,
            high_sacked: below_cumack,
            high_data: below_cumack,
            high_rxt: below_cumack,
            rescue_rxt: below_cumack,
            fack: below_cumack,
            pipe: 0,
            cursor: None,
            in_fast_recovery: false,
            in_rto_recovery: false,
            peer_sack_permitted: false,
            rtt_sample: None,
            tracked_rexmits: Vec::new(),
        }
    }

    /// Called on an active open: every recovery marker starts just below
    /// the initial send sequence number.
    pub fn on_connect(&mut self, iss: u32) {
        self.send.lastack = iss;
        self.send.snd_nxt = iss;
        self.reset_sack_markers();
    }

    /// Resets the recovery markers to just below the cumulative
    /// acknowledgment point and leaves any recovery episode.
    pub fn reset_sack_markers(&mut self) {
        let below_cumack = self.send.lastack.wrapping_sub(1);
        self.recovery_point = below_cumack;
        self.high_sacked = below_cumack;
        self.high_data = below_cumack;
        self.high_rxt = below_cumack;
        self.rescue_rxt = below_cumack;
        self.fack = below_cumack;
        self.pipe = 0;
        self.cursor = None;
        self.in_fast_recovery = false;
        self.in_rto_recovery = false;
        self.tracked_rexmits.clear();
    }

    /// Records that the peer offered SACK on its SYN.
    pub fn on_peer_sack_permitted(&mut self) {
        self.peer_sack_permitted = true;
    }

    pub fn peer_sack_permitted(&self) -> bool {
        self.peer_sack_permitted
    }

    /// The SACK-permitted option for an outgoing SYN segment, or `None`
    /// when it must be suppressed on a half-open SYN-ACK whose peer never
    /// offered SACK.
    pub fn sack_permitted_option(&self, in_syn_rcvd: bool) -> Option<[u8; 4]> {
        options::sack_permitted_option(in_syn_rcvd, self.peer_sack_permitted)
    }

    /// Appends newly sent data to the scoreboard. The stack calls this
    /// for every data segment it puts on the wire outside of recovery.
    pub fn on_segment_sent(&mut self, seq: u32, len: u32) {
        self.queue.push(crate::segment::Segment::new(seq, len));
        let end = seq.wrapping_add(len);
        if seq_gt(end, self.send.snd_nxt) {
            self.send.snd_nxt = end;
        }
    }

    /// Makes `bytes` of new data available for the recovery engine to
    /// send while it has window to fill.
    pub fn queue_unsent(&mut self, bytes: u32) {
        self.unsent_bytes += bytes;
    }

    pub fn unsent_bytes(&self) -> u32 {
        self.unsent_bytes
    }

    /// Processes a cumulative acknowledgment: drops covered segments and,
    /// when the acknowledgment covers the recovery point, ends the
    /// episode.
    pub fn on_cumulative_ack(&mut self, ackno: u32) {
        if seq_leq(ackno, self.send.lastack) {
            return;
        }
        self.send.lastack = ackno;
        self.queue.ack_through(ackno);
        self.sacked = self.queue.sacked_count() as u32;
        if self.in_recovery() && seq_gt(ackno, self.recovery_point) {
            trace!(ackno, "cumulative acknowledgment covers the recovery point");
            self.exit_recovery();
        }
    }

    /// Clears the recovery guard flags, permitting a fresh
    /// fast-retransmit entry.
    pub fn exit_recovery(&mut self) {
        self.in_fast_recovery = false;
        self.in_rto_recovery = false;
        self.cursor = None;
        self.tracked_rexmits.clear();
    }

    /// Records a retransmission-timeout event. Recovery falls back to the
    /// timer-driven path; a new fast-retransmit entry is suppressed until
    /// the episode is cleared.
    pub fn on_retransmission_timeout(&mut self) {
        self.in_fast_recovery = false;
        self.in_rto_recovery = true;
        self.tracked_rexmits.clear();
    }

    pub fn in_recovery(&self) -> bool {
        self.in_fast_recovery || self.in_rto_recovery
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery
    }

    pub fn pipe(&self) -> u32 {
        self.pipe
    }

    pub fn high_sacked(&self) -> u32 {
        self.high_sacked
    }

    pub fn high_rxt(&self) -> u32 {
        self.high_rxt
    }

    pub fn recovery_point(&self) -> u32 {
        self.recovery_point
    }

    pub fn sacked_count(&self) -> u32 {
        self.sacked
    }

    pub fn rtt_sample(&self) -> Option<u32> {
        self.rtt_sample
    }

    /// Arms an RTT measurement on `seq`. The recovery engine clears it
    /// whenever a retransmission would make the sample ambiguous.
    pub fn arm_rtt_sample(&mut self, seq: u32) {
        self.rtt_sample = Some(seq);
    }

    pub(crate) fn queue(&self) -> &SendQueue {
        &self.queue
    }

    /// Whether a block reported by the peer is usable: it must describe
    /// data strictly above both the acknowledgment that carried it and
    /// the cumulative acknowledgment point, and not beyond anything ever
    /// sent.
    fn is_sack_block_valid(&self, ackno: u32, block: &SackBlock) -> bool {
        if seq_geq(block.left, block.right) {
            return false;
        }
        let floor = seq_max(ackno, self.send.lastack);
        seq_gt(block.left, floor) && seq_leq(block.right, self.send.snd_nxt)
    }

    /// Applies the blocks parsed out of one incoming acknowledgment to
    /// the scoreboard, flagging every newly covered segment. Returns how
    /// many segments were newly flagged; reapplying the same blocks
    /// returns zero.
    pub fn apply_sack_blocks(&mut self, ackno: u32, blocks: &SackBlocks) -> u32 {
        let mut new_sacked = 0;
        for block in blocks.iter() {
            if !self.is_sack_block_valid(ackno, block) {
                trace!(
                    left = block.left,
                    right = block.right,
                    "rejecting sack block outside the outstanding window"
                );
                continue;
            }
            for segment in self.queue.iter_mut() {
                if segment.is_sacked() || !segment.covered_by(block.left, block.right) {
                    continue;
                }
                segment.mark_sacked();
                self.sacked += 1;
                new_sacked += 1;
                if seq_gt(segment.end(), self.high_sacked) {
                    self.high_sacked = segment.end();
                }
                if seq_gt(segment.end(), self.fack) {
                    self.fack = segment.end();
                }
            }
        }
        if new_sacked > 0 {
            // New selective-acknowledgment information implies new
            // knowledge about data in flight
            self.high_data = self.send.snd_nxt.wrapping_sub(1);
            trace!(
                new_sacked,
                high_sacked = self.high_sacked,
                "scoreboard updated from sack blocks"
            );
        }
        new_sacked
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::options::SackBlocks;

    pub(crate) fn established(ranges: &[(u32, u32)]) -> Connection {
        let lastack = ranges.first().map(|&(seq, _)| seq).unwrap_or(1000);
        let mut connection = Connection::new(
            SackConfig::default(),
            SendState {
                cwnd: 20000,
                ssthresh: 65535,
                mss: 500,
                snd_nxt: lastack,
                snd_wnd: 65535,
                lastack,
                iw: 1000,
            },
        );
        connection.reset_sack_markers();
        for &(seq, len) in ranges {
            connection.on_segment_sent(seq, len);
        }
        connection
    }

    pub(crate) fn blocks_of(ranges: &[(u32, u32)]) -> SackBlocks {
        let mut bytes = vec![5u8, (2 + ranges.len() * 8) as u8];
        for &(left, right) in ranges {
            bytes.extend_from_slice(&left.to_be_bytes());
            bytes.extend_from_slice(&right.to_be_bytes());
        }
        crate::options::parse_sack_option(&bytes).unwrap()
    }

    #[test]
    fn connect_positions_markers_below_iss() {
        let mut connection = established(&[]);
        connection.on_connect(5000);
        assert_eq!(connection.recovery_point, 4999);
        assert_eq!(connection.high_rxt, 4999);
        assert_eq!(connection.rescue_rxt, 4999);
        assert_eq!(connection.high_sacked, 4999);
        assert_eq!(connection.pipe, 0);
    }

    #[test]
    fn sacking_a_block_flags_covered_segments() {
        let mut connection = established(&[(1000, 500), (1500, 500), (2000, 500)]);
        let new_sacked = connection.apply_sack_blocks(1000, &blocks_of(&[(1500, 2000)]));
        assert_eq!(new_sacked, 1);
        assert!(connection.queue.get(1).unwrap().is_sacked());
        assert!(!connection.queue.get(0).unwrap().is_sacked());
        assert!(!connection.queue.get(2).unwrap().is_sacked());
        assert!(seq_geq(connection.high_sacked, 2000));
        assert_eq!(connection.high_data, connection.send.snd_nxt.wrapping_sub(1));
    }

    #[test]
    fn reapplying_a_block_is_idempotent() {
        let mut connection = established(&[(1000, 500), (1500, 500), (2000, 500)]);
        assert_eq!(
            connection.apply_sack_blocks(1000, &blocks_of(&[(1500, 2000)])),
            1
        );
        assert_eq!(
            connection.apply_sack_blocks(1000, &blocks_of(&[(1500, 2000)])),
            0
        );
        assert_eq!(connection.sacked_count(), 1);
    }

    #[test]
    fn malformed_and_stale_blocks_are_skipped_individually() {
        let mut connection = established(&[(1000, 500), (1500, 500), (2000, 500)]);
        let blocks = blocks_of(&[
            (2000, 1500), // reversed edges
            (500, 900),   // below the cumulative acknowledgment
            (2200, 3000), // runs past everything sent
            (2000, 2500), // valid
        ]);
        assert_eq!(connection.apply_sack_blocks(1000, &blocks), 1);
        assert!(connection.queue.get(2).unwrap().is_sacked());
    }

    #[test]
    fn partially_covered_segments_are_not_flagged() {
        let mut connection = established(&[(1000, 500), (1500, 500)]);
        // Block covers only half of the second segment
        assert_eq!(
            connection.apply_sack_blocks(1000, &blocks_of(&[(1500, 1700)])),
            0
        );
    }

    #[test]
    fn cumulative_ack_past_recovery_point_ends_the_episode() {
        let mut connection = established(&[(1000, 500), (1500, 500)]);
        connection.in_fast_recovery = true;
        connection.recovery_point = 1999;
        connection.on_cumulative_ack(2000);
        assert!(!connection.in_recovery());
        assert!(connection.queue.is_empty());
    }

    #[test]
    fn rto_suppresses_fast_retransmit_reentry() {
        let mut connection = established(&[(1000, 500)]);
        connection.on_retransmission_timeout();
        assert!(connection.in_recovery());
        assert!(!connection.in_fast_recovery());
        assert!(connection.enter_fast_retransmit().is_none());
    }
}
