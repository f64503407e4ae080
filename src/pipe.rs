//! The RFC 6675 SetPipe() estimate of bytes in flight, and the IsLost()
//! judgments that feed it.
//!
//! Two loss-inference strategies satisfy the same contract and are chosen
//! per connection at construction time: the RFC 6675 default counts
//! discontiguous SACKed runs above a segment, while the Forward-ACK
//! variant infers loss from how far the highest SACKed sequence number
//! has pulled ahead.

use crate::config::{LossDetection, DUPACK_THRESH};
use crate::connection::Connection;
use crate::segment::SendQueue;
use crate::seq::{seq_after, seq_leq};

impl Connection {
    /// Re-derives the in-flight estimate from the scoreboard. Sacked
    /// segments are out of the network; retransmitted segments are in it
    /// again whether or not the original survived; everything else counts
    /// unless it is judged lost.
    pub fn set_pipe(&mut self) {
        let mut pipe = 0u32;
        for index in 0..self.queue.len() {
            let segment = self.queue.get(index).expect("index in bounds");
            if segment.is_sacked() {
                continue;
            }
            if segment.is_retransmitted() {
                pipe += segment.len();
            } else if !self.is_lost_at(index) {
                pipe += segment.len();
            }
        }
        self.pipe = pipe;
    }

    /// Whether the segment starting at `seq` is judged lost. A segment
    /// the peer has selectively acknowledged is never lost.
    pub fn is_lost(&self, seq: u32) -> bool {
        match self.queue.position_of(seq) {
            Some(index) => self.is_lost_at(index),
            None => false,
        }
    }

    pub(crate) fn is_lost_at(&self, index: usize) -> bool {
        let segment = match self.queue.get(index) {
            Some(segment) => segment,
            None => return false,
        };
        if segment.is_sacked() {
            return false;
        }
        match self.cfg.loss_detection {
            LossDetection::ForwardAck => {
                is_lost_forward_ack(self.fack, segment.last_byte(), self.send.mss)
            }
            LossDetection::DupThresh => {
                is_lost_dup_thresh(&self.queue, index, self.send.mss)
            }
        }
    }
}

/// Forward-ACK inference: lost once the highest SACKed sequence number is
/// more than DupThresh segments' worth of bytes past the segment.
pub(crate) fn is_lost_forward_ack(fack: u32, last_byte: u32, mss: u32) -> bool {
    if seq_leq(fack, last_byte) {
        return false;
    }
    seq_after(fack, last_byte) > DUPACK_THRESH * mss
}

/// RFC 6675 IsLost(): walk the scoreboard above the segment; it is lost
/// once DupThresh discontiguous SACKed runs sit above it, or once more
/// than (DupThresh - 1) * MSS SACKed bytes do.
pub(crate) fn is_lost_dup_thresh(queue: &SendQueue, index: usize, mss: u32) -> bool {
    let mut sacked_blocks = 0u32;
    let mut sacked_bytes = 0u32;
    let mut previous_sacked = false;
    for later in (index + 1)..queue.len() {
        let segment = match queue.get(later) {
            Some(segment) => segment,
            None => break,
        };
        if segment.is_sacked() {
            sacked_bytes += segment.len();
            if !previous_sacked {
                sacked_blocks += 1;
            }
            if sacked_blocks >= DUPACK_THRESH
                || sacked_bytes > (DUPACK_THRESH - 1) * mss
            {
                return true;
            }
            previous_sacked = true;
        } else {
            previous_sacked = false;
        }
    }
    false
}
