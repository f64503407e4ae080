//! SACK-based loss recovery: the fast-retransmit entry point and the
//! RFC 6675 NextSeg() engine that keeps retransmitting while the
//! congestion window has room.
//!
//! The engine never touches the wire. Each call returns the segments the
//! owning stack must transmit, in order, with the rule that selected each
//! one; the scoreboard, the pipe estimate, and the recovery markers are
//! updated here as if those transmissions happen immediately.

use crate::config::RetransmitTracking;
use crate::connection::{Connection, TRACKED_REXMIT_CAP};
use crate::seq::{seq_geq, seq_gt, seq_lt};
use tracing::{debug, trace};

/// Why a segment was selected for (re)transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryCategory {
    /// Not sacked, judged lost, between the retransmission and sacked
    /// high-water marks. NextSeg() rule 1.
    UnsackedLost,
    /// Previously unsent data sent to keep the window full. Rule 2.
    NewData,
    /// Not sacked, loss inference relaxed. Rule 3.
    Unsacked,
    /// The once-per-episode rescue retransmission of the tail. Rule 4.
    Rescue,
    /// The single immediate retransmission on entry to fast recovery.
    FastRetransmit,
    /// A retransmission that was itself judged lost and sent again.
    LostRetransmission,
}

/// One transmission the owning stack must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmit {
    pub seq: u32,
    pub len: u32,
    pub category: RecoveryCategory,
}

impl Connection {
    /// Enters fast recovery on the first duplicate-ACK/SACK evidence of
    /// loss: halves the window toward 7/8 of what the path was carrying,
    /// retransmits the oldest outstanding segment, and pins the recovery
    /// markers. Returns `None` while a recovery episode is already in
    /// progress (the guard flags block re-entry) or when nothing is
    /// outstanding.
    pub fn enter_fast_retransmit(&mut self) -> Option<Retransmit> {
        if self.in_recovery() || self.queue.is_empty() {
            return None;
        }

        self.recovery_point = self.high_data;

        let flightsize = self.send.cwnd.min(self.send.snd_wnd);
        let mut ssthresh = flightsize - (flightsize >> 3);
        ssthresh = ssthresh.max(2 * self.send.mss);
        ssthresh = ssthresh.max(self.cfg.initial_ssthresh);
        self.send.ssthresh = ssthresh;
        self.send.cwnd = ssthresh.max(self.send.iw);

        let segment = self.queue.get_mut(0).expect("front exists");
        segment.mark_retransmitted();
        let (seq, len, last_byte, end) =
            (segment.seq(), segment.len(), segment.last_byte(), segment.end());

        self.high_rxt = last_byte;
        self.rescue_rxt = last_byte;
        self.cursor = Some(end);
        self.rtt_sample = None;
        self.in_fast_recovery = true;
        self.track_retransmit(seq);

        debug!(
            seq,
            ssthresh,
            cwnd = self.send.cwnd,
            recovery_point = self.recovery_point,
            "entering sack-based fast recovery"
        );
        Some(Retransmit {
            seq,
            len,
            category: RecoveryCategory::FastRetransmit,
        })
    }

    /// Runs the NextSeg() loop: keeps selecting segments while
    /// `cwnd - pipe` leaves room for one, trying each rule in priority
    /// order. Returns every transmission the stack should perform now;
    /// an empty result means recovery pauses until more acknowledgment
    /// information arrives.
    pub fn sack_loss_recovery(&mut self) -> Vec<Retransmit> {
        let mut transmissions = Vec::new();

        self.advance_cursor_past_sacked();
        if self.cursor.is_none() {
            return transmissions;
        }

        let mut tried_new_data = false;
        loop {
            if self.send.cwnd < self.pipe || self.send.cwnd - self.pipe < self.send.mss {
                break;
            }

            if let Some(index) = self.next_candidate(true) {
                self.retransmit_at(index, RecoveryCategory::UnsackedLost, &mut transmissions);
                continue;
            }

            if !tried_new_data {
                tried_new_data = true;
                if self.send_new_data(&mut transmissions) {
                    continue;
                }
            }

            if let Some(index) = self.next_candidate(false) {
                self.retransmit_at(index, RecoveryCategory::Unsacked, &mut transmissions);
                continue;
            }

            if let Some(index) = self.rescue_candidate() {
                self.rescue_rxt = self.recovery_point;
                self.retransmit_at(index, RecoveryCategory::Rescue, &mut transmissions);
                continue;
            }

            // No rule produced a segment; wait for more SACK information
            break;
        }

        transmissions
    }

    /// Re-sends retransmissions that the loss-detection strategy now
    /// judges lost again. Only active when retransmit tracking is
    /// enabled; segments the bounded table could not hold recover through
    /// the normal rules instead.
    pub fn rexmit_lost_retransmissions(&mut self) -> Vec<Retransmit> {
        let mut transmissions = Vec::new();
        if self.cfg.retransmit_tracking != RetransmitTracking::Track {
            return transmissions;
        }

        let tracked = std::mem::take(&mut self.tracked_rexmits);
        for seq in tracked {
            let index = match self.queue.position_of(seq) {
                Some(index) => index,
                // Cumulatively acknowledged since; drop it
                None => continue,
            };
            if self.queue.get(index).map(|s| s.is_sacked()).unwrap_or(true) {
                continue;
            }
            if self.is_lost_at(index)
                && self.send.cwnd >= self.pipe
                && self.send.cwnd - self.pipe >= self.send.mss
            {
                self.retransmit_at(
                    index,
                    RecoveryCategory::LostRetransmission,
                    &mut transmissions,
                );
            }
            self.tracked_rexmits.push(seq);
        }
        transmissions
    }

    /// Moves the recovery cursor past any sacked prefix of the queue,
    /// clearing it when nothing unsacked remains.
    fn advance_cursor_past_sacked(&mut self) {
        let start = match self.cursor {
            Some(seq) => self.queue.position_at_or_after(seq).unwrap_or(self.queue.len()),
            None => 0,
        };
        for index in start..self.queue.len() {
            let segment = self.queue.get(index).expect("index in bounds");
            if !segment.is_sacked() {
                self.cursor = Some(segment.seq());
                return;
            }
        }
        self.cursor = None;
    }

    /// The smallest-sequence candidate between the retransmission and
    /// sacked high-water marks, optionally requiring it to be judged
    /// lost.
    fn next_candidate(&self, require_lost: bool) -> Option<usize> {
        let start = match self.cursor {
            Some(seq) => self.queue.position_at_or_after(seq)?,
            None => return None,
        };
        for index in start..self.queue.len() {
            let segment = self.queue.get(index).expect("index in bounds");
            if !seq_gt(segment.seq(), self.high_rxt) {
                continue;
            }
            if !seq_lt(segment.seq(), self.high_sacked) {
                // The queue is sequence ordered; nothing further qualifies
                return None;
            }
            if segment.is_sacked() {
                continue;
            }
            if require_lost && !self.is_lost_at(index) {
                continue;
            }
            return Some(index);
        }
        None
    }

    /// The rescue rule: once per episode, when the cumulative
    /// acknowledgment has moved past the last rescue point, pick the
    /// first segment that has been neither sacked nor retransmitted.
    fn rescue_candidate(&self) -> Option<usize> {
        if !seq_gt(self.send.lastack, self.rescue_rxt) {
            return None;
        }
        for index in 0..self.queue.len() {
            let segment = self.queue.get(index).expect("index in bounds");
            if !segment.is_sacked() && !segment.is_retransmitted() {
                return Some(index);
            }
        }
        None
    }

    /// Sends one MSS of new data if any is queued and the peer's window
    /// has room, per NextSeg() rule 2.
    fn send_new_data(&mut self, transmissions: &mut Vec<Retransmit>) -> bool {
        if self.unsent_bytes == 0 {
            return false;
        }
        let window_edge = self.send.lastack.wrapping_add(self.send.snd_wnd);
        if seq_geq(self.send.snd_nxt, window_edge) {
            return false;
        }
        let room = window_edge.wrapping_sub(self.send.snd_nxt);
        let len = self.send.mss.min(self.unsent_bytes).min(room);
        if len == 0 {
            return false;
        }

        let seq = self.send.snd_nxt;
        self.on_segment_sent(seq, len);
        self.unsent_bytes -= len;
        self.pipe += len;
        let last_byte = self.send.snd_nxt.wrapping_sub(1);
        if seq_gt(last_byte, self.high_data) {
            self.high_data = last_byte;
        }

        trace!(seq, len, "recovery sending new data");
        transmissions.push(Retransmit {
            seq,
            len,
            category: RecoveryCategory::NewData,
        });
        true
    }

    /// Retransmits the segment at `index`: flags it, advances the
    /// markers and the cursor past it, charges the pipe, and drops any
    /// pending RTT measurement since a retransmitted range cannot yield
    /// an unambiguous sample.
    fn retransmit_at(
        &mut self,
        index: usize,
        category: RecoveryCategory,
        transmissions: &mut Vec<Retransmit>,
    ) {
        let segment = self.queue.get_mut(index).expect("index in bounds");
        segment.mark_retransmitted();
        let (seq, len, last_byte, end) =
            (segment.seq(), segment.len(), segment.last_byte(), segment.end());

        if seq_gt(last_byte, self.high_rxt) {
            self.high_rxt = last_byte;
        }
        if self.cursor.map(|cursor| seq_geq(seq, cursor)).unwrap_or(false) {
            self.cursor = Some(end);
        }
        self.pipe += len;
        self.rtt_sample = None;
        if category != RecoveryCategory::LostRetransmission {
            self.track_retransmit(seq);
        }

        trace!(seq, len, ?category, "retransmitting");
        transmissions.push(Retransmit { seq, len, category });
    }

    fn track_retransmit(&mut self, seq: u32) {
        if self.cfg.retransmit_tracking != RetransmitTracking::Track {
            return;
        }
        if self.tracked_rexmits.len() >= TRACKED_REXMIT_CAP {
            // Table full; this segment recovers through the normal rules
            return;
        }
        if !self.tracked_rexmits.contains(&seq) {
            self.tracked_rexmits.push(seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetransmitTracking, SackConfig};
    use crate::connection::tests::{blocks_of, established};
    use crate::connection::{Connection, SendState};

    #[test]
    fn fast_retransmit_halves_toward_seven_eighths() {
        let mut connection = Connection::new(
            SackConfig::default(),
            SendState {
                cwnd: 20000,
                ssthresh: 65535,
                mss: 1460,
                snd_nxt: 1000,
                snd_wnd: 16000,
                lastack: 1000,
                iw: 2920,
            },
        );
        connection.reset_sack_markers();
        connection.on_segment_sent(1000, 1460);
        connection.on_segment_sent(2460, 1460);
        connection.apply_sack_blocks(1000, &blocks_of(&[(2460, 3920)]));

        let retransmit = connection.enter_fast_retransmit().unwrap();
        assert_eq!(retransmit.seq, 1000);
        assert_eq!(retransmit.category, RecoveryCategory::FastRetransmit);
        // snd_wnd < cwnd, so 7/8 of 16000
        assert_eq!(connection.send.ssthresh, 14000);
        assert_eq!(connection.send.cwnd, 14000);
        assert_eq!(connection.high_rxt(), 2459);
        assert_eq!(connection.recovery_point(), connection.send.snd_nxt.wrapping_sub(1));
        assert!(connection.in_fast_recovery());
        assert!(connection.rtt_sample().is_none());

        // Guard flag blocks re-entry until the episode ends
        assert!(connection.enter_fast_retransmit().is_none());
    }

    #[test]
    fn ssthresh_floor_is_two_segments() {
        let mut connection = Connection::new(
            SackConfig::default(),
            SendState {
                cwnd: 2000,
                ssthresh: 65535,
                mss: 1460,
                snd_nxt: 1000,
                snd_wnd: 2000,
                lastack: 1000,
                iw: 1460,
            },
        );
        connection.reset_sack_markers();
        connection.on_segment_sent(1000, 1000);
        connection.enter_fast_retransmit().unwrap();
        assert_eq!(connection.send.ssthresh, 2 * 1460);
    }

    #[test]
    fn recovers_a_lost_segment_then_pauses() {
        let mut connection = established(&[
            (1000, 500),
            (1500, 500),
            (2000, 500),
            (2500, 500),
            (3000, 500),
            (3500, 500),
        ]);
        // Three discontiguous sacked runs above the first segment
        connection.apply_sack_blocks(
            1000,
            &blocks_of(&[(1500, 2000), (2500, 3000), (3500, 4000)]),
        );
        connection.in_fast_recovery = true;
        connection.set_pipe();
        connection.send.cwnd = connection.pipe() + connection.send.mss;

        let transmissions = connection.sack_loss_recovery();
        assert_eq!(transmissions.len(), 1);
        assert_eq!(transmissions[0].seq, 1000);
        assert_eq!(transmissions[0].category, RecoveryCategory::UnsackedLost);
        assert_eq!(connection.high_rxt(), 1499);
        assert!(connection
            .queue()
            .front()
            .unwrap()
            .is_retransmitted());

        // Budget exhausted by the retransmission; nothing more happens
        assert!(connection.sack_loss_recovery().is_empty());
    }

    #[test]
    fn sacked_segments_are_never_selected() {
        let mut connection = established(&[(1000, 500), (1500, 500), (2000, 500)]);
        connection.apply_sack_blocks(1000, &blocks_of(&[(1500, 2000), (2000, 2500)]));
        connection.in_fast_recovery = true;
        connection.set_pipe();

        let transmissions = connection.sack_loss_recovery();
        for transmission in &transmissions {
            assert_ne!(transmission.seq, 1500);
            assert_ne!(transmission.seq, 2000);
        }
    }

    #[test]
    fn all_sacked_returns_immediately() {
        let mut connection = established(&[(1000, 500), (1500, 500)]);
        for segment in connection.queue.iter_mut() {
            segment.mark_sacked();
        }
        connection.in_fast_recovery = true;
        assert!(connection.sack_loss_recovery().is_empty());
        assert!(connection.cursor.is_none());
    }

    #[test]
    fn relaxed_rule_picks_unsacked_segments_once_lost_ones_are_done() {
        let mut connection = established(&[(1000, 500), (1500, 500), (2000, 500)]);
        // One sacked run above: not enough evidence for the strict rule
        connection.apply_sack_blocks(1000, &blocks_of(&[(2000, 2500)]));
        connection.in_fast_recovery = true;
        connection.set_pipe();
        connection.send.cwnd = connection.pipe() + 2 * connection.send.mss;

        let transmissions = connection.sack_loss_recovery();
        assert!(transmissions
            .iter()
            .any(|t| t.seq == 1000 && t.category == RecoveryCategory::Unsacked));
    }

    #[test]
    fn new_data_fills_spare_window() {
        let mut connection = established(&[(1000, 500), (1500, 500), (2000, 500)]);
        connection.apply_sack_blocks(1000, &blocks_of(&[(2000, 2500)]));
        connection.queue_unsent(800);
        connection.in_fast_recovery = true;
        connection.set_pipe();
        connection.send.cwnd = connection.pipe() + 4 * connection.send.mss;

        let transmissions = connection.sack_loss_recovery();
        let new_data: Vec<_> = transmissions
            .iter()
            .filter(|t| t.category == RecoveryCategory::NewData)
            .collect();
        // Rule 2 runs at most once per call
        assert_eq!(new_data.len(), 1);
        assert_eq!(new_data[0].seq, 2500);
        assert_eq!(new_data[0].len, 500);
        assert_eq!(connection.send.snd_nxt, 3000);
        assert_eq!(connection.unsent_bytes(), 300);
        assert_eq!(connection.high_data, 2999);
    }

    #[test]
    fn rescue_retransmission_fires_once() {
        let mut connection = established(&[(1000, 500), (1500, 500), (2000, 500)]);
        // Middle segment sacked; cumulative ack then moves up to 1500
        connection.apply_sack_blocks(1000, &blocks_of(&[(1500, 2000)]));
        connection.on_cumulative_ack(1500);
        connection.in_fast_recovery = true;
        connection.recovery_point = 2499;
        // Tail beyond high_sacked: rules 1 and 3 find nothing
        connection.high_sacked = 2000;
        connection.high_rxt = 1999;
        connection.cursor = Some(2000);
        connection.set_pipe();
        connection.send.cwnd = connection.pipe() + 2 * connection.send.mss;

        let transmissions = connection.sack_loss_recovery();
        assert_eq!(transmissions.len(), 1);
        assert_eq!(transmissions[0].category, RecoveryCategory::Rescue);
        assert_eq!(transmissions[0].seq, 2000);
        // The rescue point advances so the rule cannot fire again
        assert_eq!(connection.rescue_rxt, connection.recovery_point);
        let again = connection.sack_loss_recovery();
        assert!(again.iter().all(|t| t.category != RecoveryCategory::Rescue));
    }

    #[test]
    fn lost_retransmissions_are_sent_again_when_tracked() {
        let mut connection = established(&[
            (1000, 500),
            (1500, 500),
            (2000, 500),
            (2500, 500),
            (3000, 500),
            (3500, 500),
        ]);
        connection.cfg = SackConfig {
            retransmit_tracking: RetransmitTracking::Track,
            ..SackConfig::default()
        };
        connection.apply_sack_blocks(
            1000,
            &blocks_of(&[(1500, 2000), (2500, 3000), (3500, 4000)]),
        );
        connection.in_fast_recovery = true;
        connection.set_pipe();
        connection.send.cwnd = connection.pipe() + connection.send.mss;
        let first = connection.sack_loss_recovery();
        assert_eq!(first[0].seq, 1000);

        // The retransmission is still judged lost; with tracking on it
        // goes out again without waiting for the timer
        connection.set_pipe();
        connection.send.cwnd = connection.pipe() + connection.send.mss;
        let again = connection.rexmit_lost_retransmissions();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].seq, 1000);
        assert_eq!(again[0].category, RecoveryCategory::LostRetransmission);
        assert_eq!(connection.queue().front().unwrap().tx_count(), 3);
    }

    #[test]
    fn untracked_retransmissions_are_left_to_the_normal_rules() {
        let mut connection = established(&[(1000, 500), (1500, 500)]);
        connection.queue.get_mut(0).unwrap().mark_retransmitted();
        assert!(connection.rexmit_lost_retransmissions().is_empty());
    }
}
