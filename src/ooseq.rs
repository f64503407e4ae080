//! Coalescing of out-of-order received segments into the intervals
//! advertised in outgoing SACK options.
//!
//! While the receive side holds segments above a gap, each call to
//! [`SackIntervals::update_for_ooseq`] rebuilds the interval table from
//! the current out-of-order queue, carrying forward each interval's
//! arrival tag and stamping the interval that absorbed the newest segment.
//! The table is then kept ordered newest-first so the most recently
//! changed block is reported first, as RFC 2018 recommends.

use crate::seq::{seq_bounded, seq_gt, Closed, Open};
use tracing::trace;

/// A coalesced run of out-of-order received bytes. `right` is one past the
/// final byte, matching the right edge of a SACK block on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackInterval {
    pub left: u32,
    pub right: u32,
    /// Arrival tag of the newest segment folded into the interval.
    order: u32,
}

impl SackInterval {
    pub fn order(&self) -> u32 {
        self.order
    }
}

/// Fixed-capacity table of [`SackInterval`]s owned by one connection.
#[derive(Debug, Clone)]
pub struct SackIntervals {
    intervals: Vec<SackInterval>,
    capacity: usize,
    arrivals: u32,
}

/// Enough to track one gap per in-flight window's worth of typical
/// segments; a receive path holding more distinct gaps than this falls
/// back to plain cumulative ACKs until some of them fill.
pub const DEFAULT_CAPACITY: usize = 8;

impl Default for SackIntervals {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl SackIntervals {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            intervals: Vec::with_capacity(capacity),
            capacity,
            arrivals: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SackInterval> {
        self.intervals.iter()
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    /// Rebuilds the interval table from the receive side's out-of-order
    /// queue after `new_seg_seq` was inserted into it. `ooseq` yields the
    /// queue's `(seq, len)` ranges in ascending sequence order.
    ///
    /// Returns `false` when the rebuilt table would not fit, in which case
    /// the previous table is left untouched and the caller should respond
    /// with a plain cumulative ACK for this event.
    pub fn update_for_ooseq<I>(&mut self, ooseq: I, new_seg_seq: u32) -> bool
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        self.arrivals = self.arrivals.wrapping_add(1);
        let stamp = self.arrivals;

        let mut rebuilt: Vec<SackInterval> = Vec::with_capacity(self.capacity);
        for (seq, len) in ooseq {
            let end = seq.wrapping_add(len);
            match rebuilt.last_mut() {
                // Contiguous with the interval under construction
                Some(current) if seq == current.right => {
                    current.right = end;
                }
                // Overlapping ranges fold into it as well
                Some(current) if !seq_gt(seq, current.right) => {
                    if seq_gt(end, current.right) {
                        current.right = end;
                    }
                }
                // A gap: start the next interval
                _ => {
                    if rebuilt.len() == self.capacity {
                        trace!(
                            capacity = self.capacity,
                            "out-of-order interval table full, keeping previous table"
                        );
                        return false;
                    }
                    rebuilt.push(SackInterval {
                        left: seq,
                        right: end,
                        order: 0,
                    });
                }
            }
        }

        // Carry forward arrival tags from the intervals each rebuilt one
        // absorbed, then stamp the one covering the newly arrived segment.
        for interval in &mut rebuilt {
            let mut order = 0;
            for old in &self.intervals {
                let overlaps =
                    seq_gt(old.right, interval.left) && seq_gt(interval.right, old.left);
                if overlaps && old.order > order {
                    order = old.order;
                }
            }
            if seq_bounded(interval.left, Closed, new_seg_seq, Open, interval.right) {
                order = stamp;
            }
            interval.order = order;
        }

        // Newest-first; insertion sort keeps ties in walk order
        for i in 1..rebuilt.len() {
            let mut j = i;
            while j > 0 && rebuilt[j - 1].order < rebuilt[j].order {
                rebuilt.swap(j - 1, j);
                j -= 1;
            }
        }

        self.intervals = rebuilt;
        true
    }

    /// Drops every interval at or below the cumulative acknowledgment
    /// point; once the receive gap fills, the table empties.
    pub fn ack_through(&mut self, rcv_nxt: u32) {
        self.intervals.retain(|iv| seq_gt(iv.right, rcv_nxt));
    }

    /// Removes the first `count` intervals after they have been reported.
    pub(crate) fn remove_reported(&mut self, count: usize) {
        self.intervals.drain(..count.min(self.intervals.len()));
    }

    #[cfg(test)]
    pub(crate) fn push_for_test(&mut self, left: u32, right: u32, order: u32) {
        self.intervals.push(SackInterval { left, right, order });
        self.intervals.sort_by(|a, b| b.order.cmp(&a.order));
        if self.arrivals < order {
            self.arrivals = order;
        }
    }
}
