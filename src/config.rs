//! Per-connection configuration for the recovery algorithms. Each knob
//! selects between behaviors that satisfy the same contract, so tests can
//! exercise every variant independently.

/// Number of duplicate notifications treated as evidence of loss
/// ([RFC 6675 §2](https://www.rfc-editor.org/rfc/rfc6675.html#section-2),
/// DupThresh).
pub const DUPACK_THRESH: u32 = 3;

/// How a not-yet-retransmitted segment is judged lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossDetection {
    /// RFC 6675 IsLost(): a segment is lost once DupThresh discontiguous
    /// SACKed blocks lie above it, or more than (DupThresh - 1) * MSS
    /// SACKed bytes do.
    #[default]
    DupThresh,
    /// Forward-ACK inference: a segment is lost once the highest SACKed
    /// sequence number is more than DupThresh * MSS ahead of it.
    ForwardAck,
}

/// What happens to reported intervals when a SACK option is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportMode {
    /// Intervals are dropped once reported; each gap is advertised to the
    /// peer exactly once.
    #[default]
    FlushOnSend,
    /// Intervals are kept and re-advertised on later segments; unused
    /// reserved option space is zero-filled.
    Piggyback,
}

/// Whether segments retransmitted during a recovery episode are remembered
/// so that a retransmission that is itself lost can be sent again without
/// waiting for the retransmission timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetransmitTracking {
    #[default]
    Off,
    Track,
}

/// Construction-time configuration for a [`Connection`].
///
/// [`Connection`]: crate::connection::Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackConfig {
    pub loss_detection: LossDetection,
    pub report_mode: ReportMode,
    pub retransmit_tracking: RetransmitTracking,
    /// Lower bound applied to the slow-start threshold computed on entry
    /// to fast recovery. Zero leaves the computed value alone.
    pub initial_ssthresh: u32,
}

impl Default for SackConfig {
    fn default() -> Self {
        Self {
            loss_detection: LossDetection::default(),
            report_mode: ReportMode::default(),
            retransmit_tracking: RetransmitTracking::default(),
            initial_ssthresh: 0,
        }
    }
}
