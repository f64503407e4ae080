//! Serialization of the wire-visible SACK options.
//!
//! Two options exist ([RFC 2018](https://www.rfc-editor.org/rfc/rfc2018.html)):
//! SACK-permitted (Kind=4), a fixed 2-byte option exchanged on SYN
//! segments to negotiate the extension, and the SACK option itself
//! (Kind=5), carrying 1 to 4 `(left, right)` block pairs of 32-bit
//! big-endian sequence numbers. Both must fit, together with whatever
//! other options the header carries, in the 40 bytes of TCP option space.

use crate::config::ReportMode;
use crate::ooseq::SackIntervals;
use thiserror::Error as ThisError;
use tracing::trace;

/// TCP option kind: no-operation, used for alignment padding.
const KIND_NOP: u8 = 1;
/// TCP option kind: SACK permitted.
const KIND_SACK_PERMITTED: u8 = 4;
/// TCP option kind: SACK.
const KIND_SACK: u8 = 5;

/// Total TCP option space in a header.
pub const MAX_OPTIONS_BYTES: usize = 40;
/// Wire size of one SACK block pair.
pub const SACK_BLOCK_BYTES: usize = 8;
/// Kind and length octets plus two NOPs of alignment padding.
const SACK_OPTION_OVERHEAD: usize = 4;
/// The option space bounds the block count: (40 - 4) / 8.
pub const MAX_SACK_BLOCKS: usize = 4;

/// The SACK-permitted option with its trailing alignment padding.
pub const SACK_PERMITTED_OPTION: [u8; 4] = [KIND_SACK_PERMITTED, 2, KIND_NOP, KIND_NOP];

/// One received byte range reported by the peer. `right` is one past the
/// final byte, as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SackBlock {
    pub left: u32,
    pub right: u32,
}

impl SackBlock {
    pub fn new(left: u32, right: u32) -> Self {
        Self { left, right }
    }
}

/// The blocks decoded from one SACK option, held inline. The parser
/// returns this by value so nothing outlives the ACK being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SackBlocks {
    blocks: [SackBlock; MAX_SACK_BLOCKS],
    len: usize,
}

impl SackBlocks {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[SackBlock] {
        &self.blocks[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SackBlock> {
        self.as_slice().iter()
    }

    fn push(&mut self, block: SackBlock) {
        debug_assert!(self.len < MAX_SACK_BLOCKS);
        self.blocks[self.len] = block;
        self.len += 1;
    }
}

/// An error that occurred while decoding a SACK-related option. Callers
/// treat any of these as "the option was not present": the enclosing ACK
/// is still processed normally.
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum OptionParseError {
    #[error("option kind {found:#04x} is not the expected {expected:#04x}")]
    WrongKind { expected: u8, found: u8 },
    #[error("option declares {declared} bytes but only {available} are present")]
    Truncated { declared: usize, available: usize },
    #[error("declared length {declared} does not hold a whole number of blocks")]
    BadLength { declared: usize },
}

/// The SACK-permitted option for an outgoing SYN or SYN-ACK, or `None`
/// when it must be suppressed: a passive open that never saw the peer
/// offer SACK does not offer it back on the SYN-ACK.
pub fn sack_permitted_option(
    in_syn_rcvd: bool,
    peer_sack_permitted: bool,
) -> Option<[u8; 4]> {
    if in_syn_rcvd && !peer_sack_permitted {
        None
    } else {
        Some(SACK_PERMITTED_OPTION)
    }
}

/// Checks an incoming SACK-permitted option starting at its kind octet.
pub fn parse_sack_permitted(bytes: &[u8]) -> Result<(), OptionParseError> {
    if bytes.len() < 2 {
        return Err(OptionParseError::Truncated {
            declared: 2,
            available: bytes.len(),
        });
    }
    if bytes[0] != KIND_SACK_PERMITTED {
        return Err(OptionParseError::WrongKind {
            expected: KIND_SACK_PERMITTED,
            found: bytes[0],
        });
    }
    if bytes[1] != 2 {
        return Err(OptionParseError::BadLength {
            declared: bytes[1] as usize,
        });
    }
    Ok(())
}

/// How many SACK blocks fit in the option space left after `options_len`
/// bytes of other options, bounded by `available` blocks and the fixed
/// maximum of 4. Zero when not even one fits.
pub fn sack_block_count_for_send(available: usize, options_len: usize) -> usize {
    let remaining = MAX_OPTIONS_BYTES.saturating_sub(options_len);
    if remaining < SACK_OPTION_OVERHEAD + SACK_BLOCK_BYTES {
        return 0;
    }
    let fit = (remaining - SACK_OPTION_OVERHEAD) / SACK_BLOCK_BYTES;
    fit.min(available).min(MAX_SACK_BLOCKS)
}

/// Option space to reserve for `count` blocks, including alignment.
pub fn sack_option_space(count: usize) -> usize {
    SACK_OPTION_OVERHEAD + count * SACK_BLOCK_BYTES
}

/// Writes a SACK option reporting up to `count` intervals into `buf`,
/// returning the number of bytes written (zero when there is nothing to
/// report). Intervals come out newest-first, the order the table keeps
/// them in.
///
/// Under [`ReportMode::Piggyback`] the remainder of `buf` is zero-filled
/// and the intervals stay in the table for later segments. Under
/// [`ReportMode::FlushOnSend`] the reported intervals are removed: each
/// gap is advertised once.
pub fn build_sack_option(
    intervals: &mut SackIntervals,
    count: usize,
    mode: ReportMode,
    buf: &mut [u8],
) -> usize {
    let count = count.min(intervals.len()).min(MAX_SACK_BLOCKS);
    if count == 0 {
        return 0;
    }
    let needed = 2 + count * SACK_BLOCK_BYTES;
    debug_assert!(buf.len() >= needed);

    buf[0] = KIND_SACK;
    buf[1] = needed as u8;
    for (i, interval) in intervals.iter().take(count).enumerate() {
        let at = 2 + i * SACK_BLOCK_BYTES;
        buf[at..at + 4].copy_from_slice(&interval.left.to_be_bytes());
        buf[at + 4..at + 8].copy_from_slice(&interval.right.to_be_bytes());
    }

    match mode {
        ReportMode::Piggyback => {
            for byte in buf[needed..].iter_mut() {
                *byte = 0;
            }
            buf.len()
        }
        ReportMode::FlushOnSend => {
            intervals.remove_reported(count);
            needed
        }
    }
}

/// Decodes a SACK option starting at its kind octet. Any inconsistency
/// rejects the whole option; blocks beyond the fixed maximum are ignored.
pub fn parse_sack_option(bytes: &[u8]) -> Result<SackBlocks, OptionParseError> {
    if bytes.len() < 2 {
        return Err(OptionParseError::Truncated {
            declared: 2,
            available: bytes.len(),
        });
    }
    if bytes[0] != KIND_SACK {
        return Err(OptionParseError::WrongKind {
            expected: KIND_SACK,
            found: bytes[0],
        });
    }
    let declared = bytes[1] as usize;
    if declared < 2 + SACK_BLOCK_BYTES || (declared - 2) % SACK_BLOCK_BYTES != 0 {
        return Err(OptionParseError::BadLength { declared });
    }
    if declared > bytes.len() {
        return Err(OptionParseError::Truncated {
            declared,
            available: bytes.len(),
        });
    }

    let declared_blocks = (declared - 2) / SACK_BLOCK_BYTES;
    if declared_blocks > MAX_SACK_BLOCKS {
        trace!(
            declared_blocks,
            "SACK option declares more blocks than can be tracked, ignoring the rest"
        );
    }

    let mut blocks = SackBlocks::default();
    for i in 0..declared_blocks.min(MAX_SACK_BLOCKS) {
        let at = 2 + i * SACK_BLOCK_BYTES;
        let left = u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap());
        let right = u32::from_be_bytes(bytes[at + 4..at + 8].try_into().unwrap());
        blocks.push(SackBlock::new(left, right));
    }
    Ok(blocks)
}
