//! Negentropy wire frame: `protocol_version ∥ Range*`, each range
//! `upper_bound ∥ varint(mode) ∥ payload`. Hex encoding for transport happens
//! at the connection edge — this module deals only in bytes.

use super::bound::{Bound, Timestamp, ID_SIZE};
use super::error::NegentropyError;
use super::fingerprint::FINGERPRINT_SIZE;
use super::varint;

pub const PROTOCOL_VERSION: u8 = 0x61;
pub const ID_LIST_THRESHOLD: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Skip,
    Fingerprint([u8; FINGERPRINT_SIZE]),
    IdList(Vec<[u8; ID_SIZE]>),
}

impl Mode {
    fn tag(&self) -> u64 {
        match self {
            Mode::Skip => 0,
            Mode::Fingerprint(_) => 1,
            Mode::IdList(_) => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub upper_bound: Bound,
    pub mode: Mode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub ranges: Vec<Range>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, upper_bound: Bound, mode: Mode) {
        self.ranges.push(Range { upper_bound, mode });
    }

    pub fn is_empty_or_all_skip(&self) -> bool {
        self.ranges.iter().all(|r| matches!(r.mode, Mode::Skip))
    }

    /// Encodes the message, dropping trailing `SKIP` ranges (they carry no
    /// information once nothing follows them).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![PROTOCOL_VERSION];
        let mut ranges = &self.ranges[..];
        while let Some(last) = ranges.last() {
            if matches!(last.mode, Mode::Skip) {
                ranges = &ranges[..ranges.len() - 1];
            } else {
                break;
            }
        }

        let mut prev = Bound::min().timestamp;
        for range in ranges {
            range.upper_bound.encode(prev, &mut out);
            prev = range.upper_bound.timestamp;
            varint::encode(range.mode.tag(), &mut out);
            match &range.mode {
                Mode::Skip => {}
                Mode::Fingerprint(fp) => out.extend_from_slice(fp),
                Mode::IdList(ids) => {
                    varint::encode(ids.len() as u64, &mut out);
                    for id in ids {
                        out.extend_from_slice(id);
                    }
                }
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NegentropyError> {
        let (version, mut rest) = bytes
            .split_first()
            .ok_or(NegentropyError::BadMessage("empty message"))?;
        if *version != PROTOCOL_VERSION {
            return Err(NegentropyError::UnsupportedProtocol);
        }

        let mut message = Message::new();
        let mut prev = Bound::min().timestamp;
        while !rest.is_empty() {
            let (upper_bound, after_bound) = Bound::decode(rest, prev)?;
            prev = upper_bound.timestamp;
            let (tag, after_tag) = varint::decode(after_bound)?;
            let (mode, after_mode) = match tag {
                0 => (Mode::Skip, after_tag),
                1 => {
                    if after_tag.len() < FINGERPRINT_SIZE {
                        return Err(NegentropyError::BadMessage("truncated fingerprint"));
                    }
                    let (fp_bytes, r) = after_tag.split_at(FINGERPRINT_SIZE);
                    let mut fp = [0u8; FINGERPRINT_SIZE];
                    fp.copy_from_slice(fp_bytes);
                    (Mode::Fingerprint(fp), r)
                }
                2 => {
                    let (count, after_count) = varint::decode(after_tag)?;
                    let count = usize::try_from(count)
                        .map_err(|_| NegentropyError::BadMessage("id count overflow"))?;
                    let needed = count
                        .checked_mul(ID_SIZE)
                        .ok_or(NegentropyError::BadMessage("id count overflow"))?;
                    if after_count.len() < needed {
                        return Err(NegentropyError::BadMessage("truncated id list"));
                    }
                    let (ids_bytes, r) = after_count.split_at(needed);
                    let ids = ids_bytes
                        .chunks_exact(ID_SIZE)
                        .map(|c| {
                            let mut id = [0u8; ID_SIZE];
                            id.copy_from_slice(c);
                            id
                        })
                        .collect();
                    (Mode::IdList(ids), r)
                }
                _ => return Err(NegentropyError::BadMessage("unknown range mode")),
            };
            message.push(upper_bound, mode);
            rest = after_mode;
        }
        Ok(message)
    }
}

pub fn is_infinity(timestamp: Timestamp) -> bool {
    matches!(timestamp, Timestamp::Infinity)
}
