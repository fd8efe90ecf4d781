//! `Bound` — an ordered `(timestamp, id_prefix)` pair demarcating a range in
//! the reconciliation space, and `Item` — a single `(timestamp, id)` entry in
//! a sealed [`super::storage::Storage`] view.

use std::cmp::Ordering;

use super::error::NegentropyError;
use super::varint;

pub const ID_SIZE: usize = 32;

/// A timestamp in the reconciliation ordering. `Infinity` sorts after every
/// finite value and is encoded on the wire as the delta `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Timestamp {
    Finite(u32),
    Infinity,
}

impl Timestamp {
    pub fn from_unix(seconds: u32) -> Self {
        Timestamp::Finite(seconds)
    }
}

/// A single `(timestamp, id)` entry in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    pub timestamp: u32,
    pub id: [u8; ID_SIZE],
}

impl Item {
    pub fn new(timestamp: u32, id: [u8; ID_SIZE]) -> Self {
        Self { timestamp, id }
    }
}

/// `(timestamp, id_prefix)` ordering the reconciliation space. A shorter
/// `id_prefix` sorts as though it were padded with zero bytes, matching the
/// "smallest id with this prefix" semantics an upper/lower bound needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub timestamp: Timestamp,
    pub id_prefix: Vec<u8>,
}

impl Bound {
    pub fn min() -> Self {
        Bound {
            timestamp: Timestamp::Finite(0),
            id_prefix: Vec::new(),
        }
    }

    pub fn max() -> Self {
        Bound {
            timestamp: Timestamp::Infinity,
            id_prefix: Vec::new(),
        }
    }

    /// A bound at exactly `item`, carrying its full id.
    pub fn at_item(item: &Item) -> Self {
        Bound {
            timestamp: Timestamp::Finite(item.timestamp),
            id_prefix: item.id.to_vec(),
        }
    }

    /// A bound at `item`, truncated to the shortest prefix that still
    /// distinguishes it from `neighbor` (the adjacent item on the side the
    /// bound separates). Falls back to the full id if no shorter prefix
    /// suffices or the timestamps already differ.
    pub fn at_item_minimal(item: &Item, neighbor: Option<&Item>) -> Self {
        let neighbor = match neighbor {
            Some(n) if n.timestamp == item.timestamp => n,
            _ => {
                return Bound {
                    timestamp: Timestamp::Finite(item.timestamp),
                    id_prefix: Vec::new(),
                }
            }
        };
        let mut len = 0;
        while len < ID_SIZE && item.id[len] == neighbor.id[len] {
            len += 1;
        }
        len = (len + 1).min(ID_SIZE);
        Bound {
            timestamp: Timestamp::Finite(item.timestamp),
            id_prefix: item.id[..len].to_vec(),
        }
    }

    fn padded_id(&self) -> [u8; ID_SIZE] {
        let mut buf = [0u8; ID_SIZE];
        let n = self.id_prefix.len().min(ID_SIZE);
        buf[..n].copy_from_slice(&self.id_prefix[..n]);
        buf
    }

    /// Encodes this bound onto `out`, given the previous bound's timestamp
    /// (`Bound::min()`'s timestamp, `Finite(0)`, for the first range).
    pub fn encode(&self, prev: Timestamp, out: &mut Vec<u8>) {
        let delta = match self.timestamp {
            Timestamp::Infinity => 0,
            Timestamp::Finite(ts) => {
                let prev_ts = match prev {
                    Timestamp::Finite(p) => p,
                    Timestamp::Infinity => ts,
                };
                u64::from(ts.saturating_sub(prev_ts)) + 1
            }
        };
        varint::encode(delta, out);
        varint::encode(self.id_prefix.len() as u64, out);
        out.extend_from_slice(&self.id_prefix);
    }

    /// Decodes a bound from the front of `bytes` given the previous bound's
    /// timestamp, returning the bound and the remaining slice.
    pub fn decode<'a>(
        bytes: &'a [u8],
        prev: Timestamp,
    ) -> Result<(Bound, &'a [u8]), NegentropyError> {
        let (delta, rest) = varint::decode(bytes)?;
        let timestamp = if delta == 0 {
            Timestamp::Infinity
        } else {
            let prev_ts = match prev {
                Timestamp::Finite(p) => p,
                Timestamp::Infinity => 0,
            };
            let abs = u64::from(prev_ts) + (delta - 1);
            Timestamp::Finite(u32::try_from(abs).map_err(|_| {
                NegentropyError::BadMessage("decoded timestamp exceeds u32 range")
            })?)
        };
        let (id_len, rest) = varint::decode(rest)?;
        let id_len = usize::try_from(id_len)
            .map_err(|_| NegentropyError::BadMessage("id prefix length overflow"))?;
        if id_len > ID_SIZE {
            return Err(NegentropyError::BadMessage("id prefix longer than ID_SIZE"));
        }
        if rest.len() < id_len {
            return Err(NegentropyError::BadMessage("truncated id prefix"));
        }
        let (prefix, rest) = rest.split_at(id_len);
        Ok((
            Bound {
                timestamp,
                id_prefix: prefix.to_vec(),
            },
            rest,
        ))
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.padded_id().cmp(&other.padded_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> [u8; ID_SIZE] {
        let mut b = [0u8; ID_SIZE];
        b[0] = byte;
        b
    }

    #[test]
    fn min_sorts_before_max() {
        assert!(Bound::min() < Bound::max());
    }

    #[test]
    fn roundtrips_with_shared_running_timestamp() {
        let b1 = Bound::at_item(&Item::new(100, id(0xaa)));
        let b2 = Bound::at_item(&Item::new(250, id(0xbb)));

        let mut buf = Vec::new();
        b1.encode(Bound::min().timestamp, &mut buf);
        let prev_after_first = b1.timestamp;
        b2.encode(prev_after_first, &mut buf);

        let (decoded1, rest) = Bound::decode(&buf, Bound::min().timestamp).unwrap();
        assert_eq!(decoded1, b1);
        let (decoded2, rest) = Bound::decode(rest, decoded1.timestamp).unwrap();
        assert_eq!(decoded2, b2);
        assert!(rest.is_empty());
    }

    #[test]
    fn max_encodes_zero_delta() {
        let mut buf = Vec::new();
        Bound::max().encode(Timestamp::Finite(500), &mut buf);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn minimal_prefix_is_shortest_distinguishing_prefix() {
        let a = Item::new(100, id(0xaa));
        let mut bid = [0u8; ID_SIZE];
        bid[0] = 0xaa;
        bid[1] = 0xbb;
        let b = Item::new(100, bid);
        let bound = Bound::at_item_minimal(&a, Some(&b));
        assert_eq!(bound.id_prefix.len(), 2);
    }
}
