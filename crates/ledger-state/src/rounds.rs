//! Round ledger persistence
//!
//! Finalized rounds are kept in a bounded ring inside the durable store:
//!
//! ```text
//! [0x8] + decimal index   serialized round
//! [0x9]                   latest round index, 4 bytes BE
//! [0x10]                  oldest round index, 4 bytes BE
//! [0x11]                  stored round count, 1 byte
//! [0x12]                  tree checkpoint
//! ```
//!
//! Loading reads slots `0..stored_count` in index order and does not use
//! the cursors for slot addressing.

use crate::error::{KvError, StorageError};
use crate::kv::KvStore;
use crate::tree::Snapshot;
use crate::types::Round;

const KEY_ROUNDS: u8 = 0x8;
const KEY_ROUND_LATEST_IX: u8 = 0x9;
const KEY_ROUND_OLDEST_IX: u8 = 0x10;
const KEY_ROUND_STORED_COUNT: u8 = 0x11;
const KEY_TREE_CHECKPOINT: u8 = 0x12;

/// Ring capacity. The stored count is a single byte, so the ring holds at
/// most `u8::MAX` rounds.
pub const MAX_STORED_ROUNDS: u32 = u8::MAX as u32;

fn round_key(ix: u32) -> Vec<u8> {
    let mut key = vec![KEY_ROUNDS];
    key.extend_from_slice(ix.to_string().as_bytes());
    key
}

/// Persist `round` in slot `current_ix` along with the ring cursors.
///
/// Each put may fail on its own; the first failure aborts and is reported
/// with the field it was writing. Nothing is rolled back, re-running with
/// the same indices overwrites the same keys.
pub fn store_round(
    kv: &dyn KvStore,
    round: &Round,
    current_ix: u32,
    oldest_ix: u32,
    stored_count: u8,
) -> Result<(), StorageError> {
    kv.put(&[KEY_ROUND_STORED_COUNT], &[stored_count])
        .map_err(|source| StorageError::Store {
            what: "stored rounds count",
            source,
        })?;

    kv.put(&[KEY_ROUND_OLDEST_IX], &oldest_ix.to_be_bytes())
        .map_err(|source| StorageError::Store {
            what: "oldest round index",
            source,
        })?;

    kv.put(&[KEY_ROUND_LATEST_IX], &current_ix.to_be_bytes())
        .map_err(|source| StorageError::Store {
            what: "latest round index",
            source,
        })?;

    kv.put(&round_key(current_ix), &round.marshal())
        .map_err(|source| StorageError::Store {
            what: "round",
            source,
        })?;

    Ok(())
}

/// Rounds and cursors read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRounds {
    /// Rounds in slot order `0..stored_count`
    pub rounds: Vec<Round>,
    pub latest_ix: u32,
    pub oldest_ix: u32,
}

impl LoadedRounds {
    /// Cursor state matching what was loaded
    pub fn ring(&self) -> RoundRing {
        RoundRing {
            latest_ix: self.latest_ix,
            oldest_ix: self.oldest_ix,
            stored_count: self.rounds.len() as u8,
        }
    }

    /// Rounds ordered oldest first. Slot order only differs from this once
    /// the ring has wrapped.
    pub fn chronological(&self) -> Vec<Round> {
        let mut rounds = self.rounds.clone();
        if !rounds.is_empty() {
            let shift = self.oldest_ix as usize % rounds.len();
            rounds.rotate_left(shift);
        }
        rounds
    }
}

fn load_cursor(kv: &dyn KvStore, key: u8, what: &'static str) -> Result<Vec<u8>, StorageError> {
    match kv.get(&[key]) {
        Ok(buf) => Ok(buf),
        Err(KvError::NotFound) => Err(StorageError::Uninitialized { what }),
        Err(source) => Err(StorageError::Load {
            what: what.to_string(),
            source,
        }),
    }
}

fn decode_index(buf: &[u8], what: &'static str) -> Result<u32, StorageError> {
    let arr: [u8; 4] = buf
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(StorageError::Truncated {
            what,
            expected: 4,
            actual: buf.len(),
        })?;
    Ok(u32::from_be_bytes(arr))
}

/// Load every stored round plus the ring cursors.
///
/// A missing cursor means the store was never initialized and yields an
/// error whose `is_missing()` is true. Anything else is corruption.
pub fn load_rounds(kv: &dyn KvStore) -> Result<LoadedRounds, StorageError> {
    let buf = load_cursor(kv, KEY_ROUND_LATEST_IX, "latest round index")?;
    let latest_ix = decode_index(&buf, "latest round index")?;

    let buf = load_cursor(kv, KEY_ROUND_OLDEST_IX, "oldest round index")?;
    let oldest_ix = decode_index(&buf, "oldest round index")?;

    let buf = load_cursor(kv, KEY_ROUND_STORED_COUNT, "stored rounds count")?;
    let stored_count = *buf.first().ok_or(StorageError::Truncated {
        what: "stored rounds count",
        expected: 1,
        actual: 0,
    })? as usize;

    let mut rounds = Vec::with_capacity(stored_count);
    for i in 0..stored_count {
        let buf = kv
            .get(&round_key(i as u32))
            .map_err(|source| StorageError::Load {
                what: format!("round - {}", i),
                source,
            })?;

        let round =
            Round::unmarshal(&buf).map_err(|source| StorageError::Decode { index: i, source })?;

        rounds.push(round);
    }

    Ok(LoadedRounds {
        rounds,
        latest_ix,
        oldest_ix,
    })
}

/// Ring cursor bookkeeping for the next `store_round`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundRing {
    pub latest_ix: u32,
    pub oldest_ix: u32,
    pub stored_count: u8,
}

impl RoundRing {
    /// Cursors for storing one more round. The first round lands in slot
    /// 0; once full, the oldest slot is overwritten.
    pub fn advance(&self) -> RoundRing {
        if self.stored_count == 0 {
            return RoundRing {
                latest_ix: 0,
                oldest_ix: 0,
                stored_count: 1,
            };
        }

        let latest_ix = (self.latest_ix + 1) % MAX_STORED_ROUNDS;

        if u32::from(self.stored_count) < MAX_STORED_ROUNDS {
            RoundRing {
                latest_ix,
                oldest_ix: self.oldest_ix,
                stored_count: self.stored_count + 1,
            }
        } else {
            RoundRing {
                latest_ix,
                oldest_ix: (self.oldest_ix + 1) % MAX_STORED_ROUNDS,
                stored_count: self.stored_count,
            }
        }
    }
}

/// Persist every entry of `snapshot` so a restart recovers account state
pub fn store_tree_checkpoint(kv: &dyn KvStore, snapshot: &Snapshot) -> Result<(), StorageError> {
    let bytes = bincode::serialize(&snapshot.to_entries())?;
    kv.put(&[KEY_TREE_CHECKPOINT], &bytes)
        .map_err(|source| StorageError::Store {
            what: "tree checkpoint",
            source,
        })
}

/// Load the tree checkpoint, `None` if none was ever written
pub fn load_tree_checkpoint(kv: &dyn KvStore) -> Result<Option<Snapshot>, StorageError> {
    match kv.get(&[KEY_TREE_CHECKPOINT]) {
        Ok(bytes) => {
            let entries: Vec<(Vec<u8>, Vec<u8>)> = bincode::deserialize(&bytes)?;
            Ok(Some(Snapshot::from_entries(entries)))
        }
        Err(KvError::NotFound) => Ok(None),
        Err(source) => Err(StorageError::Load {
            what: "tree checkpoint".to_string(),
            source,
        }),
    }
}
