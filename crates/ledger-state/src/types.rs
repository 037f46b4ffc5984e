//! Core types: identifiers, transactions and rounds

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size in bytes of every identifier
pub const ID_SIZE: usize = 32;

/// Opaque 32-byte identifier shared by accounts and transactions
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct Identifier(pub [u8; ID_SIZE]);

/// Identifier of an account
pub type AccountId = Identifier;

/// Identifier of a transaction
pub type TransactionId = Identifier;

impl Identifier {
    /// The zero identifier, meaning "no identifier"
    pub const ZERO: Identifier = Identifier([0u8; ID_SIZE]);

    pub fn new(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes into an identifier
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_SIZE]
    }

    /// Count the leading zero bits of the identifier
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in self.0 {
            if byte != 0 {
                return bits + byte.leading_zeros();
            }
            bits += 8;
        }
        bits
    }
}

impl AsRef<[u8]> for Identifier {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierParseError {
    #[error("invalid base58: {0}")]
    Encoding(String),

    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl FromStr for Identifier {
    type Err = IdentifierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| IdentifierParseError::Encoding(e.to_string()))?;
        let len = bytes.len();
        let arr: [u8; ID_SIZE] = bytes
            .try_into()
            .map_err(|_| IdentifierParseError::Length(len))?;
        Ok(Self(arr))
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A transaction as seen by consensus.
///
/// The payload is opaque here; it is interpreted by the processor
/// registered for `tag`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    /// Content hash of every other field
    pub id: TransactionId,
    /// Account that created the transaction
    pub sender: AccountId,
    /// Sender-local sequence number
    pub nonce: u64,
    /// Transactions this one builds on
    pub parents: Vec<TransactionId>,
    /// View the transaction was created in
    pub view_id: u64,
    /// Processor tag
    pub tag: u8,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Create a transaction and compute its identifier
    pub fn new(
        sender: AccountId,
        nonce: u64,
        parents: Vec<TransactionId>,
        view_id: u64,
        tag: u8,
        payload: Vec<u8>,
    ) -> Self {
        let mut tx = Self {
            id: Identifier::ZERO,
            sender,
            nonce,
            parents,
            view_id,
            tag,
            payload,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Hash the transaction contents, excluding `id`
    pub fn compute_id(&self) -> TransactionId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.sender.as_ref());
        hasher.update(&self.nonce.to_le_bytes());
        hasher.update(&(self.parents.len() as u32).to_le_bytes());
        for parent in &self.parents {
            hasher.update(parent.as_ref());
        }
        hasher.update(&self.view_id.to_le_bytes());
        hasher.update(&[self.tag]);
        hasher.update(&(self.payload.len() as u32).to_le_bytes());
        hasher.update(&self.payload);

        Identifier(*hasher.finalize().as_bytes())
    }

    /// Seed used for criticality, derived from the identifier
    pub fn seed(&self) -> Identifier {
        Identifier::hash(self.id.as_ref())
    }

    /// A transaction is critical when its seed has at least `difficulty`
    /// leading zero bits, making it eligible to become a round root.
    pub fn is_critical(&self, difficulty: u64) -> bool {
        u64::from(self.seed().leading_zero_bits()) >= difficulty
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Transaction serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// A finalized round: the root transaction that closed a view plus the
/// resulting state checksum.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Round {
    /// View this round finalized
    pub view_id: u64,
    /// Critical transaction that became the round root
    pub root: Transaction,
    /// Number of transactions applied in the round
    pub applied: u32,
    /// Checksum of the tree after applying the round
    pub state_root: [u8; 32],
}

impl Round {
    pub fn new(view_id: u64, root: Transaction, applied: u32, state_root: [u8; 32]) -> Self {
        Self {
            view_id,
            root,
            applied,
            state_root,
        }
    }

    /// The genesis round closes view 0 with an empty root transaction
    pub fn genesis(state_root: [u8; 32]) -> Self {
        let root = Transaction::new(Identifier::ZERO, 0, Vec::new(), 0, 0, Vec::new());
        Self::new(0, root, 0, state_root)
    }

    /// Identifier of the round, i.e. of its root transaction
    pub fn id(&self) -> TransactionId {
        self.root.id
    }

    pub fn marshal(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Round serialization should not fail")
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}
