//! Account state layout inside the versioned tree
//!
//! Every account field lives under its own key:
//!
//! ```text
//! [0x1][field tag][account id]                     scalar fields, contract code
//! [0x1][0x7][page index, 8 bytes LE][account id]   contract pages
//! ```
//!
//! A missing key reads as the field's default. Values that fail to decode
//! (short integers, corrupt pages) also read as absent; callers cannot
//! tell "never written" from "corrupt".

use crate::error::CodecError;
use crate::tree::StateTree;
use crate::types::{AccountId, ID_SIZE};

/// Key prefix for everything stored under accounts
pub const KEY_ACCOUNTS: u8 = 0x1;

/// Largest contract page accepted on read
pub const MAX_PAGE_SIZE: usize = 4 * 1024 * 1024;

const TAG_NONCE: u8 = 0x2;
const TAG_BALANCE: u8 = 0x3;
const TAG_STAKE: u8 = 0x4;
const TAG_CONTRACT_CODE: u8 = 0x5;
const TAG_CONTRACT_NUM_PAGES: u8 = 0x6;
const TAG_CONTRACT_PAGES: u8 = 0x7;

/// A field of an account record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountField {
    Nonce,
    Balance,
    Stake,
    ContractCode,
    ContractNumPages,
    /// Memory page of a contract, by page index
    ContractPage(u64),
}

impl AccountField {
    pub fn tag(&self) -> u8 {
        match self {
            AccountField::Nonce => TAG_NONCE,
            AccountField::Balance => TAG_BALANCE,
            AccountField::Stake => TAG_STAKE,
            AccountField::ContractCode => TAG_CONTRACT_CODE,
            AccountField::ContractNumPages => TAG_CONTRACT_NUM_PAGES,
            AccountField::ContractPage(_) => TAG_CONTRACT_PAGES,
        }
    }

    /// How values of this field are encoded
    pub fn codec(&self) -> FieldCodec {
        match self {
            AccountField::Nonce
            | AccountField::Balance
            | AccountField::Stake
            | AccountField::ContractNumPages => FieldCodec::U64Le,
            AccountField::ContractCode => FieldCodec::RawBytes,
            AccountField::ContractPage(_) => FieldCodec::CompressedPage,
        }
    }

    /// Full tree key of this field for `id`
    pub fn key(&self, id: &AccountId) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 + 8 + ID_SIZE);
        key.push(KEY_ACCOUNTS);
        key.push(self.tag());
        if let AccountField::ContractPage(idx) = self {
            key.extend_from_slice(&idx.to_le_bytes());
        }
        key.extend_from_slice(id.as_ref());
        key
    }
}

/// Decoded value of an account field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    U64(u64),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U64(v) => Some(*v),
            FieldValue::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            FieldValue::U64(_) => None,
        }
    }
}

/// Byte encoding of a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCodec {
    /// 8-byte little-endian unsigned integer
    U64Le,
    /// Stored as-is
    RawBytes,
    /// LZ4 block with the uncompressed size prepended
    CompressedPage,
}

impl FieldCodec {
    pub fn encode(&self, value: &FieldValue) -> Vec<u8> {
        match (self, value) {
            (_, FieldValue::U64(v)) => v.to_le_bytes().to_vec(),
            (FieldCodec::CompressedPage, FieldValue::Bytes(b)) => {
                lz4_flex::compress_prepend_size(b)
            }
            (_, FieldValue::Bytes(b)) => b.clone(),
        }
    }

    pub fn decode(&self, buf: &[u8]) -> Result<FieldValue, CodecError> {
        match self {
            FieldCodec::U64Le => {
                let arr: [u8; 8] = buf
                    .get(..8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(CodecError::Decode {
                        expected: 8,
                        actual: buf.len(),
                    })?;
                Ok(FieldValue::U64(u64::from_le_bytes(arr)))
            }
            FieldCodec::RawBytes => Ok(FieldValue::Bytes(buf.to_vec())),
            FieldCodec::CompressedPage => {
                let declared = buf
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .map(u32::from_le_bytes)
                    .ok_or(CodecError::Decode {
                        expected: 4,
                        actual: buf.len(),
                    })?;
                if declared as usize > MAX_PAGE_SIZE {
                    return Err(CodecError::Compression(format!(
                        "declared page size {} exceeds {}",
                        declared, MAX_PAGE_SIZE
                    )));
                }
                lz4_flex::decompress_size_prepended(buf)
                    .map(FieldValue::Bytes)
                    .map_err(|e| CodecError::Compression(e.to_string()))
            }
        }
    }
}

/// Raw stored bytes of a field, `None` if the key is absent or empty
pub fn lookup_field<'a, T: StateTree + ?Sized>(
    tree: &'a T,
    id: &AccountId,
    field: AccountField,
) -> Option<&'a [u8]> {
    tree.lookup(&field.key(id)).filter(|buf| !buf.is_empty())
}

/// Read and decode a field. Decode failures read as absent.
pub fn read_field<T: StateTree + ?Sized>(
    tree: &T,
    id: &AccountId,
    field: AccountField,
) -> Option<FieldValue> {
    let buf = lookup_field(tree, id, field)?;

    match field.codec().decode(buf) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::trace!("Treating {:?} of account {} as absent: {}", field, id, e);
            None
        }
    }
}

/// Encode and write a field. Zero values still create an entry.
pub fn write_field<T: StateTree + ?Sized>(
    tree: &mut T,
    id: &AccountId,
    field: AccountField,
    value: &FieldValue,
) {
    tree.insert(field.key(id), field.codec().encode(value));
}

fn read_u64<T: StateTree + ?Sized>(tree: &T, id: &AccountId, field: AccountField) -> Option<u64> {
    read_field(tree, id, field).and_then(|v| v.as_u64())
}

fn read_bytes<T: StateTree + ?Sized>(
    tree: &T,
    id: &AccountId,
    field: AccountField,
) -> Option<Vec<u8>> {
    read_field(tree, id, field).and_then(FieldValue::into_bytes)
}

pub fn read_account_nonce<T: StateTree + ?Sized>(tree: &T, id: &AccountId) -> Option<u64> {
    read_u64(tree, id, AccountField::Nonce)
}

pub fn write_account_nonce<T: StateTree + ?Sized>(tree: &mut T, id: &AccountId, nonce: u64) {
    write_field(tree, id, AccountField::Nonce, &FieldValue::U64(nonce));
}

pub fn read_account_balance<T: StateTree + ?Sized>(tree: &T, id: &AccountId) -> Option<u64> {
    read_u64(tree, id, AccountField::Balance)
}

pub fn write_account_balance<T: StateTree + ?Sized>(tree: &mut T, id: &AccountId, balance: u64) {
    write_field(tree, id, AccountField::Balance, &FieldValue::U64(balance));
}

pub fn read_account_stake<T: StateTree + ?Sized>(tree: &T, id: &AccountId) -> Option<u64> {
    read_u64(tree, id, AccountField::Stake)
}

pub fn write_account_stake<T: StateTree + ?Sized>(tree: &mut T, id: &AccountId, stake: u64) {
    write_field(tree, id, AccountField::Stake, &FieldValue::U64(stake));
}

pub fn read_account_contract_code<T: StateTree + ?Sized>(
    tree: &T,
    id: &AccountId,
) -> Option<Vec<u8>> {
    read_bytes(tree, id, AccountField::ContractCode)
}

pub fn write_account_contract_code<T: StateTree + ?Sized>(
    tree: &mut T,
    id: &AccountId,
    code: &[u8],
) {
    write_field(
        tree,
        id,
        AccountField::ContractCode,
        &FieldValue::Bytes(code.to_vec()),
    );
}

pub fn read_account_contract_num_pages<T: StateTree + ?Sized>(
    tree: &T,
    id: &AccountId,
) -> Option<u64> {
    read_u64(tree, id, AccountField::ContractNumPages)
}

pub fn write_account_contract_num_pages<T: StateTree + ?Sized>(
    tree: &mut T,
    id: &AccountId,
    num_pages: u64,
) {
    write_field(
        tree,
        id,
        AccountField::ContractNumPages,
        &FieldValue::U64(num_pages),
    );
}

/// Read a contract page. Missing and corrupt pages are both `None`.
pub fn read_account_contract_page<T: StateTree + ?Sized>(
    tree: &T,
    id: &AccountId,
    idx: u64,
) -> Option<Vec<u8>> {
    read_bytes(tree, id, AccountField::ContractPage(idx))
}

pub fn write_account_contract_page<T: StateTree + ?Sized>(
    tree: &mut T,
    id: &AccountId,
    idx: u64,
    page: &[u8],
) {
    write_field(
        tree,
        id,
        AccountField::ContractPage(idx),
        &FieldValue::Bytes(page.to_vec()),
    );
}

/// Scalar view of an account, with defaults filled in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountRecord {
    pub nonce: u64,
    pub balance: u64,
    pub stake: u64,
    pub contract_code: Option<Vec<u8>>,
    pub contract_num_pages: u64,
}

impl AccountRecord {
    /// Gather every scalar field of `id`. Pages are read on demand.
    pub fn load<T: StateTree + ?Sized>(tree: &T, id: &AccountId) -> Self {
        Self {
            nonce: read_account_nonce(tree, id).unwrap_or(0),
            balance: read_account_balance(tree, id).unwrap_or(0),
            stake: read_account_stake(tree, id).unwrap_or(0),
            contract_code: read_account_contract_code(tree, id),
            contract_num_pages: read_account_contract_num_pages(tree, id).unwrap_or(0),
        }
    }

    pub fn is_contract(&self) -> bool {
        self.contract_code.is_some()
    }

    /// An account exists once it holds funds, stake or contract state
    pub fn exists(&self) -> bool {
        self.balance > 0 || self.stake > 0 || self.is_contract() || self.contract_num_pages > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Snapshot;
    use crate::types::Identifier;

    fn account(seed: &[u8]) -> AccountId {
        Identifier::hash(seed)
    }

    #[test]
    fn test_key_layout() {
        let id = account(b"alice");

        let key = AccountField::Balance.key(&id);
        assert_eq!(&key[..2], &[0x1, 0x3]);
        assert_eq!(&key[2..], id.as_ref());

        let key = AccountField::ContractPage(3).key(&id);
        assert_eq!(&key[..2], &[0x1, 0x7]);
        assert_eq!(&key[2..10], &3u64.to_le_bytes());
        assert_eq!(&key[10..], id.as_ref());
    }

    #[test]
    fn test_scalar_fields_roundtrip() {
        let mut tree = Snapshot::new();
        let id = account(b"alice");

        write_account_nonce(&mut tree, &id, 7);
        write_account_balance(&mut tree, &id, 1_000);
        write_account_stake(&mut tree, &id, 0);
        write_account_contract_num_pages(&mut tree, &id, 2);

        assert_eq!(read_account_nonce(&tree, &id), Some(7));
        assert_eq!(read_account_balance(&tree, &id), Some(1_000));
        // Zero is still a present entry
        assert_eq!(read_account_stake(&tree, &id), Some(0));
        assert_eq!(read_account_contract_num_pages(&tree, &id), Some(2));
    }

    #[test]
    fn test_unwritten_fields_are_absent() {
        let tree = Snapshot::new();
        let id = account(b"nobody");

        assert_eq!(read_account_nonce(&tree, &id), None);
        assert_eq!(read_account_balance(&tree, &id), None);
        assert_eq!(read_account_contract_code(&tree, &id), None);
        assert_eq!(read_account_contract_page(&tree, &id, 0), None);

        let record = AccountRecord::load(&tree, &id);
        assert_eq!(record, AccountRecord::default());
        assert!(!record.exists());
    }

    #[test]
    fn test_malformed_values_read_as_absent() {
        let mut tree = Snapshot::new();
        let id = account(b"alice");

        tree.insert(AccountField::Nonce.key(&id), vec![1, 2, 3]);
        tree.insert(AccountField::Balance.key(&id), Vec::new());
        tree.insert(AccountField::ContractPage(0).key(&id), b"not lz4".to_vec());

        assert_eq!(read_account_nonce(&tree, &id), None);
        assert_eq!(read_account_balance(&tree, &id), None);
        assert_eq!(read_account_contract_page(&tree, &id, 0), None);
    }

    #[test]
    fn test_contract_code_and_empty_code() {
        let mut tree = Snapshot::new();
        let id = account(b"contract");

        write_account_contract_code(&mut tree, &id, b"\0asm");
        assert_eq!(read_account_contract_code(&tree, &id), Some(b"\0asm".to_vec()));

        // Empty stored values are indistinguishable from absence
        write_account_contract_code(&mut tree, &id, b"");
        assert_eq!(read_account_contract_code(&tree, &id), None);
    }

    #[test]
    fn test_contract_page_roundtrip() {
        let mut tree = Snapshot::new();
        let id = account(b"contract");

        let repetitive = vec![0xAB; 64 * 1024];
        let incompressible: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();

        for (idx, page) in [(3u64, repetitive), (4, incompressible), (5, Vec::new())] {
            write_account_contract_page(&mut tree, &id, idx, &page);
            assert_eq!(read_account_contract_page(&tree, &id, idx), Some(page));
        }

        // Pages are stored independently
        assert_eq!(read_account_contract_page(&tree, &id, 6), None);
    }

    #[test]
    fn test_account_record_exists() {
        let mut tree = Snapshot::new();
        let id = account(b"staker");

        write_account_stake(&mut tree, &id, 50);
        let record = AccountRecord::load(&tree, &id);

        assert_eq!(record.stake, 50);
        assert!(record.exists());
        assert!(!record.is_contract());
    }
}
