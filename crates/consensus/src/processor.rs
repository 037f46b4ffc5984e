//! Transaction processors
//!
//! A processor interprets the payload of every transaction carrying its
//! tag and applies it to a tree snapshot. The ledger dry-runs processors
//! on admission and runs them for real when a round is finalized.
//! Contract execution has no processor here; the tag is reserved.

use crate::error::ProcessError;
use borsh::{BorshDeserialize, BorshSerialize};
use ledger_state::accounts::{
    read_account_balance, read_account_stake, write_account_balance, write_account_stake,
};
use ledger_state::{AccountId, Snapshot, Transaction};

pub const TAG_NOP: u8 = 0;
pub const TAG_TRANSFER: u8 = 1;
pub const TAG_CONTRACT: u8 = 2;
pub const TAG_STAKE: u8 = 3;

/// Applies transactions of one tag to the account state
pub trait TransactionProcessor: Send + Sync {
    fn apply(&self, state: &mut Snapshot, tx: &Transaction) -> Result<(), ProcessError>;
}

/// Accepts anything and changes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NopProcessor;

impl TransactionProcessor for NopProcessor {
    fn apply(&self, _state: &mut Snapshot, _tx: &Transaction) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// Payload of a transfer
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transfer {
    pub recipient: AccountId,
    pub amount: u64,
}

impl Transfer {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Transfer serialization should not fail")
    }
}

/// Moves balance from the sender to a recipient
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferProcessor;

impl TransactionProcessor for TransferProcessor {
    fn apply(&self, state: &mut Snapshot, tx: &Transaction) -> Result<(), ProcessError> {
        let transfer: Transfer = borsh::from_slice(&tx.payload)
            .map_err(|e| ProcessError(format!("malformed transfer: {}", e)))?;

        let sender_balance = read_account_balance(&*state, &tx.sender).unwrap_or(0);
        let remaining = sender_balance.checked_sub(transfer.amount).ok_or_else(|| {
            ProcessError(format!(
                "balance {} cannot cover transfer of {}",
                sender_balance, transfer.amount
            ))
        })?;

        write_account_balance(state, &tx.sender, remaining);

        let recipient_balance = read_account_balance(&*state, &transfer.recipient).unwrap_or(0);
        let credited = recipient_balance
            .checked_add(transfer.amount)
            .ok_or_else(|| ProcessError("recipient balance overflow".to_string()))?;
        write_account_balance(state, &transfer.recipient, credited);

        Ok(())
    }
}

/// Payload of a stake transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum StakeOp {
    /// Lock balance as stake
    Place(u64),
    /// Return stake to the balance
    Withdraw(u64),
}

impl StakeOp {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("StakeOp serialization should not fail")
    }
}

/// Moves value between the sender's balance and stake
#[derive(Debug, Clone, Copy, Default)]
pub struct StakeProcessor;

impl TransactionProcessor for StakeProcessor {
    fn apply(&self, state: &mut Snapshot, tx: &Transaction) -> Result<(), ProcessError> {
        let op: StakeOp = borsh::from_slice(&tx.payload)
            .map_err(|e| ProcessError(format!("malformed stake op: {}", e)))?;

        let balance = read_account_balance(&*state, &tx.sender).unwrap_or(0);
        let stake = read_account_stake(&*state, &tx.sender).unwrap_or(0);

        let (balance, stake) = match op {
            StakeOp::Place(amount) => (
                balance.checked_sub(amount).ok_or_else(|| {
                    ProcessError(format!("balance {} cannot cover stake of {}", balance, amount))
                })?,
                stake.saturating_add(amount),
            ),
            StakeOp::Withdraw(amount) => (
                balance.saturating_add(amount),
                stake.checked_sub(amount).ok_or_else(|| {
                    ProcessError(format!("stake {} cannot cover withdrawal of {}", stake, amount))
                })?,
            ),
        };

        write_account_balance(state, &tx.sender, balance);
        write_account_stake(state, &tx.sender, stake);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_state::Identifier;

    fn funded(id: &AccountId, balance: u64) -> Snapshot {
        let mut state = Snapshot::new();
        write_account_balance(&mut state, id, balance);
        state
    }

    fn tx(sender: AccountId, tag: u8, payload: Vec<u8>) -> Transaction {
        Transaction::new(sender, 0, vec![Identifier::ZERO], 1, tag, payload)
    }

    #[test]
    fn test_transfer_moves_balance() {
        let alice = Identifier::hash(b"alice");
        let bob = Identifier::hash(b"bob");
        let mut state = funded(&alice, 100);

        let payload = Transfer { recipient: bob, amount: 40 }.to_bytes();
        TransferProcessor
            .apply(&mut state, &tx(alice, TAG_TRANSFER, payload))
            .unwrap();

        assert_eq!(read_account_balance(&state, &alice), Some(60));
        assert_eq!(read_account_balance(&state, &bob), Some(40));
    }

    #[test]
    fn test_transfer_rejects_overdraft() {
        let alice = Identifier::hash(b"alice");
        let mut state = funded(&alice, 10);

        let payload = Transfer { recipient: Identifier::hash(b"bob"), amount: 11 }.to_bytes();
        let err = TransferProcessor
            .apply(&mut state, &tx(alice, TAG_TRANSFER, payload))
            .unwrap_err();
        assert!(err.0.contains("cannot cover"));

        let err = TransferProcessor
            .apply(&mut state, &tx(alice, TAG_TRANSFER, vec![1, 2]))
            .unwrap_err();
        assert!(err.0.contains("malformed"));
    }

    #[test]
    fn test_stake_place_and_withdraw() {
        let alice = Identifier::hash(b"alice");
        let mut state = funded(&alice, 50);

        StakeProcessor
            .apply(&mut state, &tx(alice, TAG_STAKE, StakeOp::Place(30).to_bytes()))
            .unwrap();
        assert_eq!(read_account_balance(&state, &alice), Some(20));
        assert_eq!(read_account_stake(&state, &alice), Some(30));

        StakeProcessor
            .apply(&mut state, &tx(alice, TAG_STAKE, StakeOp::Withdraw(10).to_bytes()))
            .unwrap();
        assert_eq!(read_account_balance(&state, &alice), Some(30));
        assert_eq!(read_account_stake(&state, &alice), Some(20));

        assert!(StakeProcessor
            .apply(&mut state, &tx(alice, TAG_STAKE, StakeOp::Withdraw(21).to_bytes()))
            .is_err());
    }
}
