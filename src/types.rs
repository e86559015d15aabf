/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for 'inert' types, i.e., those that are sent around and inspected, but have no active behavior.
//!
//! Blocks and transactions are owned by the chain node and are read-only to this library: nothing in this
//! crate ever mutates one after construction. [Block::new] exists mainly so that library users' chain
//! adapters and test fixtures can produce blocks whose hash is consistent with their contents.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;

pub use sha2::Sha256 as CryptoHasher;

pub type BlockHeight = u64;
pub type CryptoHash = [u8; 32];
pub type Value = u64;
pub type TokenSymbol = String;

/// A user-facing textual account address.
///
/// Addresses are treated as opaque text: the base chain's address scheme may group characters with
/// whitespace for readability. Comparisons made by opcode handlers are always done on the
/// [normalized](Address::normalized) form.
#[derive(Clone, PartialEq, Eq, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Address {
        Address(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address with every whitespace character removed.
    pub fn normalized(&self) -> String {
        self.0.chars().filter(|c| !c.is_whitespace()).collect()
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Address {
        Address(address.to_string())
    }
}

/// The wire format of a transaction. Only [extended](TransactionFormat::Extended) transactions carry a
/// free-form payload, and therefore only extended transactions can encode a protocol command.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum TransactionFormat {
    Basic,
    Extended,
}

#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub value: Value,
    pub format: TransactionFormat,
    pub data: Vec<u8>,
}

impl Transaction {
    /// Create a basic (payload-less) transfer.
    pub fn basic(sender: Address, recipient: Address, value: Value) -> Transaction {
        Transaction {
            sender,
            recipient,
            value,
            format: TransactionFormat::Basic,
            data: Vec::new(),
        }
    }

    /// Create an extended transfer carrying the given payload.
    pub fn extended(sender: Address, recipient: Address, value: Value, data: Vec<u8>) -> Transaction {
        Transaction {
            sender,
            recipient,
            value,
            format: TransactionFormat::Extended,
            data,
        }
    }

    /// The payload interpreted as ASCII text, or None if any byte falls outside ASCII. A payload that
    /// fails this interpretation cannot match an opcode and is ignored by the parsing step.
    pub fn payload_ascii(&self) -> Option<&str> {
        if self.data.is_ascii() {
            // Safety: an all-ASCII bytesequence is valid UTF-8.
            Some(std::str::from_utf8(&self.data).unwrap())
        } else {
            None
        }
    }
}

#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub height: BlockHeight,
    pub hash: CryptoHash,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(height: BlockHeight, transactions: Vec<Transaction>) -> Block {
        Block {
            height,
            hash: Block::hash(height, &transactions),
            transactions,
        }
    }

    pub fn hash(height: BlockHeight, transactions: &Vec<Transaction>) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(&height.try_to_vec().unwrap());
        hasher.update(&transactions.try_to_vec().unwrap());
        hasher.finalize().into()
    }
}
