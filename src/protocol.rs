/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The embedded protocol's instruction set: opcode registration and matching, the block relevance
//! filter, and the per-opcode handlers that turn transactions into [commands](Command).
//!
//! An opcode is a short ASCII string embedded at the front of an extended transaction's payload. The
//! full set of registered opcode strings is carried by an [OpcodeTable]; matching a payload against the
//! table is first-registered-wins. A payload that matches no registered opcode is silently skipped,
//! which is the policy that keeps the instruction set forward-compatible: new opcodes can appear on
//! chain before any deployed indexer understands them.
//!
//! Today only [BURN](Opcode::Burn) has an implemented handler. The remaining opcodes are declared so
//! that their transactions are recognized (and their blocks stored), but dispatch parses them to no
//! command.

use crate::types::{Address, Block, TokenSymbol, Transaction, TransactionFormat, Value};

/// The declared instruction set of the protocol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    Burn,
    AssetIssue,
    AssetTransfer,
    AssetDestroy,
    OrderPlace,
    OrderCancel,
    Lock,
    Memo,
    Broadcast,
    Bet,
    Dividend,
}

/// The ordered registry of opcode strings.
///
/// Every registered opcode string is the protocol's payload prefix followed by an opcode-specific
/// suffix. [match_payload](Self::match_payload) tries registrations in order and returns the first
/// whose full string is a prefix of the payload.
#[derive(Clone)]
pub struct OpcodeTable {
    prefix: String,
    registrations: Vec<(String, Opcode)>,
}

impl OpcodeTable {
    pub fn new(prefix: impl Into<String>) -> OpcodeTable {
        OpcodeTable {
            prefix: prefix.into(),
            registrations: Vec::new(),
        }
    }

    /// Register `opcode` under the opcode string `prefix + suffix`. Registration order is match
    /// priority.
    pub fn register(mut self, suffix: &str, opcode: Opcode) -> OpcodeTable {
        let opcode_string = format!("{}{}", self.prefix, suffix);
        self.registrations.push((opcode_string, opcode));
        self
    }

    /// The protocol's payload prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The first registered opcode whose opcode string is a prefix of `payload`, together with that
    /// opcode string.
    pub fn match_payload<'a>(&'a self, payload: &str) -> Option<(&'a str, Opcode)> {
        self.registrations
            .iter()
            .find(|(opcode_string, _)| payload.starts_with(opcode_string.as_str()))
            .map(|(opcode_string, opcode)| (opcode_string.as_str(), *opcode))
    }
}

/// The protocol constants that opcode handlers consult.
#[derive(Clone)]
pub struct ProtocolParams {
    pub opcode_table: OpcodeTable,
    pub burn_address: Address,
    pub default_token: TokenSymbol,
}

/// Returns whether the block is worth storing: true iff at least one of its transactions is in the
/// extended format and carries a payload matching a registered opcode string. Short-circuits on the
/// first match. A block with no transactions is never relevant.
pub fn is_relevant(block: &Block, table: &OpcodeTable) -> bool {
    block.transactions.iter().any(|tx| {
        tx.format == TransactionFormat::Extended
            && tx
                .payload_ascii()
                .map_or(false, |payload| table.match_payload(payload).is_some())
    })
}

/// A parsed protocol command. Ephemeral: produced from one transaction, folded into the ledger, never
/// persisted.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    Burn {
        sender: Address,
        recipient: Address,
        value: Value,
    },
}

/// Determine the opcode, if any, for every transaction in the block and invoke the matching handler,
/// collecting commands in transaction order. Transactions in the basic format, with non-ASCII
/// payloads, or matching no registered opcode are skipped without error.
pub(crate) fn parse_block(block: &Block, params: &ProtocolParams) -> Vec<Command> {
    let mut commands = Vec::new();
    for tx in &block.transactions {
        if tx.format != TransactionFormat::Extended {
            continue;
        }
        let payload = match tx.payload_ascii() {
            Some(payload) => payload,
            None => continue,
        };
        if let Some((opcode_string, opcode)) = params.opcode_table.match_payload(payload) {
            if let Some(command) = execute(opcode, opcode_string, tx, params) {
                commands.push(command);
            }
        }
    }
    commands
}

/// Dispatch a matched transaction to its opcode's handler.
///
/// The match is exhaustive over [Opcode]. Opcodes without an implemented handler parse to no command;
/// their arm must stay a no-op until a handler lands.
fn execute(
    opcode: Opcode,
    opcode_string: &str,
    tx: &Transaction,
    params: &ProtocolParams,
) -> Option<Command> {
    match opcode {
        Opcode::Burn => burn(opcode_string, tx, params),
        Opcode::AssetIssue
        | Opcode::AssetTransfer
        | Opcode::AssetDestroy
        | Opcode::OrderPlace
        | Opcode::OrderCancel
        | Opcode::Lock
        | Opcode::Memo
        | Opcode::Broadcast
        | Opcode::Bet
        | Opcode::Dividend => None,
    }
}

/// BURN: the payload must equal the registered opcode string exactly, and the recipient,
/// whitespace-normalized, must equal the normalized burn address. A qualifying transaction credits the
/// *sender* with its value in the default token. Anything else parses to no command, silently.
fn burn(opcode_string: &str, tx: &Transaction, params: &ProtocolParams) -> Option<Command> {
    let payload = tx.payload_ascii()?;
    if payload != opcode_string {
        return None;
    }
    if tx.recipient.normalized() != params.burn_address.normalized() {
        return None;
    }
    Some(Command::Burn {
        sender: tx.sender.clone(),
        recipient: tx.recipient.clone(),
        value: tx.value,
    })
}
