/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A chain indexer and deterministic replay engine for embedded, opcode-tagged protocols.
//!
//! Some applications ride on top of an existing blockchain instead of running their own: they tag
//! otherwise-ordinary transfers with a short opcode string in the transaction payload, and derive
//! their application state, per-token account balances, by replaying those tagged transactions in
//! chain order. The base chain knows nothing about any of this; it just carries the payloads.
//!
//! This library is the indexing side of such a protocol. Given a connection to a chain node (a
//! [ChainAdapter](chain::ChainAdapter)), a key-value store (a [KVStore](store::KVStore)), and a
//! [Configuration](indexer::Configuration) naming the protocol's opcodes, it:
//! 1. Scans the chain once from a configured start height, storing every block that carries a
//!    registered opcode ([backfill](indexer)),
//! 2. Keeps storing such blocks as new heads arrive ([live updates](indexer)),
//! 3. Replays the stored blocks in strictly ascending height order through the
//!    [replay engine](engine::ReplayEngine), dispatching each recognized opcode to its
//!    [handler](protocol) and folding the results into the in-memory [ledger](ledger::LedgerState).
//!
//! Replay is deterministic: the same store contents always produce the same ledger. The ledger itself
//! is never persisted; the durably stored relevant blocks are the source of truth, and a restart
//! rebuilds the ledger by replaying them.
//!
//! Consensus, peer networking, chain validation, and transaction construction are out of scope. The
//! chain node owns all of them, behind the [ChainAdapter](chain::ChainAdapter) trait.

pub mod chain;

pub mod engine;

pub(crate) mod event_bus;

pub mod events;

pub mod indexer;

pub mod ledger;

pub mod logging;

pub mod protocol;

pub mod store;

pub mod types;
