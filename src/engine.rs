/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replay engine: the state machine that folds relevant blocks into ledger state.
//!
//! The engine starts in [Initializing](EngineState::Initializing) and moves to
//! [Ready](EngineState::Ready) exactly once, when [replay_backfill](ReplayEngine::replay_backfill)
//! finishes. There is no further transition: if the chain node loses consensus, re-establishing the
//! pipeline's bookkeeping is the surrounding process's responsibility.
//!
//! ## Ordering
//!
//! Opcode handlers fold state, so they must observe the protocol's commands in chain order. The store
//! enumerates records in no particular order; backfill replay therefore sorts the historical set by
//! ascending height before replaying it. Live blocks [pushed](ReplayEngine::push) while the engine is
//! still initializing are buffered in a FIFO queue and drained strictly after the historical set,
//! preserving arrival order. Transactions within one block are processed in their given order.
//!
//! Two stored blocks claiming the same height cannot both be right on a canonical chain. The engine
//! does not define which one's effects survive; it keeps the last writer in its seen-blocks map and
//! logs a warning so the condition is observable.
//!
//! ## Atomicity
//!
//! [process_block](ReplayEngine::process_block) computes every balance update with checked arithmetic
//! before mutating anything, so a failed block leaves the ledger and the engine's position untouched
//! and the same block can be retried.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::events::*;
use crate::ledger::LedgerState;
use crate::protocol::{parse_block, Command, ProtocolParams};
use crate::store::{BlockCodec, DecodeError, KVStore, RelevantBlockStore};
use crate::types::{Block, BlockHeight, CryptoHash, TokenSymbol, Value};

/// The engine's lifecycle state. [Initializing](Self::Initializing) buffers live pushes;
/// [Ready](Self::Ready) applies them immediately.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EngineState {
    Initializing,
    Ready,
}

/// Ways in which a replay pass can fail. All of them abort the pass with the ledger unchanged by the
/// failing block.
#[derive(Debug)]
pub enum ReplayError {
    /// A stored record failed to decode.
    Decode(DecodeError),
    /// A hash present in the store's key index has no record behind it.
    MissingRecord(CryptoHash),
    /// Folding the block's commands would overflow a balance.
    BalanceOverflow { height: BlockHeight },
}

impl From<DecodeError> for ReplayError {
    fn from(error: DecodeError) -> ReplayError {
        ReplayError::Decode(error)
    }
}

pub struct ReplayEngine<K: KVStore, C: BlockCodec> {
    state: EngineState,
    blocks: BTreeMap<BlockHeight, CryptoHash>,
    pending: VecDeque<CryptoHash>,
    ledger: LedgerState,
    store: RelevantBlockStore<K, C>,
    params: ProtocolParams,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, C: BlockCodec> ReplayEngine<K, C> {
    pub fn new(
        store: RelevantBlockStore<K, C>,
        params: ProtocolParams,
        event_publisher: Option<Sender<Event>>,
    ) -> ReplayEngine<K, C> {
        log::info!("ReplayEngine, {:?}", EngineState::Initializing);
        ReplayEngine {
            state: EngineState::Initializing,
            blocks: BTreeMap::new(),
            pending: VecDeque::new(),
            ledger: LedgerState::new(),
            store,
            params,
            event_publisher,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn ledger(&self) -> &LedgerState {
        &self.ledger
    }

    /// Replay the full historical set in ascending height order, then drain the pending queue in
    /// FIFO arrival order, then transition to [Ready](EngineState::Ready).
    ///
    /// Called exactly once, by the backfill scanner on completion. Calling it again after the engine
    /// is ready is a no-op.
    pub fn replay_backfill(&mut self) -> Result<(), ReplayError> {
        if self.state == EngineState::Ready {
            log::warn!("ReplayEngine, backfill replay requested after READY, ignoring");
            return Ok(());
        }

        let mut historical = Vec::new();
        for key in self.store.keys() {
            let block = self
                .store
                .block(&key)?
                .ok_or(ReplayError::MissingRecord(key))?;
            historical.push(block);
        }
        // Store enumeration order is arbitrary; chain order is what the handlers must observe.
        historical.sort_by_key(|block| block.height);

        for block in &historical {
            self.process_block(block)?;
        }

        while let Some(key) = self.pending.pop_front() {
            let block = self
                .store
                .block(&key)?
                .ok_or(ReplayError::MissingRecord(key))?;
            self.process_block(&block)?;
        }

        self.state = EngineState::Ready;
        log::info!("ReplayEngine, {:?}, {} blocks", self.state, self.blocks.len());
        Event::publish(
            &self.event_publisher,
            Event::EngineReady(EngineReadyEvent {
                timestamp: SystemTime::now(),
                blocks: self.blocks.len(),
            }),
        );
        Ok(())
    }

    /// Hand the engine the hash of a newly stored relevant block. While the engine is initializing
    /// the hash is buffered; once ready, the block is loaded and replayed immediately.
    pub fn push(&mut self, key: CryptoHash) -> Result<(), ReplayError> {
        match self.state {
            EngineState::Initializing => {
                self.pending.push_back(key);
                Event::publish(
                    &self.event_publisher,
                    Event::PendingBlock(PendingBlockEvent {
                        timestamp: SystemTime::now(),
                        block: key,
                    }),
                );
                Ok(())
            }
            EngineState::Ready => {
                let block = self
                    .store
                    .block(&key)?
                    .ok_or(ReplayError::MissingRecord(key))?;
                self.process_block(&block)
            }
        }
    }

    /// Parse the block's transactions into commands and fold them into the ledger, atomically per
    /// block, then record the block under its height. A block in which no transaction carries a
    /// recognized opcode is a no-op for ledger state.
    pub fn process_block(&mut self, block: &Block) -> Result<(), ReplayError> {
        let commands = parse_block(block, &self.params);

        // Stage every balance update before applying any of them.
        let mut staged: HashMap<(TokenSymbol, String), Value> = HashMap::new();
        for command in &commands {
            match command {
                Command::Burn { sender, value, .. } => {
                    let key = (self.params.default_token.clone(), sender.normalized());
                    let current = staged
                        .get(&key)
                        .copied()
                        .unwrap_or_else(|| self.ledger.balance_of_normalized(&key.0, &key.1));
                    let updated = current
                        .checked_add(*value)
                        .ok_or(ReplayError::BalanceOverflow {
                            height: block.height,
                        })?;
                    staged.insert(key, updated);
                }
            }
        }

        if let Some(previous) = self.blocks.insert(block.height, block.hash) {
            if previous != block.hash {
                log::warn!(
                    "ReplayEngine, duplicate height {} with differing hashes, keeping the later block",
                    block.height
                );
            }
        }
        for ((token, address), value) in staged {
            self.ledger.set_balance(token, address, value);
        }

        Event::publish(
            &self.event_publisher,
            Event::ReplayBlock(ReplayBlockEvent {
                timestamp: SystemTime::now(),
                block: block.hash,
                height: block.height,
                commands: commands.len(),
            }),
        );
        for command in commands {
            Event::publish(
                &self.event_publisher,
                Event::ApplyCommand(ApplyCommandEvent {
                    timestamp: SystemTime::now(),
                    command,
                }),
            );
        }
        Ok(())
    }
}
