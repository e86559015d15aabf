/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and shut down an indexer.
//!
//! An indexer connects a chain node to a replay engine. It scans the chain once, backwards-filling the
//! relevant block store from a fixed start height up to the chain height observed at consensus
//! establishment, and from then on keeps the store and the derived ledger current as new heads arrive.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the indexer](IndexerSpec) with:
//!   1. `IndexerSpec::builder` to construct an `IndexerSpecBuilder`,
//!   2. The setters of the `IndexerSpecBuilder`, and
//!   3. The `IndexerSpecBuilder::build` method to construct an [IndexerSpec],
//! - The function to [start](IndexerSpec::start) an [Indexer] given its specification,
//! - [The type](Indexer) which keeps the indexer alive.
//!
//! ## Threads
//!
//! [IndexerSpec::start] spawns four threads:
//! 1. The **poller**, which drains the [chain adapter](crate::chain::ChainAdapter)'s notifications and
//!    routes them to the other threads.
//! 2. The **backfill scanner**, which waits for the consensus-established signal, walks the chain from
//!    the configured start height to the height captured at that moment, stores relevant blocks, and
//!    triggers the engine's backfill replay exactly once before exiting.
//! 3. The **live update listener**, which filters and stores each new head block and pushes its hash
//!    into the engine for the lifetime of the process.
//! 4. The **event bus** (only if any event handler is registered), which dispatches
//!    [events](crate::events) to handlers.
//!
//! The scanner and the listener share the [replay engine](crate::engine::ReplayEngine) behind a mutex:
//! ingestion is concurrent, but application to ledger state is serialized.
//!
//! ## Starting an indexer
//!
//! ```ignore
//! let indexer =
//!     IndexerSpec::builder()
//!     .chain(chain)
//!     .kv_store(kv_store)
//!     .codec(BorshBlockCodec)
//!     .configuration(configuration)
//!     .on_engine_ready(ready_handler)
//!     .build()
//!     .start()
//! ```
//!
//! ### Required setters
//!
//! - `.chain(...)`
//! - `.kv_store(...)`
//! - `.codec(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for events from
//! [crate::events]:
//! - `.on_insert_block(...)`
//! - `.on_pending_block(...)`
//! - `.on_replay_block(...)`
//! - `.on_apply_command(...)`
//! - `.on_engine_ready(...)`
//! - `.on_start_backfill(...)`
//! - `.on_end_backfill(...)`
//! - `.on_consensus_lost(...)`
//!
//! The indexer's [configuration](Configuration) can also be defined using the builder pattern:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .start_height(472_500)
//!     .opcode_table(opcode_table)
//!     .burn_address(burn_address)
//!     .default_token("TOK".to_string())
//!     .log_events(true)
//!     .build()
//! ```

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use typed_builder::TypedBuilder;

use crate::chain::{start_polling, ChainAdapter};
use crate::engine::{EngineState, ReplayEngine};
use crate::event_bus::*;
use crate::events::*;
use crate::ledger::LedgerState;
use crate::protocol::{is_relevant, OpcodeTable, ProtocolParams};
use crate::store::{BlockCodec, InsertOutcome, KVStore, RelevantBlockStore};
use crate::types::{Address, Block, BlockHeight, TokenSymbol};

/// Stores the user-defined parameters required to start the indexer, that is:
/// 1. The start height: the first height the backfill scan considers. Blocks below it are never
///    indexed.
/// 2. The [opcode table](crate::protocol::OpcodeTable): the protocol's payload prefix and its ordered,
///    first-match-wins opcode registrations.
/// 3. The burn address: the reserved address that the BURN handler requires as recipient. Compared
///    whitespace-normalized.
/// 4. The default token: the token symbol that BURN credits.
/// 5. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Log Events
///
/// The indexer logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.start_height(...)`
    - `.opcode_table(...)`
    - `.burn_address(...)`
    - `.default_token(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the height the backfill scan starts from. Required."))]
    pub start_height: BlockHeight,
    #[builder(setter(doc = "Set the protocol's opcode table. Required."))]
    pub opcode_table: OpcodeTable,
    #[builder(setter(doc = "Set the designated burn address. Required."))]
    pub burn_address: Address,
    #[builder(setter(doc = "Set the token symbol credited by BURN. Required."))]
    pub default_token: TokenSymbol,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run the [Indexer].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building an [IndexerSpec]. On the builder call the following methods to construct a valid [IndexerSpec].

    Required:
    - `.chain(...)`
    - `.kv_store(...)`
    - `.codec(...)`
    - `.configuration(...)`

    Optional:
    - `.on_insert_block(...)`
    - `.on_pending_block(...)`
    - `.on_replay_block(...)`
    - `.on_apply_command(...)`
    - `.on_engine_ready(...)`
    - `.on_start_backfill(...)`
    - `.on_end_backfill(...)`
    - `.on_consensus_lost(...)`
"))]
pub struct IndexerSpec<K: KVStore, C: BlockCodec, N: ChainAdapter> {
    // Required parameters
    #[builder(setter(doc = "Set the connection to the chain node. The argument must implement the [ChainAdapter](crate::chain::ChainAdapter) trait. Required."))]
    chain: N,
    #[builder(setter(doc = "Set the implementation of the indexer's Key-Value store. The argument must implement the [KVStore](crate::store::KVStore) trait. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the codec that serializes blocks into the store. The argument must implement the [BlockCodec](crate::store::BlockCodec) trait. Required."))]
    codec: C,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run an indexer. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&InsertBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InsertBlockEvent>),
    doc = "Register a handler closure to be invoked after a relevant block is inserted into the store. Optional."))]
    on_insert_block: Option<HandlerPtr<InsertBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PendingBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PendingBlockEvent>),
    doc = "Register a handler closure to be invoked after a live block is buffered by the initializing engine. Optional."))]
    on_pending_block: Option<HandlerPtr<PendingBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReplayBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReplayBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is replayed into the ledger. Optional."))]
    on_replay_block: Option<HandlerPtr<ReplayBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ApplyCommandEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ApplyCommandEvent>),
    doc = "Register a handler closure to be invoked after a parsed command is applied to the ledger. Optional."))]
    on_apply_command: Option<HandlerPtr<ApplyCommandEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EngineReadyEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EngineReadyEvent>),
    doc = "Register a handler closure to be invoked after the replay engine transitions to READY. Optional."))]
    on_engine_ready: Option<HandlerPtr<EngineReadyEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartBackfillEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartBackfillEvent>),
    doc = "Register a handler closure to be invoked after the backfill scan begins. Optional."))]
    on_start_backfill: Option<HandlerPtr<StartBackfillEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EndBackfillEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EndBackfillEvent>),
    doc = "Register a handler closure to be invoked after the backfill scan completes. Optional."))]
    on_end_backfill: Option<HandlerPtr<EndBackfillEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ConsensusLostEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ConsensusLostEvent>),
    doc = "Register a handler closure to be invoked after the chain node reports loss of consensus. Optional."))]
    on_consensus_lost: Option<HandlerPtr<ConsensusLostEvent>>,
}

impl<K: KVStore, C: BlockCodec, N: ChainAdapter> IndexerSpec<K, C, N> {
    /// Starts all threads and channels associated with running an indexer, and returns the handles to
    /// them in an [Indexer] struct.
    pub fn start(self) -> Indexer<K, C> {
        let store = RelevantBlockStore::new(self.kv_store, self.codec);
        let params = ProtocolParams {
            opcode_table: self.configuration.opcode_table.clone(),
            burn_address: self.configuration.burn_address.clone(),
            default_token: self.configuration.default_token.clone(),
        };

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_insert_block,
            self.on_pending_block,
            self.on_replay_block,
            self.on_apply_command,
            self.on_engine_ready,
            self.on_start_backfill,
            self.on_end_backfill,
            self.on_consensus_lost,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let engine = Arc::new(Mutex::new(ReplayEngine::new(
            store.clone(),
            params.clone(),
            event_publisher.clone(),
        )));

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, consensus_established, heads) =
            start_polling(self.chain.clone(), event_publisher.clone(), poller_shutdown_receiver);

        let (scanner_shutdown, scanner_shutdown_receiver) = mpsc::channel();
        let scanner = start_backfill_scanner(
            self.chain,
            store.clone(),
            params.clone(),
            Arc::clone(&engine),
            self.configuration.start_height,
            consensus_established,
            scanner_shutdown_receiver,
            event_publisher.clone(),
        );

        let (listener_shutdown, listener_shutdown_receiver) = mpsc::channel();
        let listener = start_live_listener(
            store,
            params,
            Arc::clone(&engine),
            heads,
            listener_shutdown_receiver,
            event_publisher,
        );

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let event_bus = if !event_handlers.is_empty() {
            Some(start_event_bus(
                event_handlers,
                event_subscriber.unwrap(), // Safety: should be Some(...).
                event_bus_shutdown_receiver.unwrap(), // Safety: should be Some(...).
            ))
        } else {
            None
        };

        Indexer {
            engine,
            poller: Some(poller),
            poller_shutdown,
            scanner: Some(scanner),
            scanner_shutdown,
            listener: Some(listener),
            listener_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// The backfill scanner: a one-shot thread. It blocks until the poller forwards the
/// consensus-established signal, captures the chain height delivered with that signal as the fixed
/// upper bound of the scan, then walks heights upwards storing every relevant block it has not stored
/// before. On completion it triggers the engine's backfill replay exactly once and exits.
///
/// A fetch failure aborts the scan and leaves the engine INITIALIZING; this is fatal for the run and
/// is logged at error level for the operator.
fn start_backfill_scanner<K: KVStore, C: BlockCodec, N: ChainAdapter>(
    mut chain: N,
    mut store: RelevantBlockStore<K, C>,
    params: ProtocolParams,
    engine: Arc<Mutex<ReplayEngine<K, C>>>,
    start_height: BlockHeight,
    consensus_established: Receiver<BlockHeight>,
    shutdown_signal: Receiver<()>,
    event_publisher: Option<Sender<Event>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let target_height = loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Backfill scanner thread disconnected from main thread")
                }
            }
            match consensus_established.try_recv() {
                // The upper bound is captured once: the chain may keep growing during the scan, but
                // the scan must terminate. Heads past the bound arrive through the live listener.
                Ok(height) => break height,
                Err(TryRecvError::Empty) => thread::yield_now(),
                Err(TryRecvError::Disconnected) => return,
            }
        };

        Event::publish(
            &event_publisher,
            Event::StartBackfill(StartBackfillEvent {
                timestamp: SystemTime::now(),
                start_height,
                target_height,
            }),
        );

        let mut blocks_stored = 0;
        let mut height = start_height;
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Backfill scanner thread disconnected from main thread")
                }
            }

            let block = match chain.block_at_height(height) {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(error) => {
                    log::error!(
                        "Backfill, fetch failed at height {}: {}, scan aborted, engine stays {:?}",
                        height,
                        error.0,
                        EngineState::Initializing
                    );
                    return;
                }
            };

            if is_relevant(&block, &params.opcode_table) {
                match store.insert(&block) {
                    InsertOutcome::Stored => {
                        blocks_stored += 1;
                        Event::publish(
                            &event_publisher,
                            Event::InsertBlock(InsertBlockEvent {
                                timestamp: SystemTime::now(),
                                block: block.clone(),
                            }),
                        );
                    }
                    InsertOutcome::AlreadyStored => {
                        log::debug!("Backfill, block at height {} already stored", height)
                    }
                }
            }

            height = block.height + 1;
            if height > target_height {
                break;
            }
        }

        Event::publish(
            &event_publisher,
            Event::EndBackfill(EndBackfillEvent {
                timestamp: SystemTime::now(),
                blocks_stored,
            }),
        );

        let result = engine.lock().unwrap().replay_backfill();
        if let Err(error) = result {
            log::error!("Backfill, replay failed: {:?}", error);
        }
    })
}

/// The live update listener: consumes head blocks from the poller (which only forwards them while
/// consensus is established), stores the relevant ones, and pushes their hashes into the engine. Runs
/// for the lifetime of the process.
fn start_live_listener<K: KVStore, C: BlockCodec>(
    mut store: RelevantBlockStore<K, C>,
    params: ProtocolParams,
    engine: Arc<Mutex<ReplayEngine<K, C>>>,
    heads: Receiver<Block>,
    shutdown_signal: Receiver<()>,
    event_publisher: Option<Sender<Event>>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Live listener thread disconnected from main thread")
            }
        }

        match heads.try_recv() {
            Ok(head) => {
                if !is_relevant(&head, &params.opcode_table) {
                    continue;
                }
                if let InsertOutcome::Stored = store.insert(&head) {
                    Event::publish(
                        &event_publisher,
                        Event::InsertBlock(InsertBlockEvent {
                            timestamp: SystemTime::now(),
                            block: head.clone(),
                        }),
                    );
                }
                let result = engine.lock().unwrap().push(head.hash);
                if let Err(error) = result {
                    log::error!("LiveUpdate, push failed at height {}: {:?}", head.height, error);
                }
            }
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}

/// A handle to the background threads of an indexer. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Indexer<K: KVStore, C: BlockCodec> {
    engine: Arc<Mutex<ReplayEngine<K, C>>>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    scanner: Option<JoinHandle<()>>,
    scanner_shutdown: Sender<()>,
    listener: Option<JoinHandle<()>>,
    listener_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<K: KVStore, C: BlockCodec> Indexer<K, C> {
    /// A point-in-time copy of the derived ledger. This is a camera, not a query API: the engine keeps
    /// mutating its own ledger after the copy is taken.
    pub fn ledger(&self) -> LedgerState {
        self.engine.lock().unwrap().ledger().clone()
    }

    /// The replay engine's current lifecycle state.
    pub fn engine_state(&self) -> EngineState {
        self.engine.lock().unwrap().state()
    }
}

impl<K: KVStore, C: BlockCodec> Drop for Indexer<K, C> {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important, as the threads make
        // assumptions about the validity of their channels based on this. The scanner and listener
        // receive from the poller and assume the poller lives longer than them; the event bus must
        // outlive every publisher.

        // The scanner is one-shot and may have exited on its own, so its shutdown send may fail.
        let _ = self.scanner_shutdown.send(());
        self.scanner.take().unwrap().join().unwrap();

        self.listener_shutdown.send(()).unwrap();
        self.listener.take().unwrap().join().unwrap();

        self.poller_shutdown.send(()).unwrap();
        self.poller.take().unwrap().join().unwrap();

        self.event_bus_shutdown.iter().for_each(|shutdown| shutdown.send(()).unwrap());
        if self.event_bus.is_some() {
            self.event_bus.take().unwrap().join().unwrap();
        }
    }
}
