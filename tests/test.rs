/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The test suite exercises the indexing pipeline against a mock [chain](MockChain) and a mock
//! [MemDB](key-value store). These use channels to simulate the chain node's notifications and a
//! hashmap to simulate persistence, and thus never leave any artifacts.
//!
//! The properties covered:
//! 1. [relevance_filter_test]: which blocks pass the coarse filter.
//! 2. [idempotent_storage_test]: storing the same block twice produces exactly one record.
//! 3. [replay_ordering_test]: backfill replay observes blocks in ascending height order regardless of
//!    insertion order.
//! 4. [pending_queue_test]: live pushes buffered while INITIALIZING are drained after the full
//!    historical replay, in FIFO order.
//! 5. [burn_accounting_test] and [idle_opcode_test]: the BURN handler's accounting and the
//!    no-op policy for everything else.
//! 6. [end_to_end_integration_test]: the full threaded indexer, backfill through live update. This
//!    should complete in a few seconds.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::thread;
use std::time::Duration;

use log::LevelFilter;

use opledger_rs::chain::{ChainAdapter, ChainError, ChainEvent};
use opledger_rs::engine::{EngineState, ReplayEngine};
use opledger_rs::events::Event;
use opledger_rs::indexer::{Configuration, IndexerSpec};
use opledger_rs::protocol::{is_relevant, Opcode, OpcodeTable, ProtocolParams};
use opledger_rs::store::{
    BorshBlockCodec, InsertOutcome, KVGet, KVStore, RelevantBlockStore, WriteBatch,
};
use opledger_rs::types::{Block, BlockHeight, Transaction, Value};

const OPCODE_PREFIX: &str = "TKP_";
const BURN_SUFFIX: &str = "01";
const BURN_ADDRESS: &str = "BC11 BURN 0000 0000 0000";
const DEFAULT_TOKEN: &str = "TOK";

#[test]
fn relevance_filter_test() {
    let table = opcode_table();

    // One transaction whose payload is exactly a registered opcode string.
    let relevant = Block::new(5, vec![burn_tx("A", 1)]);
    assert!(is_relevant(&relevant, &table));

    // Payloads are matched by prefix at the filter level.
    let mut tx = burn_tx("A", 1);
    tx.data.extend_from_slice(b" trailing");
    assert!(is_relevant(&Block::new(5, vec![tx]), &table));

    // All transactions in the basic format.
    let basic = Block::new(
        6,
        vec![
            Transaction::basic("A".into(), "B".into(), 100),
            Transaction::basic("B".into(), "C".into(), 50),
        ],
    );
    assert!(!is_relevant(&basic, &table));

    // Extended format but no registered opcode.
    let unmatched = Block::new(
        7,
        vec![Transaction::extended(
            "A".into(),
            "B".into(),
            1,
            b"hello world".to_vec(),
        )],
    );
    assert!(!is_relevant(&unmatched, &table));

    // Non-ASCII payload.
    let non_ascii = Block::new(
        8,
        vec![Transaction::extended(
            "A".into(),
            "B".into(),
            1,
            vec![0xff, 0xfe, 0xfd],
        )],
    );
    assert!(!is_relevant(&non_ascii, &table));

    // A block with zero transactions is never relevant.
    let empty = Block::new(9, Vec::new());
    assert!(!is_relevant(&empty, &table));
}

#[test]
fn idempotent_storage_test() {
    let mut store = RelevantBlockStore::new(MemDB::new(), BorshBlockCodec);
    let block = Block::new(42, vec![burn_tx("A", 5)]);

    assert!(!store.contains(&block.hash));
    assert_eq!(store.insert(&block), InsertOutcome::Stored);
    assert_eq!(store.insert(&block), InsertOutcome::AlreadyStored);

    assert!(store.contains(&block.hash));
    assert_eq!(store.keys(), vec![block.hash]);

    let loaded = store.block(&block.hash).unwrap().unwrap();
    assert_eq!(loaded.height, 42);
    assert_eq!(loaded.hash, block.hash);
}

#[test]
fn replay_ordering_test() {
    setup_logger(LevelFilter::Debug);

    let db = MemDB::new();
    let mut store = RelevantBlockStore::new(db.clone(), BorshBlockCodec);

    // Insert out of chain order; replay must still observe ascending heights.
    for height in [3u64, 1, 2] {
        store.insert(&Block::new(height, vec![burn_tx("A", height)]));
    }

    let (event_publisher, events) = mpsc::channel();
    let mut engine = ReplayEngine::new(
        RelevantBlockStore::new(db, BorshBlockCodec),
        params(),
        Some(event_publisher),
    );
    engine.replay_backfill().unwrap();

    assert_eq!(replayed_heights(&events), vec![1, 2, 3]);
    assert_eq!(engine.state(), EngineState::Ready);

    // 1 + 2 + 3: the same total as replaying the pre-sorted sequence.
    assert_eq!(engine.ledger().balance(DEFAULT_TOKEN, &"A".into()), 6);
}

#[test]
fn pending_queue_test() {
    setup_logger(LevelFilter::Debug);

    let db = MemDB::new();
    let mut store = RelevantBlockStore::new(db.clone(), BorshBlockCodec);

    // Two historical blocks, then two live blocks that arrive before backfill replay begins.
    for height in [11u64, 10] {
        store.insert(&Block::new(height, vec![burn_tx("A", 1)]));
    }
    let live_1 = Block::new(12, vec![burn_tx("A", 1)]);
    let live_2 = Block::new(13, vec![burn_tx("A", 1)]);
    store.insert(&live_1);
    store.insert(&live_2);

    let (event_publisher, events) = mpsc::channel();
    let mut engine = ReplayEngine::new(
        RelevantBlockStore::new(db.clone(), BorshBlockCodec),
        params(),
        Some(event_publisher),
    );

    // While INITIALIZING, pushes buffer instead of replaying.
    engine.push(live_1.hash).unwrap();
    engine.push(live_2.hash).unwrap();
    assert_eq!(engine.state(), EngineState::Initializing);
    assert_eq!(replayed_heights(&events), Vec::<BlockHeight>::new());

    engine.replay_backfill().unwrap();

    // All historical blocks first (ascending), then the pending pushes in arrival order. The live
    // blocks are also part of the stored historical set here, so they replay twice; what matters is
    // that no pending push ever lands ahead of an unfinished historical replay.
    assert_eq!(replayed_heights(&events), vec![10, 11, 12, 13, 12, 13]);

    // Once READY, a push replays immediately.
    let live_3 = Block::new(14, vec![burn_tx("A", 1)]);
    store.insert(&live_3);
    engine.push(live_3.hash).unwrap();
    assert_eq!(replayed_heights(&events), vec![14]);
}

#[test]
fn burn_accounting_test() {
    let db = MemDB::new();
    let mut engine = ReplayEngine::new(
        RelevantBlockStore::new(db, BorshBlockCodec),
        params(),
        None,
    );

    // A burn of 7 from S credits S by exactly 7.
    engine
        .process_block(&Block::new(1, vec![burn_tx("S", 7)]))
        .unwrap();
    assert_eq!(engine.ledger().balance(DEFAULT_TOKEN, &"S".into()), 7);

    // The burn address comparison is whitespace-normalized.
    let spaced = Transaction::extended(
        "S".into(),
        "BC11BURN 00000000 0000".into(),
        4,
        burn_payload(),
    );
    engine.process_block(&Block::new(2, vec![spaced])).unwrap();
    assert_eq!(engine.ledger().balance(DEFAULT_TOKEN, &"S".into()), 11);

    // A burn-tagged payload sent to any other recipient produces nothing, silently.
    let misdirected = Transaction::extended("S".into(), "B".into(), 100, burn_payload());
    engine
        .process_block(&Block::new(3, vec![misdirected]))
        .unwrap();
    assert_eq!(engine.ledger().balance(DEFAULT_TOKEN, &"S".into()), 11);

    // The BURN handler requires the payload to equal the opcode string exactly.
    let mut trailing = burn_tx("S", 100);
    trailing.data.extend_from_slice(b"x");
    engine.process_block(&Block::new(4, vec![trailing])).unwrap();
    assert_eq!(engine.ledger().balance(DEFAULT_TOKEN, &"S".into()), 11);

    // Two burns from the same sender accumulate, including within one block.
    engine
        .process_block(&Block::new(5, vec![burn_tx("S", 20), burn_tx("S", 9)]))
        .unwrap();
    assert_eq!(engine.ledger().balance(DEFAULT_TOKEN, &"S".into()), 40);

    // Senders are credited independently.
    assert_eq!(engine.ledger().balance(DEFAULT_TOKEN, &"T".into()), 0);
}

#[test]
fn idle_opcode_test() {
    let db = MemDB::new();
    let mut engine = ReplayEngine::new(
        RelevantBlockStore::new(db, BorshBlockCodec),
        params(),
        None,
    );

    // A registered opcode with no implemented handler parses to no command.
    let memo = Transaction::extended(
        "S".into(),
        "B".into(),
        3,
        format!("{}08 a note", OPCODE_PREFIX).into_bytes(),
    );
    // An unregistered payload is skipped without error.
    let unknown = Transaction::extended("S".into(), "B".into(), 3, b"TKQ_99".to_vec());

    engine
        .process_block(&Block::new(1, vec![memo, unknown]))
        .unwrap();
    assert_eq!(engine.ledger().accounts(DEFAULT_TOKEN), 0);
}

#[test]
fn end_to_end_integration_test() {
    setup_logger(LevelFilter::Debug);

    // Chain with blocks 100 through 103; only block 102 carries a burn (value 7, sender "A").
    let (chain, chain_events) = MockChain::new(
        (100..=103)
            .map(|height| match height {
                102 => Block::new(height, vec![burn_tx("A", 7)]),
                _ => Block::new(height, vec![Transaction::basic("X".into(), "Y".into(), 1)]),
            })
            .collect(),
    );

    let db = MemDB::new();
    let indexer = IndexerSpec::builder()
        .chain(chain.clone())
        .kv_store(db.clone())
        .codec(BorshBlockCodec)
        .configuration(
            Configuration::builder()
                .start_height(100)
                .opcode_table(opcode_table())
                .burn_address(BURN_ADDRESS.into())
                .default_token(DEFAULT_TOKEN.to_string())
                .log_events(true)
                .build(),
        )
        .build()
        .start();

    chain_events
        .send(ChainEvent::ConsensusEstablished { height: 103 })
        .unwrap();

    // Poll until backfill replay completes.
    log::debug!("Polling until the engine is READY and A's balance is 7.");
    while indexer.engine_state() != EngineState::Ready
        || indexer.ledger().balance(DEFAULT_TOKEN, &"A".into()) != 7
    {
        thread::sleep(Duration::from_millis(50));
    }

    // Exactly one relevant block (height 102) was stored.
    let store = RelevantBlockStore::new(db.clone(), BorshBlockCodec);
    assert_eq!(store.keys().len(), 1);

    // A live head at 104 with a burn of 3 from "A".
    let head = Block::new(104, vec![burn_tx("A", 3)]);
    chain.add_block(head.clone());
    chain_events.send(ChainEvent::HeadChanged(head)).unwrap();

    log::debug!("Polling until A's balance is 10.");
    while indexer.ledger().balance(DEFAULT_TOKEN, &"A".into()) != 10 {
        thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(store.keys().len(), 2);

    // An irrelevant head leaves both the store and the ledger alone.
    let quiet = Block::new(105, vec![Transaction::basic("X".into(), "Y".into(), 2)]);
    chain.add_block(quiet.clone());
    chain_events.send(ChainEvent::HeadChanged(quiet)).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(store.keys().len(), 2);
    assert_eq!(indexer.ledger().balance(DEFAULT_TOKEN, &"A".into()), 10);

    drop(indexer);
}

fn opcode_table() -> OpcodeTable {
    OpcodeTable::new(OPCODE_PREFIX)
        .register(BURN_SUFFIX, Opcode::Burn)
        .register("02", Opcode::AssetIssue)
        .register("03", Opcode::AssetTransfer)
        .register("04", Opcode::AssetDestroy)
        .register("05", Opcode::OrderPlace)
        .register("06", Opcode::OrderCancel)
        .register("07", Opcode::Lock)
        .register("08", Opcode::Memo)
        .register("09", Opcode::Broadcast)
        .register("10", Opcode::Bet)
        .register("11", Opcode::Dividend)
}

fn params() -> ProtocolParams {
    ProtocolParams {
        opcode_table: opcode_table(),
        burn_address: BURN_ADDRESS.into(),
        default_token: DEFAULT_TOKEN.to_string(),
    }
}

fn burn_payload() -> Vec<u8> {
    format!("{}{}", OPCODE_PREFIX, BURN_SUFFIX).into_bytes()
}

fn burn_tx(sender: &str, value: Value) -> Transaction {
    Transaction::extended(sender.into(), BURN_ADDRESS.into(), value, burn_payload())
}

/// Drain every event published so far and return the heights of the replayed blocks, in order.
fn replayed_heights(events: &Receiver<Event>) -> Vec<BlockHeight> {
    let mut heights = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::ReplayBlock(replay_block_event) = event {
            heights.push(replay_block_event.height);
        }
    }
    heights
}

static LOGGER_INIT: Once = Once::new();

// Set up a logger that logs all log messages with level Trace and above.
fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    message
                ))
            })
            .level(level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}

/// A mock chain node which serves blocks from a shared map and notifications from a channel.
#[derive(Clone)]
struct MockChain {
    blocks: Arc<Mutex<BTreeMap<BlockHeight, Block>>>,
    events: Arc<Mutex<Receiver<ChainEvent>>>,
}

impl MockChain {
    fn new(blocks: Vec<Block>) -> (MockChain, Sender<ChainEvent>) {
        let (event_sender, event_receiver) = mpsc::channel();
        let chain = MockChain {
            blocks: Arc::new(Mutex::new(
                blocks.into_iter().map(|block| (block.height, block)).collect(),
            )),
            events: Arc::new(Mutex::new(event_receiver)),
        };
        (chain, event_sender)
    }

    fn add_block(&self, block: Block) {
        self.blocks.lock().unwrap().insert(block.height, block);
    }
}

impl ChainAdapter for MockChain {
    fn block_at_height(&mut self, height: BlockHeight) -> Result<Option<Block>, ChainError> {
        Ok(self.blocks.lock().unwrap().get(&height).cloned())
    }

    fn poll_event(&mut self) -> Option<ChainEvent> {
        match self.events.lock().unwrap().try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// A simple, volatile, in-memory implementation of [KVStore].
#[derive(Clone)]
struct MemDB(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemDB {
    fn new() -> MemDB {
        MemDB(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl KVStore for MemDB {
    type WriteBatch = MemWriteBatch;
    type Snapshot<'a> = MemDBSnapshot<'a>;

    fn write(&mut self, wb: Self::WriteBatch) {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.insertions {
            map.insert(key, value);
        }
        for key in wb.deletions {
            map.remove(&key);
        }
    }

    fn clear(&mut self) {
        self.0.lock().unwrap().clear();
    }

    fn snapshot<'b>(&'b self) -> MemDBSnapshot<'b> {
        MemDBSnapshot(self.0.lock().unwrap())
    }
}

impl KVGet for MemDB {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

/// A simple implementation of [WriteBatch].
struct MemWriteBatch {
    insertions: HashMap<Vec<u8>, Vec<u8>>,
    deletions: HashSet<Vec<u8>>,
}

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch {
            insertions: HashMap::new(),
            deletions: HashSet::new(),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        let _ = self.deletions.remove(key);
        self.insertions.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        let _ = self.insertions.remove(key);
        self.deletions.insert(key.to_vec());
    }
}

/// A simple implementation of [KVGet] used as `KVStore::Snapshot` for [MemDB].
struct MemDBSnapshot<'a>(MutexGuard<'a, HashMap<Vec<u8>, Vec<u8>>>);

impl KVGet for MemDBSnapshot<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.get(key).cloned()
    }
}
