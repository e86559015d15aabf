//! Definitions of indexer events for event handling and logging.
//! Note: an event for a given action indicates that the action has been completed.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::protocol::Command;
use crate::types::{Block, BlockHeight, CryptoHash};

pub enum Event {
    // Events that change persistent state.
    InsertBlock(InsertBlockEvent),
    // Events that drive the replay engine.
    PendingBlock(PendingBlockEvent),
    ReplayBlock(ReplayBlockEvent),
    ApplyCommand(ApplyCommandEvent),
    EngineReady(EngineReadyEvent),
    // Backfill progress events.
    StartBackfill(StartBackfillEvent),
    EndBackfill(EndBackfillEvent),
    // Chain events observed through the poller.
    ConsensusLost(ConsensusLostEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            event_publisher.send(event).unwrap()
        }
    }
}

pub struct InsertBlockEvent {
    pub timestamp: SystemTime,
    pub block: Block,
}

pub struct PendingBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
}

pub struct ReplayBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
    pub height: BlockHeight,
    pub commands: usize,
}

pub struct ApplyCommandEvent {
    pub timestamp: SystemTime,
    pub command: Command,
}

pub struct EngineReadyEvent {
    pub timestamp: SystemTime,
    pub blocks: usize,
}

pub struct StartBackfillEvent {
    pub timestamp: SystemTime,
    pub start_height: BlockHeight,
    pub target_height: BlockHeight,
}

pub struct EndBackfillEvent {
    pub timestamp: SystemTime,
    pub blocks_stored: usize,
}

pub struct ConsensusLostEvent {
    pub timestamp: SystemTime,
}
