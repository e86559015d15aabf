/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the indexer's
//! [config](crate::indexer::Configuration).
//!
//! Logging goes through the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. Block hashes are abbreviated to the
//! first seven characters of their Base64 encoding; addresses are printed in normalized form.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

use crate::events::*;
use crate::protocol::Command;

// Names of each event in PascalCase for printing:
pub const INSERT_BLOCK: &str = "InsertBlock";
pub const PENDING_BLOCK: &str = "PendingBlock";
pub const REPLAY_BLOCK: &str = "ReplayBlock";
pub const APPLY_COMMAND: &str = "ApplyCommand";
pub const ENGINE_READY: &str = "EngineReady";

pub const START_BACKFILL: &str = "StartBackfill";
pub const END_BACKFILL: &str = "EndBackfill";

pub const CONSENSUS_LOST: &str = "ConsensusLost";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for InsertBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |insert_block_event: &InsertBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                INSERT_BLOCK,
                secs_since_unix_epoch(insert_block_event.timestamp),
                first_seven_base64_chars(&insert_block_event.block.hash),
                insert_block_event.block.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for PendingBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |pending_block_event: &PendingBlockEvent| {
            log::info!(
                "{}, {}, {}",
                PENDING_BLOCK,
                secs_since_unix_epoch(pending_block_event.timestamp),
                first_seven_base64_chars(&pending_block_event.block)
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReplayBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |replay_block_event: &ReplayBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REPLAY_BLOCK,
                secs_since_unix_epoch(replay_block_event.timestamp),
                first_seven_base64_chars(&replay_block_event.block),
                replay_block_event.height,
                replay_block_event.commands
            )
        };
        Box::new(logger)
    }
}

impl Logger for ApplyCommandEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |apply_command_event: &ApplyCommandEvent| {
            log::info!(
                "{}, {}, {}",
                APPLY_COMMAND,
                secs_since_unix_epoch(apply_command_event.timestamp),
                command_info(&apply_command_event.command)
            )
        };
        Box::new(logger)
    }
}

impl Logger for EngineReadyEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |engine_ready_event: &EngineReadyEvent| {
            log::info!(
                "{}, {}, {}",
                ENGINE_READY,
                secs_since_unix_epoch(engine_ready_event.timestamp),
                engine_ready_event.blocks
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartBackfillEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_backfill_event: &StartBackfillEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_BACKFILL,
                secs_since_unix_epoch(start_backfill_event.timestamp),
                start_backfill_event.start_height,
                start_backfill_event.target_height
            )
        };
        Box::new(logger)
    }
}

impl Logger for EndBackfillEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |end_backfill_event: &EndBackfillEvent| {
            log::info!(
                "{}, {}, {}",
                END_BACKFILL,
                secs_since_unix_epoch(end_backfill_event.timestamp),
                end_backfill_event.blocks_stored
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConsensusLostEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |consensus_lost_event: &ConsensusLostEvent| {
            log::info!(
                "{}, {}",
                CONSENSUS_LOST,
                secs_since_unix_epoch(consensus_lost_event.timestamp)
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}

fn command_info(command: &Command) -> String {
    match command {
        Command::Burn { sender, value, .. } => {
            format!("Burn, {}, {}", sender.normalized(), value)
        }
    }
}
