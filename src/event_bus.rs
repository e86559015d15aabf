use std::sync::mpsc::Receiver;
use std::sync::mpsc::TryRecvError;
use std::thread;
use std::thread::JoinHandle;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) insert_block_handlers: Vec<HandlerPtr<InsertBlockEvent>>,
    pub(crate) pending_block_handlers: Vec<HandlerPtr<PendingBlockEvent>>,
    pub(crate) replay_block_handlers: Vec<HandlerPtr<ReplayBlockEvent>>,
    pub(crate) apply_command_handlers: Vec<HandlerPtr<ApplyCommandEvent>>,
    pub(crate) engine_ready_handlers: Vec<HandlerPtr<EngineReadyEvent>>,
    pub(crate) start_backfill_handlers: Vec<HandlerPtr<StartBackfillEvent>>,
    pub(crate) end_backfill_handlers: Vec<HandlerPtr<EndBackfillEvent>>,
    pub(crate) consensus_lost_handlers: Vec<HandlerPtr<ConsensusLostEvent>>,
}

impl EventHandlers {
    pub(crate) fn new(
        log_events: bool,
        on_insert_block: Option<HandlerPtr<InsertBlockEvent>>,
        on_pending_block: Option<HandlerPtr<PendingBlockEvent>>,
        on_replay_block: Option<HandlerPtr<ReplayBlockEvent>>,
        on_apply_command: Option<HandlerPtr<ApplyCommandEvent>>,
        on_engine_ready: Option<HandlerPtr<EngineReadyEvent>>,
        on_start_backfill: Option<HandlerPtr<StartBackfillEvent>>,
        on_end_backfill: Option<HandlerPtr<EndBackfillEvent>>,
        on_consensus_lost: Option<HandlerPtr<ConsensusLostEvent>>,
    ) -> EventHandlers {
        let mut handlers = EventHandlers {
            insert_block_handlers: on_insert_block.into_iter().collect(),
            pending_block_handlers: on_pending_block.into_iter().collect(),
            replay_block_handlers: on_replay_block.into_iter().collect(),
            apply_command_handlers: on_apply_command.into_iter().collect(),
            engine_ready_handlers: on_engine_ready.into_iter().collect(),
            start_backfill_handlers: on_start_backfill.into_iter().collect(),
            end_backfill_handlers: on_end_backfill.into_iter().collect(),
            consensus_lost_handlers: on_consensus_lost.into_iter().collect(),
        };

        if log_events {
            handlers.insert_block_handlers.push(InsertBlockEvent::get_logger());
            handlers.pending_block_handlers.push(PendingBlockEvent::get_logger());
            handlers.replay_block_handlers.push(ReplayBlockEvent::get_logger());
            handlers.apply_command_handlers.push(ApplyCommandEvent::get_logger());
            handlers.engine_ready_handlers.push(EngineReadyEvent::get_logger());
            handlers.start_backfill_handlers.push(StartBackfillEvent::get_logger());
            handlers.end_backfill_handlers.push(EndBackfillEvent::get_logger());
            handlers.consensus_lost_handlers.push(ConsensusLostEvent::get_logger());
        }

        handlers
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.insert_block_handlers.is_empty()
            && self.pending_block_handlers.is_empty()
            && self.replay_block_handlers.is_empty()
            && self.apply_command_handlers.is_empty()
            && self.engine_ready_handlers.is_empty()
            && self.start_backfill_handlers.is_empty()
            && self.end_backfill_handlers.is_empty()
            && self.consensus_lost_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::InsertBlock(insert_block_event) => self
                .insert_block_handlers
                .iter()
                .for_each(|handler| handler(&insert_block_event)),

            Event::PendingBlock(pending_block_event) => self
                .pending_block_handlers
                .iter()
                .for_each(|handler| handler(&pending_block_event)),

            Event::ReplayBlock(replay_block_event) => self
                .replay_block_handlers
                .iter()
                .for_each(|handler| handler(&replay_block_event)),

            Event::ApplyCommand(apply_command_event) => self
                .apply_command_handlers
                .iter()
                .for_each(|handler| handler(&apply_command_event)),

            Event::EngineReady(engine_ready_event) => self
                .engine_ready_handlers
                .iter()
                .for_each(|handler| handler(&engine_ready_event)),

            Event::StartBackfill(start_backfill_event) => self
                .start_backfill_handlers
                .iter()
                .for_each(|handler| handler(&start_backfill_event)),

            Event::EndBackfill(end_backfill_event) => self
                .end_backfill_handlers
                .iter()
                .for_each(|handler| handler(&end_backfill_event)),

            Event::ConsensusLost(consensus_lost_event) => self
                .consensus_lost_handlers
                .iter()
                .for_each(|handler| handler(&consensus_lost_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => {
                panic!("The event publishers were disconnected from the channel")
            }
        }
    })
}
