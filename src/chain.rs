/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](ChainAdapter) for the pluggable chain node connection, as well as the internal
//! poller that indexer threads use to consume its notifications.
//!
//! The indexer does not speak to peers, validate blocks, or establish consensus; all of that lives in
//! the chain node the library user connects to. Chain node providers interact with the indexer's
//! threads through implementations of the [ChainAdapter] trait: one method to fetch a block by height,
//! and one to surface the node's notifications as [chain events](ChainEvent).

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use crate::events::{ConsensusLostEvent, Event};
use crate::types::{Block, BlockHeight};

pub trait ChainAdapter: Clone + Send + 'static {
    /// Fetch the block at `height` on the canonical chain, with its transactions. Returns `Ok(None)`
    /// if the chain has no block at that height.
    fn block_at_height(&mut self, height: BlockHeight) -> Result<Option<Block>, ChainError>;

    /// Receive the next notification from the chain node. Returns immediately with a None if no
    /// notification is available now.
    fn poll_event(&mut self) -> Option<ChainEvent>;
}

/// Notifications a chain node delivers to the indexer.
pub enum ChainEvent {
    /// The node established consensus; `height` is the canonical chain height at that moment.
    ConsensusEstablished { height: BlockHeight },
    ConsensusLost,
    /// The canonical chain gained a new head block.
    HeadChanged(Block),
}

/// The chain node could not serve a request. Fatal to the backfill pass that hit it: the chain
/// accessor's own retry policy, if any, sits behind the [ChainAdapter] implementation.
#[derive(Clone, Debug)]
pub struct ChainError(pub String);

/// Spawn the poller thread, which polls the chain adapter for events and distributes them into
/// receivers for the consensus-established signal and for new head blocks.
///
/// Head blocks are only forwarded while the node reports consensus established; while consensus is
/// lost they are dropped, and the loss itself is logged and published.
pub(crate) fn start_polling<N: ChainAdapter>(
    mut chain: N,
    event_publisher: Option<mpsc::Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, Receiver<BlockHeight>, Receiver<Block>) {
    let (to_consensus_receiver, consensus_receiver) = mpsc::channel();
    let (to_head_receiver, head_receiver) = mpsc::channel();

    let poller_thread = thread::spawn(move || {
        let mut established = false;
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Poller thread disconnected from main thread")
                }
            }

            if let Some(event) = chain.poll_event() {
                match event {
                    ChainEvent::ConsensusEstablished { height } => {
                        established = true;
                        let _ = to_consensus_receiver.send(height);
                    }
                    ChainEvent::ConsensusLost => {
                        established = false;
                        log::info!("ConsensusLost");
                        Event::publish(
                            &event_publisher,
                            Event::ConsensusLost(ConsensusLostEvent {
                                timestamp: SystemTime::now(),
                            }),
                        );
                    }
                    ChainEvent::HeadChanged(head) => {
                        if established {
                            let _ = to_head_receiver.send(head);
                        }
                    }
                }
            } else {
                thread::yield_now()
            }
        }
    });

    (poller_thread, consensus_receiver, head_receiver)
}
