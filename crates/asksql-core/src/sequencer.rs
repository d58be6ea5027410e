//! Per-conversation arrival ordering.
//!
//! Each request takes a [`Ticket`] when it arrives. Before persisting it waits
//! until every earlier ticket for the same conversation has finished, so turn
//! pairs land in arrival order while different conversations never wait on
//! each other. Dropping a ticket finishes it, whether or not it persisted.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

type Lanes = Arc<Mutex<HashMap<Uuid, Arc<Lane>>>>;

#[derive(Clone, Default)]
pub struct Sequencer {
    lanes: Lanes,
}

struct Lane {
    state: Mutex<LaneState>,
    serving: watch::Sender<u64>,
}

#[derive(Default)]
struct LaneState {
    next: u64,
    serving: u64,
    finished: BTreeSet<u64>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next ticket for `conversation`.
    pub fn ticket(&self, conversation: Uuid) -> Ticket {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let lane = Arc::clone(lanes.entry(conversation).or_insert_with(|| {
            Arc::new(Lane {
                state: Mutex::new(LaneState::default()),
                serving: watch::Sender::new(0),
            })
        }));
        let number = {
            let mut state = lane.state.lock().unwrap_or_else(PoisonError::into_inner);
            let n = state.next;
            state.next += 1;
            n
        };
        Ticket {
            conversation,
            number,
            lane,
            lanes: Arc::clone(&self.lanes),
        }
    }

    /// Conversations with outstanding tickets.
    pub fn active(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A place in one conversation's arrival order.
pub struct Ticket {
    conversation: Uuid,
    number: u64,
    lane: Arc<Lane>,
    lanes: Lanes,
}

impl Ticket {
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Wait until every earlier ticket of this conversation has finished.
    pub async fn wait_turn(&self) {
        let mut rx = self.lane.serving.subscribe();
        // The sender lives in `self.lane`, so the channel cannot close here.
        let _ = rx.wait_for(|serving| *serving >= self.number).await;
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard = self.lane.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;

        state.finished.insert(self.number);
        while state.finished.remove(&state.serving) {
            state.serving += 1;
        }
        self.lane.serving.send_replace(state.serving);

        if state.serving == state.next {
            lanes.remove(&self.conversation);
        }
    }
}
