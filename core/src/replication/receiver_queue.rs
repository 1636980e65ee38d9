//! # Receiver Queue
//!
//! Requests received from a remote peer, waiting to be served.
//!
//! Two lanes feed [`shift`](ReceiverQueue::shift): a priority lane served
//! newest-first, then the regular FIFO lane. Requests with a non-zero id are
//! indexed so the peer can cancel them in O(1); id 0 means the peer never
//! expects to cancel and those requests are not indexed.
//!
//! A request whose demand fields (`block`, `hash`, `seek`, `upgrade`) have
//! all been cleared no longer asks for anything. `shift` drops such requests
//! silently instead of handing them out.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// A block or tree-hash request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBlock {
    pub index: u64,
    /// Number of proof nodes the peer already has.
    pub nodes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSeek {
    pub bytes: u64,
    pub padding: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUpgrade {
    pub start: u64,
    pub length: u64,
}

/// One request as it arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WireRequest {
    /// Peer-chosen id. 0 is not cancellable.
    pub id: u64,
    pub fork: u64,
    /// Anything above 0 goes in the priority lane.
    pub priority: u32,
    pub block: Option<RequestBlock>,
    pub hash: Option<RequestBlock>,
    pub seek: Option<RequestSeek>,
    pub upgrade: Option<RequestUpgrade>,
}

impl WireRequest {
    /// Whether the request still asks for anything.
    pub fn has_demand(&self) -> bool {
        self.block.is_some() || self.hash.is_some() || self.seek.is_some() || self.upgrade.is_some()
    }
}

/// FIFO of incoming requests, cancellable by id.
#[derive(Debug, Default)]
pub struct ReceiverQueue {
    /// Live requests keyed by arrival sequence.
    requests: HashMap<u64, WireRequest>,
    /// Request id to arrival sequence.
    by_id: HashMap<u64, u64>,
    fifo: VecDeque<u64>,
    priority: Vec<u64>,
    next_seq: u64,
}

impl ReceiverQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a request. A second request with the same non-zero id replaces
    /// the first.
    pub fn push(&mut self, request: WireRequest) {
        let seq = self.next_seq;
        self.next_seq += 1;

        if request.id != 0 {
            if let Some(old) = self.by_id.insert(request.id, seq) {
                self.requests.remove(&old);
            }
        }
        if request.priority > 0 {
            self.priority.push(seq);
        } else {
            self.fifo.push_back(seq);
        }
        self.requests.insert(seq, request);
    }

    /// Next request that still asks for something, or `None` when the queue
    /// is drained.
    pub fn shift(&mut self) -> Option<WireRequest> {
        loop {
            let seq = match self.priority.pop() {
                Some(seq) => seq,
                None => self.fifo.pop_front()?,
            };
            // Cancelled entries leave their sequence behind.
            let Some(request) = self.requests.remove(&seq) else {
                continue;
            };
            if request.id != 0 {
                self.by_id.remove(&request.id);
            }
            if request.has_demand() {
                return Some(request);
            }
        }
    }

    /// Cancels the request with this id.
    pub fn delete(&mut self, id: u64) -> Option<WireRequest> {
        if id == 0 {
            return None;
        }
        let seq = self.by_id.remove(&id)?;
        self.requests.remove(&seq)
    }

    /// Queued request with this id, for clearing individual demand fields.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut WireRequest> {
        if id == 0 {
            return None;
        }
        let seq = self.by_id.get(&id)?;
        self.requests.get_mut(seq)
    }

    /// Number of queued requests, including ones whose demand was cleared
    /// but which have not been shifted out yet.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
        self.by_id.clear();
        self.fifo.clear();
        self.priority.clear();
    }
}
