//! The opening engine: threshold reconstruction of public values from
//! private shares. Each id opens a whole batch at once; all slots use the
//! same contributor set and reconstruct independently.

use crate::crypto::{join, Share};
use crate::message::{Message, MessageID, OpenRequest, OpenResult, PartyID, Rpc};
use crate::task::{self, TaskHandle};

use crate::algebra::Fq;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};

/// Spawn the engine as a task.
pub fn spawn(index: PartyID, parties: u64, threshold: u64, capacity: usize) -> TaskHandle {
    let mut engine = Open::new(index, parties, threshold);
    task::spawn("open", capacity, Box::new(move |m| engine.reduce(m)), Vec::new())
}

#[derive(Default)]
struct OpenState {
    batch: Option<usize>,
    broadcasts: BTreeMap<PartyID, Vec<Share>>,
}

/// Per-party OPEN engine. Finished batches are cached: a duplicate request
/// answers immediately and nothing is rebroadcast.
pub struct Open {
    index: PartyID,
    parties: u64,
    threshold: u64,
    states: HashMap<MessageID, OpenState>,
    results: HashMap<MessageID, Vec<Fq>>,
}

impl Open {
    pub fn new(index: PartyID, parties: u64, threshold: u64) -> Open {
        Open {
            index,
            parties,
            threshold,
            states: HashMap::new(),
            results: HashMap::new(),
        }
    }

    pub fn reduce(&mut self, msg: Message) -> Option<Message> {
        let out = match msg {
            Message::OpenRequest(req) => self.handle_request(req),
            Message::Rpc(Rpc::BroadcastShares { id, from, shares }) => {
                self.accept_broadcast(id, from, shares)
            }
            other => {
                warn!("[open:{}] ignoring {:?}", self.index, other);
                Vec::new()
            }
        };
        if out.is_empty() {
            None
        } else {
            Some(Message::Batch(out))
        }
    }

    fn handle_request(&mut self, req: OpenRequest) -> Vec<Message> {
        if let Some(values) = self.results.get(&req.id) {
            debug!("[open:{}] duplicate request {:?}, cached", self.index, req.id);
            return vec![Message::OpenResult(OpenResult {
                id: req.id,
                values: values.clone(),
            })];
        }
        {
            let state = self.states.entry(req.id).or_default();
            if state.batch.is_some() {
                debug!("[open:{}] duplicate request {:?} while pending", self.index, req.id);
                return Vec::new();
            }
            state.batch = Some(req.shares.len());
        }

        let mut out = vec![Message::Rpc(Rpc::BroadcastShares {
            id: req.id,
            from: self.index,
            shares: req.shares.clone(),
        })];
        out.extend(self.accept_broadcast(req.id, self.index, req.shares));
        out
    }

    fn accept_broadcast(&mut self, id: MessageID, from: PartyID, shares: Vec<Share>) -> Vec<Message> {
        if self.results.contains_key(&id) {
            return Vec::new();
        }
        if from == 0 || from > self.parties || shares.iter().any(|s| s.index != from) {
            warn!("[open:{}] dropping mislabeled broadcast from {}", self.index, from);
            return Vec::new();
        }
        {
            let state = self.states.entry(id).or_default();
            if state.broadcasts.contains_key(&from) {
                debug!("[open:{}] duplicate broadcast from {}", self.index, from);
                return Vec::new();
            }
            state.broadcasts.insert(from, shares);
        }
        self.try_finish(id)
    }

    /// Reconstruct once the local request has arrived and enough
    /// distinct-index contributions are in.
    fn try_finish(&mut self, id: MessageID) -> Vec<Message> {
        let needed = self.threshold as usize;
        let index = self.index;

        let state = match self.states.get_mut(&id) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let batch = match state.batch {
            Some(b) => b,
            None => return Vec::new(),
        };
        let usable: Vec<&Vec<Share>> = state
            .broadcasts
            .values()
            .filter(|b| b.len() == batch)
            .collect();
        if usable.len() < needed {
            return Vec::new();
        }

        let mut values = Vec::with_capacity(batch);
        for j in 0..batch {
            let slot: Vec<Share> = usable.iter().map(|b| b[j].clone()).collect();
            match join(&slot, needed) {
                Ok(v) => values.push(v),
                Err(e) => {
                    warn!("[open:{}] reconstruction failed for {:?}: {}", index, id, e);
                    return Vec::new();
                }
            }
        }

        self.results.insert(id, values.clone());
        self.states.remove(&id);
        debug!("[open:{}] done with {:?}", index, id);
        vec![Message::OpenResult(OpenResult { id, values })]
    }
}
