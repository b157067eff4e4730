//! The distributed multiplication engine. Each party masks its local
//! product with the high-degree half of a random tuple, the masked shares
//! are pooled to open the masked product, and subtracting the low-degree
//! half brings the result back to the working degree.

use crate::crypto::{join, multiplicative_degree, Share};
use crate::message::{Message, MessageID, MulRequest, MulResult, PartyID, Rpc};
use crate::task::{self, TaskHandle};

use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};

/// Spawn the engine as a task.
pub fn spawn(index: PartyID, parties: u64, threshold: u64, capacity: usize) -> TaskHandle {
    let mut engine = Mul::new(index, parties, threshold);
    task::spawn("mul", capacity, Box::new(move |m| engine.reduce(m)), Vec::new())
}

#[derive(Default)]
struct MulState {
    /// The sigma shares of the consumed tuple, kept until the masked
    /// product opens.
    sigma: Option<Vec<Share>>,
    broadcasts: BTreeMap<PartyID, Vec<Share>>,
}

/// Per-party MUL engine: one state per in-flight id and a cache of
/// finished results, so a duplicate signal short-circuits deterministically.
pub struct Mul {
    index: PartyID,
    parties: u64,
    threshold: u64,
    states: HashMap<MessageID, MulState>,
    results: HashMap<MessageID, Vec<Share>>,
}

impl Mul {
    pub fn new(index: PartyID, parties: u64, threshold: u64) -> Mul {
        Mul {
            index,
            parties,
            threshold,
            states: HashMap::new(),
            results: HashMap::new(),
        }
    }

    /// Shares needed to open the degree-2d masked product.
    fn open_threshold(&self) -> usize {
        2 * multiplicative_degree(self.threshold) + 1
    }

    pub fn reduce(&mut self, msg: Message) -> Option<Message> {
        let out = match msg {
            Message::MulRequest(req) => self.handle_request(req),
            Message::Rpc(Rpc::BroadcastMulShares { id, from, shares }) => {
                self.accept_broadcast(id, from, shares)
            }
            other => {
                warn!("[mul:{}] ignoring {:?}", self.index, other);
                Vec::new()
            }
        };
        if out.is_empty() {
            None
        } else {
            Some(Message::Batch(out))
        }
    }

    fn handle_request(&mut self, req: MulRequest) -> Vec<Message> {
        if let Some(shares) = self.results.get(&req.id) {
            debug!("[mul:{}] duplicate signal {:?}, cached", self.index, req.id);
            return vec![Message::MulResult(MulResult {
                id: req.id,
                shares: shares.clone(),
            })];
        }

        let batch = req.x.len();
        if req.y.len() != batch || req.rho.len() != batch || req.sigma.len() != batch {
            warn!("[mul:{}] ragged batch in signal {:?}", self.index, req.id);
            return Vec::new();
        }

        {
            let state = self.states.entry(req.id).or_default();
            if state.sigma.is_some() {
                debug!("[mul:{}] duplicate signal {:?} while pending", self.index, req.id);
                return Vec::new();
            }
            state.sigma = Some(req.sigma);
        }

        // z = x*y + rho, a share of the masked product at degree 2d
        let masked: Vec<Share> = req
            .x
            .iter()
            .zip(&req.y)
            .zip(&req.rho)
            .map(|((x, y), rho)| {
                Share::new(self.index, &x.value * &y.value + &rho.value)
            })
            .collect();

        let mut out = vec![Message::Rpc(Rpc::BroadcastMulShares {
            id: req.id,
            from: self.index,
            shares: masked.clone(),
        })];
        out.extend(self.accept_broadcast(req.id, self.index, masked));
        out
    }

    fn accept_broadcast(&mut self, id: MessageID, from: PartyID, shares: Vec<Share>) -> Vec<Message> {
        if self.results.contains_key(&id) {
            return Vec::new();
        }
        if from == 0 || from > self.parties || shares.iter().any(|s| s.index != from) {
            warn!("[mul:{}] dropping mislabeled broadcast from {}", self.index, from);
            return Vec::new();
        }
        {
            let state = self.states.entry(id).or_default();
            if state.broadcasts.contains_key(&from) {
                debug!("[mul:{}] duplicate broadcast from {}", self.index, from);
                return Vec::new();
            }
            state.broadcasts.insert(from, shares);
        }
        self.try_finish(id)
    }

    fn try_finish(&mut self, id: MessageID) -> Vec<Message> {
        let needed = self.open_threshold();
        let index = self.index;

        let state = match self.states.get_mut(&id) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let sigma = match &state.sigma {
            Some(s) => s,
            None => return Vec::new(),
        };
        let batch = sigma.len();
        let usable: Vec<&Vec<Share>> = state
            .broadcasts
            .values()
            .filter(|b| b.len() == batch)
            .collect();
        if usable.len() < needed {
            return Vec::new();
        }

        // one reconstruction per batch slot over the same contributor set
        let mut result = Vec::with_capacity(batch);
        for (j, sigma_j) in sigma.iter().enumerate() {
            let slot: Vec<Share> = usable.iter().map(|b| b[j].clone()).collect();
            let masked = match join(&slot, needed) {
                Ok(v) => v,
                Err(e) => {
                    warn!("[mul:{}] reconstruction failed for {:?}: {}", index, id, e);
                    return Vec::new();
                }
            };
            result.push(Share::new(index, masked - &sigma_j.value));
        }

        self.results.insert(id, result.clone());
        self.states.remove(&id);
        debug!("[mul:{}] done with {:?}", index, id);
        vec![Message::MulResult(MulResult { id, shares: result })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{Fq, Polynomial};
    use crate::crypto::split;

    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::collections::VecDeque;

    const TEST_SEED: [u8; 32] = [8u8; 32];

    fn flatten(m: Message, out: &mut Vec<Message>) {
        match m {
            Message::Batch(msgs) => {
                for m in msgs {
                    flatten(m, out);
                }
            }
            m => out.push(m),
        }
    }

    fn run_network(
        engines: &mut Vec<Mul>,
        initial: Vec<(usize, Message)>,
    ) -> HashMap<PartyID, MulResult> {
        let mut pending: VecDeque<(usize, Message)> = initial.into_iter().collect();
        let mut results = HashMap::new();
        while let Some((i, msg)) = pending.pop_front() {
            let from = engines[i].index;
            let out = match engines[i].reduce(msg) {
                Some(m) => m,
                None => continue,
            };
            let mut flat = Vec::new();
            flatten(out, &mut flat);
            for m in flat {
                match m {
                    Message::Rpc(rpc) => {
                        for j in 0..engines.len() {
                            if j != i {
                                pending.push_back((j, Message::Rpc(rpc.clone())));
                            }
                        }
                    }
                    Message::MulResult(res) => {
                        results.insert(from, res);
                    }
                    other => panic!("unexpected engine output {:?}", other),
                }
            }
        }
        results
    }

    /// Degree-d sharings of x, y and a fresh (rho, sigma) tuple, plus the
    /// per-party signals.
    fn signals(
        n: u64,
        k: u64,
        x: u64,
        y: u64,
        id: MessageID,
        rng: &mut ChaCha20Rng,
    ) -> Vec<(usize, Message)> {
        let d = multiplicative_degree(k);
        let xs = split(&Polynomial::random(d, Fq::from(x), rng), n);
        let ys = split(&Polynomial::random(d, Fq::from(y), rng), n);
        let secret = Fq::random(rng);
        let rhos = split(&Polynomial::random(2 * d, secret.clone(), rng), n);
        let sigmas = split(&Polynomial::random(d, secret, rng), n);
        (0..n as usize)
            .map(|i| {
                (
                    i,
                    Message::MulRequest(MulRequest {
                        id,
                        x: vec![xs[i].clone()],
                        y: vec![ys[i].clone()],
                        rho: vec![rhos[i].clone()],
                        sigma: vec![sigmas[i].clone()],
                    }),
                )
            })
            .collect()
    }

    #[test]
    fn test_product_reconstructs() {
        let (n, k) = (6, 4);
        let rng = &mut ChaCha20Rng::from_seed(TEST_SEED);
        let id = MessageID::new(&[1u8; 32], 0);
        let mut engines: Vec<Mul> = (1..=n).map(|i| Mul::new(i, n, k)).collect();

        let results = run_network(&mut engines, signals(n, k, 3, 5, id, rng));
        assert_eq!(results.len(), n as usize);

        let shares: Vec<Share> = (1..=n).map(|i| results[&i].shares[0].clone()).collect();
        // the result is a degree-d sharing of x*y
        assert_eq!(join(&shares, k as usize).unwrap(), Fq::from(15));
        let d = multiplicative_degree(k);
        assert_eq!(join(&shares[..d + 1], d + 1).unwrap(), Fq::from(15));
    }

    #[test]
    fn test_duplicate_signal_replays_cached_result() {
        let (n, k) = (6, 4);
        let rng = &mut ChaCha20Rng::from_seed(TEST_SEED);
        let id = MessageID::new(&[2u8; 32], 7);
        let mut engines: Vec<Mul> = (1..=n).map(|i| Mul::new(i, n, k)).collect();

        let sigs = signals(n, k, 4, 9, id, rng);
        let first = run_network(&mut engines, sigs.clone());

        // the same signal again answers from cache, without rebroadcasting
        let replay = run_network(&mut engines, vec![sigs[0].clone()]);
        assert_eq!(replay[&1].shares, first[&1].shares);
    }

    #[test]
    fn test_waits_for_local_signal() {
        let (n, k) = (6, 4);
        let rng = &mut ChaCha20Rng::from_seed(TEST_SEED);
        let id = MessageID::new(&[3u8; 32], 0);
        let mut engines: Vec<Mul> = (1..=n).map(|i| Mul::new(i, n, k)).collect();

        // engine 6 never receives its signal: broadcasts alone must not
        // produce a result for it
        let sigs: Vec<(usize, Message)> = signals(n, k, 2, 8, id, rng)
            .into_iter()
            .take(n as usize - 1)
            .collect();
        let results = run_network(&mut engines, sigs);
        assert!(results.contains_key(&1));
        assert!(!results.contains_key(&n));
    }
}
