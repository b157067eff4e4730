//! The distributed random-number engine. One round per request id: every
//! party deals a Pedersen-verifiable sharing of a fresh secret, the
//! contributions of the canonical contributor set are summed per recipient,
//! and the summed shares are cross-checked in a propose round. Nobody
//! learns the secret behind the resulting shares.

use crate::algebra::Fq;
use crate::crypto::{multiplicative_degree, pedersen, vss, Share, VShare};
use crate::message::{Message, MessageID, PartyID, RngRequest, RngResult, RngVariant, Rpc};
use crate::task::{self, TaskHandle};

use log::{debug, warn};
use num_traits::Zero;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::{BTreeMap, HashMap};

/// Spawn the engine as a task.
pub fn spawn(
    index: PartyID,
    parties: u64,
    threshold: u64,
    scheme: pedersen::Scheme,
    seed: [u8; 32],
    capacity: usize,
) -> TaskHandle {
    let mut engine = Rng::new(index, parties, threshold, scheme, seed);
    task::spawn("rng", capacity, Box::new(move |m| engine.reduce(m)), Vec::new())
}

#[derive(Default)]
struct RngState {
    signalled: bool,
    batch: Option<usize>,
    variant: Option<RngVariant>,
    contributions: BTreeMap<PartyID, (Vec<VShare>, Vec<VShare>)>,
    summed: Option<(Vec<VShare>, Vec<VShare>)>,
    proposals: BTreeMap<PartyID, (Vec<VShare>, Vec<VShare>)>,
}

/// Per-party RNG engine state. One `RngState` per in-flight request id,
/// plus a cache of finished results for duplicate requests.
pub struct Rng {
    index: PartyID,
    parties: u64,
    threshold: u64,
    scheme: pedersen::Scheme,
    rng: ChaCha20Rng,
    states: HashMap<MessageID, RngState>,
    results: HashMap<MessageID, (Vec<Share>, Vec<Share>)>,
}

impl Rng {
    pub fn new(
        index: PartyID,
        parties: u64,
        threshold: u64,
        scheme: pedersen::Scheme,
        seed: [u8; 32],
    ) -> Rng {
        Rng {
            index,
            parties,
            threshold,
            scheme,
            rng: ChaCha20Rng::from_seed(seed),
            states: HashMap::new(),
            results: HashMap::new(),
        }
    }

    pub fn reduce(&mut self, msg: Message) -> Option<Message> {
        let out = match msg {
            Message::RngRequest(req) => self.handle_request(req),
            Message::Rpc(Rpc::RnShares {
                id,
                from,
                rho,
                sigma,
            }) => self.handle_shares(id, from, rho, sigma),
            Message::Rpc(Rpc::ProposeRnShare { id, rho, sigma }) => {
                let from = rho
                    .first()
                    .or_else(|| sigma.first())
                    .map(|v| v.share.index);
                match from {
                    Some(from) => self.accept_proposal(id, from, rho, sigma),
                    None => {
                        warn!("[rng:{}] dropping empty proposal for {:?}", self.index, id);
                        Vec::new()
                    }
                }
            }
            other => {
                warn!("[rng:{}] ignoring {:?}", self.index, other);
                Vec::new()
            }
        };
        if out.is_empty() {
            None
        } else {
            Some(Message::Batch(out))
        }
    }

    /// Local signal: deal verifiable sharings for the whole batch and
    /// broadcast them, keyed by recipient.
    fn handle_request(&mut self, req: RngRequest) -> Vec<Message> {
        if let Some((rho, sigma)) = self.results.get(&req.id) {
            debug!("[rng:{}] duplicate request {:?}, cached", self.index, req.id);
            return vec![Message::RngResult(RngResult {
                id: req.id,
                rho: rho.clone(),
                sigma: sigma.clone(),
            })];
        }
        {
            let state = self.states.entry(req.id).or_default();
            if state.signalled {
                debug!("[rng:{}] duplicate request {:?} while pending", self.index, req.id);
                return Vec::new();
            }
            state.signalled = true;
            state.batch = Some(req.batch);
            state.variant = Some(req.variant);
        }

        let d = multiplicative_degree(self.threshold);
        let (rho_degree, sigma_degree) = match req.variant {
            RngVariant::Rn => (d, None),
            RngVariant::RnZero => ((self.threshold - 1) as usize, None),
            RngVariant::RnTuple => (2 * d, Some(d)),
        };

        let mut rho_batches: BTreeMap<PartyID, Vec<VShare>> = BTreeMap::new();
        let mut sigma_batches: BTreeMap<PartyID, Vec<VShare>> = BTreeMap::new();
        for _ in 0..req.batch {
            let secret = match req.variant {
                RngVariant::RnZero => Fq::zero(),
                _ => Fq::random(&mut self.rng),
            };
            for v in vss::share(&self.scheme, &secret, self.parties, rho_degree, &mut self.rng) {
                rho_batches.entry(v.share.index).or_default().push(v);
            }
            if let Some(sigma_degree) = sigma_degree {
                // sigma shares the same secret at the lower degree
                for v in
                    vss::share(&self.scheme, &secret, self.parties, sigma_degree, &mut self.rng)
                {
                    sigma_batches.entry(v.share.index).or_default().push(v);
                }
            }
        }

        let mine_rho = rho_batches.get(&self.index).cloned().unwrap_or_default();
        let mine_sigma = sigma_batches.get(&self.index).cloned().unwrap_or_default();

        let mut out = vec![Message::Rpc(Rpc::RnShares {
            id: req.id,
            from: self.index,
            rho: rho_batches,
            sigma: sigma_batches,
        })];
        out.extend(self.accept_contribution(req.id, self.index, mine_rho, mine_sigma));
        out
    }

    /// A peer's dealt shares: keep the ones addressed to us, if they verify.
    fn handle_shares(
        &mut self,
        id: MessageID,
        from: PartyID,
        mut rho: BTreeMap<PartyID, Vec<VShare>>,
        mut sigma: BTreeMap<PartyID, Vec<VShare>>,
    ) -> Vec<Message> {
        let mine_rho = rho.remove(&self.index).unwrap_or_default();
        let mine_sigma = sigma.remove(&self.index).unwrap_or_default();
        self.accept_contribution(id, from, mine_rho, mine_sigma)
    }

    fn accept_contribution(
        &mut self,
        id: MessageID,
        from: PartyID,
        rho: Vec<VShare>,
        sigma: Vec<VShare>,
    ) -> Vec<Message> {
        if self.results.contains_key(&id) {
            return Vec::new();
        }
        let index = self.index;
        let ok = rho
            .iter()
            .chain(sigma.iter())
            .all(|v| v.share.index == index && v.verify(&self.scheme));
        if !ok {
            warn!("[rng:{}] dropping malformed contribution from {}", index, from);
            return Vec::new();
        }

        let state = self.states.entry(id).or_default();
        if state.contributions.contains_key(&from) {
            debug!("[rng:{}] duplicate contribution from {}", index, from);
            return Vec::new();
        }
        if rho.is_empty() {
            warn!("[rng:{}] contribution from {} has no shares for us", index, from);
            return Vec::new();
        }
        state.contributions.insert(from, (rho, sigma));
        self.try_propose(id)
    }

    /// Once every canonical contributor (the `threshold` lowest indices)
    /// has dealt, sum their shares addressed to us and propose the sum.
    fn try_propose(&mut self, id: MessageID) -> Vec<Message> {
        let scheme = &self.scheme;
        let index = self.index;
        let threshold = self.threshold;

        let state = match self.states.get_mut(&id) {
            Some(s) => s,
            None => return Vec::new(),
        };
        if !state.signalled || state.summed.is_some() {
            return Vec::new();
        }
        let batch = match state.batch {
            Some(b) => b,
            None => return Vec::new(),
        };
        let want_sigma = state.variant == Some(RngVariant::RnTuple);
        let complete = (1..=threshold).all(|i| match state.contributions.get(&i) {
            Some((r, s)) => r.len() == batch && (!want_sigma || s.len() == batch),
            None => false,
        });
        if !complete {
            return Vec::new();
        }

        let mut rho_sum: Option<Vec<VShare>> = None;
        let mut sigma_sum: Option<Vec<VShare>> = None;
        for i in 1..=threshold {
            let (r, s) = &state.contributions[&i];
            rho_sum = Some(match rho_sum {
                None => r.clone(),
                Some(acc) => acc
                    .iter()
                    .zip(r)
                    .map(|(a, b)| a.combine(b, scheme))
                    .collect(),
            });
            if want_sigma {
                sigma_sum = Some(match sigma_sum {
                    None => s.clone(),
                    Some(acc) => acc
                        .iter()
                        .zip(s)
                        .map(|(a, b)| a.combine(b, scheme))
                        .collect(),
                });
            }
        }
        let rho_sum = rho_sum.unwrap_or_default();
        let sigma_sum = sigma_sum.unwrap_or_default();
        state.summed = Some((rho_sum.clone(), sigma_sum.clone()));
        debug!("[rng:{}] proposing summed share for {:?}", index, id);

        let mut out = vec![Message::Rpc(Rpc::ProposeRnShare {
            id,
            rho: rho_sum.clone(),
            sigma: sigma_sum.clone(),
        })];
        out.extend(self.accept_proposal(id, index, rho_sum, sigma_sum));
        out
    }

    fn accept_proposal(
        &mut self,
        id: MessageID,
        from: PartyID,
        rho: Vec<VShare>,
        sigma: Vec<VShare>,
    ) -> Vec<Message> {
        if self.results.contains_key(&id) {
            return Vec::new();
        }
        let index = self.index;
        let ok = rho
            .iter()
            .chain(sigma.iter())
            .all(|v| v.share.index == from && v.verify(&self.scheme));
        if !ok || rho.is_empty() {
            warn!("[rng:{}] dropping malformed proposal from {}", index, from);
            return Vec::new();
        }

        let state = self.states.entry(id).or_default();
        if state.proposals.contains_key(&from) {
            debug!("[rng:{}] duplicate proposal from {}", index, from);
            return Vec::new();
        }
        state.proposals.insert(from, (rho, sigma));
        self.try_finish(id)
    }

    /// With our own sum in hand and enough proposals, reconstruct the
    /// commitment side to check consistency, then emit the result.
    fn try_finish(&mut self, id: MessageID) -> Vec<Message> {
        let scheme = self.scheme.clone();
        let index = self.index;
        let threshold = self.threshold as usize;

        let state = match self.states.get_mut(&id) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let (rho_sum, sigma_sum) = match &state.summed {
            Some(summed) => summed.clone(),
            None => return Vec::new(),
        };
        if state.proposals.len() < threshold {
            return Vec::new();
        }

        // interpolate the commitments of the lowest-indexed proposals and
        // check every further proposal against them
        if state.proposals.len() > threshold {
            let base: Vec<(PartyID, Vec<VShare>, Vec<VShare>)> = state
                .proposals
                .iter()
                .take(threshold)
                .map(|(i, (r, s))| (*i, r.clone(), s.clone()))
                .collect();
            let consistent = |idx: PartyID, rho: &[VShare], sigma: &[VShare]| -> bool {
                if rho.len() != rho_sum.len() || sigma.len() != sigma_sum.len() {
                    return false;
                }
                for (j, v) in rho.iter().enumerate() {
                    let points: Vec<(PartyID, pedersen::Commitment)> = base
                        .iter()
                        .map(|(i, r, _)| (*i, r[j].commitment.clone()))
                        .collect();
                    if scheme.interpolate(&points, idx) != v.commitment {
                        return false;
                    }
                }
                for (j, v) in sigma.iter().enumerate() {
                    let points: Vec<(PartyID, pedersen::Commitment)> = base
                        .iter()
                        .map(|(i, _, s)| (*i, s[j].commitment.clone()))
                        .collect();
                    if scheme.interpolate(&points, idx) != v.commitment {
                        return false;
                    }
                }
                true
            };
            let bad: Vec<PartyID> = state
                .proposals
                .iter()
                .skip(threshold)
                .filter(|(i, (r, s))| !consistent(**i, r, s))
                .map(|(i, _)| *i)
                .collect();
            for i in bad {
                warn!("[rng:{}] proposal from {} is off the commitment curve", index, i);
                state.proposals.remove(&i);
            }
            if state.proposals.len() < threshold {
                return Vec::new();
            }
        }

        let rho_shares: Vec<Share> = rho_sum.iter().map(|v| v.share.clone()).collect();
        let sigma_shares: Vec<Share> = sigma_sum.iter().map(|v| v.share.clone()).collect();
        self.results
            .insert(id, (rho_shares.clone(), sigma_shares.clone()));
        self.states.remove(&id);
        debug!("[rng:{}] done with {:?}", index, id);
        vec![Message::RngResult(RngResult {
            id,
            rho: rho_shares,
            sigma: sigma_shares,
        })]
    }
}
