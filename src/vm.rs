//! The routing hub. The VM owns the running processes, turns their pause
//! intents into engine requests, routes inbound remote calls to the right
//! engine, and feeds engine results back into the paused instruction.

use crate::crypto::pedersen;
use crate::error::ProcessError;
use crate::message::{
    Message, MessageID, MulRequest, OpenRequest, PartyID, ProcessFailure, ProcessId,
    ProcessResult, RngRequest, Rpc,
};
use crate::mul;
use crate::open;
use crate::process::{IntentKind, Process, State};
use crate::rng;
use crate::task::{self, TaskHandle};

use crossbeam::channel::Sender;
use log::{debug, error, warn};
use std::collections::HashMap;

/// Spawn a VM task owning its three engine tasks. The handle's input takes
/// `Exec` and inbound `Rpc` messages; its output carries `Result`, `Error`
/// and outbound `Rpc` messages.
pub fn spawn(
    index: PartyID,
    parties: u64,
    threshold: u64,
    scheme: pedersen::Scheme,
    seed: [u8; 32],
    capacity: usize,
) -> TaskHandle {
    let rng_task = rng::spawn(index, parties, threshold, scheme, seed, capacity);
    let mul_task = mul::spawn(index, parties, threshold, capacity);
    let open_task = open::spawn(index, parties, threshold, capacity);
    let mut vm = Vm::new(
        index,
        rng_task.sender(),
        mul_task.sender(),
        open_task.sender(),
    );
    task::spawn(
        "vm",
        capacity,
        Box::new(move |m| vm.reduce(m)),
        vec![rng_task, mul_task, open_task],
    )
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum EngineKind {
    Rng,
    Mul,
    Open,
}

/// The hub state: running processes, outstanding intents and the engine
/// mailboxes.
pub struct Vm {
    index: PartyID,
    procs: HashMap<ProcessId, Process>,
    intents: HashMap<MessageID, EngineKind>,
    rng_input: Sender<Message>,
    mul_input: Sender<Message>,
    open_input: Sender<Message>,
}

impl Vm {
    fn new(
        index: PartyID,
        rng_input: Sender<Message>,
        mul_input: Sender<Message>,
        open_input: Sender<Message>,
    ) -> Vm {
        Vm {
            index,
            procs: HashMap::new(),
            intents: HashMap::new(),
            rng_input,
            mul_input,
            open_input,
        }
    }

    pub fn reduce(&mut self, msg: Message) -> Option<Message> {
        match msg {
            Message::Batch(msgs) => {
                let outs: Vec<Message> = msgs.into_iter().filter_map(|m| self.reduce(m)).collect();
                if outs.is_empty() {
                    None
                } else {
                    Some(Message::Batch(outs))
                }
            }
            Message::Exec(proc) => self.exec(proc),
            Message::Rpc(rpc) => {
                if rpc.from_index() == self.index {
                    // authored by our own engines: outbound to the peers
                    Some(Message::Rpc(rpc))
                } else {
                    self.route(rpc);
                    None
                }
            }
            Message::RngResult(res) => self.resume(
                res.id,
                EngineKind::Rng,
                State::RnReady {
                    rho: res.rho,
                    sigma: res.sigma,
                },
            ),
            Message::MulResult(res) => {
                self.resume(res.id, EngineKind::Mul, State::MulReady { shares: res.shares })
            }
            Message::OpenResult(res) => {
                self.resume(res.id, EngineKind::Open, State::OpenReady { values: res.values })
            }
            other => {
                warn!("[vm:{}] ignoring {:?}", self.index, other);
                None
            }
        }
    }

    fn exec(&mut self, proc: Process) -> Option<Message> {
        let pid = proc.id;
        if self.procs.contains_key(&pid) {
            warn!("[vm:{}] duplicate exec for {:02x?}", self.index, &pid[..4]);
            return None;
        }
        debug!("[vm:{}] executing process {:02x?}", self.index, &pid[..4]);
        self.procs.insert(pid, proc);
        self.advance(pid)
    }

    /// Inbound remote calls go to the engine that speaks their variant.
    fn route(&self, rpc: Rpc) {
        let target = match &rpc {
            Rpc::RnShares { .. } | Rpc::ProposeRnShare { .. } => &self.rng_input,
            Rpc::BroadcastMulShares { .. } => &self.mul_input,
            Rpc::BroadcastShares { .. } => &self.open_input,
        };
        if target.send(Message::Rpc(rpc)).is_err() {
            error!("[vm:{}] engine mailbox closed", self.index);
        }
    }

    /// An engine finished a round: populate the paused instruction's state
    /// and run the process further.
    fn resume(&mut self, id: MessageID, kind: EngineKind, state: State) -> Option<Message> {
        match self.intents.remove(&id) {
            None => {
                debug!("[vm:{}] no outstanding intent for {:?}", self.index, id);
                None
            }
            Some(expected) if expected != kind => {
                error!(
                    "[vm:{}] engine result kind {:?} does not match intent {:?}",
                    self.index, kind, expected
                );
                None
            }
            Some(_) => {
                let pid = id.process_id();
                match self.procs.get_mut(&pid) {
                    None => {
                        debug!("[vm:{}] result for finished process {:?}", self.index, id);
                        None
                    }
                    Some(proc) => match proc.set_state(id.pc(), state) {
                        Ok(()) => self.advance(pid),
                        Err(e) => self.fail(pid, e),
                    },
                }
            }
        }
    }

    /// Step the process to its next pause point, dispatching the request
    /// the pause asks for.
    fn advance(&mut self, pid: ProcessId) -> Option<Message> {
        let proc = match self.procs.get_mut(&pid) {
            Some(p) => p,
            None => return None,
        };
        let intent = match proc.step() {
            Ok(intent) => intent,
            Err(e) => return self.fail(pid, e),
        };
        match intent.kind {
            IntentKind::Exit { values } => {
                self.procs.remove(&pid);
                debug!("[vm:{}] process {:02x?} finished", self.index, &pid[..4]);
                Some(Message::Result(ProcessResult { pid, values }))
            }
            IntentKind::GenRn { variant, batch } => {
                self.intents.insert(intent.id, EngineKind::Rng);
                self.dispatch(
                    &self.rng_input,
                    Message::RngRequest(RngRequest {
                        id: intent.id,
                        batch,
                        variant,
                    }),
                );
                None
            }
            IntentKind::Mul { x, y, rho, sigma } => {
                self.intents.insert(intent.id, EngineKind::Mul);
                self.dispatch(
                    &self.mul_input,
                    Message::MulRequest(MulRequest {
                        id: intent.id,
                        x,
                        y,
                        rho,
                        sigma,
                    }),
                );
                None
            }
            IntentKind::Open { shares } => {
                self.intents.insert(intent.id, EngineKind::Open);
                self.dispatch(
                    &self.open_input,
                    Message::OpenRequest(OpenRequest {
                        id: intent.id,
                        shares,
                    }),
                );
                None
            }
        }
    }

    fn dispatch(&self, target: &Sender<Message>, msg: Message) {
        if target.send(msg).is_err() {
            error!("[vm:{}] engine mailbox closed", self.index);
        }
    }

    fn fail(&mut self, pid: ProcessId, e: ProcessError) -> Option<Message> {
        self.procs.remove(&pid);
        self.intents.retain(|id, _| id.process_id() != pid);
        error!("[vm:{}] process {:02x?} failed: {}", self.index, &pid[..4], e);
        Some(Message::Error(ProcessFailure {
            pid,
            reason: e.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::Fq;
    use crate::crypto::Share;
    use crate::message::{MulResult, OpenResult, RngResult, RngVariant};
    use crate::process::{Addr, Inst, Value};

    use crossbeam::channel::{bounded, Receiver};

    fn harness() -> (Vm, Receiver<Message>, Receiver<Message>, Receiver<Message>) {
        let (rng_s, rng_r) = bounded(16);
        let (mul_s, mul_r) = bounded(16);
        let (open_s, open_r) = bounded(16);
        (Vm::new(1, rng_s, mul_s, open_s), rng_r, mul_r, open_r)
    }

    fn pid(x: u8) -> ProcessId {
        [x; 32]
    }

    #[test]
    fn test_sync_program_runs_to_result() {
        let (mut vm, _rng_r, _mul_r, _open_r) = harness();
        let insts = vec![
            Inst::Move(
                Addr::new(0),
                vec![Value::Public(Fq::from(5)), Value::Public(Fq::from(7))],
            ),
            Inst::Add(Addr::new(2), Addr::new(0), Addr::new(1), 1),
            Inst::Exit(Addr::new(2), 1),
        ];
        let out = vm.reduce(Message::Exec(Process::new(pid(1), insts, 3)));
        match out {
            Some(Message::Result(res)) => {
                assert_eq!(res.pid, pid(1));
                assert_eq!(res.values, vec![Value::Public(Fq::from(12))]);
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn test_async_program_dispatches_and_resumes() {
        let (mut vm, _rng_r, _mul_r, open_r) = harness();
        let share = Share::new(1, Fq::from(30));
        let insts = vec![
            Inst::Move(Addr::new(0), vec![Value::Private(share)]),
            Inst::Open(Addr::new(0), Addr::new(0), 1),
            Inst::Exit(Addr::new(0), 1),
        ];
        let out = vm.reduce(Message::Exec(Process::new(pid(2), insts, 1)));
        assert!(out.is_none());

        // the intent became an open request for (pid, pc=1)
        let id = MessageID::new(&pid(2), 1);
        match open_r.try_recv().unwrap() {
            Message::OpenRequest(req) => {
                assert_eq!(req.id, id);
                assert_eq!(req.shares, vec![Share::new(1, Fq::from(30))]);
            }
            other => panic!("expected open request, got {:?}", other),
        }

        // engine result resumes the instruction and the program exits
        let out = vm.reduce(Message::OpenResult(OpenResult {
            id,
            values: vec![Fq::from(30)],
        }));
        match out {
            Some(Message::Result(res)) => {
                assert_eq!(res.values, vec![Value::Public(Fq::from(30))]);
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn test_rng_then_mul_pipeline() {
        let (mut vm, rng_r, mul_r, _open_r) = harness();
        let a = Share::new(1, Fq::from(3));
        let b = Share::new(1, Fq::from(4));
        let insts = vec![
            Inst::Move(
                Addr::new(0),
                vec![Value::Private(a.clone()), Value::Private(b.clone())],
            ),
            Inst::GenerateRnTuple(Addr::new(2), Addr::new(3), 1),
            Inst::Mul(Addr::new(4), Addr::new(0), Addr::new(1), Addr::new(2), Addr::new(3), 1),
            Inst::Exit(Addr::new(4), 1),
        ];
        assert!(vm
            .reduce(Message::Exec(Process::new(pid(3), insts, 5)))
            .is_none());

        let tuple_id = MessageID::new(&pid(3), 1);
        match rng_r.try_recv().unwrap() {
            Message::RngRequest(req) => {
                assert_eq!(req.id, tuple_id);
                assert_eq!(req.variant, RngVariant::RnTuple);
                assert_eq!(req.batch, 1);
            }
            other => panic!("expected rng request, got {:?}", other),
        }

        let rho = Share::new(1, Fq::from(100));
        let sigma = Share::new(1, Fq::from(40));
        assert!(vm
            .reduce(Message::RngResult(RngResult {
                id: tuple_id,
                rho: vec![rho.clone()],
                sigma: vec![sigma.clone()],
            }))
            .is_none());

        let mul_id = MessageID::new(&pid(3), 2);
        match mul_r.try_recv().unwrap() {
            Message::MulRequest(req) => {
                assert_eq!(req.id, mul_id);
                assert_eq!(req.x, vec![a]);
                assert_eq!(req.y, vec![b]);
                assert_eq!(req.rho, vec![rho]);
                assert_eq!(req.sigma, vec![sigma]);
            }
            other => panic!("expected mul request, got {:?}", other),
        }

        let product = Share::new(1, Fq::from(12));
        let out = vm.reduce(Message::MulResult(MulResult {
            id: mul_id,
            shares: vec![product.clone()],
        }));
        match out {
            Some(Message::Result(res)) => {
                assert_eq!(res.values, vec![Value::Private(product)]);
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn test_rpc_routing_by_direction() {
        let (mut vm, _rng_r, _mul_r, open_r) = harness();
        let id = MessageID::new(&pid(4), 0);

        // a peer's broadcast goes to the engine
        let inbound = Rpc::BroadcastShares {
            id,
            from: 2,
            shares: vec![Share::new(2, Fq::from(1))],
        };
        assert!(vm.reduce(Message::Rpc(inbound.clone())).is_none());
        match open_r.try_recv().unwrap() {
            Message::Rpc(rpc) => assert_eq!(rpc, inbound),
            other => panic!("expected rpc, got {:?}", other),
        }

        // our own engines' broadcast goes back out to the peers
        let outbound = Rpc::BroadcastShares {
            id,
            from: 1,
            shares: vec![Share::new(1, Fq::from(1))],
        };
        match vm.reduce(Message::Rpc(outbound.clone())) {
            Some(Message::Rpc(rpc)) => assert_eq!(rpc, outbound),
            other => panic!("expected outbound rpc, got {:?}", other),
        }
    }

    #[test]
    fn test_programmer_error_emits_error_and_drops_process() {
        let (mut vm, _rng_r, _mul_r, _open_r) = harness();
        let insts = vec![Inst::Move(Addr::new(7), vec![Value::Public(Fq::from(1))])];
        let out = vm.reduce(Message::Exec(Process::new(pid(5), insts, 2)));
        match out {
            Some(Message::Error(failure)) => {
                assert_eq!(failure.pid, pid(5));
                assert!(failure.reason.contains("out of range"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert!(vm.procs.is_empty());
        assert!(vm.intents.is_empty());
    }

    #[test]
    fn test_stale_engine_result_is_discarded() {
        let (mut vm, _rng_r, _mul_r, _open_r) = harness();
        let out = vm.reduce(Message::OpenResult(OpenResult {
            id: MessageID::new(&pid(6), 3),
            values: vec![Fq::from(1)],
        }));
        assert!(out.is_none());
    }
}
