//! The linear bytecode process: memory, values, the instruction set and the
//! re-entrant `step` that pauses on asynchronous instructions.

use crate::algebra::Fq;
use crate::crypto::Share;
use crate::error::ProcessError;
use crate::macros;
use crate::message::{MessageID, ProcessId, RngVariant};

use num_traits::Zero;

/// A strided view into process memory. Element `i` of an operand lives at
/// slot `offset + i * step`, so operands can be interleavings of the same
/// buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Addr {
    pub offset: usize,
    pub step: usize,
}

impl Addr {
    pub fn new(offset: usize) -> Addr {
        Addr { offset, step: 1 }
    }

    pub fn with_step(offset: usize, step: usize) -> Addr {
        Addr { offset, step }
    }

    pub fn at(&self, i: usize) -> usize {
        self.offset + i * self.step
    }
}

/// A memory slot value. `PrivateRn` marks one half of a `(rho, sigma)`
/// tuple; only `Mul` may consume it, which keeps a tuple from being reused
/// in ordinary arithmetic.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Public(Fq),
    Private(Share),
    PrivateRn(Share),
}

/// Flat process memory. Reading a slot that was never written is a
/// programmer error, like reading out of range.
#[derive(Clone, Debug)]
pub struct Memory {
    slots: Vec<Option<Value>>,
}

impl Memory {
    pub fn new(len: usize) -> Memory {
        Memory {
            slots: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn read(&self, addr: Addr, i: usize) -> Result<&Value, ProcessError> {
        let slot = addr.at(i);
        match self.slots.get(slot) {
            None => Err(ProcessError::OutOfRange(slot)),
            Some(None) => Err(ProcessError::EmptySlot(slot)),
            Some(Some(v)) => Ok(v),
        }
    }

    pub fn write(&mut self, addr: Addr, i: usize, value: Value) -> Result<(), ProcessError> {
        let slot = addr.at(i);
        match self.slots.get_mut(slot) {
            None => Err(ProcessError::OutOfRange(slot)),
            Some(s) => {
                *s = Some(value);
                Ok(())
            }
        }
    }
}

/// The instruction set. Every instruction operates element-wise over `n`
/// slots of its operand views.
#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    /// `Move(dst, values)` writes the literal `values` starting at `dst`.
    Move(Addr, Vec<Value>),
    /// `Copy(dst, src, n)` copies `n` values element-wise.
    Copy(Addr, Addr, usize),
    /// `Add(dst, lhs, rhs, n)` adds on any public/private mix.
    Add(Addr, Addr, Addr, usize),
    /// `Sub(dst, lhs, rhs, n)` subtracts on any public/private mix.
    Sub(Addr, Addr, Addr, usize),
    /// `Neg(dst, src, n)` is the additive inverse.
    Neg(Addr, Addr, usize),
    /// `Exp(dst, lhs, rhs, n)` raises `lhs` to `rhs`; both public.
    Exp(Addr, Addr, Addr, usize),
    /// `Inv(dst, src, n)` is the multiplicative inverse of a public value.
    Inv(Addr, Addr, usize),
    /// `Mod(dst, lhs, rhs, n)` reduces a public value by a public integer
    /// divisor.
    Mod(Addr, Addr, Addr, usize),
    /// `Mul(dst, lhs, rhs, rho, sigma, n)` multiplies. With a public
    /// operand this is local; private times private consumes the `(rho,
    /// sigma)` tuple and runs through the MUL engine.
    Mul(Addr, Addr, Addr, Addr, Addr, usize),
    /// `GenerateRn(dst, n)` produces `n` private shares of fresh random
    /// values at the multiplicative degree.
    GenerateRn(Addr, usize),
    /// `GenerateRnZero(dst, n)` produces `n` private shares of zero.
    GenerateRnZero(Addr, usize),
    /// `GenerateRnTuple(rho_dst, sigma_dst, n)` produces `n` random tuples.
    GenerateRnTuple(Addr, Addr, usize),
    /// `Open(dst, src, n)` reconstructs public values from private shares.
    Open(Addr, Addr, usize),
    /// `Exit(src, n)` terminates the program with `n` result values.
    Exit(Addr, usize),
    /// Placeholder expanded before execution; evaluating one is an error.
    Macro(Vec<Inst>),
}

/// Persisted state of an instruction that is mid-execution. The pending
/// variants are written when an intent leaves the process, the ready
/// variants when the engine result comes back.
#[derive(Clone, Debug)]
pub enum State {
    RnPending { variant: RngVariant, batch: usize },
    RnReady { rho: Vec<Share>, sigma: Vec<Share> },
    MulPending { batch: usize },
    MulReady { shares: Vec<Share> },
    OpenPending { batch: usize },
    OpenReady { values: Vec<Fq> },
}

/// Pause token handed to the VM when an instruction cannot complete
/// locally, or when the program exits.
#[derive(Clone, Debug)]
pub struct Intent {
    pub id: MessageID,
    pub kind: IntentKind,
}

#[derive(Clone, Debug)]
pub enum IntentKind {
    GenRn {
        variant: RngVariant,
        batch: usize,
    },
    Mul {
        x: Vec<Share>,
        y: Vec<Share>,
        rho: Vec<Share>,
        sigma: Vec<Share>,
    },
    Open {
        shares: Vec<Share>,
    },
    Exit {
        values: Vec<Value>,
    },
}

enum Eval {
    Ready,
    NotReady(State, IntentKind),
    Exit(Vec<Value>),
}

/// One program instance: an expanded instruction stream, a program counter,
/// one state slot per instruction and a flat memory.
#[derive(Clone, Debug)]
pub struct Process {
    pub id: ProcessId,
    pub pc: u64,
    insts: Vec<Inst>,
    states: Vec<Option<State>>,
    pub memory: Memory,
}

impl Process {
    /// Create a process over a fresh memory of `memory_len` slots. Macro
    /// instructions are flattened here, before execution starts.
    pub fn new(id: ProcessId, insts: Vec<Inst>, memory_len: usize) -> Process {
        let insts = macros::expand(insts);
        let states = vec![None; insts.len()];
        Process {
            id,
            pc: 0,
            insts,
            states,
            memory: Memory::new(memory_len),
        }
    }

    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    /// Install the engine payload for the instruction at `pc`, so the next
    /// `step` re-enters it with a populated state.
    pub fn set_state(&mut self, pc: u64, state: State) -> Result<(), ProcessError> {
        match self.states.get_mut(pc as usize) {
            None => Err(ProcessError::PcOutOfRange(pc)),
            Some(slot) => {
                *slot = Some(state);
                Ok(())
            }
        }
    }

    /// Run instructions until one cannot complete locally or the program
    /// exits. The program counter only advances past an instruction that
    /// observed its populated state and became ready.
    pub fn step(&mut self) -> Result<Intent, ProcessError> {
        loop {
            let pc = self.pc as usize;
            let inst = match self.insts.get(pc) {
                Some(i) => i,
                None => return Err(ProcessError::PcOutOfRange(self.pc)),
            };
            match evaluate(inst, self.states[pc].as_ref(), &mut self.memory)? {
                Eval::Ready => {
                    self.states[pc] = None;
                    self.pc += 1;
                }
                Eval::NotReady(state, kind) => {
                    let id = MessageID::new(&self.id, self.pc);
                    self.states[pc] = Some(state);
                    return Ok(Intent { id, kind });
                }
                Eval::Exit(values) => {
                    let id = MessageID::new(&self.id, self.pc);
                    return Ok(Intent {
                        id,
                        kind: IntentKind::Exit { values },
                    });
                }
            }
        }
    }
}

fn add_values(a: &Value, b: &Value) -> Result<Value, ProcessError> {
    match (a, b) {
        (Value::Public(x), Value::Public(y)) => Ok(Value::Public(x + y)),
        (Value::Public(c), Value::Private(s)) | (Value::Private(s), Value::Public(c)) => {
            Ok(Value::Private(Share::new(s.index, &s.value + c)))
        }
        (Value::Private(x), Value::Private(y)) => {
            if x.index != y.index {
                return Err(ProcessError::ShareIndexMismatch(x.index, y.index));
            }
            Ok(Value::Private(Share::new(x.index, &x.value + &y.value)))
        }
        _ => Err(ProcessError::UnexpectedValue("add")),
    }
}

fn sub_values(a: &Value, b: &Value) -> Result<Value, ProcessError> {
    match (a, b) {
        (Value::Public(x), Value::Public(y)) => Ok(Value::Public(x - y)),
        (Value::Public(c), Value::Private(s)) => {
            Ok(Value::Private(Share::new(s.index, c - &s.value)))
        }
        (Value::Private(s), Value::Public(c)) => {
            Ok(Value::Private(Share::new(s.index, &s.value - c)))
        }
        (Value::Private(x), Value::Private(y)) => {
            if x.index != y.index {
                return Err(ProcessError::ShareIndexMismatch(x.index, y.index));
            }
            Ok(Value::Private(Share::new(x.index, &x.value - &y.value)))
        }
        _ => Err(ProcessError::UnexpectedValue("sub")),
    }
}

fn neg_value(a: &Value) -> Result<Value, ProcessError> {
    match a {
        Value::Public(x) => Ok(Value::Public(-x)),
        Value::Private(s) => Ok(Value::Private(Share::new(s.index, -&s.value))),
        Value::PrivateRn(_) => Err(ProcessError::UnexpectedValue("neg")),
    }
}

/// Local multiplication for slots where at least one operand is public.
fn mul_local(a: &Value, b: &Value) -> Result<Value, ProcessError> {
    match (a, b) {
        (Value::Public(x), Value::Public(y)) => Ok(Value::Public(x * y)),
        (Value::Public(c), Value::Private(s)) | (Value::Private(s), Value::Public(c)) => {
            Ok(Value::Private(Share::new(s.index, &s.value * c)))
        }
        _ => Err(ProcessError::UnexpectedValue("mul")),
    }
}

fn read_public(mem: &Memory, addr: Addr, i: usize, what: &'static str) -> Result<Fq, ProcessError> {
    match mem.read(addr, i)? {
        Value::Public(x) => Ok(x.clone()),
        _ => Err(ProcessError::UnexpectedValue(what)),
    }
}

/// Read `n` private shares and check they all carry the same index.
fn read_shares(mem: &Memory, addr: Addr, n: usize, what: &'static str) -> Result<Vec<Share>, ProcessError> {
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let share = match mem.read(addr, i)? {
            Value::Private(s) => s.clone(),
            _ => return Err(ProcessError::UnexpectedValue(what)),
        };
        if let Some(first) = out.first() {
            let first: &Share = first;
            if first.index != share.index {
                return Err(ProcessError::ShareIndexMismatch(first.index, share.index));
            }
        }
        out.push(share);
    }
    Ok(out)
}

/// Read `n` tuple halves (`PrivateRn` values).
fn read_rn_shares(mem: &Memory, addr: Addr, n: usize) -> Result<Vec<Share>, ProcessError> {
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        match mem.read(addr, i)? {
            Value::PrivateRn(s) => out.push(s.clone()),
            _ => return Err(ProcessError::UnexpectedValue("mul tuple operand")),
        }
    }
    Ok(out)
}

fn evaluate(inst: &Inst, state: Option<&State>, mem: &mut Memory) -> Result<Eval, ProcessError> {
    match inst {
        Inst::Move(dst, values) => {
            for (i, v) in values.iter().enumerate() {
                mem.write(*dst, i, v.clone())?;
            }
            Ok(Eval::Ready)
        }
        Inst::Copy(dst, src, n) => {
            for i in 0..*n {
                let v = mem.read(*src, i)?.clone();
                mem.write(*dst, i, v)?;
            }
            Ok(Eval::Ready)
        }
        Inst::Add(dst, lhs, rhs, n) => {
            for i in 0..*n {
                let v = add_values(mem.read(*lhs, i)?, mem.read(*rhs, i)?)?;
                mem.write(*dst, i, v)?;
            }
            Ok(Eval::Ready)
        }
        Inst::Sub(dst, lhs, rhs, n) => {
            for i in 0..*n {
                let v = sub_values(mem.read(*lhs, i)?, mem.read(*rhs, i)?)?;
                mem.write(*dst, i, v)?;
            }
            Ok(Eval::Ready)
        }
        Inst::Neg(dst, src, n) => {
            for i in 0..*n {
                let v = neg_value(mem.read(*src, i)?)?;
                mem.write(*dst, i, v)?;
            }
            Ok(Eval::Ready)
        }
        Inst::Exp(dst, lhs, rhs, n) => {
            for i in 0..*n {
                let base = read_public(mem, *lhs, i, "exp")?;
                let exponent = read_public(mem, *rhs, i, "exp")?;
                mem.write(*dst, i, Value::Public(base.pow(&exponent)))?;
            }
            Ok(Eval::Ready)
        }
        Inst::Inv(dst, src, n) => {
            for i in 0..*n {
                let x = read_public(mem, *src, i, "inv")?;
                if x.is_zero() {
                    return Err(ProcessError::ZeroInverse);
                }
                mem.write(*dst, i, Value::Public(x.inv()))?;
            }
            Ok(Eval::Ready)
        }
        Inst::Mod(dst, lhs, rhs, n) => {
            for i in 0..*n {
                let x = read_public(mem, *lhs, i, "mod")?;
                let divisor = read_public(mem, *rhs, i, "mod")?;
                if divisor.is_zero() {
                    return Err(ProcessError::ZeroDivisor);
                }
                mem.write(*dst, i, Value::Public(x.reduced_by(&divisor)))?;
            }
            Ok(Eval::Ready)
        }
        Inst::Mul(dst, lhs, rhs, rho, sigma, n) => {
            if let Some(State::MulReady { shares }) = state {
                if shares.len() != *n {
                    return Err(ProcessError::StateMismatch);
                }
                for (i, s) in shares.iter().enumerate() {
                    mem.write(*dst, i, Value::Private(s.clone()))?;
                }
                return Ok(Eval::Ready);
            }

            let local = (0..*n)
                .map(|i| {
                    Ok(matches!(
                        (mem.read(*lhs, i)?, mem.read(*rhs, i)?),
                        (Value::Public(_), _) | (_, Value::Public(_))
                    ))
                })
                .collect::<Result<Vec<bool>, ProcessError>>()?;

            if local.iter().all(|l| *l) {
                for i in 0..*n {
                    let v = mul_local(mem.read(*lhs, i)?, mem.read(*rhs, i)?)?;
                    mem.write(*dst, i, v)?;
                }
                Ok(Eval::Ready)
            } else if local.iter().any(|l| *l) {
                Err(ProcessError::UnexpectedValue("mul: mixed batch"))
            } else {
                let x = read_shares(mem, *lhs, *n, "mul")?;
                let y = read_shares(mem, *rhs, *n, "mul")?;
                let rho = read_rn_shares(mem, *rho, *n)?;
                let sigma = read_rn_shares(mem, *sigma, *n)?;
                Ok(Eval::NotReady(
                    State::MulPending { batch: *n },
                    IntentKind::Mul { x, y, rho, sigma },
                ))
            }
        }
        Inst::GenerateRn(dst, n) => match state {
            Some(State::RnReady { rho, .. }) => {
                if rho.len() != *n {
                    return Err(ProcessError::StateMismatch);
                }
                for (i, s) in rho.iter().enumerate() {
                    mem.write(*dst, i, Value::Private(s.clone()))?;
                }
                Ok(Eval::Ready)
            }
            _ => Ok(Eval::NotReady(
                State::RnPending {
                    variant: RngVariant::Rn,
                    batch: *n,
                },
                IntentKind::GenRn {
                    variant: RngVariant::Rn,
                    batch: *n,
                },
            )),
        },
        Inst::GenerateRnZero(dst, n) => match state {
            Some(State::RnReady { rho, .. }) => {
                if rho.len() != *n {
                    return Err(ProcessError::StateMismatch);
                }
                for (i, s) in rho.iter().enumerate() {
                    mem.write(*dst, i, Value::Private(s.clone()))?;
                }
                Ok(Eval::Ready)
            }
            _ => Ok(Eval::NotReady(
                State::RnPending {
                    variant: RngVariant::RnZero,
                    batch: *n,
                },
                IntentKind::GenRn {
                    variant: RngVariant::RnZero,
                    batch: *n,
                },
            )),
        },
        Inst::GenerateRnTuple(rho_dst, sigma_dst, n) => match state {
            Some(State::RnReady { rho, sigma }) => {
                if rho.len() != *n || sigma.len() != *n {
                    return Err(ProcessError::StateMismatch);
                }
                for (i, s) in rho.iter().enumerate() {
                    mem.write(*rho_dst, i, Value::PrivateRn(s.clone()))?;
                }
                for (i, s) in sigma.iter().enumerate() {
                    mem.write(*sigma_dst, i, Value::PrivateRn(s.clone()))?;
                }
                Ok(Eval::Ready)
            }
            _ => Ok(Eval::NotReady(
                State::RnPending {
                    variant: RngVariant::RnTuple,
                    batch: *n,
                },
                IntentKind::GenRn {
                    variant: RngVariant::RnTuple,
                    batch: *n,
                },
            )),
        },
        Inst::Open(dst, src, n) => match state {
            Some(State::OpenReady { values }) => {
                if values.len() != *n {
                    return Err(ProcessError::StateMismatch);
                }
                for (i, v) in values.iter().enumerate() {
                    mem.write(*dst, i, Value::Public(v.clone()))?;
                }
                Ok(Eval::Ready)
            }
            _ => {
                let shares = read_shares(mem, *src, *n, "open")?;
                Ok(Eval::NotReady(
                    State::OpenPending { batch: *n },
                    IntentKind::Open { shares },
                ))
            }
        },
        Inst::Exit(src, n) => {
            let mut values = Vec::with_capacity(*n);
            for i in 0..*n {
                let v = mem.read(*src, i)?.clone();
                if let Value::PrivateRn(_) = v {
                    return Err(ProcessError::UnexpectedValue("exit"));
                }
                values.push(v);
            }
            Ok(Eval::Exit(values))
        }
        Inst::Macro(_) => Err(ProcessError::UnexpandedMacro),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::Fq;

    fn pid(x: u8) -> ProcessId {
        [x; 32]
    }

    fn exit_values(proc: &mut Process) -> Vec<Value> {
        match proc.step().unwrap().kind {
            IntentKind::Exit { values } => values,
            other => panic!("expected exit, got {:?}", other),
        }
    }

    #[test]
    fn test_public_add() {
        let insts = vec![
            Inst::Move(Addr::new(0), vec![Value::Public(Fq::from(5)), Value::Public(Fq::from(7))]),
            Inst::Add(Addr::new(2), Addr::new(0), Addr::new(1), 1),
            Inst::Exit(Addr::new(2), 1),
        ];
        let mut proc = Process::new(pid(1), insts, 3);
        assert_eq!(exit_values(&mut proc), vec![Value::Public(Fq::from(12))]);
    }

    #[test]
    fn test_strided_operands() {
        // interleaved [a0, b0, a1, b1] with step-2 views
        let insts = vec![
            Inst::Move(
                Addr::new(0),
                vec![
                    Value::Public(Fq::from(1)),
                    Value::Public(Fq::from(10)),
                    Value::Public(Fq::from(2)),
                    Value::Public(Fq::from(20)),
                ],
            ),
            Inst::Add(Addr::new(4), Addr::with_step(0, 2), Addr::with_step(1, 2), 2),
            Inst::Exit(Addr::new(4), 2),
        ];
        let mut proc = Process::new(pid(2), insts, 6);
        assert_eq!(
            exit_values(&mut proc),
            vec![Value::Public(Fq::from(11)), Value::Public(Fq::from(22))]
        );
    }

    #[test]
    fn test_exp_inv_mod() {
        let insts = vec![
            Inst::Move(
                Addr::new(0),
                vec![
                    Value::Public(Fq::from(3)),
                    Value::Public(Fq::from(4)),
                    Value::Public(Fq::from(5)),
                ],
            ),
            Inst::Exp(Addr::new(3), Addr::new(0), Addr::new(1), 1),
            Inst::Inv(Addr::new(4), Addr::new(2), 1),
            Inst::Mul(Addr::new(4), Addr::new(4), Addr::new(2), Addr::new(0), Addr::new(0), 1),
            Inst::Mod(Addr::new(5), Addr::new(3), Addr::new(2), 1),
            Inst::Exit(Addr::new(3), 3),
        ];
        let mut proc = Process::new(pid(3), insts, 6);
        assert_eq!(
            exit_values(&mut proc),
            vec![
                Value::Public(Fq::from(81)),
                Value::Public(Fq::from(1)),
                Value::Public(Fq::from(1)),
            ]
        );
    }

    #[test]
    fn test_memory_out_of_range_is_fatal() {
        let insts = vec![Inst::Move(Addr::new(9), vec![Value::Public(Fq::from(1))])];
        let mut proc = Process::new(pid(4), insts, 3);
        match proc.step() {
            Err(ProcessError::OutOfRange(9)) => (),
            other => panic!("expected out of range, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_slot_is_fatal() {
        let insts = vec![Inst::Add(Addr::new(2), Addr::new(0), Addr::new(1), 1)];
        let mut proc = Process::new(pid(5), insts, 3);
        match proc.step() {
            Err(ProcessError::EmptySlot(0)) => (),
            other => panic!("expected empty slot, got {:?}", other),
        }
    }

    #[test]
    fn test_share_index_mismatch_is_fatal() {
        let insts = vec![
            Inst::Move(
                Addr::new(0),
                vec![
                    Value::Private(Share::new(1, Fq::from(3))),
                    Value::Private(Share::new(2, Fq::from(4))),
                ],
            ),
            Inst::Add(Addr::new(2), Addr::new(0), Addr::new(1), 1),
        ];
        let mut proc = Process::new(pid(6), insts, 3);
        match proc.step() {
            Err(ProcessError::ShareIndexMismatch(1, 2)) => (),
            other => panic!("expected index mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_generate_rn_pauses_and_resumes() {
        let insts = vec![
            Inst::GenerateRn(Addr::new(0), 2),
            Inst::Exit(Addr::new(0), 2),
        ];
        let mut proc = Process::new(pid(7), insts, 2);

        let intent = proc.step().unwrap();
        assert_eq!(intent.id, MessageID::new(&pid(7), 0));
        match intent.kind {
            IntentKind::GenRn {
                variant: RngVariant::Rn,
                batch: 2,
            } => (),
            other => panic!("unexpected intent {:?}", other),
        }

        // re-stepping without a result re-issues the same intent
        let again = proc.step().unwrap();
        assert_eq!(again.id, intent.id);

        let rho = vec![Share::new(3, Fq::from(11)), Share::new(3, Fq::from(22))];
        proc.set_state(0, State::RnReady { rho: rho.clone(), sigma: vec![] })
            .unwrap();
        let values = exit_values(&mut proc);
        assert_eq!(
            values,
            vec![
                Value::Private(rho[0].clone()),
                Value::Private(rho[1].clone())
            ]
        );
    }

    #[test]
    fn test_private_mul_roundtrip() {
        let a = Share::new(2, Fq::from(3));
        let b = Share::new(2, Fq::from(5));
        let insts = vec![
            Inst::Move(
                Addr::new(0),
                vec![Value::Private(a.clone()), Value::Private(b.clone())],
            ),
            Inst::GenerateRnTuple(Addr::new(2), Addr::new(3), 1),
            Inst::Mul(Addr::new(4), Addr::new(0), Addr::new(1), Addr::new(2), Addr::new(3), 1),
            Inst::Exit(Addr::new(4), 1),
        ];
        let mut proc = Process::new(pid(8), insts, 5);

        // tuple intent
        let intent = proc.step().unwrap();
        match intent.kind {
            IntentKind::GenRn {
                variant: RngVariant::RnTuple,
                batch: 1,
            } => (),
            other => panic!("unexpected intent {:?}", other),
        }
        let rho = vec![Share::new(2, Fq::from(100))];
        let sigma = vec![Share::new(2, Fq::from(40))];
        proc.set_state(1, State::RnReady { rho: rho.clone(), sigma: sigma.clone() })
            .unwrap();

        // mul intent carries operands and the consumed tuple
        let intent = proc.step().unwrap();
        assert_eq!(intent.id.pc(), 2);
        match intent.kind {
            IntentKind::Mul { x, y, rho: r, sigma: s } => {
                assert_eq!(x, vec![a]);
                assert_eq!(y, vec![b]);
                assert_eq!(r, rho);
                assert_eq!(s, sigma);
            }
            other => panic!("unexpected intent {:?}", other),
        }

        let product = vec![Share::new(2, Fq::from(15))];
        proc.set_state(2, State::MulReady { shares: product.clone() })
            .unwrap();
        assert_eq!(exit_values(&mut proc), vec![Value::Private(product[0].clone())]);
    }

    #[test]
    fn test_tuple_in_arithmetic_is_fatal() {
        let insts = vec![
            Inst::Move(
                Addr::new(0),
                vec![
                    Value::PrivateRn(Share::new(1, Fq::from(3))),
                    Value::Public(Fq::from(1)),
                ],
            ),
            Inst::Add(Addr::new(2), Addr::new(0), Addr::new(1), 1),
        ];
        let mut proc = Process::new(pid(9), insts, 3);
        match proc.step() {
            Err(ProcessError::UnexpectedValue("add")) => (),
            other => panic!("expected unexpected-value, got {:?}", other),
        }
    }

    #[test]
    fn test_mixed_mul_batch_is_fatal() {
        let insts = vec![
            Inst::Move(
                Addr::new(0),
                vec![
                    Value::Public(Fq::from(2)),
                    Value::Private(Share::new(1, Fq::from(3))),
                    Value::Public(Fq::from(4)),
                    Value::Private(Share::new(1, Fq::from(5))),
                ],
            ),
            // slot 0: public*public, slot 1: private*private
            Inst::Mul(
                Addr::new(4),
                Addr::with_step(0, 1),
                Addr::with_step(2, 1),
                Addr::new(0),
                Addr::new(0),
                2,
            ),
        ];
        let mut proc = Process::new(pid(10), insts, 6);
        match proc.step() {
            Err(ProcessError::UnexpectedValue(_)) => (),
            other => panic!("expected unexpected-value, got {:?}", other),
        }
    }

    #[test]
    fn test_open_requires_private_source() {
        let insts = vec![
            Inst::Move(Addr::new(0), vec![Value::Public(Fq::from(1))]),
            Inst::Open(Addr::new(1), Addr::new(0), 1),
        ];
        let mut proc = Process::new(pid(11), insts, 2);
        match proc.step() {
            Err(ProcessError::UnexpectedValue("open")) => (),
            other => panic!("expected unexpected-value, got {:?}", other),
        }
    }

    #[test]
    fn test_unexpanded_macro_is_fatal() {
        let mut proc = Process {
            id: pid(12),
            pc: 0,
            insts: vec![Inst::Macro(vec![])],
            states: vec![None],
            memory: Memory::new(1),
        };
        match proc.step() {
            Err(ProcessError::UnexpandedMacro) => (),
            other => panic!("expected unexpanded macro, got {:?}", other),
        }
    }

    #[test]
    fn test_pc_overflow_without_exit() {
        let insts = vec![Inst::Move(Addr::new(0), vec![Value::Public(Fq::from(1))])];
        let mut proc = Process::new(pid(13), insts, 1);
        match proc.step() {
            Err(ProcessError::PcOutOfRange(1)) => (),
            other => panic!("expected pc out of range, got {:?}", other),
        }
    }
}
