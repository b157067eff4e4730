//! Here are the structs and enums that represent messages flowing through
//! task mailboxes, plus the wire-level remote procedure calls exchanged
//! between parties.

use crate::algebra::Fq;
use crate::crypto::{Share, VShare};
use crate::process::{Process, Value};

use byteorder::{ByteOrder, LittleEndian};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Parties are identified by an index in `1..=n`.
pub type PartyID = u64;

/// Unique identifier of one program instance.
pub type ProcessId = [u8; 32];

/// The correlation key for one asynchronous invocation of one instruction
/// inside one process: the 32-byte process id followed by the program
/// counter in little-endian. Every protocol round carries it unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageID([u8; 40]);

impl MessageID {
    pub fn new(pid: &ProcessId, pc: u64) -> MessageID {
        let mut buf = [0u8; 40];
        buf[..32].copy_from_slice(pid);
        LittleEndian::write_u64(&mut buf[32..], pc);
        MessageID(buf)
    }

    pub fn process_id(&self) -> ProcessId {
        let mut pid = [0u8; 32];
        pid.copy_from_slice(&self.0[..32]);
        pid
    }

    pub fn pc(&self) -> u64 {
        LittleEndian::read_u64(&self.0[32..])
    }

    pub fn as_bytes(&self) -> &[u8; 40] {
        &self.0
    }
}

impl fmt::Debug for MessageID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageID({:02x}{:02x}{:02x}{:02x}../{})",
            self.0[0],
            self.0[1],
            self.0[2],
            self.0[3],
            self.pc()
        )
    }
}

impl Serialize for MessageID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

struct MessageIDVisitor;

impl<'de> de::Visitor<'de> for MessageIDVisitor {
    type Value = MessageID;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a 40-byte message id")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.len() != 40 {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut buf = [0u8; 40];
        buf.copy_from_slice(v);
        Ok(MessageID(buf))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        self.visit_bytes(&v)
    }
}

impl<'de> Deserialize<'de> for MessageID {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(MessageIDVisitor)
    }
}

/// Which kind of randomness an RNG round produces.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum RngVariant {
    Rn,
    RnZero,
    RnTuple,
}

/// The remote procedure calls exchanged between parties. Field elements
/// encode as big-endian byte strings of the modulus width, ids as 40 raw
/// bytes, so the wire format is stable across implementations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Rpc {
    RnShares {
        id: MessageID,
        from: PartyID,
        rho: BTreeMap<PartyID, Vec<VShare>>,
        sigma: BTreeMap<PartyID, Vec<VShare>>,
    },
    ProposeRnShare {
        id: MessageID,
        rho: Vec<VShare>,
        sigma: Vec<VShare>,
    },
    BroadcastMulShares {
        id: MessageID,
        from: PartyID,
        shares: Vec<Share>,
    },
    BroadcastShares {
        id: MessageID,
        from: PartyID,
        shares: Vec<Share>,
    },
}

impl Rpc {
    pub fn id(&self) -> &MessageID {
        match self {
            Rpc::RnShares { id, .. } => id,
            Rpc::ProposeRnShare { id, .. } => id,
            Rpc::BroadcastMulShares { id, .. } => id,
            Rpc::BroadcastShares { id, .. } => id,
        }
    }

    /// The index of the authoring party. A proposal is attributed through
    /// the index its verifiable shares carry.
    pub fn from_index(&self) -> PartyID {
        match self {
            Rpc::RnShares { from, .. } => *from,
            Rpc::ProposeRnShare { rho, sigma, .. } => rho
                .first()
                .or_else(|| sigma.first())
                .map(|v| v.share.index)
                .unwrap_or(0),
            Rpc::BroadcastMulShares { from, .. } => *from,
            Rpc::BroadcastShares { from, .. } => *from,
        }
    }
}

/// Result of a finished process: the values its `Exit` instruction named.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessResult {
    pub pid: ProcessId,
    pub values: Vec<Value>,
}

/// A fatal programmer error surfaced at the VM boundary.
#[derive(Clone, Debug)]
pub struct ProcessFailure {
    pub pid: ProcessId,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct RngRequest {
    pub id: MessageID,
    pub batch: usize,
    pub variant: RngVariant,
}

#[derive(Clone, Debug)]
pub struct RngResult {
    pub id: MessageID,
    pub rho: Vec<Share>,
    pub sigma: Vec<Share>,
}

#[derive(Clone, Debug)]
pub struct MulRequest {
    pub id: MessageID,
    pub x: Vec<Share>,
    pub y: Vec<Share>,
    pub rho: Vec<Share>,
    pub sigma: Vec<Share>,
}

#[derive(Clone, Debug)]
pub struct MulResult {
    pub id: MessageID,
    pub shares: Vec<Share>,
}

#[derive(Clone, Debug)]
pub struct OpenRequest {
    pub id: MessageID,
    pub shares: Vec<Share>,
}

#[derive(Clone, Debug)]
pub struct OpenResult {
    pub id: MessageID,
    pub values: Vec<Fq>,
}

/// Everything a task mailbox can carry. A `Batch` is flattened by the task
/// runtime and delivered one message at a time.
#[derive(Clone, Debug)]
pub enum Message {
    Batch(Vec<Message>),
    Exec(Process),
    Result(ProcessResult),
    Error(ProcessFailure),
    Rpc(Rpc),
    RngRequest(RngRequest),
    RngResult(RngResult),
    MulRequest(MulRequest),
    MulResult(MulResult),
    OpenRequest(OpenRequest),
    OpenResult(OpenResult),
}
