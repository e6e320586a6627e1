use crate::clock::KnownState;
use crate::id::{DocId, Dot, NodeId};
use crate::token::TokenId;
use anyhow::{anyhow, Result};
use smallvec::SmallVec;

const SIG_DOMAIN: &[u8] = b"treecrdt/op-sig/v1";
const STORAGE_VERSION: u8 = 1;

/// Opaque sibling ordering key. The engine never interprets it beyond
/// lexicographic comparison; see [`crate::order`] for a producer.
#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OrderKey(SmallVec<[u8; 16]>);

impl OrderKey {
    pub fn new(bytes: impl Into<SmallVec<[u8; 16]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for OrderKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl From<Vec<u8>> for OrderKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl std::fmt::Debug for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "OrderKey({})", hex::encode(&self.0))
    }
}

/// The five op kinds of the move tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OpKind {
    Insert {
        parent: NodeId,
        node: NodeId,
        order_key: OrderKey,
        payload: Option<Vec<u8>>,
    },
    Move {
        node: NodeId,
        new_parent: NodeId,
        order_key: OrderKey,
    },
    Delete {
        node: NodeId,
    },
    Tombstone {
        node: NodeId,
    },
    Payload {
        node: NodeId,
        payload: Option<Vec<u8>>,
    },
}

impl OpKind {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Insert { .. } => 1,
            Self::Move { .. } => 2,
            Self::Delete { .. } => 3,
            Self::Tombstone { .. } => 4,
            Self::Payload { .. } => 5,
        }
    }

    /// The node this op acts on.
    pub fn node(&self) -> NodeId {
        match self {
            Self::Insert { node, .. } => *node,
            Self::Move { node, .. } => *node,
            Self::Delete { node } => *node,
            Self::Tombstone { node } => *node,
            Self::Payload { node, .. } => *node,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpMeta {
    pub dot: Dot,
    pub lamport: u64,
    /// Version vector snapshot of the emitter's awareness. Required for
    /// deletes, absent otherwise.
    pub known_state: Option<KnownState>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Op {
    pub meta: OpMeta,
    pub kind: OpKind,
}

impl Op {
    pub fn dot(&self) -> Dot {
        self.meta.dot
    }

    /// The signed preimage. A domain separated byte concatenation rather
    /// than CBOR so the preimage is unambiguous across implementations and
    /// independent of wire framing.
    pub fn encode_sig_input(&self, doc: &DocId) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(SIG_DOMAIN);
        out.push(0);
        put_bytes(&mut out, doc.as_ref());
        put_bytes(&mut out, self.meta.dot.replica.as_ref());
        out.extend_from_slice(&self.meta.dot.counter.to_be_bytes());
        out.extend_from_slice(&self.meta.lamport.to_be_bytes());
        out.push(self.kind.tag());
        match &self.kind {
            OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            } => {
                out.extend_from_slice(parent.as_ref());
                out.extend_from_slice(node.as_ref());
                put_bytes(&mut out, order_key.as_bytes());
                put_payload(&mut out, payload.as_deref());
            }
            OpKind::Move {
                node,
                new_parent,
                order_key,
            } => {
                out.extend_from_slice(node.as_ref());
                out.extend_from_slice(new_parent.as_ref());
                put_bytes(&mut out, order_key.as_bytes());
            }
            OpKind::Delete { node } => {
                out.extend_from_slice(node.as_ref());
                let known_state = self
                    .meta
                    .known_state
                    .as_ref()
                    .ok_or_else(|| anyhow!("delete op without known_state"))?;
                put_bytes(&mut out, &known_state.encode()?);
            }
            OpKind::Tombstone { node } => {
                out.extend_from_slice(node.as_ref());
            }
            OpKind::Payload { node, payload } => {
                out.extend_from_slice(node.as_ref());
                put_payload(&mut out, payload.as_deref());
            }
        }
        Ok(out)
    }
}

/// Signature and capability proof attached to an op.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpAuth {
    pub sig: [u8; 64],
    /// Token id of the capability the author signed under.
    pub proof_ref: Option<TokenId>,
}

/// An op together with its auth, as it travels and as it is stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedOp {
    pub op: Op,
    pub auth: OpAuth,
}

impl SignedOp {
    /// Canonical storage encoding of the op and its auth.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(160);
        out.push(STORAGE_VERSION);
        out.extend_from_slice(self.op.meta.dot.replica.as_ref());
        out.extend_from_slice(&self.op.meta.dot.counter.to_be_bytes());
        out.extend_from_slice(&self.op.meta.lamport.to_be_bytes());
        out.push(self.op.kind.tag());
        match &self.op.kind {
            OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            } => {
                out.extend_from_slice(parent.as_ref());
                out.extend_from_slice(node.as_ref());
                put_bytes(&mut out, order_key.as_bytes());
                put_payload(&mut out, payload.as_deref());
            }
            OpKind::Move {
                node,
                new_parent,
                order_key,
            } => {
                out.extend_from_slice(node.as_ref());
                out.extend_from_slice(new_parent.as_ref());
                put_bytes(&mut out, order_key.as_bytes());
            }
            OpKind::Delete { node } => {
                out.extend_from_slice(node.as_ref());
                let known_state = self
                    .op
                    .meta
                    .known_state
                    .as_ref()
                    .ok_or_else(|| anyhow!("delete op without known_state"))?;
                put_bytes(&mut out, &known_state.encode()?);
            }
            OpKind::Tombstone { node } => {
                out.extend_from_slice(node.as_ref());
            }
            OpKind::Payload { node, payload } => {
                out.extend_from_slice(node.as_ref());
                put_payload(&mut out, payload.as_deref());
            }
        }
        match self.auth.proof_ref {
            Some(proof_ref) => {
                out.push(1);
                out.extend_from_slice(&self.auth.sig);
                out.extend_from_slice(proof_ref.as_ref());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&self.auth.sig);
            }
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != STORAGE_VERSION {
            return Err(anyhow!("unsupported op encoding version {}", version));
        }
        let replica = crate::id::ReplicaId::new(r.array::<32>()?);
        let counter = r.u64()?;
        let lamport = r.u64()?;
        let tag = r.u8()?;
        let mut known_state = None;
        let kind = match tag {
            1 => {
                let parent = NodeId::new(r.array::<16>()?);
                let node = NodeId::new(r.array::<16>()?);
                let order_key = OrderKey::from(r.bytes()?);
                let payload = r.payload()?;
                OpKind::Insert {
                    parent,
                    node,
                    order_key,
                    payload,
                }
            }
            2 => {
                let node = NodeId::new(r.array::<16>()?);
                let new_parent = NodeId::new(r.array::<16>()?);
                let order_key = OrderKey::from(r.bytes()?);
                OpKind::Move {
                    node,
                    new_parent,
                    order_key,
                }
            }
            3 => {
                let node = NodeId::new(r.array::<16>()?);
                known_state = Some(KnownState::decode(&r.bytes()?)?);
                OpKind::Delete { node }
            }
            4 => OpKind::Tombstone {
                node: NodeId::new(r.array::<16>()?),
            },
            5 => {
                let node = NodeId::new(r.array::<16>()?);
                let payload = r.payload()?;
                OpKind::Payload { node, payload }
            }
            tag => return Err(anyhow!("unknown op kind tag {}", tag)),
        };
        let has_proof = r.u8()?;
        let sig = r.array::<64>()?;
        let proof_ref = match has_proof {
            0 => None,
            1 => Some(TokenId::new(r.array::<16>()?)),
            flag => return Err(anyhow!("bad auth flags {}", flag)),
        };
        r.finish()?;
        Ok(Self {
            op: Op {
                meta: OpMeta {
                    dot: Dot::new(replica, counter),
                    lamport,
                    known_state,
                },
                kind,
            },
            auth: OpAuth { sig, proof_ref },
        })
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_payload(out: &mut Vec<u8>, payload: Option<&[u8]>) {
    match payload {
        Some(payload) => {
            out.push(1);
            put_bytes(out, payload);
        }
        None => out.push(0xff),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(anyhow!("op encoding truncated"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn payload(&mut self) -> Result<Option<Vec<u8>>> {
        match self.u8()? {
            1 => Ok(Some(self.bytes()?)),
            0xff => Ok(None),
            flag => Err(anyhow!("bad payload flag {}", flag)),
        }
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(anyhow!("trailing bytes in op encoding"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ReplicaId;
    use crate::props::*;
    use proptest::prelude::*;

    #[test]
    fn sig_input_is_framing_independent() {
        let doc = DocId::new([1; 32]);
        let op = Op {
            meta: OpMeta {
                dot: Dot::new(ReplicaId::new([2; 32]), 1),
                lamport: 1,
                known_state: None,
            },
            kind: OpKind::Insert {
                parent: NodeId::ROOT,
                node: NodeId::new([3; 16]),
                order_key: OrderKey::from(vec![0x80]),
                payload: Some(b"hello".to_vec()),
            },
        };
        let signed = SignedOp {
            op: op.clone(),
            auth: OpAuth {
                sig: [0; 64],
                proof_ref: None,
            },
        };
        // storage roundtrip must not change the preimage
        let bytes = signed.encode().unwrap();
        let decoded = SignedOp::decode(&bytes).unwrap();
        assert_eq!(
            decoded.op.encode_sig_input(&doc).unwrap(),
            op.encode_sig_input(&doc).unwrap()
        );
    }

    #[test]
    fn delete_without_known_state_fails() {
        let doc = DocId::new([1; 32]);
        let op = Op {
            meta: OpMeta {
                dot: Dot::new(ReplicaId::new([2; 32]), 1),
                lamport: 1,
                known_state: None,
            },
            kind: OpKind::Delete {
                node: NodeId::new([3; 16]),
            },
        };
        assert!(op.encode_sig_input(&doc).is_err());
    }

    proptest! {
        #[test]
        fn storage_roundtrip(op in arb_signed_op()) {
            let bytes = op.encode().unwrap();
            prop_assert_eq!(SignedOp::decode(&bytes).unwrap(), op);
        }
    }
}
