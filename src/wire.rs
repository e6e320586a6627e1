//! Protobuf wire format of the sync protocol.
//!
//! One envelope, [`SyncMessage`], with a version, a doc id and a oneof
//! payload. The message structs are the normative wire contract; op
//! signatures never depend on this framing (the signed preimage is the
//! domain separated byte form produced by the engine).

use anyhow::{anyhow, bail, Result};
use arbor_crdt::{
    CodedSymbol, Dot, KnownState, NodeId, Op, OpAuth, OpKind, OpMeta, OrderKey, ReplicaId,
    SignedOp, TokenId,
};
use prost::Message;

/// Wire protocol version.
pub const VERSION: u32 = 0;

/// Error codes carried by [`SyncError`] and filter rejections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    Unauthorized = 1,
    Protocol = 2,
    Backend = 3,
    DecodeFailed = 4,
    Cancelled = 5,
    VersionMismatch = 6,
    Revoked = 7,
}

#[derive(Clone, PartialEq, Message)]
pub struct SyncMessage {
    #[prost(uint32, tag = "1")]
    pub v: u32,
    #[prost(string, tag = "2")]
    pub doc_id: String,
    #[prost(oneof = "Payload", tags = "3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "3")]
    Hello(Hello),
    #[prost(message, tag = "4")]
    HelloAck(HelloAck),
    #[prost(message, tag = "5")]
    RibltCodewords(RibltCodewords),
    #[prost(message, tag = "6")]
    RibltStatus(RibltStatus),
    #[prost(message, tag = "7")]
    OpsBatch(OpsBatch),
    #[prost(message, tag = "8")]
    Subscribe(Subscribe),
    #[prost(message, tag = "9")]
    SubscribeAck(SubscribeAck),
    #[prost(message, tag = "10")]
    Unsubscribe(Unsubscribe),
    #[prost(message, tag = "11")]
    SyncError(SyncError),
}

#[derive(Clone, PartialEq, Message)]
pub struct Hello {
    /// Capability tokens (COSE bytes) presented by the sender.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub capabilities: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub filters: Vec<FilterSpec>,
    #[prost(uint64, tag = "3")]
    pub max_lamport: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct HelloAck {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub capabilities: Vec<Vec<u8>>,
    #[prost(uint32, repeated, tag = "2")]
    pub accepted_filters: Vec<u32>,
    #[prost(message, repeated, tag = "3")]
    pub rejected_filters: Vec<RejectedFilter>,
    #[prost(uint64, tag = "4")]
    pub max_lamport: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct FilterSpec {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "FilterKind", tags = "2, 3")]
    pub kind: Option<FilterKind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum FilterKind {
    /// The whole document.
    #[prost(bool, tag = "2")]
    All(bool),
    /// Children of one parent node (16 byte node id).
    #[prost(bytes, tag = "3")]
    Children(Vec<u8>),
}

#[derive(Clone, PartialEq, Message)]
pub struct RejectedFilter {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(enumeration = "ErrorCode", tag = "2")]
    pub reason: i32,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RibltCodewords {
    #[prost(uint32, tag = "1")]
    pub filter_id: u32,
    #[prost(uint32, tag = "2")]
    pub round: u32,
    #[prost(uint64, tag = "3")]
    pub start_index: u64,
    /// Empty from the decoding side: a request for the next round.
    #[prost(message, repeated, tag = "4")]
    pub codewords: Vec<Codeword>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Codeword {
    #[prost(sint64, tag = "1")]
    pub count: i64,
    #[prost(bytes, tag = "2")]
    pub key_sum: Vec<u8>,
    #[prost(bytes, tag = "3")]
    pub value_sum: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RibltStatus {
    #[prost(uint32, tag = "1")]
    pub filter_id: u32,
    #[prost(uint32, tag = "2")]
    pub round: u32,
    #[prost(oneof = "RibltOutcome", tags = "3, 4")]
    pub outcome: Option<RibltOutcome>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum RibltOutcome {
    #[prost(message, tag = "3")]
    Decoded(RibltDecoded),
    #[prost(message, tag = "4")]
    Failed(RibltFailed),
}

#[derive(Clone, PartialEq, Message)]
pub struct RibltDecoded {
    /// Op refs the codeword sender is missing.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub sender_missing: Vec<Vec<u8>>,
    /// Op refs the codeword receiver is missing.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub receiver_missing: Vec<Vec<u8>>,
    #[prost(uint64, tag = "3")]
    pub codewords_received: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct RibltFailed {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub reason: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct OpsBatch {
    #[prost(uint32, tag = "1")]
    pub filter_id: u32,
    #[prost(message, repeated, tag = "2")]
    pub ops: Vec<Operation>,
    /// Index-aligned with `ops`.
    #[prost(message, repeated, tag = "3")]
    pub auth: Vec<OperationAuth>,
    #[prost(bool, tag = "4")]
    pub done: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Operation {
    #[prost(message, optional, tag = "1")]
    pub meta: Option<OperationMetadata>,
    #[prost(oneof = "OperationKind", tags = "2, 3, 4, 5, 6")]
    pub kind: Option<OperationKind>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperationMetadata {
    #[prost(bytes, tag = "1")]
    pub replica: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub counter: u64,
    #[prost(uint64, tag = "3")]
    pub lamport: u64,
    /// Canonical CBOR known-state vector; empty when absent.
    #[prost(bytes, tag = "4")]
    pub known_state: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum OperationKind {
    #[prost(message, tag = "2")]
    Insert(InsertOp),
    #[prost(message, tag = "3")]
    Move(MoveOp),
    #[prost(message, tag = "4")]
    Delete(DeleteOp),
    #[prost(message, tag = "5")]
    Tombstone(TombstoneOp),
    #[prost(message, tag = "6")]
    Payload(PayloadOp),
}

#[derive(Clone, PartialEq, Message)]
pub struct InsertOp {
    #[prost(bytes, tag = "1")]
    pub parent: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub node: Vec<u8>,
    #[prost(bytes, tag = "3")]
    pub order_key: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct MoveOp {
    #[prost(bytes, tag = "1")]
    pub node: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub new_parent: Vec<u8>,
    #[prost(bytes, tag = "3")]
    pub order_key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeleteOp {
    #[prost(bytes, tag = "1")]
    pub node: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TombstoneOp {
    #[prost(bytes, tag = "1")]
    pub node: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadOp {
    #[prost(bytes, tag = "1")]
    pub node: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperationAuth {
    #[prost(bytes, tag = "1")]
    pub sig: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub proof_ref: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Subscribe {
    #[prost(uint32, tag = "1")]
    pub subscription_id: u32,
    #[prost(message, optional, tag = "2")]
    pub filter: Option<FilterSpec>,
    #[prost(uint32, tag = "3")]
    pub interval_ms: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeAck {
    #[prost(uint32, tag = "1")]
    pub subscription_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Unsubscribe {
    #[prost(uint32, tag = "1")]
    pub subscription_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct SyncError {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(uint32, optional, tag = "3")]
    pub filter_id: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub subscription_id: Option<u32>,
}

pub fn encode_message(msg: &SyncMessage) -> Vec<u8> {
    msg.encode_to_vec()
}

pub fn decode_message(bytes: &[u8]) -> Result<SyncMessage> {
    SyncMessage::decode(bytes).map_err(|err| anyhow!("wire decode: {}", err))
}

fn node_id(bytes: &[u8]) -> Result<NodeId> {
    let bytes: [u8; 16] = bytes
        .try_into()
        .map_err(|_| anyhow!("node id must be 16 bytes, got {}", bytes.len()))?;
    Ok(NodeId::new(bytes))
}

fn replica_id(bytes: &[u8]) -> Result<ReplicaId> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("replica id must be 32 bytes, got {}", bytes.len()))?;
    Ok(ReplicaId::new(bytes))
}

pub fn encode_op(signed: &SignedOp) -> Result<(Operation, OperationAuth)> {
    let meta = OperationMetadata {
        replica: signed.op.meta.dot.replica.as_bytes().to_vec(),
        counter: signed.op.meta.dot.counter,
        lamport: signed.op.meta.lamport,
        known_state: match &signed.op.meta.known_state {
            Some(state) => state.encode()?,
            None => Vec::new(),
        },
    };
    let kind = match &signed.op.kind {
        OpKind::Insert {
            parent,
            node,
            order_key,
            payload,
        } => OperationKind::Insert(InsertOp {
            parent: parent.as_bytes().to_vec(),
            node: node.as_bytes().to_vec(),
            order_key: order_key.as_bytes().to_vec(),
            payload: payload.clone(),
        }),
        OpKind::Move {
            node,
            new_parent,
            order_key,
        } => OperationKind::Move(MoveOp {
            node: node.as_bytes().to_vec(),
            new_parent: new_parent.as_bytes().to_vec(),
            order_key: order_key.as_bytes().to_vec(),
        }),
        OpKind::Delete { node } => OperationKind::Delete(DeleteOp {
            node: node.as_bytes().to_vec(),
        }),
        OpKind::Tombstone { node } => OperationKind::Tombstone(TombstoneOp {
            node: node.as_bytes().to_vec(),
        }),
        OpKind::Payload { node, payload } => OperationKind::Payload(PayloadOp {
            node: node.as_bytes().to_vec(),
            payload: payload.clone(),
        }),
    };
    let auth = OperationAuth {
        sig: signed.auth.sig.to_vec(),
        proof_ref: signed.auth.proof_ref.map(|id| id.as_bytes().to_vec()),
    };
    Ok((
        Operation {
            meta: Some(meta),
            kind: Some(kind),
        },
        auth,
    ))
}

pub fn decode_op(op: &Operation, auth: &OperationAuth) -> Result<SignedOp> {
    let meta = op
        .meta
        .as_ref()
        .ok_or_else(|| anyhow!("operation missing metadata"))?;
    let known_state = if meta.known_state.is_empty() {
        None
    } else {
        Some(KnownState::decode(&meta.known_state)?)
    };
    let kind = match op
        .kind
        .as_ref()
        .ok_or_else(|| anyhow!("operation missing kind"))?
    {
        OperationKind::Insert(insert) => OpKind::Insert {
            parent: node_id(&insert.parent)?,
            node: node_id(&insert.node)?,
            order_key: OrderKey::from(insert.order_key.as_slice()),
            payload: insert.payload.clone(),
        },
        OperationKind::Move(mv) => OpKind::Move {
            node: node_id(&mv.node)?,
            new_parent: node_id(&mv.new_parent)?,
            order_key: OrderKey::from(mv.order_key.as_slice()),
        },
        OperationKind::Delete(delete) => OpKind::Delete {
            node: node_id(&delete.node)?,
        },
        OperationKind::Tombstone(tombstone) => OpKind::Tombstone {
            node: node_id(&tombstone.node)?,
        },
        OperationKind::Payload(payload) => OpKind::Payload {
            node: node_id(&payload.node)?,
            payload: payload.payload.clone(),
        },
    };
    let sig: [u8; 64] = auth
        .sig
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("signature must be 64 bytes"))?;
    let proof_ref = match &auth.proof_ref {
        Some(bytes) => {
            let bytes: [u8; 16] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("proof ref must be 16 bytes"))?;
            Some(TokenId::new(bytes))
        }
        None => None,
    };
    Ok(SignedOp {
        op: Op {
            meta: OpMeta {
                dot: Dot::new(replica_id(&meta.replica)?, meta.counter),
                lamport: meta.lamport,
                known_state,
            },
            kind,
        },
        auth: OpAuth { sig, proof_ref },
    })
}

pub fn encode_codeword(cell: &CodedSymbol) -> Codeword {
    Codeword {
        count: cell.count,
        key_sum: cell.key_sum.to_vec(),
        value_sum: cell.value_sum.to_vec(),
    }
}

pub fn decode_codeword(cell: &Codeword) -> Result<CodedSymbol> {
    Ok(CodedSymbol {
        count: cell.count,
        key_sum: cell
            .key_sum
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("key sum must be 16 bytes"))?,
        value_sum: cell
            .value_sum
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("value sum must be 16 bytes"))?,
    })
}

/// Validates the envelope of a received message.
pub fn check_envelope(msg: &SyncMessage, doc_id: &str) -> Result<()> {
    if msg.v != VERSION {
        bail!("unsupported protocol version {}", msg.v);
    }
    if msg.doc_id != doc_id {
        bail!("message for doc {} on a session for {}", msg.doc_id, doc_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_crdt::{DocId, Keypair};

    #[test]
    fn op_wire_roundtrip_preserves_sig_input() {
        let keypair = Keypair::generate();
        let doc = DocId::new([1; 32]);
        let op = Op {
            meta: OpMeta {
                dot: Dot::new(keypair.replica_id(), 3),
                lamport: 9,
                known_state: None,
            },
            kind: OpKind::Insert {
                parent: NodeId::ROOT,
                node: NodeId::new([5; 16]),
                order_key: OrderKey::from(&b"\x40"[..]),
                payload: Some(b"payload".to_vec()),
            },
        };
        let sig = keypair.sign(&op.encode_sig_input(&doc).unwrap());
        let signed = SignedOp {
            op,
            auth: OpAuth {
                sig,
                proof_ref: None,
            },
        };
        let (wire_op, wire_auth) = encode_op(&signed).unwrap();
        let decoded = decode_op(&wire_op, &wire_auth).unwrap();
        assert_eq!(decoded, signed);
        assert_eq!(
            decoded.op.encode_sig_input(&doc).unwrap(),
            signed.op.encode_sig_input(&doc).unwrap()
        );
    }

    #[test]
    fn envelope_roundtrip() {
        let msg = SyncMessage {
            v: VERSION,
            doc_id: "doc".into(),
            payload: Some(Payload::Hello(Hello {
                capabilities: vec![b"token".to_vec()],
                filters: vec![FilterSpec {
                    id: 1,
                    kind: Some(FilterKind::All(true)),
                }],
                max_lamport: 42,
            })),
        };
        let bytes = encode_message(&msg);
        let decoded = decode_message(&bytes).unwrap();
        assert_eq!(decoded, msg);
        check_envelope(&decoded, "doc").unwrap();
        assert!(check_envelope(&decoded, "other").is_err());
    }

    #[test]
    fn bad_id_lengths_rejected() {
        let op = Operation {
            meta: Some(OperationMetadata {
                replica: vec![0; 31],
                counter: 1,
                lamport: 1,
                known_state: Vec::new(),
            }),
            kind: Some(OperationKind::Tombstone(TombstoneOp {
                node: vec![0; 16],
            })),
        };
        let auth = OperationAuth {
            sig: vec![0; 64],
            proof_ref: None,
        };
        assert!(decode_op(&op, &auth).is_err());
    }
}
