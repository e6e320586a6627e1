//! Pending-ops store.
//!
//! An op whose signature checks out but whose scope evaluation came back
//! unknown is parked here instead of being dropped. Whenever an apply lands
//! new tree context, the parked ops are replayed; the ones that become
//! decidable either apply or get discarded.

use crate::id::{DocId, OpRef};
use crate::op::SignedOp;
use anyhow::{anyhow, Result};

#[derive(Clone)]
pub struct PendingStore {
    tree: sled::Tree,
}

#[derive(Clone, Debug)]
pub struct PendingOp {
    pub op_ref: OpRef,
    pub signed: SignedOp,
    pub message: String,
}

fn pending_key(doc: &DocId, op_ref: &OpRef) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(doc.as_ref());
    key.extend_from_slice(op_ref.as_ref());
    key
}

impl PendingStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn add(&self, doc: &DocId, op_ref: &OpRef, signed: &SignedOp, message: &str) -> Result<()> {
        let op = signed.encode()?;
        let mut value = Vec::with_capacity(4 + op.len() + message.len());
        value.extend_from_slice(&(op.len() as u32).to_be_bytes());
        value.extend_from_slice(&op);
        value.extend_from_slice(message.as_bytes());
        self.tree.insert(pending_key(doc, op_ref), value)?;
        Ok(())
    }

    pub fn remove(&self, doc: &DocId, op_ref: &OpRef) -> Result<()> {
        self.tree.remove(pending_key(doc, op_ref))?;
        Ok(())
    }

    pub fn all(&self, doc: &DocId) -> Result<Vec<PendingOp>> {
        self.tree
            .scan_prefix(doc.as_ref())
            .map(|entry| {
                let (key, value) = entry?;
                let op_ref = OpRef::new(key[32..48].try_into().unwrap());
                let len = u32::from_be_bytes(
                    value
                        .get(..4)
                        .ok_or_else(|| anyhow!("corrupt pending record"))?
                        .try_into()
                        .unwrap(),
                ) as usize;
                let op = value
                    .get(4..4 + len)
                    .ok_or_else(|| anyhow!("corrupt pending record"))?;
                let message = String::from_utf8_lossy(&value[4 + len..]).into_owned();
                Ok(PendingOp {
                    op_ref,
                    signed: SignedOp::decode(op)?,
                    message,
                })
            })
            .collect()
    }

    pub fn len(&self, doc: &DocId) -> usize {
        self.tree.scan_prefix(doc.as_ref()).count()
    }

    pub fn is_empty(&self, doc: &DocId) -> bool {
        self.len(doc) == 0
    }
}

impl std::fmt::Debug for PendingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PendingStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Dot, NodeId, ReplicaId};
    use crate::op::{Op, OpAuth, OpKind, OpMeta};

    #[test]
    fn park_and_replay_roundtrip() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = PendingStore::new(db.open_tree("pending").unwrap());
        let doc = DocId::new([1; 32]);
        let signed = SignedOp {
            op: Op {
                meta: OpMeta {
                    dot: Dot::new(ReplicaId::new([2; 32]), 1),
                    lamport: 7,
                    known_state: None,
                },
                kind: OpKind::Tombstone {
                    node: NodeId::new([3; 16]),
                },
            },
            auth: OpAuth {
                sig: [9; 64],
                proof_ref: None,
            },
        };
        let op_ref = OpRef::derive(&doc, &signed.op.dot());
        store.add(&doc, &op_ref, &signed, "missing_context").unwrap();
        assert_eq!(store.len(&doc), 1);

        let parked = store.all(&doc).unwrap();
        assert_eq!(parked[0].signed, signed);
        assert_eq!(parked[0].message, "missing_context");
        assert_eq!(parked[0].op_ref, op_ref);

        store.remove(&doc, &op_ref).unwrap();
        assert!(store.is_empty(&doc));
    }
}
