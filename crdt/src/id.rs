use anyhow::{anyhow, Result};

/// Identifier of a document. This is the public key of the keypair generated
/// when the document was created, which also acts as the root of authority
/// for capability tokens.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct DocId([u8; 32]);

impl DocId {
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<DocId> for [u8; 32] {
    fn from(id: DocId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 32]> for DocId {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut doc_id = [0; 44];
        base64::encode_config_slice(&self.0, base64::URL_SAFE, &mut doc_id);
        write!(f, "{}", std::str::from_utf8(&doc_id).expect("wtf?"))
    }
}

impl std::str::FromStr for DocId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 44 {
            return Err(anyhow!("invalid doc_id length {}", s.len()));
        }
        let mut doc_id = [0; 32];
        base64::decode_config_slice(s, base64::URL_SAFE, &mut doc_id)?;
        Ok(Self(doc_id))
    }
}

/// Identifier of a replica. This is the Ed25519 public key the replica signs
/// its operations with, and doubles as the author identity of an op.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ReplicaId([u8; 32]);

impl ReplicaId {
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<ReplicaId> for [u8; 32] {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 32]> for ReplicaId {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut replica_id = [0; 44];
        base64::encode_config_slice(&self.0, base64::URL_SAFE, &mut replica_id);
        write!(f, "{}", std::str::from_utf8(&replica_id).expect("wtf?"))
    }
}

impl std::str::FromStr for ReplicaId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 44 {
            return Err(anyhow!("invalid replica_id length {}", s.len()));
        }
        let mut replica_id = [0; 32];
        base64::decode_config_slice(s, base64::URL_SAFE, &mut replica_id)?;
        Ok(Self(replica_id))
    }
}

impl From<DocId> for ReplicaId {
    fn from(id: DocId) -> Self {
        Self::new(id.into())
    }
}

/// Identifier of a tree node.
///
/// Two values are reserved: [`NodeId::ROOT`] (all zero), the root every
/// document starts with, and [`NodeId::TRASH`] (all 0xff), the sink for
/// deletions.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct NodeId([u8; 16]);

impl NodeId {
    pub const ROOT: Self = Self([0; 16]);
    pub const TRASH: Self = Self([0xff; 16]);

    pub fn new(id: [u8; 16]) -> Self {
        Self(id)
    }

    /// Generates a fresh random node id.
    pub fn generate() -> Self {
        let mut id = [0; 16];
        getrandom::getrandom(&mut id).expect("csprng failure");
        Self(id)
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    pub fn is_trash(&self) -> bool {
        *self == Self::TRASH
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<NodeId> for [u8; 16] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 16]> for NodeId {
    fn as_ref(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_root() {
            write!(f, "ROOT")
        } else if self.is_trash() {
            write!(f, "TRASH")
        } else {
            write!(f, "{}", hex::encode(&self.0[0..2]))
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut node_id = [0; 24];
        base64::encode_config_slice(&self.0, base64::URL_SAFE, &mut node_id);
        write!(f, "{}", std::str::from_utf8(&node_id).expect("wtf?"))
    }
}

impl std::str::FromStr for NodeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 {
            return Err(anyhow!("invalid node_id length {}", s.len()));
        }
        let mut node_id = [0; 16];
        base64::decode_config_slice(s, base64::URL_SAFE, &mut node_id)?;
        Ok(Self(node_id))
    }
}

/// A dot is a version marker for a single replica and identifies an op.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(C)]
pub struct Dot {
    /// The replica identifier.
    pub replica: ReplicaId,
    /// The per-replica counter. Monotone and gap free for a replica on a
    /// given device.
    pub counter: u64,
}

impl Dot {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// Generate the successor of this dot.
    pub fn inc(&mut self) -> Self {
        let res = *self;
        self.counter += 1;
        res
    }
}

impl std::fmt::Debug for Dot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({:?},{})", self.replica, self.counter)
    }
}

impl std::fmt::Display for Dot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.replica, self.counter)
    }
}

impl From<(ReplicaId, u64)> for Dot {
    fn from(dot: (ReplicaId, u64)) -> Self {
        Self {
            replica: dot.0,
            counter: dot.1,
        }
    }
}

const OP_REF_DOMAIN: &[u8] = b"treecrdt/opref/v0";

/// Content hash identifying an operation. Derived from (doc, replica,
/// counter) so the same logical op hashes identically on every replica.
/// Serves as the reconciliation key during sync.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct OpRef([u8; 16]);

impl OpRef {
    pub fn new(id: [u8; 16]) -> Self {
        Self(id)
    }

    /// Derives the op ref of the op identified by `dot` within `doc`.
    pub fn derive(doc: &DocId, dot: &Dot) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(OP_REF_DOMAIN);
        hasher.update(doc.as_ref());
        hasher.update(dot.replica.as_ref());
        hasher.update(&dot.counter.to_be_bytes());
        let mut id = [0; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<OpRef> for [u8; 16] {
    fn from(id: OpRef) -> Self {
        id.0
    }
}

impl AsRef<[u8; 16]> for OpRef {
    fn as_ref(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for OpRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_str_roundtrip() {
        let node = NodeId::generate();
        let s = node.to_string();
        assert_eq!(s.parse::<NodeId>().unwrap(), node);
    }

    #[test]
    fn op_ref_is_stable() {
        let doc = DocId::new([7; 32]);
        let dot = Dot::new(ReplicaId::new([3; 32]), 42);
        assert_eq!(OpRef::derive(&doc, &dot), OpRef::derive(&doc, &dot));
        let other = Dot::new(ReplicaId::new([3; 32]), 43);
        assert_ne!(OpRef::derive(&doc, &dot), OpRef::derive(&doc, &other));
    }
}
