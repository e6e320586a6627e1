//! The op log and the materialized tree.
//!
//! Ops are stored once, keyed by their op ref, in a log ordered by
//! (lamport, replica, counter), the authoritative apply order. The
//! materialized view is derived state: any out-of-order arrival rebuilds it
//! from the sorted log, so eventual consistency holds under every delivery
//! permutation.
//!
//! Deletes are defensive. A delete carries the emitter's known state and
//! only tombstones children the emitter had seen; a concurrent child it
//! didn't know about stays live and pins its tombstoned ancestors visible.
//! The visibility rule for the whole view: a node is visible iff it is not
//! tombstoned or has at least one visible descendant.

use crate::clock::KnownState;
use crate::id::{DocId, Dot, NodeId, OpRef, ReplicaId};
use crate::op::{OpKind, OrderKey, SignedOp};
use crate::token::{Scope, ScopeDecision, ScopeEvaluator};
use anyhow::{anyhow, bail, Result};
use std::ops::Bound;

const META_HEAD: u8 = 0;
const META_COUNTER: u8 = 1;

/// Upper bound on parent chain walks. The cycle check keeps the tree
/// acyclic, this only guards against corrupt stores.
const MAX_WALK: usize = 65_536;

/// A materialized tree row.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeRow {
    /// None for nodes referenced by ops whose own insert hasn't arrived.
    pub parent: Option<NodeId>,
    pub order_key: OrderKey,
    pub tombstone: bool,
    /// Number of visible direct children. A tombstoned node with a visible
    /// child stays visible.
    pub vis_children: u32,
    /// Dot of the insert/move op that last attached this node, used to test
    /// coverage against a delete's known state.
    pub attach_dot: Option<Dot>,
    /// Dot of the op holding the current payload bytes.
    pub payload: Option<Dot>,
}

impl NodeRow {
    pub fn visible(&self) -> bool {
        !self.tombstone || self.vis_children > 0
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        let mut flags = 0u8;
        if self.parent.is_some() {
            flags |= 1;
        }
        if self.tombstone {
            flags |= 2;
        }
        if self.attach_dot.is_some() {
            flags |= 4;
        }
        if self.payload.is_some() {
            flags |= 8;
        }
        out.push(flags);
        if let Some(parent) = self.parent {
            out.extend_from_slice(parent.as_ref());
        }
        out.extend_from_slice(&self.vis_children.to_be_bytes());
        if let Some(dot) = self.attach_dot {
            out.extend_from_slice(dot.replica.as_ref());
            out.extend_from_slice(&dot.counter.to_be_bytes());
        }
        if let Some(dot) = self.payload {
            out.extend_from_slice(dot.replica.as_ref());
            out.extend_from_slice(&dot.counter.to_be_bytes());
        }
        out.extend_from_slice(self.order_key.as_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
            let slice = bytes
                .get(*pos..*pos + n)
                .ok_or_else(|| anyhow!("corrupt node row"))?;
            *pos += n;
            Ok(slice)
        }
        let flags = *bytes.first().ok_or_else(|| anyhow!("corrupt node row"))?;
        let mut pos = 1;
        let parent = if flags & 1 != 0 {
            Some(NodeId::new(take(bytes, &mut pos, 16)?.try_into().unwrap()))
        } else {
            None
        };
        let vis_children = u32::from_be_bytes(take(bytes, &mut pos, 4)?.try_into().unwrap());
        let attach_dot = if flags & 4 != 0 {
            let replica = ReplicaId::new(take(bytes, &mut pos, 32)?.try_into().unwrap());
            let counter = u64::from_be_bytes(take(bytes, &mut pos, 8)?.try_into().unwrap());
            Some(Dot::new(replica, counter))
        } else {
            None
        };
        let payload = if flags & 8 != 0 {
            let replica = ReplicaId::new(take(bytes, &mut pos, 32)?.try_into().unwrap());
            let counter = u64::from_be_bytes(take(bytes, &mut pos, 8)?.try_into().unwrap());
            Some(Dot::new(replica, counter))
        } else {
            None
        };
        let order_key = OrderKey::from(&bytes[pos..]);
        Ok(Self {
            parent,
            order_key,
            tombstone: flags & 2 != 0,
            vis_children,
            attach_dot,
            payload,
        })
    }
}

/// One row of a tree dump.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeEntry {
    pub node: NodeId,
    pub parent: Option<NodeId>,
    pub order_key: OrderKey,
    pub tombstone: bool,
}

/// One row of a children page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChildEntry {
    pub node: NodeId,
    pub order_key: OrderKey,
}

/// The tree engine: append-only op log plus materialized view.
#[derive(Clone)]
pub struct Engine {
    ops: sled::Tree,
    refs: sled::Tree,
    nodes: sled::Tree,
    children: sled::Tree,
    noderefs: sled::Tree,
    meta: sled::Tree,
}

fn log_suffix(dot: &Dot, lamport: u64) -> [u8; 48] {
    let mut key = [0; 48];
    key[..8].copy_from_slice(&lamport.to_be_bytes());
    key[8..40].copy_from_slice(dot.replica.as_ref());
    key[40..].copy_from_slice(&dot.counter.to_be_bytes());
    key
}

fn log_key(doc: &DocId, dot: &Dot, lamport: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(80);
    key.extend_from_slice(doc.as_ref());
    key.extend_from_slice(&log_suffix(dot, lamport));
    key
}

fn ref_key(doc: &DocId, op_ref: &OpRef) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(doc.as_ref());
    key.extend_from_slice(op_ref.as_ref());
    key
}

fn node_key(doc: &DocId, node: &NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(doc.as_ref());
    key.extend_from_slice(node.as_ref());
    key
}

fn child_key(doc: &DocId, parent: &NodeId, order_key: &OrderKey, node: &NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(64 + order_key.as_bytes().len());
    key.extend_from_slice(doc.as_ref());
    key.extend_from_slice(parent.as_ref());
    key.extend_from_slice(order_key.as_bytes());
    key.extend_from_slice(node.as_ref());
    key
}

fn node_ref_key(doc: &DocId, node: &NodeId, op_ref: &OpRef) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(doc.as_ref());
    key.extend_from_slice(node.as_ref());
    key.extend_from_slice(op_ref.as_ref());
    key
}

impl Engine {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            ops: db.open_tree("ops")?,
            refs: db.open_tree("refs")?,
            nodes: db.open_tree("nodes")?,
            children: db.open_tree("children")?,
            noderefs: db.open_tree("noderefs")?,
            meta: db.open_tree("meta")?,
        })
    }

    /// Appends one op. Idempotent by op ref; deletes without a known state
    /// snapshot are rejected outright since a rebuild could not replay their
    /// semantics faithfully.
    pub fn append(&self, doc: &DocId, signed: &SignedOp) -> Result<OpRef> {
        Ok(self.append_many(doc, std::slice::from_ref(signed))?[0])
    }

    /// Appends a batch. Validates everything before mutating anything so a
    /// bad op never leaves a half-applied batch behind.
    pub fn append_many(&self, doc: &DocId, ops: &[SignedOp]) -> Result<Vec<OpRef>> {
        for signed in ops {
            if matches!(signed.op.kind, OpKind::Delete { .. })
                && signed.op.meta.known_state.is_none()
            {
                bail!("delete op requires known_state");
            }
        }
        let out: Vec<OpRef> = ops
            .iter()
            .map(|signed| OpRef::derive(doc, &signed.op.dot()))
            .collect();

        let mut fresh: Vec<(usize, &SignedOp)> = Vec::with_capacity(ops.len());
        for (i, signed) in ops.iter().enumerate() {
            if self.refs.get(ref_key(doc, &out[i]))?.is_none()
                && !fresh.iter().any(|(j, _)| out[*j] == out[i])
            {
                fresh.push((i, signed));
            }
        }
        if fresh.is_empty() {
            return Ok(out);
        }
        fresh.sort_by(|(_, a), (_, b)| {
            (a.op.meta.lamport, a.op.dot().replica, a.op.dot().counter).cmp(&(
                b.op.meta.lamport,
                b.op.dot().replica,
                b.op.dot().counter,
            ))
        });

        let head = self.head_lamport(doc)?;
        let out_of_order = fresh[0].1.op.meta.lamport <= head && head > 0;

        for (i, signed) in fresh.iter() {
            let dot = signed.op.dot();
            let lamport = signed.op.meta.lamport;
            self.ops
                .insert(log_key(doc, &dot, lamport), signed.encode()?)?;
            self.refs
                .insert(ref_key(doc, &out[*i]), &log_suffix(&dot, lamport)[..])?;
            let counter_key = self.counter_key(doc, &dot.replica);
            let prev = self
                .meta
                .get(&counter_key)?
                .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap()))
                .unwrap_or_default();
            if dot.counter > prev {
                self.meta
                    .insert(counter_key, &dot.counter.to_be_bytes()[..])?;
            }
            let max = lamport.max(self.head_lamport(doc)?);
            self.meta
                .insert(self.head_key(doc), &max.to_be_bytes()[..])?;
        }

        if out_of_order {
            tracing::debug!("out of order arrival for {:?}, rebuilding", doc);
            self.rebuild(doc)?;
        } else {
            for (i, signed) in fresh.iter() {
                self.apply(doc, signed, &out[*i])?;
            }
        }
        Ok(out)
    }

    fn head_key(&self, doc: &DocId) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.extend_from_slice(doc.as_ref());
        key.push(META_HEAD);
        key
    }

    fn counter_key(&self, doc: &DocId, replica: &ReplicaId) -> Vec<u8> {
        let mut key = Vec::with_capacity(65);
        key.extend_from_slice(doc.as_ref());
        key.push(META_COUNTER);
        key.extend_from_slice(replica.as_ref());
        key
    }

    pub fn head_lamport(&self, doc: &DocId) -> Result<u64> {
        Ok(self
            .meta
            .get(self.head_key(doc))?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap()))
            .unwrap_or_default())
    }

    pub fn replica_max_counter(&self, doc: &DocId, replica: &ReplicaId) -> Result<u64> {
        Ok(self
            .meta
            .get(self.counter_key(doc, replica))?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap()))
            .unwrap_or_default())
    }

    /// Version vector over every op in the log, captured when emitting a
    /// delete.
    pub fn known_state(&self, doc: &DocId) -> Result<KnownState> {
        let mut state = KnownState::new();
        for entry in self.ops.scan_prefix(doc.as_ref()) {
            let (key, _) = entry?;
            let replica = ReplicaId::new(key[40..72].try_into().unwrap());
            let counter = u64::from_be_bytes(key[72..80].try_into().unwrap());
            state.insert(Dot::new(replica, counter));
        }
        Ok(state)
    }

    pub fn ops_all(&self, doc: &DocId) -> Result<Vec<SignedOp>> {
        self.ops
            .scan_prefix(doc.as_ref())
            .map(|entry| {
                let (_, value) = entry?;
                SignedOp::decode(&value)
            })
            .collect()
    }

    pub fn ops_since(&self, doc: &DocId, lamport: u64) -> Result<Vec<SignedOp>> {
        let mut start = Vec::with_capacity(40);
        start.extend_from_slice(doc.as_ref());
        start.extend_from_slice(&(lamport + 1).to_be_bytes());
        self.ops
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|entry| match entry {
                Ok((key, _)) => key.starts_with(doc.as_ref()),
                Err(_) => true,
            })
            .map(|entry| {
                let (_, value) = entry?;
                SignedOp::decode(&value)
            })
            .collect()
    }

    pub fn ops_get(&self, doc: &DocId, refs: &[OpRef]) -> Result<Vec<SignedOp>> {
        let mut out = Vec::with_capacity(refs.len());
        for op_ref in refs {
            if let Some(suffix) = self.refs.get(ref_key(doc, op_ref))? {
                let mut key = Vec::with_capacity(80);
                key.extend_from_slice(doc.as_ref());
                key.extend_from_slice(&suffix);
                let value = self
                    .ops
                    .get(key)?
                    .ok_or_else(|| anyhow!("op ref without log entry"))?;
                out.push(SignedOp::decode(&value)?);
            }
        }
        Ok(out)
    }

    pub fn op_refs_all(&self, doc: &DocId) -> Result<Vec<OpRef>> {
        self.refs
            .scan_prefix(doc.as_ref())
            .map(|entry| {
                let (key, _) = entry?;
                Ok(OpRef::new(key[32..48].try_into().unwrap()))
            })
            .collect()
    }

    /// Op refs whose target node currently sits under `parent`. After a
    /// move, a node's whole history (including its last payload op) is
    /// reachable under its new parent, which is what lets a child-scoped
    /// pull reconstruct state.
    pub fn op_refs_children(&self, doc: &DocId, parent: &NodeId) -> Result<Vec<OpRef>> {
        let mut out = Vec::new();
        let mut prefix = Vec::with_capacity(48);
        prefix.extend_from_slice(doc.as_ref());
        prefix.extend_from_slice(parent.as_ref());
        for entry in self.children.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let node = NodeId::new(key[key.len() - 16..].try_into().unwrap());
            for entry in self.noderefs.scan_prefix(node_key(doc, &node)) {
                let (key, _) = entry?;
                out.push(OpRef::new(key[48..64].try_into().unwrap()));
            }
        }
        Ok(out)
    }

    /// Visible children of `parent`, ordered by (order_key, node).
    pub fn children(&self, doc: &DocId, parent: &NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut prefix = Vec::with_capacity(48);
        prefix.extend_from_slice(doc.as_ref());
        prefix.extend_from_slice(parent.as_ref());
        for entry in self.children.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let node = NodeId::new(key[key.len() - 16..].try_into().unwrap());
            let row = self
                .load(doc, &node)?
                .ok_or_else(|| anyhow!("child index without row"))?;
            if row.visible() {
                out.push(node);
            }
        }
        Ok(out)
    }

    /// Keyset-paginated visible children. The cursor is the (order_key,
    /// node) of the last row of the previous page.
    pub fn children_page(
        &self,
        doc: &DocId,
        parent: &NodeId,
        cursor: Option<(&OrderKey, &NodeId)>,
        limit: usize,
    ) -> Result<Vec<ChildEntry>> {
        let mut prefix = Vec::with_capacity(48);
        prefix.extend_from_slice(doc.as_ref());
        prefix.extend_from_slice(parent.as_ref());
        let start = match cursor {
            Some((order_key, node)) => Bound::Excluded(child_key(doc, parent, order_key, node)),
            None => Bound::Included(prefix.clone()),
        };
        let mut out = Vec::new();
        for entry in self.children.range((start, Bound::Unbounded)) {
            let (key, _) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let node = NodeId::new(key[key.len() - 16..].try_into().unwrap());
            let order_key = OrderKey::from(&key[48..key.len() - 16]);
            let row = self
                .load(doc, &node)?
                .ok_or_else(|| anyhow!("child index without row"))?;
            if row.visible() {
                out.push(ChildEntry { node, order_key });
                if out.len() == limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Every materialized row, tombstones included.
    pub fn dump(&self, doc: &DocId) -> Result<Vec<TreeEntry>> {
        self.nodes
            .scan_prefix(doc.as_ref())
            .map(|entry| {
                let (key, value) = entry?;
                let row = NodeRow::decode(&value)?;
                Ok(TreeEntry {
                    node: NodeId::new(key[32..48].try_into().unwrap()),
                    parent: row.parent,
                    order_key: row.order_key,
                    tombstone: row.tombstone,
                })
            })
            .collect()
    }

    pub fn node_count(&self, doc: &DocId) -> Result<u64> {
        let mut count = 0;
        for entry in self.nodes.scan_prefix(doc.as_ref()) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn node_row(&self, doc: &DocId, node: &NodeId) -> Result<Option<NodeRow>> {
        self.load(doc, node)
    }

    /// Payload bytes currently attached to `node`, straight from the log.
    pub fn payload(&self, doc: &DocId, node: &NodeId) -> Result<Option<Vec<u8>>> {
        let row = match self.load(doc, node)? {
            Some(row) => row,
            None => return Ok(None),
        };
        let dot = match row.payload {
            Some(dot) => dot,
            None => return Ok(None),
        };
        let ops = self.ops_get(doc, &[OpRef::derive(doc, &dot)])?;
        let op = ops.first().ok_or_else(|| anyhow!("dangling payload dot"))?;
        Ok(match &op.op.kind {
            OpKind::Insert { payload, .. } => payload.clone(),
            OpKind::Payload { payload, .. } => payload.clone(),
            _ => None,
        })
    }

    /// A scope evaluator over this doc's materialized tree.
    pub fn tree_view(&self, doc: DocId) -> TreeView<'_> {
        TreeView { engine: self, doc }
    }

    /// Watches the doc's log for appends. Fires on every new op, which is
    /// what wakes live subscriptions.
    pub fn watch(&self, doc: &DocId) -> sled::Subscriber {
        self.ops.watch_prefix(doc.as_ref())
    }

    /// Drops and replays the materialized view from the sorted log.
    pub fn rebuild(&self, doc: &DocId) -> Result<()> {
        for tree in [&self.nodes, &self.children, &self.noderefs] {
            let keys: Vec<_> = tree
                .scan_prefix(doc.as_ref())
                .map(|entry| entry.map(|(key, _)| key))
                .collect::<Result<_, _>>()?;
            for key in keys {
                tree.remove(key)?;
            }
        }
        for entry in self.ops.scan_prefix(doc.as_ref()) {
            let (_, value) = entry?;
            let signed = SignedOp::decode(&value)?;
            let op_ref = OpRef::derive(doc, &signed.op.dot());
            self.apply(doc, &signed, &op_ref)?;
        }
        Ok(())
    }

    fn load(&self, doc: &DocId, node: &NodeId) -> Result<Option<NodeRow>> {
        Ok(match self.nodes.get(node_key(doc, node))? {
            Some(value) => Some(NodeRow::decode(&value)?),
            None => None,
        })
    }

    fn store(&self, doc: &DocId, node: &NodeId, row: &NodeRow) -> Result<()> {
        self.nodes.insert(node_key(doc, node), row.encode())?;
        Ok(())
    }

    /// Adjusts a parent's visible-children count and cascades further up
    /// when the parent's own visibility flips.
    fn propagate(&self, doc: &DocId, node: &NodeId, delta: i32) -> Result<()> {
        let mut cur = *node;
        let mut delta = delta;
        for _ in 0..MAX_WALK {
            if cur.is_root() || delta == 0 {
                return Ok(());
            }
            let mut row = match self.load(doc, &cur)? {
                Some(row) => row,
                None => return Ok(()),
            };
            let was = row.visible();
            row.vis_children = (row.vis_children as i64 + delta as i64).max(0) as u32;
            let now = row.visible();
            self.store(doc, &cur, &row)?;
            if was == now {
                return Ok(());
            }
            delta = if now { 1 } else { -1 };
            cur = match row.parent {
                Some(parent) => parent,
                None => return Ok(()),
            };
        }
        bail!("parent chain too deep");
    }

    /// Removes `node` from its parent's child index, updating counts.
    fn detach(&self, doc: &DocId, node: &NodeId, row: &NodeRow) -> Result<()> {
        if let Some(parent) = row.parent {
            self.children
                .remove(child_key(doc, &parent, &row.order_key, node))?;
            if row.visible() {
                self.propagate(doc, &parent, -1)?;
            }
        }
        Ok(())
    }

    /// Inserts `node` into its parent's child index, updating counts.
    fn attach(&self, doc: &DocId, node: &NodeId, row: &NodeRow) -> Result<()> {
        if let Some(parent) = row.parent {
            self.children
                .insert(child_key(doc, &parent, &row.order_key, node), &[])?;
            if row.visible() {
                self.propagate(doc, &parent, 1)?;
            }
        }
        Ok(())
    }

    /// Flips a node's tombstone flag, keeping ancestor counts in step.
    fn set_tombstone(&self, doc: &DocId, node: &NodeId, tombstone: bool) -> Result<()> {
        if node.is_root() {
            return Ok(());
        }
        let mut row = self.load(doc, node)?.unwrap_or_default();
        if row.tombstone == tombstone {
            return Ok(());
        }
        let was = row.visible();
        row.tombstone = tombstone;
        let now = row.visible();
        self.store(doc, node, &row)?;
        if was != now {
            if let Some(parent) = row.parent {
                self.propagate(doc, &parent, if now { 1 } else { -1 })?;
            }
        }
        Ok(())
    }

    /// Clears tombstones on the whole parent chain. Ran for the target
    /// parent of an insert or move so the restored node is reachable again.
    fn restore_chain(&self, doc: &DocId, node: &NodeId) -> Result<()> {
        let mut cur = *node;
        for _ in 0..MAX_WALK {
            if cur.is_root() {
                return Ok(());
            }
            self.set_tombstone(doc, &cur, false)?;
            cur = match self.load(doc, &cur)?.and_then(|row| row.parent) {
                Some(parent) => parent,
                None => return Ok(()),
            };
        }
        bail!("parent chain too deep");
    }

    /// Would making `node` a child of `new_parent` create a cycle?
    fn creates_cycle(&self, doc: &DocId, node: &NodeId, new_parent: &NodeId) -> Result<bool> {
        let mut cur = *new_parent;
        for _ in 0..MAX_WALK {
            if cur == *node {
                return Ok(true);
            }
            if cur.is_root() {
                return Ok(false);
            }
            cur = match self.load(doc, &cur)?.and_then(|row| row.parent) {
                Some(parent) => parent,
                None => return Ok(false),
            };
        }
        bail!("parent chain too deep");
    }

    /// Makes sure a row exists for `parent` so children can hang off it
    /// before its own insert arrives.
    fn ensure_row(&self, doc: &DocId, node: &NodeId) -> Result<()> {
        if node.is_root() || node.is_trash() {
            return Ok(());
        }
        if self.load(doc, node)?.is_none() {
            self.store(doc, node, &NodeRow::default())?;
        }
        Ok(())
    }

    fn attach_node(
        &self,
        doc: &DocId,
        node: &NodeId,
        parent: NodeId,
        order_key: &OrderKey,
        dot: Dot,
    ) -> Result<()> {
        let mut row = self.load(doc, node)?.unwrap_or_default();
        self.detach(doc, node, &row)?;
        row.parent = Some(parent);
        row.order_key = order_key.clone();
        row.tombstone = false;
        row.attach_dot = Some(dot);
        self.store(doc, node, &row)?;
        self.ensure_row(doc, &parent)?;
        self.restore_chain(doc, &parent)?;
        self.attach(doc, node, &row)?;
        Ok(())
    }

    fn delete_rec(&self, doc: &DocId, node: &NodeId, known_state: &KnownState) -> Result<()> {
        self.set_tombstone(doc, node, true)?;
        let mut prefix = Vec::with_capacity(48);
        prefix.extend_from_slice(doc.as_ref());
        prefix.extend_from_slice(node.as_ref());
        let children: Vec<NodeId> = self
            .children
            .scan_prefix(&prefix)
            .map(|entry| entry.map(|(key, _)| NodeId::new(key[key.len() - 16..].try_into().unwrap())))
            .collect::<Result<_, _>>()?;
        for child in children {
            let covered = self
                .load(doc, &child)?
                .and_then(|row| row.attach_dot)
                .map(|dot| known_state.covers(&dot))
                .unwrap_or(false);
            if covered {
                self.delete_rec(doc, &child, known_state)?;
            }
            // an uncovered child is concurrent: it stays live and pins this
            // node visible
        }
        Ok(())
    }

    fn apply(&self, doc: &DocId, signed: &SignedOp, op_ref: &OpRef) -> Result<()> {
        let op = &signed.op;
        self.noderefs
            .insert(node_ref_key(doc, &op.kind.node(), op_ref), &[])?;
        match &op.kind {
            OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            } => {
                if node.is_root() || node.is_trash() {
                    return Ok(());
                }
                if let Some(row) = self.load(doc, node)? {
                    if !row.tombstone && row.parent.is_some() {
                        // live already, idempotent
                        return Ok(());
                    }
                }
                self.attach_node(doc, node, *parent, order_key, op.dot())?;
                if payload.is_some() {
                    let mut row = self.load(doc, node)?.unwrap();
                    row.payload = Some(op.dot());
                    self.store(doc, node, &row)?;
                }
            }
            OpKind::Move {
                node,
                new_parent,
                order_key,
            } => {
                if node.is_root() || node.is_trash() {
                    return Ok(());
                }
                if self.creates_cycle(doc, node, new_parent)? {
                    tracing::debug!("move of {:?} under {:?} would cycle, dropped", node, new_parent);
                    return Ok(());
                }
                self.attach_node(doc, node, *new_parent, order_key, op.dot())?;
            }
            OpKind::Delete { node } => {
                if node.is_root() {
                    return Ok(());
                }
                let known_state = op
                    .meta
                    .known_state
                    .as_ref()
                    .ok_or_else(|| anyhow!("delete op requires known_state"))?;
                self.ensure_row(doc, node)?;
                self.delete_rec(doc, node, known_state)?;
            }
            OpKind::Tombstone { node } => {
                if node.is_root() {
                    return Ok(());
                }
                self.ensure_row(doc, node)?;
                self.set_tombstone(doc, node, true)?;
            }
            OpKind::Payload { node, payload } => {
                if let Some(mut row) = self.load(doc, node)? {
                    row.payload = payload.as_ref().map(|_| op.dot());
                    self.store(doc, node, &row)?;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

/// Scope evaluation over the materialized tree: walk parents from the
/// target. Hitting an excluded node denies, reaching the scope root within
/// the depth budget allows, walking off the known tree is unknown.
pub struct TreeView<'a> {
    engine: &'a Engine,
    doc: DocId,
}

impl<'a> ScopeEvaluator for TreeView<'a> {
    fn evaluate(&self, scope: &Scope, node: NodeId) -> ScopeDecision {
        if scope.is_doc_wide() {
            // nothing to exclude and no depth bound, the walk can't change
            // the answer even for nodes whose position is still unknown
            return ScopeDecision::Allow { depth: 0 };
        }
        let mut cur = node;
        let mut depth = 0u32;
        for _ in 0..MAX_WALK {
            if scope.exclude.contains(&cur) {
                return ScopeDecision::Deny;
            }
            if cur == scope.root {
                return if scope.max_depth.map_or(true, |max| depth <= max) {
                    ScopeDecision::Allow { depth }
                } else {
                    ScopeDecision::Deny
                };
            }
            if cur.is_root() {
                // walked past the scope root to the top of the tree
                return ScopeDecision::Deny;
            }
            let row = match self.engine.load(&self.doc, &cur) {
                Ok(Some(row)) => row,
                Ok(None) => return ScopeDecision::Unknown,
                Err(err) => {
                    tracing::error!("scope walk failed: {}", err);
                    return ScopeDecision::Unknown;
                }
            };
            cur = match row.parent {
                Some(parent) => parent,
                None => return ScopeDecision::Unknown,
            };
            depth += 1;
        }
        ScopeDecision::Unknown
    }
}
