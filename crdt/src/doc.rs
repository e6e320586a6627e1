//! Backend, frontend and document handles.
//!
//! The [`Backend`] owns the sled database and wires the engine, keystore,
//! token store and pending-ops store together. A clonable [`Frontend`]
//! hands out [`Doc`] handles which append local ops, run queries, and
//! transparently encrypt and decrypt payload bytes through the doc's
//! keyring.

use crate::auth::{self, Disposition, TokenStore, Verifier};
use crate::clock::KnownState;
use crate::cose;
use crate::crypto::Keypair;
use crate::engine::{ChildEntry, Engine, TreeEntry};
use crate::id::{DocId, Dot, NodeId, OpRef, ReplicaId};
use crate::keystore::{BlobKind, Decrypted, Keyring, Keystore};
use crate::op::{Op, OpKind, OpMeta, OrderKey, SignedOp};
use crate::order;
use crate::pending::PendingStore;
use crate::token::{Action, CapToken, Capability, Scope, TokenClaims, TokenId};
use anyhow::{anyhow, Result};
use ciborium::value::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const DOC_REPLICA: u8 = 0;
const DOC_ISSUER: u8 = 2;
const DEFAULT_EPOCH: &str = "epoch-1";

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn system_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Clone)]
struct Docs(sled::Tree);

impl Docs {
    fn new(tree: sled::Tree) -> Self {
        Self(tree)
    }

    fn docs(&self) -> impl Iterator<Item = Result<DocId>> + '_ {
        self.0.iter().filter_map(|entry| match entry {
            Ok((k, _)) if k.len() == 33 && k[32] == DOC_REPLICA => {
                Some(Ok(DocId::new(k[..32].try_into().unwrap())))
            }
            Ok(_) => None,
            Err(err) => Some(Err(err.into())),
        })
    }

    fn replica_id(&self, doc: &DocId) -> Result<ReplicaId> {
        let mut key = [0; 33];
        key[..32].copy_from_slice(doc.as_ref());
        key[32] = DOC_REPLICA;
        let v = self
            .0
            .get(key)?
            .ok_or_else(|| anyhow!("{:?} doesn't have an associated replica", doc))?;
        Ok(ReplicaId::new(v.as_ref().try_into().unwrap()))
    }

    fn set_replica_id(&self, doc: &DocId, replica: &ReplicaId) -> Result<()> {
        let mut key = [0; 33];
        key[..32].copy_from_slice(doc.as_ref());
        key[32] = DOC_REPLICA;
        self.0.insert(key, replica.as_ref())?;
        Ok(())
    }

    fn add_trusted_issuer(&self, doc: &DocId, issuer: &ReplicaId) -> Result<()> {
        let mut key = [0; 65];
        key[..32].copy_from_slice(doc.as_ref());
        key[32] = DOC_ISSUER;
        key[33..].copy_from_slice(issuer.as_ref());
        self.0.insert(&key[..], &[])?;
        Ok(())
    }

    /// The doc id itself is always trusted: it is the issuer's public key.
    fn trusted_issuers(&self, doc: &DocId) -> Result<Vec<ReplicaId>> {
        let mut issuers = vec![ReplicaId::from(*doc)];
        let mut prefix = [0; 33];
        prefix[..32].copy_from_slice(doc.as_ref());
        prefix[32] = DOC_ISSUER;
        for entry in self.0.scan_prefix(&prefix[..]) {
            let (key, _) = entry?;
            issuers.push(ReplicaId::new(key[33..65].try_into().unwrap()));
        }
        Ok(issuers)
    }
}

/// Summary of a remote batch application.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Applied {
    pub applied: usize,
    pub pending: usize,
}

/// The main entry point to this crate.
pub struct Backend {
    #[allow(dead_code)]
    db: sled::Db,
    engine: Engine,
    keystore: Arc<Keystore>,
    tokens: TokenStore,
    pending: PendingStore,
    docs: Docs,
    clock: Clock,
}

impl Backend {
    /// Creates a new [`Backend`] from a [`sled::Db`].
    pub fn new(db: sled::Db) -> Result<Self> {
        let engine = Engine::new(&db)?;
        let keystore = Arc::new(Keystore::new(db.open_tree("secrets")?)?);
        let pending = PendingStore::new(db.open_tree("pending")?);
        let docs = Docs::new(db.open_tree("docs")?);
        Ok(Self {
            db,
            engine,
            keystore,
            tokens: TokenStore::new(),
            pending,
            docs,
            clock: Arc::new(system_clock),
        })
    }

    /// Creates a new in-memory backend for testing purposes.
    #[cfg(test)]
    pub fn memory() -> Result<Self> {
        use tracing_subscriber::EnvFilter;
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        log_panics::init();
        Self::new(sled::Config::new().temporary(true).open()?)
    }

    /// Replaces the injected clock used for token exp/nbf checks.
    pub fn set_clock(&mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) {
        self.clock = Arc::new(clock);
    }

    /// Returns a clonable [`Frontend`].
    pub fn frontend(&self) -> Frontend {
        Frontend {
            engine: self.engine.clone(),
            keystore: self.keystore.clone(),
            tokens: self.tokens.clone(),
            pending: self.pending.clone(),
            docs: self.docs.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("engine", &self.engine)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

/// Clonable handle to the backend's state.
#[derive(Clone)]
pub struct Frontend {
    engine: Engine,
    keystore: Arc<Keystore>,
    tokens: TokenStore,
    pending: PendingStore,
    docs: Docs,
    clock: Clock,
}

impl Frontend {
    /// Returns an iterator of known [`DocId`]s.
    pub fn docs(&self) -> impl Iterator<Item = Result<DocId>> + '_ {
        self.docs.docs()
    }

    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Creates a new document. Generates the issuer keypair (whose public
    /// key becomes the doc id), a payload keyring, and a self-issued
    /// doc-wide capability for the local replica; everything secret is
    /// sealed into the keystore.
    pub fn create_doc(&self, keypair: Keypair) -> Result<Doc> {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let replica = keypair.replica_id();

        let token = CapToken::issue(
            &issuer,
            TokenClaims::new(
                doc,
                replica,
                vec![Capability {
                    doc,
                    scope: Scope::doc_wide(),
                    actions: Action::ALL.into_iter().collect(),
                }],
            ),
        )?;
        self.tokens.add(&doc, token.clone());

        let keyring = Keyring::new(DEFAULT_EPOCH)?;
        let bundle = cose::encode(&cose::canonical_map(vec![
            (
                Value::Text("issuer".into()),
                Value::Bytes(<[u8; 32]>::from(issuer).to_vec()),
            ),
            (
                Value::Text("replica".into()),
                Value::Bytes(<[u8; 32]>::from(keypair).to_vec()),
            ),
        ])?)?;
        self.keystore
            .seal_blob(&doc, BlobKind::DocKeyBundle, None, &bundle)?;
        self.keystore
            .seal_blob(&doc, BlobKind::IssuerKey, None, &<[u8; 32]>::from(issuer))?;
        self.keystore
            .seal_blob(&doc, BlobKind::DocPayloadKey, None, &keyring.encode()?)?;
        self.seal_identity(&doc, &keypair, &[token])?;

        self.docs.set_replica_id(&doc, &replica)?;
        Ok(Doc {
            doc,
            frontend: self.clone(),
            keypair,
        })
    }

    /// Adds an existing document, associating the local keypair. Tokens for
    /// the local replica arrive out of band and are installed with
    /// [`Doc::add_token`].
    pub fn add_doc(&self, doc: DocId, keypair: Keypair) -> Result<Doc> {
        self.docs.set_replica_id(&doc, &keypair.replica_id())?;
        self.seal_identity(&doc, &keypair, &[])?;
        Ok(Doc {
            doc,
            frontend: self.clone(),
            keypair,
        })
    }

    /// Opens a previously created or added document.
    pub fn doc(&self, doc: DocId) -> Result<Doc> {
        let replica = self.docs.replica_id(&doc)?;
        let identity = self
            .keystore
            .open_blob(&doc, BlobKind::LocalIdentity, Some(replica.as_ref().as_slice()))?
            .ok_or_else(|| anyhow!("no local identity for {:?}", doc))?;
        let (keypair, tokens) = decode_identity(&identity)?;
        for token in tokens {
            self.tokens.add(&doc, token);
        }
        Ok(Doc {
            doc,
            frontend: self.clone(),
            keypair,
        })
    }

    fn seal_identity(&self, doc: &DocId, keypair: &Keypair, tokens: &[CapToken]) -> Result<()> {
        let tokens = tokens
            .iter()
            .map(|t| Value::Bytes(t.as_bytes().to_vec()))
            .collect();
        let identity = cose::encode(&cose::canonical_map(vec![
            (
                Value::Text("replica".into()),
                Value::Bytes(<[u8; 32]>::from(*keypair).to_vec()),
            ),
            (Value::Text("tokens".into()), Value::Array(tokens)),
        ])?)?;
        let replica = keypair.replica_id();
        self.keystore.seal_blob(
            doc,
            BlobKind::LocalIdentity,
            Some(replica.as_ref().as_slice()),
            &identity,
        )
    }

    pub fn add_trusted_issuer(&self, doc: &DocId, issuer: &ReplicaId) -> Result<()> {
        self.docs.add_trusted_issuer(doc, issuer)
    }

    pub fn keyring(&self, doc: &DocId) -> Result<Option<Keyring>> {
        Ok(
            match self.keystore.open_blob(doc, BlobKind::DocPayloadKey, None)? {
                Some(bytes) => Some(Keyring::decode(&bytes)?),
                None => None,
            },
        )
    }

    pub fn set_keyring(&self, doc: &DocId, keyring: &Keyring) -> Result<()> {
        self.keystore
            .seal_blob(doc, BlobKind::DocPayloadKey, None, &keyring.encode()?)
    }

    /// Direct access to the tree engine, mostly for the sync layer.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Watches a doc's log; fires on every append. Live subscriptions hang
    /// off this instead of polling.
    pub fn watch(&self, doc: &DocId) -> sled::Subscriber {
        self.engine.watch(doc)
    }

    /// Verifies and applies a batch received from a peer. Denials fail the
    /// whole batch; ops lacking scope context are parked and replayed as
    /// context arrives.
    pub fn apply_remote(&self, doc: &DocId, ops: &[SignedOp]) -> Result<Applied> {
        let verifier = Verifier {
            doc: *doc,
            store: &self.tokens,
            trusted_issuers: self.docs.trusted_issuers(doc)?,
            now: self.now(),
            require_proof_ref: false,
        };
        let view = self.engine.tree_view(*doc);
        let engine = self.engine.clone();
        let parent_of = move |node: &NodeId| {
            engine
                .node_row(doc, node)
                .ok()
                .flatten()
                .and_then(|row| row.parent)
        };
        let dispositions = verifier.verify_batch(ops, &view, &parent_of)?;

        let mut to_apply = Vec::new();
        let mut parked = 0;
        for (signed, disposition) in ops.iter().zip(dispositions) {
            match disposition {
                Disposition::Apply => to_apply.push(signed.clone()),
                Disposition::PendingContext { message } => {
                    let op_ref = OpRef::derive(doc, &signed.op.dot());
                    self.pending.add(doc, &op_ref, signed, &message)?;
                    parked += 1;
                }
            }
        }
        let applied = to_apply.len();
        if !to_apply.is_empty() {
            self.engine.append_many(doc, &to_apply)?;
            self.replay_pending(doc)?;
        }
        Ok(Applied {
            applied,
            pending: parked,
        })
    }

    /// Re-evaluates parked ops against the grown tree. Newly decidable ops
    /// apply or drop; the rest stay parked.
    pub fn replay_pending(&self, doc: &DocId) -> Result<()> {
        loop {
            let parked = self.pending.all(doc)?;
            if parked.is_empty() {
                return Ok(());
            }
            let verifier = Verifier {
                doc: *doc,
                store: &self.tokens,
                trusted_issuers: self.docs.trusted_issuers(doc)?,
                now: self.now(),
                require_proof_ref: false,
            };
            let view = self.engine.tree_view(*doc);
            let engine = self.engine.clone();
            let parent_of = move |node: &NodeId| {
                engine
                    .node_row(doc, node)
                    .ok()
                    .flatten()
                    .and_then(|row| row.parent)
            };
            let mut progressed = false;
            for pending in parked {
                match verifier.verify_batch(std::slice::from_ref(&pending.signed), &view, &parent_of)
                {
                    Ok(dispositions) => match &dispositions[0] {
                        Disposition::Apply => {
                            self.engine.append(doc, &pending.signed)?;
                            self.pending.remove(doc, &pending.op_ref)?;
                            progressed = true;
                        }
                        Disposition::PendingContext { .. } => {}
                    },
                    Err(err) => {
                        tracing::info!("parked op {:?} now denied: {}", pending.op_ref, err);
                        self.pending.remove(doc, &pending.op_ref)?;
                    }
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    pub fn pending_count(&self, doc: &DocId) -> usize {
        self.pending.len(doc)
    }
}

impl std::fmt::Debug for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Frontend")
            .field("engine", &self.engine)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

fn decode_identity(bytes: &[u8]) -> Result<(Keypair, Vec<CapToken>)> {
    let value = cose::decode(bytes)?;
    let map = value
        .as_map()
        .ok_or_else(|| anyhow!("corrupt local identity"))?;
    let secret = cose::map_get_text(map, "replica")
        .and_then(|v| v.as_bytes())
        .filter(|b| b.len() == 32)
        .ok_or_else(|| anyhow!("corrupt local identity"))?;
    let keypair = Keypair::new(secret.as_slice().try_into().unwrap());
    let tokens = match cose::map_get_text(map, "tokens").and_then(|v| v.as_array()) {
        Some(tokens) => tokens
            .iter()
            .map(|t| {
                t.as_bytes()
                    .ok_or_else(|| anyhow!("corrupt local identity"))
                    .and_then(|b| CapToken::decode(b))
            })
            .collect::<Result<_>>()?,
        None => Vec::new(),
    };
    Ok((keypair, tokens))
}

/// A document handle bound to a local keypair.
#[derive(Clone)]
pub struct Doc {
    doc: DocId,
    frontend: Frontend,
    keypair: Keypair,
}

impl Doc {
    pub fn id(&self) -> &DocId {
        &self.doc
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.keypair.replica_id()
    }

    pub fn frontend(&self) -> &Frontend {
        &self.frontend
    }

    fn next_meta(&self) -> Result<(Dot, u64)> {
        let replica = self.keypair.replica_id();
        let counter = self
            .frontend
            .engine
            .replica_max_counter(&self.doc, &replica)?
            + 1;
        let lamport = self.frontend.engine.head_lamport(&self.doc)? + 1;
        Ok((Dot::new(replica, counter), lamport))
    }

    fn sign_and_append(&self, kind: OpKind, known_state: Option<KnownState>) -> Result<OpRef> {
        let (dot, lamport) = self.next_meta()?;
        let op = Op {
            meta: OpMeta {
                dot,
                lamport,
                known_state,
            },
            kind,
        };
        let tokens = self
            .frontend
            .tokens
            .tokens_for(&self.doc, &self.keypair.replica_id());
        let view = self.frontend.engine.tree_view(self.doc);
        let engine = self.frontend.engine.clone();
        let doc = self.doc;
        let auth = auth::sign_op(
            &self.keypair,
            &self.doc,
            &op,
            &tokens,
            &view,
            move |node: &NodeId| {
                engine
                    .node_row(&doc, node)
                    .ok()
                    .flatten()
                    .and_then(|row| row.parent)
            },
        )?;
        let op_ref = self
            .frontend
            .engine
            .append(&self.doc, &SignedOp { op, auth })?;
        self.frontend.replay_pending(&self.doc)?;
        Ok(op_ref)
    }

    fn seal_payload(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.frontend.keyring(&self.doc)? {
            Some(keyring) => keyring.encrypt(payload),
            None => Ok(payload.to_vec()),
        }
    }

    /// Inserts a fresh node as the last child of `parent`.
    pub fn create_node(&self, parent: NodeId, payload: Option<&[u8]>) -> Result<NodeId> {
        let node = NodeId::generate();
        let order_key = self.order_key_last(&parent)?;
        self.insert_with_id(node, parent, order_key, payload)?;
        Ok(node)
    }

    /// Inserts `node` under `parent` at an explicit position.
    pub fn insert_with_id(
        &self,
        node: NodeId,
        parent: NodeId,
        order_key: OrderKey,
        payload: Option<&[u8]>,
    ) -> Result<OpRef> {
        let payload = payload.map(|p| self.seal_payload(p)).transpose()?;
        self.sign_and_append(
            OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            },
            None,
        )
    }

    /// Mints an order key placing a node after the current last child.
    pub fn order_key_last(&self, parent: &NodeId) -> Result<OrderKey> {
        let children = self.frontend.engine.children_page(&self.doc, parent, None, usize::MAX)?;
        let last = children.last().map(|entry| entry.order_key.clone());
        Ok(OrderKey::from(order::between(
            last.as_ref().map(|k| k.as_bytes()),
            None,
        )))
    }

    /// Mints an order key between two siblings.
    pub fn order_key_between(
        &self,
        left: Option<&OrderKey>,
        right: Option<&OrderKey>,
    ) -> OrderKey {
        OrderKey::from(order::between(
            left.map(|k| k.as_bytes()),
            right.map(|k| k.as_bytes()),
        ))
    }

    pub fn move_node(
        &self,
        node: NodeId,
        new_parent: NodeId,
        order_key: OrderKey,
    ) -> Result<OpRef> {
        self.sign_and_append(
            OpKind::Move {
                node,
                new_parent,
                order_key,
            },
            None,
        )
    }

    /// Deletes a subtree, snapshotting this replica's awareness so
    /// concurrent children survive on every replica.
    pub fn delete(&self, node: NodeId) -> Result<OpRef> {
        let known_state = self.frontend.engine.known_state(&self.doc)?;
        self.sign_and_append(OpKind::Delete { node }, Some(known_state))
    }

    pub fn tombstone(&self, node: NodeId) -> Result<OpRef> {
        self.sign_and_append(OpKind::Tombstone { node }, None)
    }

    pub fn set_payload(&self, node: NodeId, payload: Option<&[u8]>) -> Result<OpRef> {
        let payload = payload.map(|p| self.seal_payload(p)).transpose()?;
        self.sign_and_append(OpKind::Payload { node, payload }, None)
    }

    /// Reads and transparently decrypts a node's payload.
    pub fn payload(&self, node: &NodeId) -> Result<Option<Decrypted>> {
        let bytes = match self.frontend.engine.payload(&self.doc, node)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        match self.frontend.keyring(&self.doc)? {
            Some(keyring) => Ok(Some(keyring.maybe_decrypt(&bytes)?)),
            None => Ok(Some(Decrypted::Plain(bytes))),
        }
    }

    /// Rotates the payload keyring to a new epoch. Old epochs stay in the
    /// ring so historical payloads remain readable.
    pub fn rotate_payload_key(&self, kid: &str) -> Result<()> {
        let mut keyring = self
            .frontend
            .keyring(&self.doc)?
            .ok_or_else(|| anyhow!("doc has no payload keyring"))?;
        keyring.rotate(kid)?;
        self.frontend.set_keyring(&self.doc, &keyring)
    }

    pub fn children(&self, parent: &NodeId) -> Result<Vec<NodeId>> {
        self.frontend.engine.children(&self.doc, parent)
    }

    pub fn children_page(
        &self,
        parent: &NodeId,
        cursor: Option<(&OrderKey, &NodeId)>,
        limit: usize,
    ) -> Result<Vec<ChildEntry>> {
        self.frontend.engine.children_page(&self.doc, parent, cursor, limit)
    }

    pub fn dump(&self) -> Result<Vec<TreeEntry>> {
        self.frontend.engine.dump(&self.doc)
    }

    pub fn node_count(&self) -> Result<u64> {
        self.frontend.engine.node_count(&self.doc)
    }

    pub fn head_lamport(&self) -> Result<u64> {
        self.frontend.engine.head_lamport(&self.doc)
    }

    pub fn replica_max_counter(&self, replica: &ReplicaId) -> Result<u64> {
        self.frontend.engine.replica_max_counter(&self.doc, replica)
    }

    /// Issues a capability for `subject` signed with the doc's issuer key.
    /// Only the creating device holds it.
    pub fn grant(
        &self,
        subject: ReplicaId,
        actions: impl IntoIterator<Item = Action>,
        scope: Scope,
    ) -> Result<CapToken> {
        let issuer = self
            .frontend
            .keystore
            .open_blob(&self.doc, BlobKind::IssuerKey, None)?
            .ok_or_else(|| anyhow!("issuer key not held on this device"))?;
        let issuer = Keypair::new(issuer.as_slice().try_into().unwrap());
        let token = CapToken::issue(
            &issuer,
            TokenClaims::new(
                self.doc,
                subject,
                vec![Capability {
                    doc: self.doc,
                    scope,
                    actions: actions.into_iter().collect(),
                }],
            ),
        )?;
        self.frontend.tokens.add(&self.doc, token.clone());
        Ok(token)
    }

    /// Delegates a narrowed capability to `subject`, embedding `proof` (a
    /// token held by this replica that carries grant).
    pub fn delegate(
        &self,
        proof: &CapToken,
        subject: ReplicaId,
        actions: impl IntoIterator<Item = Action>,
        scope: Scope,
    ) -> Result<CapToken> {
        let mut claims = TokenClaims::new(
            self.doc,
            subject,
            vec![Capability {
                doc: self.doc,
                scope,
                actions: actions.into_iter().collect(),
            }],
        );
        claims.proof = Some(proof.as_bytes().to_vec());
        let token = CapToken::issue(&self.keypair, claims)?;
        self.frontend.tokens.add(&self.doc, token.clone());
        Ok(token)
    }

    /// Installs a token received out of band after verifying its chain.
    pub fn add_token(&self, bytes: &[u8]) -> Result<CapToken> {
        let token = CapToken::decode(bytes)?;
        let revoked = self.frontend.tokens.revoked();
        let view = self.frontend.engine.tree_view(self.doc);
        token.verify(&crate::token::VerifyContext {
            doc: self.doc,
            trusted_issuers: &self.frontend.docs.trusted_issuers(&self.doc)?,
            revoked: &revoked,
            now: self.frontend.now(),
            evaluator: Some(&view),
        })?;
        self.frontend.tokens.add(&self.doc, token.clone());
        Ok(token)
    }

    pub fn revoke(&self, token_id: TokenId) {
        self.frontend.tokens.revoke(token_id);
    }
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Doc")
            .field("doc", &self.doc)
            .field("replica", &self.keypair.replica_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_insert_delete() {
        let backend = Backend::memory().unwrap();
        let doc = backend.frontend().create_doc(Keypair::generate()).unwrap();

        let node = NodeId::new([1; 16]);
        doc.insert_with_id(node, NodeId::ROOT, OrderKey::from(&b"\x40"[..]), None)
            .unwrap();
        assert_eq!(doc.children(&NodeId::ROOT).unwrap(), vec![node]);

        doc.delete(node).unwrap();
        assert!(doc.children(&NodeId::ROOT).unwrap().is_empty());
        let dump = doc.dump().unwrap();
        assert!(dump.iter().find(|r| r.node == node).unwrap().tombstone);
    }

    #[test]
    fn payload_is_transparently_encrypted() {
        let backend = Backend::memory().unwrap();
        let doc = backend.frontend().create_doc(Keypair::generate()).unwrap();

        let node = doc.create_node(NodeId::ROOT, Some(b"secret note")).unwrap();
        // on disk the payload is an envelope, not the plaintext
        let raw = backend
            .frontend()
            .engine()
            .payload(doc.id(), &node)
            .unwrap()
            .unwrap();
        assert_ne!(raw, b"secret note".to_vec());
        assert!(crate::keystore::is_encrypted_payload(&raw));
        // through the doc handle it decrypts
        assert_eq!(
            doc.payload(&node).unwrap().unwrap(),
            Decrypted::Plain(b"secret note".to_vec())
        );
    }

    #[test]
    fn keyring_rotation_mid_doc() {
        let backend = Backend::memory().unwrap();
        let doc = backend.frontend().create_doc(Keypair::generate()).unwrap();

        let before = doc.create_node(NodeId::ROOT, Some(b"before")).unwrap();
        doc.rotate_payload_key("epoch-2").unwrap();
        let after = doc.create_node(NodeId::ROOT, Some(b"after")).unwrap();

        assert_eq!(
            doc.payload(&before).unwrap().unwrap(),
            Decrypted::Plain(b"before".to_vec())
        );
        assert_eq!(
            doc.payload(&after).unwrap().unwrap(),
            Decrypted::Plain(b"after".to_vec())
        );

        // a ring missing the old epoch reports which key it needs
        let mut ring = backend.frontend().keyring(doc.id()).unwrap().unwrap();
        ring.remove("epoch-1").unwrap();
        let raw = backend
            .frontend()
            .engine()
            .payload(doc.id(), &before)
            .unwrap()
            .unwrap();
        assert_eq!(
            ring.maybe_decrypt(&raw).unwrap(),
            Decrypted::KeyMissing {
                kid: "epoch-1".into()
            }
        );
    }

    #[test]
    fn doc_reopens_from_keystore() {
        let backend = Backend::memory().unwrap();
        let frontend = backend.frontend();
        let doc = frontend.create_doc(Keypair::generate()).unwrap();
        let id = *doc.id();
        let replica = doc.replica_id();

        let reopened = frontend.doc(id).unwrap();
        assert_eq!(reopened.replica_id(), replica);
        // the reloaded identity still signs appendable ops
        reopened.create_node(NodeId::ROOT, None).unwrap();
    }

    #[test]
    fn remote_batch_applies_and_parks() {
        let backend_a = Backend::memory().unwrap();
        let doc_a = backend_a.frontend().create_doc(Keypair::generate()).unwrap();
        let node = doc_a.create_node(NodeId::ROOT, None).unwrap();

        // ship A's ops and token to a second backend
        let backend_b = Backend::memory().unwrap();
        let doc_b = backend_b
            .frontend()
            .add_doc(*doc_a.id(), Keypair::generate())
            .unwrap();
        let token = doc_a
            .frontend()
            .tokens()
            .tokens_for(doc_a.id(), &doc_a.replica_id())
            .pop()
            .unwrap();
        doc_b.add_token(token.as_bytes()).unwrap();

        let ops = doc_a.frontend().engine().ops_all(doc_a.id()).unwrap();
        let applied = backend_b.frontend().apply_remote(doc_a.id(), &ops).unwrap();
        assert_eq!(applied.applied, 1);
        assert_eq!(applied.pending, 0);
        assert_eq!(doc_b.children(&NodeId::ROOT).unwrap(), vec![node]);
    }
}
