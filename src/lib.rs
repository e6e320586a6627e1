//! # arbor
//!
//! A local-first SDK for replicated ordered trees. Documents converge
//! through a signed append-only op log; peers reconcile their logs with a
//! rateless set-reconciliation protocol; capability tokens scope what each
//! peer may read and write down to individual subtrees; payloads and
//! long-term keys are encrypted at rest.
//!
//! The engine lives in the `arbor-crdt` crate; this crate adds the wire
//! format, the transport abstraction and the peer protocol, plus the [`Sdk`]
//! entry point.
pub mod sync;
pub mod transport;
pub mod wire;

pub use arbor_crdt::{
    Action, Applied, Backend, CapToken, Capability, Decrypted, Doc, DocId, Dot, Frontend, Keypair,
    Keyring, KnownState, NodeId, OpKind, OpRef, OrderKey, ReplicaId, Scope, SignedOp, TokenId,
};

use anyhow::Result;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// The SDK: a backend plus process-wide logging setup.
pub struct Sdk {
    frontend: Frontend,
}

impl Sdk {
    /// Opens the SDK over a sled database.
    pub fn new(db: sled::Db) -> Result<Self> {
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        log_panics::init();

        let backend = Backend::new(db)?;
        Ok(Self {
            frontend: backend.frontend(),
        })
    }

    /// Opens a persistent SDK at `path`.
    pub fn persistent(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::new(sled::open(path)?)
    }

    /// Opens an in-memory SDK, mostly for tests.
    pub fn memory() -> Result<Self> {
        Self::new(sled::Config::new().temporary(true).open()?)
    }

    pub fn frontend(&self) -> &Frontend {
        &self.frontend
    }

    /// Creates a new document with a fresh replica keypair.
    pub fn create_doc(&self) -> Result<Doc> {
        self.frontend.create_doc(Keypair::generate())
    }

    /// Adds a document created elsewhere, with a fresh replica keypair.
    /// Capability tokens arrive out of band via [`Doc::add_token`].
    pub fn add_doc(&self, id: DocId) -> Result<Doc> {
        self.frontend.add_doc(id, Keypair::generate())
    }

    /// Opens a previously created or added document.
    pub fn doc(&self, id: DocId) -> Result<Doc> {
        self.frontend.doc(id)
    }

    /// Returns an iterator of known [`DocId`]s.
    pub fn docs(&self) -> impl Iterator<Item = Result<DocId>> + '_ {
        self.frontend.docs()
    }
}

#[cfg(test)]
mod tests {
    use super::sync::{initiate, respond, subscribe, Filter, SyncConfig};
    use super::transport::memory_pair;
    use super::transport::Transport;
    use super::*;
    use std::time::Duration;

    fn tree_of(doc: &Doc) -> Vec<(NodeId, Option<NodeId>, bool)> {
        let mut dump: Vec<_> = doc
            .dump()
            .unwrap()
            .into_iter()
            .map(|row| (row.node, row.parent, row.tombstone))
            .collect();
        dump.sort();
        dump
    }

    /// Grants `to` a capability and installs it on both sides.
    fn share_token(
        from: &Doc,
        to: &Doc,
        actions: impl IntoIterator<Item = Action>,
        scope: Scope,
    ) {
        let token = from.grant(to.replica_id(), actions, scope).unwrap();
        to.add_token(token.as_bytes()).unwrap();
    }

    async fn sync_once(a: &Doc, b: &Doc) -> sync::SyncSummary {
        let (mut ta, mut tb) = memory_pair();
        let b = b.clone();
        let responder = async_std::task::spawn(async move {
            respond(&b, &mut tb, &SyncConfig::default()).await
        });
        let summary = initiate(a, &mut ta, &[Filter::All], &SyncConfig::default())
            .await
            .unwrap();
        ta.close().await.unwrap();
        responder.await.unwrap();
        summary
    }

    #[async_std::test]
    async fn initial_sync_transfers_everything() {
        let sdk_a = Sdk::memory().unwrap();
        let sdk_b = Sdk::memory().unwrap();
        let doc_a = sdk_a.create_doc().unwrap();
        let doc_b = sdk_b.add_doc(*doc_a.id()).unwrap();
        share_token(
            &doc_a,
            &doc_b,
            [Action::ReadStructure, Action::ReadPayload],
            Scope::doc_wide(),
        );

        let first = doc_a.create_node(NodeId::ROOT, Some(b"hello")).unwrap();
        let child = doc_a.create_node(first, None).unwrap();

        let summary = sync_once(&doc_a, &doc_b).await;
        assert_eq!(summary.sent, 2);
        assert_eq!(doc_b.children(&NodeId::ROOT).unwrap(), vec![first]);
        assert_eq!(doc_b.children(&first).unwrap(), vec![child]);
        assert_eq!(tree_of(&doc_a), tree_of(&doc_b));
    }

    #[async_std::test]
    async fn defensive_delete_across_replicas() {
        let sdk_a = Sdk::memory().unwrap();
        let sdk_b = Sdk::memory().unwrap();
        let doc_a = sdk_a.create_doc().unwrap();
        let doc_b = sdk_b.add_doc(*doc_a.id()).unwrap();
        share_token(&doc_a, &doc_b, Action::ALL, Scope::doc_wide());

        // A inserts P and syncs it over
        let p = NodeId::new([1; 16]);
        doc_a
            .insert_with_id(p, NodeId::ROOT, OrderKey::from(&b"\x40"[..]), None)
            .unwrap();
        sync_once(&doc_a, &doc_b).await;
        assert_eq!(doc_b.children(&NodeId::ROOT).unwrap(), vec![p]);

        // B inserts C under P without syncing, A deletes P unaware of C
        let c = NodeId::new([2; 16]);
        doc_b
            .insert_with_id(c, p, OrderKey::from(&b"\x40"[..]), None)
            .unwrap();
        doc_a.delete(p).unwrap();

        // after syncing both directions, the concurrent child survives and
        // pins the tombstoned parent visible on both sides
        sync_once(&doc_a, &doc_b).await;
        sync_once(&doc_b, &doc_a).await;
        for doc in [&doc_a, &doc_b] {
            assert_eq!(doc.children(&NodeId::ROOT).unwrap(), vec![p], "{:?}", doc);
            assert_eq!(doc.children(&p).unwrap(), vec![c], "{:?}", doc);
        }
        assert_eq!(tree_of(&doc_a), tree_of(&doc_b));
    }

    #[async_std::test]
    async fn convergence_with_overlapping_histories() {
        let sdk_a = Sdk::memory().unwrap();
        let sdk_b = Sdk::memory().unwrap();
        let doc_a = sdk_a.create_doc().unwrap();
        let doc_b = sdk_b.add_doc(*doc_a.id()).unwrap();
        share_token(&doc_a, &doc_b, Action::ALL, Scope::doc_wide());

        for _ in 0..8 {
            doc_a.create_node(NodeId::ROOT, Some(b"base")).unwrap();
        }
        sync_once(&doc_a, &doc_b).await;

        // diverge on both sides, then reconcile through the riblt path
        for _ in 0..3 {
            doc_a.create_node(NodeId::ROOT, None).unwrap();
            doc_b.create_node(NodeId::ROOT, None).unwrap();
        }
        let summary = sync_once(&doc_a, &doc_b).await;
        assert!(summary.applied > 0);
        assert!(summary.sent > 0);
        assert_eq!(tree_of(&doc_a), tree_of(&doc_b));
        assert_eq!(
            doc_a.children(&NodeId::ROOT).unwrap().len(),
            doc_b.children(&NodeId::ROOT).unwrap().len()
        );
    }

    #[async_std::test]
    async fn scoped_invite_hides_private_subtree() {
        let sdk_a = Sdk::memory().unwrap();
        let sdk_b = Sdk::memory().unwrap();
        let doc_a = sdk_a.create_doc().unwrap();
        let doc_b = sdk_b.add_doc(*doc_a.id()).unwrap();

        let public = NodeId::new([1; 16]);
        let private = NodeId::new([2; 16]);
        let secret_child = NodeId::new([3; 16]);
        doc_a
            .insert_with_id(public, NodeId::ROOT, OrderKey::from(&b"\x20"[..]), None)
            .unwrap();
        doc_a
            .insert_with_id(private, NodeId::ROOT, OrderKey::from(&b"\x40"[..]), None)
            .unwrap();
        doc_a
            .insert_with_id(secret_child, private, OrderKey::from(&b"\x40"[..]), None)
            .unwrap();

        // B's invite excludes the private root
        share_token(
            &doc_a,
            &doc_b,
            [Action::ReadStructure, Action::ReadPayload],
            Scope {
                root: NodeId::ROOT,
                max_depth: None,
                exclude: vec![private],
            },
        );

        sync_once(&doc_a, &doc_b).await;
        assert_eq!(doc_b.children(&NodeId::ROOT).unwrap(), vec![public]);
        assert!(doc_b
            .dump()
            .unwrap()
            .iter()
            .all(|row| row.node != private && row.node != secret_child));

        // ops tombstoning the private subtree must not leak either
        doc_a.tombstone(private).unwrap();
        sync_once(&doc_a, &doc_b).await;
        assert!(doc_b
            .frontend()
            .engine()
            .ops_all(doc_b.id())
            .unwrap()
            .iter()
            .all(|signed| signed.op.kind.node() != private));
    }

    #[async_std::test]
    async fn unauthorized_filter_is_rejected_not_fatal() {
        let sdk_a = Sdk::memory().unwrap();
        let sdk_b = Sdk::memory().unwrap();
        let doc_a = sdk_a.create_doc().unwrap();
        let doc_b = sdk_b.add_doc(*doc_a.id()).unwrap();
        let subtree = NodeId::new([5; 16]);
        doc_a
            .insert_with_id(subtree, NodeId::ROOT, OrderKey::from(&b"\x40"[..]), None)
            .unwrap();

        // B only holds a subtree capability but asks for the whole doc
        share_token(
            &doc_a,
            &doc_b,
            [Action::ReadStructure],
            Scope::subtree(subtree),
        );

        let (mut ta, mut tb) = memory_pair();
        let responder = {
            let doc_a = doc_a.clone();
            async_std::task::spawn(async move {
                respond(&doc_a, &mut ta, &SyncConfig::default()).await
            })
        };
        let summary = initiate(
            &doc_b,
            &mut tb,
            &[Filter::All, Filter::Children(subtree)],
            &SyncConfig::default(),
        )
        .await
        .unwrap();
        tb.close().await.unwrap();
        responder.await.unwrap();

        // the doc-wide filter bounced, the children filter went through
        assert_eq!(summary.rejected_filters.len(), 1);
        assert_eq!(summary.rejected_filters[0].0, 1);
        assert!(summary.failed_filters.is_empty());
    }

    #[async_std::test]
    async fn subscription_pushes_live_updates() {
        let sdk_a = Sdk::memory().unwrap();
        let sdk_b = Sdk::memory().unwrap();
        let doc_a = sdk_a.create_doc().unwrap();
        let doc_b = sdk_b.add_doc(*doc_a.id()).unwrap();
        share_token(&doc_a, &doc_b, Action::ALL, Scope::doc_wide());
        doc_a.create_node(NodeId::ROOT, None).unwrap();

        let (mut ta, mut tb) = memory_pair();
        let responder = {
            let doc_a = doc_a.clone();
            async_std::task::spawn(async move {
                respond(&doc_a, &mut ta, &SyncConfig::default()).await
            })
        };

        initiate(&doc_b, &mut tb, &[Filter::All], &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(doc_b.node_count().unwrap(), 1);

        // append on A after the subscription is registered
        let writer = {
            let doc_a = doc_a.clone();
            async_std::task::spawn(async move {
                async_std::task::sleep(Duration::from_millis(200)).await;
                doc_a.create_node(NodeId::ROOT, Some(b"live")).unwrap();
            })
        };

        subscribe(&doc_b, &mut tb, Filter::All, 1, |applied| {
            applied.applied == 0
        })
        .await
        .unwrap();
        writer.await;
        assert_eq!(doc_b.node_count().unwrap(), 2);

        tb.close().await.unwrap();
        responder.await.unwrap();
    }

    #[async_std::test]
    async fn payloads_stay_encrypted_in_transit() {
        let sdk_a = Sdk::memory().unwrap();
        let sdk_b = Sdk::memory().unwrap();
        let doc_a = sdk_a.create_doc().unwrap();
        let doc_b = sdk_b.add_doc(*doc_a.id()).unwrap();
        share_token(&doc_a, &doc_b, Action::ALL, Scope::doc_wide());

        let node = doc_a.create_node(NodeId::ROOT, Some(b"secret")).unwrap();
        sync_once(&doc_a, &doc_b).await;

        // B has the op but not the payload key ring
        let raw = doc_b
            .frontend()
            .engine()
            .payload(doc_b.id(), &node)
            .unwrap()
            .unwrap();
        assert!(arbor_crdt::is_encrypted_payload(&raw));
        assert_ne!(raw, b"secret".to_vec());

        // shipping the keyring (e.g. inside an invite) makes it readable
        let ring = doc_a.frontend().keyring(doc_a.id()).unwrap().unwrap();
        doc_b.frontend().set_keyring(doc_b.id(), &ring).unwrap();
        assert_eq!(
            doc_b.payload(&node).unwrap().unwrap(),
            Decrypted::Plain(b"secret".to_vec())
        );
    }
}
