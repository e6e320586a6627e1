//! Op authorization.
//!
//! Every op carries the author's signature over the domain separated
//! preimage plus an optional proof ref naming the capability token it was
//! signed under. Verification resolves the author's tokens, validates their
//! chains and evaluates their scopes against the op's required checks. The
//! outcome is tri-state: allowed ops apply, denied ops reject the whole
//! batch, and ops the local tree lacks context to judge are parked until
//! more of the tree arrives.

use crate::crypto::{self, Keypair};
use crate::id::{DocId, NodeId, ReplicaId};
use crate::op::{Op, OpAuth, OpKind, SignedOp};
use crate::token::{
    key_id, Action, CapToken, ScopeDecision, ScopeEvaluator, TokenId, VerifyContext,
};
use anyhow::{anyhow, bail, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One (action, node) pair an op must be authorized for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Check {
    pub action: Action,
    pub node: NodeId,
}

/// The checks an op requires. A move needs write_structure on both ends:
/// the destination parent and the node's current parent, otherwise a write
/// on a forbidden subtree could be laundered by moving the node out of it.
pub fn required_checks(op: &Op, current_parent: impl Fn(&NodeId) -> Option<NodeId>) -> Vec<Check> {
    match &op.kind {
        OpKind::Insert {
            parent, payload, ..
        } => {
            let mut checks = vec![Check {
                action: Action::WriteStructure,
                node: *parent,
            }];
            if payload.is_some() {
                checks.push(Check {
                    action: Action::WritePayload,
                    node: *parent,
                });
            }
            checks
        }
        OpKind::Move {
            node, new_parent, ..
        } => {
            // an unknown source degrades to a check on the node itself,
            // which evaluates to unknown until its position arrives
            let source = current_parent(node).unwrap_or(*node);
            vec![
                Check {
                    action: Action::WriteStructure,
                    node: *new_parent,
                },
                Check {
                    action: Action::WriteStructure,
                    node: source,
                },
            ]
        }
        OpKind::Delete { node } => vec![Check {
            action: Action::Delete,
            node: *node,
        }],
        OpKind::Tombstone { node } => vec![Check {
            action: Action::Tombstone,
            node: *node,
        }],
        OpKind::Payload { node, .. } => vec![Check {
            action: Action::WritePayload,
            node: *node,
        }],
    }
}

/// Combining across candidate tokens: any allow wins, unknown beats deny.
pub fn combine_or(a: ScopeDecision, b: ScopeDecision) -> ScopeDecision {
    match (a, b) {
        (ScopeDecision::Allow { depth }, _) | (_, ScopeDecision::Allow { depth }) => {
            ScopeDecision::Allow { depth }
        }
        (ScopeDecision::Unknown, _) | (_, ScopeDecision::Unknown) => ScopeDecision::Unknown,
        _ => ScopeDecision::Deny,
    }
}

/// Combining the checks of a single op: any deny wins, unknown beats allow.
pub fn combine_and(a: ScopeDecision, b: ScopeDecision) -> ScopeDecision {
    match (a, b) {
        (ScopeDecision::Deny, _) | (_, ScopeDecision::Deny) => ScopeDecision::Deny,
        (ScopeDecision::Unknown, _) | (_, ScopeDecision::Unknown) => ScopeDecision::Unknown,
        (ScopeDecision::Allow { depth }, ScopeDecision::Allow { .. }) => {
            ScopeDecision::Allow { depth }
        }
    }
}

/// Evaluates one token against one check.
fn token_decision(
    token: &CapToken,
    doc: &DocId,
    check: &Check,
    evaluator: &dyn ScopeEvaluator,
) -> ScopeDecision {
    token
        .caps_for(doc)
        .filter(|cap| cap.actions.contains(&check.action))
        .map(|cap| evaluator.evaluate(&cap.scope, check.node))
        .fold(ScopeDecision::Deny, combine_or)
}

/// Evaluates a set of candidate tokens against all of an op's checks.
pub fn op_decision(
    tokens: &[CapToken],
    doc: &DocId,
    op: &Op,
    evaluator: &dyn ScopeEvaluator,
    current_parent: impl Fn(&NodeId) -> Option<NodeId>,
) -> ScopeDecision {
    let checks = required_checks(op, current_parent);
    checks
        .iter()
        .map(|check| {
            tokens
                .iter()
                .map(|token| token_decision(token, doc, check, evaluator))
                .fold(ScopeDecision::Deny, combine_or)
        })
        .fold(ScopeDecision::Allow { depth: 0 }, combine_and)
}

/// Read-mostly index of verified capability tokens and revocations, keyed
/// by the key id of their subject.
#[derive(Clone, Default)]
pub struct TokenStore {
    tokens: Arc<RwLock<BTreeMap<(DocId, [u8; 16]), Vec<CapToken>>>>,
    revoked: Arc<RwLock<BTreeSet<TokenId>>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, doc: &DocId, token: CapToken) {
        let key = (*doc, key_id(&token.subject()));
        let mut tokens = self.tokens.write();
        let entry = tokens.entry(key).or_default();
        if !entry.iter().any(|t| t.token_id() == token.token_id()) {
            entry.push(token);
        }
    }

    pub fn tokens_for(&self, doc: &DocId, subject: &ReplicaId) -> Vec<CapToken> {
        self.tokens
            .read()
            .get(&(*doc, key_id(subject)))
            .cloned()
            .unwrap_or_default()
    }

    pub fn revoke(&self, token_id: TokenId) {
        self.revoked.write().insert(token_id);
    }

    pub fn revoked(&self) -> BTreeSet<TokenId> {
        self.revoked.read().clone()
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("tokens", &self.tokens.read().len())
            .field("revoked", &self.revoked.read().len())
            .finish()
    }
}

/// Signs a local op, picking any held token whose scope allows it as the
/// proof ref.
pub fn sign_op(
    keypair: &Keypair,
    doc: &DocId,
    op: &Op,
    tokens: &[CapToken],
    evaluator: &dyn ScopeEvaluator,
    current_parent: impl Fn(&NodeId) -> Option<NodeId>,
) -> Result<OpAuth> {
    let sig = keypair.sign(&op.encode_sig_input(doc)?);
    let proof_ref = tokens
        .iter()
        .find(|token| {
            op_decision(
                std::slice::from_ref(*token),
                doc,
                op,
                evaluator,
                &current_parent,
            )
            .is_allow()
        })
        .map(|token| token.token_id());
    Ok(OpAuth { sig, proof_ref })
}

/// Per-op outcome of batch verification. Denials never get this far: they
/// fail the batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    Apply,
    /// Signature checked out but the local tree can't place the op's scope
    /// yet. Park it and replay once more context arrives.
    PendingContext { message: String },
}

/// Batch verification policy.
pub struct Verifier<'a> {
    pub doc: DocId,
    pub store: &'a TokenStore,
    pub trusted_issuers: Vec<ReplicaId>,
    /// Injected clock, seconds since the epoch.
    pub now: u64,
    /// When set, ops must name a proof ref and it must resolve.
    pub require_proof_ref: bool,
}

impl<'a> Verifier<'a> {
    /// Verifies a batch of ops. Any denial or bad signature fails the whole
    /// batch; the caller maps that to an unauthorized session error.
    pub fn verify_batch(
        &self,
        ops: &[SignedOp],
        evaluator: &dyn ScopeEvaluator,
        current_parent: impl Fn(&NodeId) -> Option<NodeId>,
    ) -> Result<Vec<Disposition>> {
        let revoked = self.store.revoked();
        let mut out = Vec::with_capacity(ops.len());
        for signed in ops {
            let author = signed.op.dot().replica;
            crypto::verify(
                &author,
                &signed.op.encode_sig_input(&self.doc)?,
                &signed.auth.sig,
            )
            .map_err(|err| anyhow!("op {:?} by {:?}: {}", signed.op.dot(), author, err))?;

            let ctx = VerifyContext {
                doc: self.doc,
                trusted_issuers: &self.trusted_issuers,
                revoked: &revoked,
                now: self.now,
                evaluator: Some(evaluator),
            };
            let mut candidates: Vec<CapToken> = self
                .store
                .tokens_for(&self.doc, &author)
                .into_iter()
                .filter(|token| match token.verify(&ctx) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::debug!("token {:?} rejected: {}", token.token_id(), err);
                        false
                    }
                })
                .collect();
            if let Some(proof_ref) = signed.auth.proof_ref {
                candidates.retain(|token| token.token_id() == proof_ref);
            } else if self.require_proof_ref {
                bail!("op {:?} is missing its proof ref", signed.op.dot());
            }
            match op_decision(&candidates, &self.doc, &signed.op, evaluator, &current_parent) {
                ScopeDecision::Allow { .. } => out.push(Disposition::Apply),
                ScopeDecision::Unknown => out.push(Disposition::PendingContext {
                    message: format!("missing context for {:?}", signed.op.kind.node()),
                }),
                ScopeDecision::Deny => {
                    bail!(
                        "op {:?} by {:?} is not authorized",
                        signed.op.dot(),
                        author
                    );
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Capability, Scope, TokenClaims};

    struct FlatTree;

    impl ScopeEvaluator for FlatTree {
        fn evaluate(&self, scope: &Scope, node: NodeId) -> ScopeDecision {
            if scope.exclude.contains(&node) {
                ScopeDecision::Deny
            } else if scope.root == node || scope.root.is_root() {
                ScopeDecision::Allow { depth: 0 }
            } else {
                ScopeDecision::Unknown
            }
        }
    }

    fn token(doc: DocId, issuer: &Keypair, subject: ReplicaId, actions: &[Action]) -> CapToken {
        CapToken::issue(
            issuer,
            TokenClaims::new(
                doc,
                subject,
                vec![Capability {
                    doc,
                    scope: Scope::doc_wide(),
                    actions: actions.iter().cloned().collect(),
                }],
            ),
        )
        .unwrap()
    }

    #[test]
    fn combinators_order() {
        use ScopeDecision::*;
        let allow = Allow { depth: 0 };
        assert_eq!(combine_or(allow, Deny), allow);
        assert_eq!(combine_or(Unknown, Deny), Unknown);
        assert_eq!(combine_or(allow, Unknown), allow);
        assert_eq!(combine_and(allow, Deny), Deny);
        assert_eq!(combine_and(Unknown, Deny), Deny);
        assert_eq!(combine_and(allow, Unknown), Unknown);
        assert_eq!(combine_and(allow, allow), allow);
    }

    #[test]
    fn move_requires_both_endpoints() {
        use crate::op::{Op, OpMeta, OrderKey};
        let node = NodeId::new([1; 16]);
        let dest = NodeId::new([2; 16]);
        let source = NodeId::new([3; 16]);
        let op = Op {
            meta: OpMeta {
                dot: crate::id::Dot::new(ReplicaId::new([0; 32]), 1),
                lamport: 1,
                known_state: None,
            },
            kind: OpKind::Move {
                node,
                new_parent: dest,
                order_key: OrderKey::default(),
            },
        };
        let checks = required_checks(&op, |_| Some(source));
        assert_eq!(checks.len(), 2);
        assert!(checks.iter().any(|c| c.node == dest));
        assert!(checks.iter().any(|c| c.node == source));
        assert!(checks
            .iter()
            .all(|c| c.action == Action::WriteStructure));
    }

    #[test]
    fn widened_token_still_allows() {
        // scope monotonicity: a token with more actions allows whatever the
        // narrower token allowed
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let author = Keypair::generate();
        let narrow = token(
            doc,
            &issuer,
            author.replica_id(),
            &[Action::WriteStructure],
        );
        let wide = token(doc, &issuer, author.replica_id(), &Action::ALL);

        let op = crate::op::Op {
            meta: crate::op::OpMeta {
                dot: crate::id::Dot::new(author.replica_id(), 1),
                lamport: 1,
                known_state: None,
            },
            kind: OpKind::Insert {
                parent: NodeId::ROOT,
                node: NodeId::new([1; 16]),
                order_key: Default::default(),
                payload: None,
            },
        };
        let narrow_decision =
            op_decision(&[narrow.clone()], &doc, &op, &FlatTree, |_| None);
        let wide_decision = op_decision(&[wide], &doc, &op, &FlatTree, |_| None);
        assert!(narrow_decision.is_allow());
        assert!(wide_decision.is_allow());
    }

    #[test]
    fn batch_denied_on_unauthorized_op() {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let author = Keypair::generate();
        let store = TokenStore::new();
        store.add(
            &doc,
            token(doc, &issuer, author.replica_id(), &[Action::ReadStructure]),
        );

        let op = crate::op::Op {
            meta: crate::op::OpMeta {
                dot: crate::id::Dot::new(author.replica_id(), 1),
                lamport: 1,
                known_state: None,
            },
            kind: OpKind::Insert {
                parent: NodeId::ROOT,
                node: NodeId::new([1; 16]),
                order_key: Default::default(),
                payload: None,
            },
        };
        let sig = author.sign(&op.encode_sig_input(&doc).unwrap());
        let signed = SignedOp {
            op,
            auth: OpAuth {
                sig,
                proof_ref: None,
            },
        };
        let verifier = Verifier {
            doc,
            store: &store,
            trusted_issuers: vec![issuer.replica_id()],
            now: 0,
            require_proof_ref: false,
        };
        assert!(verifier
            .verify_batch(&[signed], &FlatTree, |_| None)
            .is_err());
    }

    #[test]
    fn unknown_scope_parks_op() {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let author = Keypair::generate();
        let store = TokenStore::new();
        let subtree = NodeId::new([7; 16]);
        store.add(
            &doc,
            CapToken::issue(
                &issuer,
                TokenClaims::new(
                    doc,
                    author.replica_id(),
                    vec![Capability {
                        doc,
                        scope: Scope::subtree(subtree),
                        actions: [Action::WriteStructure].into_iter().collect(),
                    }],
                ),
            )
            .unwrap(),
        );

        let op = crate::op::Op {
            meta: crate::op::OpMeta {
                dot: crate::id::Dot::new(author.replica_id(), 1),
                lamport: 1,
                known_state: None,
            },
            kind: OpKind::Insert {
                parent: NodeId::new([9; 16]),
                node: NodeId::new([1; 16]),
                order_key: Default::default(),
                payload: None,
            },
        };
        let sig = author.sign(&op.encode_sig_input(&doc).unwrap());
        let signed = SignedOp {
            op,
            auth: OpAuth {
                sig,
                proof_ref: None,
            },
        };
        let verifier = Verifier {
            doc,
            store: &store,
            trusted_issuers: vec![issuer.replica_id()],
            now: 0,
            require_proof_ref: false,
        };
        let dispositions = verifier
            .verify_batch(&[signed], &FlatTree, |_| None)
            .unwrap();
        assert!(matches!(
            dispositions[0],
            Disposition::PendingContext { .. }
        ));
    }

    #[test]
    fn revoked_token_denies() {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let author = Keypair::generate();
        let store = TokenStore::new();
        let t = token(doc, &issuer, author.replica_id(), &Action::ALL);
        let token_id = t.token_id();
        store.add(&doc, t);

        let op = crate::op::Op {
            meta: crate::op::OpMeta {
                dot: crate::id::Dot::new(author.replica_id(), 1),
                lamport: 1,
                known_state: None,
            },
            kind: OpKind::Insert {
                parent: NodeId::ROOT,
                node: NodeId::new([1; 16]),
                order_key: Default::default(),
                payload: None,
            },
        };
        let sig = author.sign(&op.encode_sig_input(&doc).unwrap());
        let signed = SignedOp {
            op,
            auth: OpAuth {
                sig,
                proof_ref: None,
            },
        };
        let verifier = Verifier {
            doc,
            store: &store,
            trusted_issuers: vec![issuer.replica_id()],
            now: 0,
            require_proof_ref: false,
        };
        assert!(verifier
            .verify_batch(std::slice::from_ref(&signed), &FlatTree, |_| None)
            .is_ok());
        store.revoke(token_id);
        assert!(verifier
            .verify_batch(&[signed], &FlatTree, |_| None)
            .is_err());
    }
}
