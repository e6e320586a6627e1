//! # The local first tree sdk's replicated engine
//!
//! ## Move tree over a signed op log
//! A document is an ordered tree whose nodes carry opaque payloads. Every
//! mutation is an op: insert, move, delete, tombstone or payload. Ops are
//! signed by their author, identified by a (replica, counter) dot, stamped
//! with a lamport clock, and appended to a per-doc log exactly once (keyed
//! by a 16 byte content hash, the op ref). The materialized tree is derived
//! from the log in (lamport, replica, counter) order and can be rebuilt at
//! any time, which is how out-of-order delivery converges: replicas that
//! have applied the same set of ops are in the same state regardless of the
//! order they learned them in.
//!
//! ## Defensive delete
//! Concurrent edits race with deletes. If one replica deletes a subtree
//! while another inserts a child into it, naively applying both loses the
//! insert. A delete therefore carries the emitter's known state, a version
//! vector snapshot of the ops it had seen. Applying the delete tombstones
//! only children covered by that snapshot; a concurrent child stays live,
//! and the visibility rule (a node is visible iff it is not tombstoned or
//! has a visible descendant) pins the deleted ancestors back into view
//! above it. Deletes without a snapshot are rejected outright because a
//! rebuild could not replay them faithfully.
//!
//! ## Capability based access control
//! The keypair generated at doc creation is the root of authority and its
//! public key is the doc id. Capabilities are COSE_Sign1 tokens with CWT
//! shaped claims: a subject key, actions, and a subtree scope (root node,
//! optional depth, excluded nodes). Delegation embeds the delegator's own
//! token as proof; validation walks the chain to a trusted issuer, requires
//! grant on every non-leaf layer, and checks each narrowing against the
//! local tree. Scope evaluation is tri-state: allow, deny, or unknown when
//! the local tree is missing the context to decide. Ops that evaluate to
//! unknown are parked in the pending store and replayed as context arrives,
//! never silently dropped.
//!
//! ## Payload encryption
//! Payload bytes are sealed under a per-doc keyring with rotating epochs;
//! ciphertexts carry the key id they were sealed with, so rotation never
//! breaks history, and a ring missing an epoch reports exactly which key it
//! needs. Every long-term secret on a device (issuer key, replica identity,
//! keyrings) is itself sealed under a device wrap key, with the AEAD
//! additional data binding each blob to its doc and kind.
//!
//! ## Set reconciliation
//! Two replicas find the symmetric difference of their op sets with a
//! rateless invertible Bloom lookup table over op refs: one side streams
//! coded symbols from a shared seed, the other subtracts its own aggregate
//! and peels the difference out. No size estimate is needed up front and
//! the stream extends until it decodes or a budget is exhausted.
mod auth;
mod clock;
mod cose;
mod crypto;
mod doc;
mod engine;
mod id;
mod keystore;
mod op;
mod order;
mod pending;
#[cfg(test)]
mod props;
mod riblt;
mod token;

pub use crate::auth::{
    combine_and, combine_or, op_decision, required_checks, sign_op, Check, Disposition,
    TokenStore, Verifier,
};
pub use crate::clock::KnownState;
pub use crate::crypto::{verify, Key, Keypair};
pub use crate::doc::{Applied, Backend, Doc, Frontend};
pub use crate::engine::{ChildEntry, Engine, NodeRow, TreeEntry, TreeView};
pub use crate::id::{DocId, Dot, NodeId, OpRef, ReplicaId};
pub use crate::keystore::{is_encrypted_payload, BlobKind, Decrypted, Keyring, Keystore};
pub use crate::op::{Op, OpAuth, OpKind, OpMeta, OrderKey, SignedOp};
pub use crate::order::between;
pub use crate::pending::{PendingOp, PendingStore};
pub use crate::riblt::{CodedSymbol, Decoder, Encoder, Symbol, SymmetricDifference};
pub use crate::token::{
    issue_device_cert, issue_replica_cert, key_id, Action, CapToken, Capability, IdentityChain,
    Scope, ScopeDecision, ScopeEvaluator, TokenClaims, TokenId, VerifyContext,
};
