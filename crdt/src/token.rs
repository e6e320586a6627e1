//! Capability tokens and identity certificates.
//!
//! A capability token is a COSE_Sign1 over CWT shaped CBOR claims. It names
//! a subject key, the doc it applies to, a set of actions and a subtree
//! scope. Delegation embeds the delegator's own token as an opaque proof;
//! validation walks the chain down to a trusted issuer. The issuer keypair
//! is generated at doc creation and its public key doubles as the doc id,
//! so authority is rooted in the document itself.

use crate::cose;
use crate::crypto::Keypair;
use crate::id::{DocId, NodeId, ReplicaId};
use anyhow::{anyhow, bail, Result};
use ciborium::value::Value;
use std::collections::BTreeSet;

const TOKEN_ID_DOMAIN: &[u8] = b"treecrdt/tokenid/v1";
const KEY_ID_DOMAIN: &[u8] = b"treecrdt/keyid/v1";
const DEVICE_CERT_TAG: &str = "treecrdt/device-cert/v1";
const REPLICA_CERT_TAG: &str = "treecrdt/replica-cert/v1";

/// CWT claim keys.
const CLAIM_AUD: i64 = 3;
const CLAIM_EXP: i64 = 4;
const CLAIM_NBF: i64 = 5;
const CLAIM_CNF: i64 = 8;
const CLAIM_CAPS: i64 = -1;
const CLAIM_PROOF: i64 = -2;

/// Delegation chains deeper than this are rejected.
const MAX_CHAIN_DEPTH: usize = 8;

/// Identifier of a capability token, derived from its encoded bytes.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct TokenId([u8; 16]);

impl TokenId {
    pub fn new(id: [u8; 16]) -> Self {
        Self(id)
    }

    pub fn derive(cose_bytes: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(TOKEN_ID_DOMAIN);
        hasher.update(cose_bytes);
        let mut id = [0; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl AsRef<[u8; 16]> for TokenId {
    fn as_ref(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..4]))
    }
}

/// Key id binding a token to its subject public key.
pub fn key_id(pk: &ReplicaId) -> [u8; 16] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(KEY_ID_DOMAIN);
    hasher.update(pk.as_ref());
    let mut id = [0; 16];
    id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    id
}

/// Actions a capability can grant.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Action {
    ReadStructure,
    ReadPayload,
    WriteStructure,
    WritePayload,
    Delete,
    Tombstone,
    Grant,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::ReadStructure,
        Action::ReadPayload,
        Action::WriteStructure,
        Action::WritePayload,
        Action::Delete,
        Action::Tombstone,
        Action::Grant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadStructure => "read_structure",
            Self::ReadPayload => "read_payload",
            Self::WriteStructure => "write_structure",
            Self::WritePayload => "write_payload",
            Self::Delete => "delete",
            Self::Tombstone => "tombstone",
            Self::Grant => "grant",
        }
    }
}

impl std::str::FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "read_structure" => Self::ReadStructure,
            "read_payload" => Self::ReadPayload,
            "write_structure" => Self::WriteStructure,
            "write_payload" => Self::WritePayload,
            "delete" => Self::Delete,
            "tombstone" => Self::Tombstone,
            "grant" => Self::Grant,
            s => bail!("unknown action {}", s),
        })
    }
}

/// Subtree scope of a capability.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Scope {
    pub root: NodeId,
    pub max_depth: Option<u32>,
    pub exclude: Vec<NodeId>,
}

impl Scope {
    pub fn doc_wide() -> Self {
        Self {
            root: NodeId::ROOT,
            max_depth: None,
            exclude: Vec::new(),
        }
    }

    pub fn subtree(root: NodeId) -> Self {
        Self {
            root,
            max_depth: None,
            exclude: Vec::new(),
        }
    }

    /// A doc wide scope: rooted at ROOT, unbounded, nothing excluded.
    pub fn is_doc_wide(&self) -> bool {
        self.root.is_root() && self.max_depth.is_none() && self.exclude.is_empty()
    }
}

/// Tri-state outcome of evaluating a scope against a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScopeDecision {
    /// The node sits under the scope root, `depth` edges below it.
    Allow { depth: u32 },
    Deny,
    /// The local tree is missing context to decide.
    Unknown,
}

impl ScopeDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Evaluates scopes against the current materialized tree.
pub trait ScopeEvaluator {
    fn evaluate(&self, scope: &Scope, node: NodeId) -> ScopeDecision;
}

/// One resource grant inside a token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Capability {
    pub doc: DocId,
    pub scope: Scope,
    pub actions: BTreeSet<Action>,
}

/// Decoded claims of a capability token.
#[derive(Clone, Debug)]
pub struct TokenClaims {
    pub aud: Vec<String>,
    pub exp: Option<u64>,
    pub nbf: Option<u64>,
    pub subject: ReplicaId,
    pub caps: Vec<Capability>,
    pub proof: Option<Vec<u8>>,
}

impl TokenClaims {
    pub fn new(doc: DocId, subject: ReplicaId, caps: Vec<Capability>) -> Self {
        Self {
            aud: vec![doc.to_string()],
            exp: None,
            nbf: None,
            subject,
            caps,
            proof: None,
        }
    }

    fn to_value(&self) -> Result<Value> {
        let aud = if self.aud.len() == 1 {
            Value::Text(self.aud[0].clone())
        } else {
            Value::Array(self.aud.iter().cloned().map(Value::Text).collect())
        };
        let mut cnf = vec![(
            Value::Text("pub".into()),
            Value::Bytes(self.subject.as_bytes().to_vec()),
        )];
        cnf.push((
            Value::Text("kid".into()),
            Value::Bytes(key_id(&self.subject).to_vec()),
        ));
        let caps = self
            .caps
            .iter()
            .map(|cap| {
                let mut res = vec![(
                    Value::Text("doc_id".into()),
                    Value::Text(cap.doc.to_string()),
                )];
                if !cap.scope.root.is_root() {
                    res.push((
                        Value::Text("root".into()),
                        Value::Bytes(cap.scope.root.as_bytes().to_vec()),
                    ));
                }
                if let Some(depth) = cap.scope.max_depth {
                    res.push((
                        Value::Text("max_depth".into()),
                        Value::Integer(depth.into()),
                    ));
                }
                if !cap.scope.exclude.is_empty() {
                    res.push((
                        Value::Text("exclude".into()),
                        Value::Array(
                            cap.scope
                                .exclude
                                .iter()
                                .map(|n| Value::Bytes(n.as_bytes().to_vec()))
                                .collect(),
                        ),
                    ));
                }
                let actions = cap
                    .actions
                    .iter()
                    .map(|a| Value::Text(a.as_str().into()))
                    .collect();
                cose::canonical_map(vec![
                    (Value::Text("res".into()), cose::canonical_map(res)?),
                    (Value::Text("actions".into()), Value::Array(actions)),
                ])
            })
            .collect::<Result<Vec<_>>>()?;
        let mut claims = vec![
            (Value::Integer(CLAIM_AUD.into()), aud),
            (Value::Integer(CLAIM_CNF.into()), cose::canonical_map(cnf)?),
            (Value::Integer(CLAIM_CAPS.into()), Value::Array(caps)),
        ];
        if let Some(exp) = self.exp {
            claims.push((Value::Integer(CLAIM_EXP.into()), Value::Integer(exp.into())));
        }
        if let Some(nbf) = self.nbf {
            claims.push((Value::Integer(CLAIM_NBF.into()), Value::Integer(nbf.into())));
        }
        if let Some(proof) = &self.proof {
            claims.push((
                Value::Integer(CLAIM_PROOF.into()),
                Value::Bytes(proof.clone()),
            ));
        }
        cose::canonical_map(claims)
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| anyhow!("token claims: expected map"))?;
        let aud = match cose::map_get_int(map, CLAIM_AUD) {
            Some(Value::Text(aud)) => vec![aud.clone()],
            Some(Value::Array(auds)) => auds
                .iter()
                .map(|v| {
                    v.as_text()
                        .map(|s| s.to_string())
                        .ok_or_else(|| anyhow!("token claims: bad aud entry"))
                })
                .collect::<Result<_>>()?,
            _ => bail!("token claims: missing aud"),
        };
        let exp = cose::map_get_int(map, CLAIM_EXP)
            .and_then(|v| v.as_integer())
            .map(|i| i128::from(i) as u64);
        let nbf = cose::map_get_int(map, CLAIM_NBF)
            .and_then(|v| v.as_integer())
            .map(|i| i128::from(i) as u64);
        let cnf = cose::map_get_int(map, CLAIM_CNF)
            .and_then(|v| v.as_map())
            .ok_or_else(|| anyhow!("token claims: missing cnf"))?;
        let subject = cose::map_get_text(cnf, "pub")
            .and_then(|v| v.as_bytes())
            .filter(|b| b.len() == 32)
            .ok_or_else(|| anyhow!("token claims: bad cnf pub"))?;
        let mut pk = [0; 32];
        pk.copy_from_slice(subject);
        let subject = ReplicaId::new(pk);
        if let Some(kid) = cose::map_get_text(cnf, "kid").and_then(|v| v.as_bytes()) {
            if kid[..] != key_id(&subject)[..] {
                bail!("token claims: cnf kid does not match pub");
            }
        }
        let caps = cose::map_get_int(map, CLAIM_CAPS)
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("token claims: missing caps"))?
            .iter()
            .map(|cap| {
                let cap = cap
                    .as_map()
                    .ok_or_else(|| anyhow!("token claims: cap is not a map"))?;
                let res = cose::map_get_text(cap, "res")
                    .and_then(|v| v.as_map())
                    .ok_or_else(|| anyhow!("token claims: cap missing res"))?;
                let doc = cose::map_get_text(res, "doc_id")
                    .and_then(|v| v.as_text())
                    .ok_or_else(|| anyhow!("token claims: res missing doc_id"))?
                    .parse()?;
                let root = match cose::map_get_text(res, "root").and_then(|v| v.as_bytes()) {
                    Some(root) if root.len() == 16 => {
                        let mut id = [0; 16];
                        id.copy_from_slice(root);
                        NodeId::new(id)
                    }
                    Some(_) => bail!("token claims: bad scope root"),
                    None => NodeId::ROOT,
                };
                let max_depth = cose::map_get_text(res, "max_depth")
                    .and_then(|v| v.as_integer())
                    .map(|i| i128::from(i) as u32);
                let exclude = match cose::map_get_text(res, "exclude").and_then(|v| v.as_array()) {
                    Some(nodes) => nodes
                        .iter()
                        .map(|n| {
                            n.as_bytes()
                                .filter(|b| b.len() == 16)
                                .map(|b| {
                                    let mut id = [0; 16];
                                    id.copy_from_slice(b);
                                    NodeId::new(id)
                                })
                                .ok_or_else(|| anyhow!("token claims: bad exclude entry"))
                        })
                        .collect::<Result<_>>()?,
                    None => Vec::new(),
                };
                let actions = cose::map_get_text(cap, "actions")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| anyhow!("token claims: cap missing actions"))?
                    .iter()
                    .map(|a| {
                        a.as_text()
                            .ok_or_else(|| anyhow!("token claims: bad action"))?
                            .parse()
                    })
                    .collect::<Result<_>>()?;
                Ok(Capability {
                    doc,
                    scope: Scope {
                        root,
                        max_depth,
                        exclude,
                    },
                    actions,
                })
            })
            .collect::<Result<_>>()?;
        let proof = cose::map_get_int(map, CLAIM_PROOF)
            .and_then(|v| v.as_bytes())
            .cloned();
        Ok(Self {
            aud,
            exp,
            nbf,
            subject,
            caps,
            proof,
        })
    }
}

/// Everything token verification needs besides the token itself.
pub struct VerifyContext<'a> {
    pub doc: DocId,
    pub trusted_issuers: &'a [ReplicaId],
    pub revoked: &'a BTreeSet<TokenId>,
    /// Injected clock, seconds since the epoch.
    pub now: u64,
    pub evaluator: Option<&'a dyn ScopeEvaluator>,
}

/// A capability token: encoded COSE bytes plus decoded claims.
#[derive(Clone, Debug)]
pub struct CapToken {
    bytes: Vec<u8>,
    claims: TokenClaims,
    token_id: TokenId,
}

impl CapToken {
    /// Signs `claims` and returns the encoded token.
    pub fn issue(signer: &Keypair, claims: TokenClaims) -> Result<Self> {
        let payload = cose::encode(&claims.to_value()?)?;
        let bytes = cose::sign1(signer, &payload)?;
        let token_id = TokenId::derive(&bytes);
        Ok(Self {
            bytes,
            claims,
            token_id,
        })
    }

    /// Decodes a token without verifying its chain. Call [`CapToken::verify`]
    /// before trusting it.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload = cose::peek_payload(bytes)?;
        let claims = TokenClaims::from_value(&cose::decode(&payload)?)?;
        let token_id = TokenId::derive(bytes);
        Ok(Self {
            bytes: bytes.to_vec(),
            claims,
            token_id,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    pub fn token_id(&self) -> TokenId {
        self.token_id
    }

    pub fn subject(&self) -> ReplicaId {
        self.claims.subject
    }

    /// Capabilities this token grants for `doc`.
    pub fn caps_for(&self, doc: &DocId) -> impl Iterator<Item = &Capability> + '_ {
        let doc = *doc;
        self.claims.caps.iter().filter(move |cap| cap.doc == doc)
    }

    /// Validates the token and its whole delegation chain.
    pub fn verify(&self, ctx: &VerifyContext) -> Result<()> {
        self.verify_layer(ctx, 0)?;
        Ok(())
    }

    fn verify_layer(&self, ctx: &VerifyContext, depth: usize) -> Result<()> {
        if depth > MAX_CHAIN_DEPTH {
            bail!("delegation chain too deep");
        }
        if ctx.revoked.contains(&self.token_id) {
            bail!("capability token revoked");
        }
        if let Some(exp) = self.claims.exp {
            if ctx.now >= exp {
                bail!("capability token expired");
            }
        }
        if let Some(nbf) = self.claims.nbf {
            if ctx.now < nbf {
                bail!("capability token not yet valid");
            }
        }
        let doc = ctx.doc.to_string();
        if !self.claims.aud.iter().any(|aud| *aud == doc) {
            bail!("capability token audience mismatch");
        }
        match &self.claims.proof {
            Some(proof) => {
                let proof = CapToken::decode(proof)?;
                proof.verify_layer(ctx, depth + 1)?;
                cose::verify1(&self.bytes, &proof.claims.subject)?;
                if !proof
                    .caps_for(&ctx.doc)
                    .any(|cap| cap.actions.contains(&Action::Grant))
                {
                    bail!("delegation proof lacks grant");
                }
                for cap in self.caps_for(&ctx.doc) {
                    let covered = proof.caps_for(&ctx.doc).try_fold(false, |acc, outer| {
                        if acc || !outer.actions.is_superset(&cap.actions) {
                            return Ok::<_, anyhow::Error>(acc);
                        }
                        scope_within(&cap.scope, &outer.scope, ctx.evaluator).map(|ok| acc || ok)
                    })?;
                    if !covered {
                        bail!("delegated scope not covered by proof");
                    }
                }
            }
            None => {
                let trusted = ctx
                    .trusted_issuers
                    .iter()
                    .any(|issuer| cose::verify1(&self.bytes, issuer).is_ok());
                if !trusted {
                    bail!("capability token issuer not trusted");
                }
            }
        }
        Ok(())
    }
}

/// Is `inner` contained in `outer` on the current tree?
///
/// With equal roots containment is structural. With differing roots the
/// evaluator walks the tree; narrowing a delegation to a descendant root is
/// only checkable against local context.
fn scope_within(
    inner: &Scope,
    outer: &Scope,
    evaluator: Option<&dyn ScopeEvaluator>,
) -> Result<bool> {
    if !outer
        .exclude
        .iter()
        .all(|node| inner.exclude.contains(node))
    {
        return Ok(false);
    }
    if inner.root == outer.root {
        return Ok(match (inner.max_depth, outer.max_depth) {
            (_, None) => true,
            (Some(inner), Some(outer)) => inner <= outer,
            (None, Some(_)) => false,
        });
    }
    let evaluator =
        evaluator.ok_or_else(|| anyhow!("scope evaluator required to validate delegation"))?;
    match evaluator.evaluate(outer, inner.root) {
        ScopeDecision::Allow { depth } => Ok(match outer.max_depth {
            None => true,
            Some(od) => match inner.max_depth {
                Some(id) => id.saturating_add(depth) <= od,
                None => false,
            },
        }),
        ScopeDecision::Deny => Ok(false),
        ScopeDecision::Unknown => Ok(false),
    }
}

fn cert_claims(tag: &str, fields: Vec<(Value, Value)>) -> Result<Vec<u8>> {
    let mut entries = vec![(Value::Text("t".into()), Value::Text(tag.into()))];
    entries.extend(fields);
    cose::encode(&cose::canonical_map(entries)?)
}

fn cert_open(tag: &str, bytes: &[u8], signer: &ReplicaId) -> Result<Value> {
    let payload = cose::verify1(bytes, signer)?;
    let value = cose::decode(&payload)?;
    let ok = value
        .as_map()
        .and_then(|m| cose::map_get_text(m, "t"))
        .and_then(|v| v.as_text())
        .map(|t| t == tag)
        .unwrap_or(false);
    if !ok {
        bail!("certificate tag mismatch");
    }
    Ok(value)
}

fn cert_field_pk(value: &Value, field: &str) -> Result<ReplicaId> {
    let bytes = value
        .as_map()
        .and_then(|m| cose::map_get_text(m, field))
        .and_then(|v| v.as_bytes())
        .filter(|b| b.len() == 32)
        .ok_or_else(|| anyhow!("certificate missing {}", field))?;
    let mut pk = [0; 32];
    pk.copy_from_slice(bytes);
    Ok(ReplicaId::new(pk))
}

/// Issues a device certificate: the identity key vouches for a device key.
pub fn issue_device_cert(identity: &Keypair, device: &ReplicaId) -> Result<Vec<u8>> {
    let payload = cert_claims(
        DEVICE_CERT_TAG,
        vec![
            (
                Value::Text("identity".into()),
                Value::Bytes(identity.replica_id().as_bytes().to_vec()),
            ),
            (
                Value::Text("device".into()),
                Value::Bytes(device.as_bytes().to_vec()),
            ),
        ],
    )?;
    cose::sign1(identity, &payload)
}

/// Issues a replica certificate: a device key binds a replica key to a doc.
pub fn issue_replica_cert(device: &Keypair, doc: &DocId, replica: &ReplicaId) -> Result<Vec<u8>> {
    let payload = cert_claims(
        REPLICA_CERT_TAG,
        vec![
            (
                Value::Text("doc".into()),
                Value::Bytes(doc.as_bytes().to_vec()),
            ),
            (
                Value::Text("device".into()),
                Value::Bytes(device.replica_id().as_bytes().to_vec()),
            ),
            (
                Value::Text("replica".into()),
                Value::Bytes(replica.as_bytes().to_vec()),
            ),
        ],
    )?;
    cose::sign1(device, &payload)
}

/// An optional attribution chain: identity key, a device cert for one of its
/// devices, and a replica cert binding the signing replica to the doc.
#[derive(Clone, Debug)]
pub struct IdentityChain {
    pub identity: ReplicaId,
    pub device_cert: Vec<u8>,
    pub replica_cert: Vec<u8>,
}

impl IdentityChain {
    /// Verifies the chain and returns the attributed replica key.
    pub fn verify(&self, doc: &DocId) -> Result<ReplicaId> {
        let device_claims = cert_open(DEVICE_CERT_TAG, &self.device_cert, &self.identity)?;
        if cert_field_pk(&device_claims, "identity")? != self.identity {
            bail!("device cert identity mismatch");
        }
        let device = cert_field_pk(&device_claims, "device")?;
        let replica_claims = cert_open(REPLICA_CERT_TAG, &self.replica_cert, &device)?;
        let bound_doc = replica_claims
            .as_map()
            .and_then(|m| cose::map_get_text(m, "doc"))
            .and_then(|v| v.as_bytes())
            .filter(|b| b[..] == doc.as_bytes()[..])
            .is_some();
        if !bound_doc {
            bail!("replica cert bound to a different doc");
        }
        cert_field_pk(&replica_claims, "replica")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        doc: DocId,
        issuers: &'a [ReplicaId],
        revoked: &'a BTreeSet<TokenId>,
    ) -> VerifyContext<'a> {
        VerifyContext {
            doc,
            trusted_issuers: issuers,
            revoked,
            now: 1_000,
            evaluator: None,
        }
    }

    fn doc_wide_claims(doc: DocId, subject: ReplicaId) -> TokenClaims {
        TokenClaims::new(
            doc,
            subject,
            vec![Capability {
                doc,
                scope: Scope::doc_wide(),
                actions: Action::ALL.into_iter().collect(),
            }],
        )
    }

    #[test]
    fn issue_verify_roundtrip() {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let subject = Keypair::generate().replica_id();
        let token = CapToken::issue(&issuer, doc_wide_claims(doc, subject)).unwrap();
        let decoded = CapToken::decode(token.as_bytes()).unwrap();
        assert_eq!(decoded.token_id(), token.token_id());
        assert_eq!(decoded.subject(), subject);
        let issuers = [issuer.replica_id()];
        let revoked = BTreeSet::new();
        decoded.verify(&ctx(doc, &issuers, &revoked)).unwrap();
    }

    #[test]
    fn untrusted_issuer_rejected() {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let token = CapToken::issue(
            &issuer,
            doc_wide_claims(doc, Keypair::generate().replica_id()),
        )
        .unwrap();
        let issuers = [Keypair::generate().replica_id()];
        let revoked = BTreeSet::new();
        let err = token.verify(&ctx(doc, &issuers, &revoked)).unwrap_err();
        assert!(err.to_string().contains("issuer not trusted"));
    }

    #[test]
    fn expiry_and_nbf() {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let mut claims = doc_wide_claims(doc, Keypair::generate().replica_id());
        claims.exp = Some(500);
        let token = CapToken::issue(&issuer, claims).unwrap();
        let issuers = [issuer.replica_id()];
        let revoked = BTreeSet::new();
        let err = token.verify(&ctx(doc, &issuers, &revoked)).unwrap_err();
        assert!(err.to_string().contains("expired"));

        let mut claims = doc_wide_claims(doc, Keypair::generate().replica_id());
        claims.nbf = Some(2_000);
        let token = CapToken::issue(&issuer, claims).unwrap();
        let err = token.verify(&ctx(doc, &issuers, &revoked)).unwrap_err();
        assert!(err.to_string().contains("not yet valid"));
    }

    #[test]
    fn revoked_ancestor_invalidates_delegation() {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let delegator = Keypair::generate();
        let leaf_subject = Keypair::generate().replica_id();

        let proof = CapToken::issue(&issuer, doc_wide_claims(doc, delegator.replica_id())).unwrap();
        let mut claims = doc_wide_claims(doc, leaf_subject);
        claims.proof = Some(proof.as_bytes().to_vec());
        let leaf = CapToken::issue(&delegator, claims).unwrap();

        let issuers = [issuer.replica_id()];
        let revoked = BTreeSet::new();
        leaf.verify(&ctx(doc, &issuers, &revoked)).unwrap();

        let revoked: BTreeSet<_> = [proof.token_id()].into_iter().collect();
        let err = leaf.verify(&ctx(doc, &issuers, &revoked)).unwrap_err();
        assert!(err.to_string().contains("revoked"));
    }

    #[test]
    fn narrowed_root_needs_evaluator() {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let delegator = Keypair::generate();
        let subtree = NodeId::generate();

        let proof = CapToken::issue(&issuer, doc_wide_claims(doc, delegator.replica_id())).unwrap();
        let mut claims = TokenClaims::new(
            doc,
            Keypair::generate().replica_id(),
            vec![Capability {
                doc,
                scope: Scope::subtree(subtree),
                actions: [Action::ReadStructure, Action::WriteStructure]
                    .into_iter()
                    .collect(),
            }],
        );
        claims.proof = Some(proof.as_bytes().to_vec());
        let leaf = CapToken::issue(&delegator, claims).unwrap();

        let issuers = [issuer.replica_id()];
        let revoked = BTreeSet::new();
        let err = leaf.verify(&ctx(doc, &issuers, &revoked)).unwrap_err();
        assert!(err.to_string().contains("scope evaluator"));

        struct AllowAll;
        impl ScopeEvaluator for AllowAll {
            fn evaluate(&self, _scope: &Scope, _node: NodeId) -> ScopeDecision {
                ScopeDecision::Allow { depth: 1 }
            }
        }
        let mut ctx = ctx(doc, &issuers, &revoked);
        ctx.evaluator = Some(&AllowAll);
        leaf.verify(&ctx).unwrap();
    }

    #[test]
    fn proof_without_grant_rejected() {
        let issuer = Keypair::generate();
        let doc = DocId::new(issuer.replica_id().into());
        let delegator = Keypair::generate();

        let mut proof_claims = doc_wide_claims(doc, delegator.replica_id());
        for cap in &mut proof_claims.caps {
            cap.actions.remove(&Action::Grant);
        }
        let proof = CapToken::issue(&issuer, proof_claims).unwrap();
        let mut claims = doc_wide_claims(doc, Keypair::generate().replica_id());
        claims.proof = Some(proof.as_bytes().to_vec());
        let leaf = CapToken::issue(&delegator, claims).unwrap();

        let issuers = [issuer.replica_id()];
        let revoked = BTreeSet::new();
        let err = leaf.verify(&ctx(doc, &issuers, &revoked)).unwrap_err();
        assert!(err.to_string().contains("lacks grant"));
    }

    #[test]
    fn identity_chain_verifies() {
        let identity = Keypair::generate();
        let device = Keypair::generate();
        let replica = Keypair::generate().replica_id();
        let doc = DocId::new(Keypair::generate().replica_id().into());

        let chain = IdentityChain {
            identity: identity.replica_id(),
            device_cert: issue_device_cert(&identity, &device.replica_id()).unwrap(),
            replica_cert: issue_replica_cert(&device, &doc, &replica).unwrap(),
        };
        assert_eq!(chain.verify(&doc).unwrap(), replica);

        let other_doc = DocId::new(Keypair::generate().replica_id().into());
        assert!(chain.verify(&other_doc).is_err());
    }
}
