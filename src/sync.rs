//! The peer sync protocol.
//!
//! A session starts with a hello exchange that presents capability tokens
//! and proposes filters. The responder authorizes each filter against the
//! peer's tokens; rejected filters come back marked unauthorized while the
//! rest proceed. Per accepted filter the initiator streams RIBLT codewords,
//! the responder peels the symmetric difference, and both sides transfer
//! the ops the other is missing in bounded batches. Outgoing ops are
//! additionally filtered against the receiver's capabilities so nothing
//! about excluded subtrees ever crosses the wire. After transfer the
//! responder serves live subscriptions, pushing new ops as its log grows.

use crate::transport::{recv_msg, send_msg, Transport};
use crate::wire::{self, ErrorCode, FilterKind, FilterSpec, Payload, SyncMessage};
use anyhow::{anyhow, bail, Result};
use arbor_crdt::{
    combine_or, required_checks, Action, Applied, CapToken, Decoder, Doc, DocId, Encoder, NodeId,
    OpKind, OpRef, ScopeDecision, ScopeEvaluator, SignedOp, Symbol,
};
use fnv::FnvHashMap;
use futures::FutureExt;

const RIBLT_SEED_DOMAIN: &[u8] = b"treecrdt/sync/riblt-seed/v0";

/// Tunables of a sync session.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub codewords_per_message: usize,
    pub max_codewords: usize,
    pub max_ops_per_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            codewords_per_message: 64,
            max_codewords: 4096,
            max_ops_per_batch: 64,
        }
    }
}

/// What a session pulls: the whole doc or the children of one parent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Filter {
    All,
    Children(NodeId),
}

impl Filter {
    fn to_spec(self, id: u32) -> FilterSpec {
        FilterSpec {
            id,
            kind: Some(match self {
                Filter::All => FilterKind::All(true),
                Filter::Children(parent) => FilterKind::Children(parent.as_bytes().to_vec()),
            }),
        }
    }

    fn from_spec(spec: &FilterSpec) -> Result<Self> {
        match &spec.kind {
            Some(FilterKind::All(_)) => Ok(Filter::All),
            Some(FilterKind::Children(parent)) => {
                let parent: [u8; 16] = parent
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("filter parent must be 16 bytes"))?;
                Ok(Filter::Children(NodeId::new(parent)))
            }
            None => Err(anyhow!("filter spec without kind")),
        }
    }
}

/// Outcome of an initiated session.
#[derive(Clone, Debug, Default)]
pub struct SyncSummary {
    pub applied: usize,
    pub pending: usize,
    pub sent: usize,
    pub rejected_filters: Vec<(u32, String)>,
    pub failed_filters: Vec<u32>,
}

fn riblt_seed(doc: &DocId, filter_id: u32) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(RIBLT_SEED_DOMAIN);
    hasher.update(doc.as_ref());
    hasher.update(&filter_id.to_be_bytes());
    u64::from_be_bytes(hasher.finalize().as_bytes()[..8].try_into().unwrap())
}

fn filter_refs(doc: &Doc, filter: &Filter) -> Result<Vec<OpRef>> {
    match filter {
        Filter::All => doc.frontend().engine().op_refs_all(doc.id()),
        Filter::Children(parent) => doc.frontend().engine().op_refs_children(doc.id(), parent),
    }
}

fn symbols(refs: &[OpRef]) -> Vec<Symbol> {
    refs.iter().map(|r| *r.as_bytes()).collect()
}

/// Can these tokens pull under this filter? `All` needs a doc-wide
/// read_structure grant; a children filter needs read_structure to
/// evaluate to allow at the parent.
fn filter_allows(doc: &Doc, tokens: &[CapToken], filter: &Filter) -> bool {
    let doc_id = *doc.id();
    match filter {
        Filter::All => tokens.iter().any(|token| {
            token
                .caps_for(&doc_id)
                .any(|cap| cap.scope.is_doc_wide() && cap.actions.contains(&Action::ReadStructure))
        }),
        Filter::Children(parent) => {
            let view = doc.frontend().engine().tree_view(doc_id);
            tokens
                .iter()
                .flat_map(|token| token.caps_for(&doc_id))
                .filter(|cap| cap.actions.contains(&Action::ReadStructure))
                .map(|cap| view.evaluate(&cap.scope, *parent))
                .fold(ScopeDecision::Deny, combine_or)
                .is_allow()
        }
    }
}

/// The outgoing capability filter: an op is sent only when every node it
/// concerns (the target node plus each scope-check target) is strictly
/// readable under the receiver's tokens. Dropping anything less keeps
/// tombstone and move traffic for excluded subtrees invisible.
fn op_visible_to_peer(doc: &Doc, signed: &SignedOp, peer_tokens: &[CapToken]) -> bool {
    if peer_tokens.is_empty() {
        return false;
    }
    let doc_id = *doc.id();
    let engine = doc.frontend().engine();
    let view = engine.tree_view(doc_id);
    let parent_of = |node: &NodeId| {
        engine
            .node_row(&doc_id, node)
            .ok()
            .flatten()
            .and_then(|row| row.parent)
    };
    let mut targets = vec![signed.op.kind.node()];
    for check in required_checks(&signed.op, parent_of) {
        if !targets.contains(&check.node) {
            targets.push(check.node);
        }
    }
    let carries_payload = matches!(
        &signed.op.kind,
        OpKind::Insert {
            payload: Some(_),
            ..
        } | OpKind::Payload {
            payload: Some(_),
            ..
        }
    );
    let mut actions = vec![Action::ReadStructure];
    if carries_payload {
        actions.push(Action::ReadPayload);
    }
    targets.iter().all(|target| {
        actions.iter().all(|action| {
            peer_tokens
                .iter()
                .flat_map(|token| token.caps_for(&doc_id))
                .filter(|cap| cap.actions.contains(action))
                .map(|cap| view.evaluate(&cap.scope, *target))
                .fold(ScopeDecision::Deny, combine_or)
                .is_allow()
        })
    })
}

/// Decodes and installs tokens presented by the peer, keeping the ones
/// whose chains verify.
fn install_peer_tokens(doc: &Doc, capabilities: &[Vec<u8>]) -> Vec<CapToken> {
    let mut tokens = Vec::with_capacity(capabilities.len());
    for bytes in capabilities {
        match doc.add_token(bytes) {
            Ok(token) => tokens.push(token),
            Err(err) => tracing::info!("presented token rejected: {}", err),
        }
    }
    tokens
}

fn our_capabilities(doc: &Doc) -> Vec<Vec<u8>> {
    doc.frontend()
        .tokens()
        .tokens_for(doc.id(), &doc.replica_id())
        .iter()
        .map(|token| token.as_bytes().to_vec())
        .collect()
}

fn msg(doc_id: &str, payload: Payload) -> SyncMessage {
    SyncMessage {
        v: wire::VERSION,
        doc_id: doc_id.to_string(),
        payload: Some(payload),
    }
}

fn error_payload(
    code: ErrorCode,
    message: &str,
    filter_id: Option<u32>,
    subscription_id: Option<u32>,
) -> Payload {
    Payload::SyncError(wire::SyncError {
        code: code as i32,
        message: message.to_string(),
        filter_id,
        subscription_id,
    })
}

async fn expect_msg(transport: &mut dyn Transport, doc_id: &str) -> Result<SyncMessage> {
    let msg = recv_msg(transport)
        .await?
        .ok_or_else(|| anyhow!("transport closed (cancelled)"))?;
    wire::check_envelope(&msg, doc_id)?;
    Ok(msg)
}

/// Sends the ops for `refs` in bounded batches, ending with `done`. Always
/// emits at least the final empty batch so the receiver can make progress.
async fn send_ops(
    doc: &Doc,
    transport: &mut dyn Transport,
    doc_id: &str,
    filter_id: u32,
    refs: &[OpRef],
    peer_tokens: &[CapToken],
    config: &SyncConfig,
    done: bool,
) -> Result<usize> {
    let ops = doc.frontend().engine().ops_get(doc.id(), refs)?;
    let visible: Vec<&SignedOp> = ops
        .iter()
        .filter(|signed| op_visible_to_peer(doc, signed, peer_tokens))
        .collect();
    let mut sent = 0;
    let mut chunks = visible.chunks(config.max_ops_per_batch.max(1)).peekable();
    if chunks.peek().is_none() {
        if done {
            let batch = wire::OpsBatch {
                filter_id,
                ops: Vec::new(),
                auth: Vec::new(),
                done: true,
            };
            send_msg(transport, &msg(doc_id, Payload::OpsBatch(batch))).await?;
        }
        return Ok(0);
    }
    while let Some(chunk) = chunks.next() {
        let mut ops = Vec::with_capacity(chunk.len());
        let mut auth = Vec::with_capacity(chunk.len());
        for signed in chunk {
            let (op, op_auth) = wire::encode_op(signed)?;
            ops.push(op);
            auth.push(op_auth);
        }
        sent += chunk.len();
        let batch = wire::OpsBatch {
            filter_id,
            ops,
            auth,
            done: done && chunks.peek().is_none(),
        };
        send_msg(transport, &msg(doc_id, Payload::OpsBatch(batch))).await?;
    }
    Ok(sent)
}

fn decode_batch(batch: &wire::OpsBatch) -> Result<Vec<SignedOp>> {
    if batch.ops.len() != batch.auth.len() {
        bail!(
            "ops batch auth misaligned: {} ops, {} auth",
            batch.ops.len(),
            batch.auth.len()
        );
    }
    batch
        .ops
        .iter()
        .zip(batch.auth.iter())
        .map(|(op, auth)| wire::decode_op(op, auth))
        .collect()
}

/// Applies one received batch; auth failures bounce back as a session
/// scoped unauthorized error.
async fn apply_batch(
    doc: &Doc,
    transport: &mut dyn Transport,
    doc_id: &str,
    filter_id: u32,
    batch: &wire::OpsBatch,
) -> Result<Applied> {
    let ops = match decode_batch(batch) {
        Ok(ops) => ops,
        Err(err) => {
            send_msg(
                transport,
                &msg(
                    doc_id,
                    error_payload(ErrorCode::Protocol, &err.to_string(), Some(filter_id), None),
                ),
            )
            .await
            .ok();
            return Err(err);
        }
    };
    match doc.frontend().apply_remote(doc.id(), &ops) {
        Ok(applied) => Ok(applied),
        Err(err) => {
            send_msg(
                transport,
                &msg(
                    doc_id,
                    error_payload(
                        ErrorCode::Unauthorized,
                        &err.to_string(),
                        Some(filter_id),
                        None,
                    ),
                ),
            )
            .await
            .ok();
            Err(err)
        }
    }
}

/// Receives ops batches for one filter until `done`.
async fn recv_ops(
    doc: &Doc,
    transport: &mut dyn Transport,
    doc_id: &str,
    filter_id: u32,
) -> Result<Applied> {
    let mut total = Applied::default();
    loop {
        let msg = expect_msg(transport, doc_id).await?;
        match msg.payload {
            Some(Payload::OpsBatch(batch)) if batch.filter_id == filter_id => {
                let applied = apply_batch(doc, transport, doc_id, filter_id, &batch).await?;
                total.applied += applied.applied;
                total.pending += applied.pending;
                if batch.done {
                    return Ok(total);
                }
            }
            Some(Payload::SyncError(err)) => {
                bail!("peer error {:?}: {}", err.code, err.message);
            }
            other => bail!("unexpected message during op transfer: {:?}", kind_of(&other)),
        }
    }
}

fn kind_of(payload: &Option<Payload>) -> &'static str {
    match payload {
        Some(Payload::Hello(_)) => "hello",
        Some(Payload::HelloAck(_)) => "hello_ack",
        Some(Payload::RibltCodewords(_)) => "riblt_codewords",
        Some(Payload::RibltStatus(_)) => "riblt_status",
        Some(Payload::OpsBatch(_)) => "ops_batch",
        Some(Payload::Subscribe(_)) => "subscribe",
        Some(Payload::SubscribeAck(_)) => "subscribe_ack",
        Some(Payload::Unsubscribe(_)) => "unsubscribe",
        Some(Payload::SyncError(_)) => "sync_error",
        None => "empty",
    }
}

/// Runs the initiator side of a session over `filters`.
pub async fn initiate(
    doc: &Doc,
    transport: &mut dyn Transport,
    filters: &[Filter],
    config: &SyncConfig,
) -> Result<SyncSummary> {
    let doc_id = doc.id().to_string();
    let our_head = doc.head_lamport()?;
    let specs: Vec<FilterSpec> = filters
        .iter()
        .enumerate()
        .map(|(i, filter)| filter.to_spec(i as u32 + 1))
        .collect();
    send_msg(
        transport,
        &msg(
            &doc_id,
            Payload::Hello(wire::Hello {
                capabilities: our_capabilities(doc),
                filters: specs.clone(),
                max_lamport: our_head,
            }),
        ),
    )
    .await?;

    let ack = match expect_msg(transport, &doc_id).await?.payload {
        Some(Payload::HelloAck(ack)) => ack,
        Some(Payload::SyncError(err)) => bail!("peer error {:?}: {}", err.code, err.message),
        other => bail!("expected hello ack, got {:?}", kind_of(&other)),
    };
    let peer_tokens = install_peer_tokens(doc, &ack.capabilities);
    let mut summary = SyncSummary {
        rejected_filters: ack
            .rejected_filters
            .iter()
            .map(|r| (r.id, r.message.clone()))
            .collect(),
        ..Default::default()
    };

    for spec in &specs {
        if !ack.accepted_filters.contains(&spec.id) {
            continue;
        }
        let filter = Filter::from_spec(spec)?;
        let refs = filter_refs(doc, &filter)?;
        let seed = riblt_seed(doc.id(), spec.id);
        let mut encoder = Encoder::new(seed, symbols(&refs));
        let mut sent_upto = 0usize;

        // both empty-side fast paths skip the codeword stream entirely
        if our_head > 0 && ack.max_lamport > 0 {
            let upto = config.codewords_per_message.min(config.max_codewords);
            let cells = encoder.emit(upto)[..upto].to_vec();
            sent_upto = upto;
            send_msg(
                transport,
                &msg(
                    &doc_id,
                    Payload::RibltCodewords(wire::RibltCodewords {
                        filter_id: spec.id,
                        round: 0,
                        start_index: 0,
                        codewords: cells.iter().map(wire::encode_codeword).collect(),
                    }),
                ),
            )
            .await?;
        }

        let decoded = loop {
            let msg_in = expect_msg(transport, &doc_id).await?;
            match msg_in.payload {
                Some(Payload::RibltCodewords(req))
                    if req.filter_id == spec.id && req.codewords.is_empty() =>
                {
                    // a request for the next round of the stream
                    let start = sent_upto;
                    let upto = (start + config.codewords_per_message).min(config.max_codewords);
                    let cells = encoder.emit(upto)[start..upto].to_vec();
                    sent_upto = upto;
                    send_msg(
                        transport,
                        &msg(
                            &doc_id,
                            Payload::RibltCodewords(wire::RibltCodewords {
                                filter_id: spec.id,
                                round: req.round,
                                start_index: start as u64,
                                codewords: cells.iter().map(wire::encode_codeword).collect(),
                            }),
                        ),
                    )
                    .await?;
                }
                Some(Payload::RibltStatus(status)) if status.filter_id == spec.id => {
                    match status.outcome {
                        Some(wire::RibltOutcome::Decoded(decoded)) => break Some(decoded),
                        Some(wire::RibltOutcome::Failed(failed)) => {
                            tracing::info!(
                                "riblt failed for filter {}: {}",
                                spec.id,
                                failed.message
                            );
                            summary.failed_filters.push(spec.id);
                            break None;
                        }
                        None => bail!("riblt status without outcome"),
                    }
                }
                Some(Payload::SyncError(err)) => {
                    bail!("peer error {:?}: {}", err.code, err.message)
                }
                other => bail!("unexpected message during riblt: {:?}", kind_of(&other)),
            }
        };

        let decoded = match decoded {
            Some(decoded) => decoded,
            None => continue,
        };

        // the responder streams its batches right after the status
        let applied = recv_ops(doc, transport, &doc_id, spec.id).await?;
        summary.applied += applied.applied;
        summary.pending += applied.pending;

        // then we send what it is missing
        let missing: Vec<OpRef> = if ack.max_lamport == 0 {
            refs.clone()
        } else {
            decoded
                .receiver_missing
                .iter()
                .filter_map(|bytes| bytes.as_slice().try_into().ok().map(OpRef::new))
                .collect()
        };
        summary.sent += send_ops(
            doc,
            transport,
            &doc_id,
            spec.id,
            &missing,
            &peer_tokens,
            config,
            true,
        )
        .await?;
    }
    Ok(summary)
}

struct Subscription {
    id: u32,
    filter: Filter,
    last_lamport: u64,
}

/// Runs the responder side: hello, filter authorization, reconciliation,
/// op transfer, then serves subscriptions until the peer goes away.
pub async fn respond(doc: &Doc, transport: &mut dyn Transport, config: &SyncConfig) -> Result<()> {
    let doc_id = doc.id().to_string();
    let hello = match expect_msg(transport, &doc_id).await?.payload {
        Some(Payload::Hello(hello)) => hello,
        other => {
            let payload = error_payload(
                ErrorCode::Protocol,
                &format!("expected hello, got {}", kind_of(&other)),
                None,
                None,
            );
            send_msg(transport, &msg(&doc_id, payload)).await.ok();
            bail!("expected hello, got {:?}", kind_of(&other));
        }
    };
    let peer_tokens = install_peer_tokens(doc, &hello.capabilities);

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for spec in &hello.filters {
        match Filter::from_spec(spec) {
            Ok(filter) if filter_allows(doc, &peer_tokens, &filter) => {
                accepted.push((spec.id, filter))
            }
            Ok(_) => rejected.push(wire::RejectedFilter {
                id: spec.id,
                reason: ErrorCode::Unauthorized as i32,
                message: "filter not covered by presented capabilities".into(),
            }),
            Err(err) => rejected.push(wire::RejectedFilter {
                id: spec.id,
                reason: ErrorCode::Protocol as i32,
                message: err.to_string(),
            }),
        }
    }
    let our_head = doc.head_lamport()?;
    send_msg(
        transport,
        &msg(
            &doc_id,
            Payload::HelloAck(wire::HelloAck {
                capabilities: our_capabilities(doc),
                accepted_filters: accepted.iter().map(|(id, _)| *id).collect(),
                rejected_filters: rejected,
                max_lamport: our_head,
            }),
        ),
    )
    .await?;

    for (filter_id, filter) in &accepted {
        let refs = filter_refs(doc, filter)?;
        let seed = riblt_seed(doc.id(), *filter_id);

        let diff = if hello.max_lamport == 0 {
            // the peer is empty, everything we have is missing on its side
            Some((refs.clone(), Vec::new(), 0))
        } else if our_head == 0 {
            // we are empty, the peer sends everything after our status
            Some((Vec::new(), Vec::new(), 0))
        } else {
            let mut decoder = Decoder::new(seed, symbols(&refs));
            loop {
                let msg_in = expect_msg(transport, &doc_id).await?;
                match msg_in.payload {
                    Some(Payload::RibltCodewords(chunk)) if chunk.filter_id == *filter_id => {
                        let cells = chunk
                            .codewords
                            .iter()
                            .map(wire::decode_codeword)
                            .collect::<Result<Vec<_>>>()?;
                        decoder.add_codewords(&cells);
                        if let Some(diff) = decoder.try_decode() {
                            let sender_missing = diff
                                .local_only
                                .iter()
                                .map(|s| OpRef::new(*s))
                                .collect::<Vec<_>>();
                            let receiver_missing = diff
                                .remote_only
                                .iter()
                                .map(|s| OpRef::new(*s))
                                .collect::<Vec<_>>();
                            break Some((
                                sender_missing,
                                receiver_missing,
                                diff.codewords_received,
                            ));
                        }
                        if decoder.codewords_received() >= config.max_codewords {
                            let payload = Payload::RibltStatus(wire::RibltStatus {
                                filter_id: *filter_id,
                                round: chunk.round,
                                outcome: Some(wire::RibltOutcome::Failed(wire::RibltFailed {
                                    reason: ErrorCode::DecodeFailed as i32,
                                    message: format!(
                                        "undecodable after {} codewords",
                                        decoder.codewords_received()
                                    ),
                                })),
                            });
                            send_msg(transport, &msg(&doc_id, payload)).await?;
                            break None;
                        }
                        let payload = Payload::RibltCodewords(wire::RibltCodewords {
                            filter_id: *filter_id,
                            round: chunk.round + 1,
                            start_index: decoder.codewords_received() as u64,
                            codewords: Vec::new(),
                        });
                        send_msg(transport, &msg(&doc_id, payload)).await?;
                    }
                    Some(Payload::SyncError(err)) => {
                        bail!("peer error {:?}: {}", err.code, err.message)
                    }
                    other => bail!("unexpected message during riblt: {:?}", kind_of(&other)),
                }
            }
        };

        let (sender_missing, receiver_missing, codewords_received) = match diff {
            Some(diff) => diff,
            None => continue,
        };

        let payload = Payload::RibltStatus(wire::RibltStatus {
            filter_id: *filter_id,
            round: 0,
            outcome: Some(wire::RibltOutcome::Decoded(wire::RibltDecoded {
                sender_missing: sender_missing
                    .iter()
                    .map(|r| r.as_bytes().to_vec())
                    .collect(),
                receiver_missing: receiver_missing
                    .iter()
                    .map(|r| r.as_bytes().to_vec())
                    .collect(),
                codewords_received: codewords_received as u64,
            })),
        });
        send_msg(transport, &msg(&doc_id, payload)).await?;

        // our batches first, then the peer's
        send_ops(
            doc,
            transport,
            &doc_id,
            *filter_id,
            &sender_missing,
            &peer_tokens,
            config,
            true,
        )
        .await?;
        recv_ops(doc, transport, &doc_id, *filter_id).await?;
    }

    serve_subscriptions(doc, transport, &doc_id, &peer_tokens, config).await
}

/// The post-transfer service loop: accept subscriptions, wake on local log
/// growth, push matching ops, handle cancellation.
async fn serve_subscriptions(
    doc: &Doc,
    transport: &mut dyn Transport,
    doc_id: &str,
    peer_tokens: &[CapToken],
    config: &SyncConfig,
) -> Result<()> {
    let mut subs: FnvHashMap<u32, Subscription> = FnvHashMap::default();
    let mut watcher = doc.frontend().watch(doc.id());
    loop {
        let incoming = if subs.is_empty() {
            // nothing to push, just wait for the peer
            match recv_msg(transport).await? {
                Some(msg) => Some(msg),
                None => return Ok(()),
            }
        } else {
            let recv_fut = recv_msg(transport).fuse();
            futures::pin_mut!(recv_fut);
            let mut watch_fut = futures::FutureExt::fuse(&mut watcher);
            futures::select! {
                msg = recv_fut => match msg? {
                    Some(msg) => Some(msg),
                    None => return Ok(()),
                },
                _ = watch_fut => None,
            }
        };

        match incoming {
            None => {
                // local log grew, push updates to every live subscription
                flush_subscriptions(doc, transport, doc_id, &mut subs, peer_tokens, config)
                    .await?;
            }
            Some(msg_in) => {
                wire::check_envelope(&msg_in, doc_id)?;
                match msg_in.payload {
                    Some(Payload::Subscribe(sub)) => {
                        let spec = sub
                            .filter
                            .as_ref()
                            .ok_or_else(|| anyhow!("subscribe without filter"))?;
                        match Filter::from_spec(spec) {
                            Ok(filter) if filter_allows(doc, peer_tokens, &filter) => {
                                subs.insert(
                                    sub.subscription_id,
                                    Subscription {
                                        id: sub.subscription_id,
                                        filter,
                                        last_lamport: doc.head_lamport()?,
                                    },
                                );
                                send_msg(
                                    transport,
                                    &msg(
                                        doc_id,
                                        Payload::SubscribeAck(wire::SubscribeAck {
                                            subscription_id: sub.subscription_id,
                                        }),
                                    ),
                                )
                                .await?;
                            }
                            _ => {
                                send_msg(
                                    transport,
                                    &msg(
                                        doc_id,
                                        error_payload(
                                            ErrorCode::Unauthorized,
                                            "subscription filter not covered",
                                            None,
                                            Some(sub.subscription_id),
                                        ),
                                    ),
                                )
                                .await?;
                            }
                        }
                    }
                    Some(Payload::Unsubscribe(unsub)) => {
                        subs.remove(&unsub.subscription_id);
                    }
                    Some(Payload::OpsBatch(batch)) => {
                        // peers may keep pushing ops after transfer
                        apply_batch(doc, transport, doc_id, batch.filter_id, &batch).await?;
                    }
                    Some(Payload::SyncError(err)) => {
                        bail!("peer error {:?}: {}", err.code, err.message)
                    }
                    other => bail!("unexpected message: {:?}", kind_of(&other)),
                }
            }
        }
    }
}

fn op_in_filter(doc: &Doc, filter: &Filter, signed: &SignedOp) -> bool {
    match filter {
        Filter::All => true,
        Filter::Children(parent) => doc
            .frontend()
            .engine()
            .node_row(doc.id(), &signed.op.kind.node())
            .ok()
            .flatten()
            .and_then(|row| row.parent)
            .map(|p| p == *parent)
            .unwrap_or(false),
    }
}

async fn flush_subscriptions(
    doc: &Doc,
    transport: &mut dyn Transport,
    doc_id: &str,
    subs: &mut FnvHashMap<u32, Subscription>,
    peer_tokens: &[CapToken],
    config: &SyncConfig,
) -> Result<()> {
    let head = doc.head_lamport()?;
    for sub in subs.values_mut() {
        if head <= sub.last_lamport {
            continue;
        }
        let ops = doc
            .frontend()
            .engine()
            .ops_since(doc.id(), sub.last_lamport)?;
        sub.last_lamport = head;
        let visible: Vec<&SignedOp> = ops
            .iter()
            .filter(|signed| {
                op_in_filter(doc, &sub.filter, signed)
                    && op_visible_to_peer(doc, signed, peer_tokens)
            })
            .collect();
        for chunk in visible.chunks(config.max_ops_per_batch.max(1)) {
            let mut wire_ops = Vec::with_capacity(chunk.len());
            let mut auth = Vec::with_capacity(chunk.len());
            for signed in chunk {
                let (op, op_auth) = wire::encode_op(signed)?;
                wire_ops.push(op);
                auth.push(op_auth);
            }
            let batch = wire::OpsBatch {
                filter_id: sub.id,
                ops: wire_ops,
                auth,
                done: false,
            };
            send_msg(transport, &msg(doc_id, Payload::OpsBatch(batch))).await?;
        }
    }
    Ok(())
}

/// Subscribes to a filter on the peer and applies pushed batches until
/// `on_batch` returns false, then unsubscribes. Transport teardown resolves
/// with a cancellation error.
pub async fn subscribe(
    doc: &Doc,
    transport: &mut dyn Transport,
    filter: Filter,
    subscription_id: u32,
    mut on_batch: impl FnMut(Applied) -> bool + Send,
) -> Result<()> {
    let doc_id = doc.id().to_string();
    send_msg(
        transport,
        &msg(
            &doc_id,
            Payload::Subscribe(wire::Subscribe {
                subscription_id,
                filter: Some(filter.to_spec(0)),
                interval_ms: 0,
            }),
        ),
    )
    .await?;
    match expect_msg(transport, &doc_id).await?.payload {
        Some(Payload::SubscribeAck(ack)) if ack.subscription_id == subscription_id => {}
        Some(Payload::SyncError(err)) => bail!("subscribe rejected {:?}: {}", err.code, err.message),
        other => bail!("expected subscribe ack, got {:?}", kind_of(&other)),
    }
    loop {
        let msg_in = expect_msg(transport, &doc_id).await?;
        match msg_in.payload {
            Some(Payload::OpsBatch(batch)) => {
                let applied = apply_batch(doc, transport, &doc_id, batch.filter_id, &batch).await?;
                if !on_batch(applied) {
                    send_msg(
                        transport,
                        &msg(&doc_id, Payload::Unsubscribe(wire::Unsubscribe { subscription_id })),
                    )
                    .await?;
                    return Ok(());
                }
            }
            Some(Payload::SyncError(err)) => {
                bail!("peer error {:?}: {}", err.code, err.message)
            }
            other => bail!("unexpected message: {:?}", kind_of(&other)),
        }
    }
}
