use crate::clock::KnownState;
use crate::id::{Dot, NodeId, ReplicaId};
use crate::op::{Op, OpAuth, OpKind, OpMeta, OrderKey, SignedOp};
use proptest::prelude::*;

pub fn arb_replica_id() -> impl Strategy<Value = ReplicaId> {
    (0u8..5).prop_map(|i| ReplicaId::new([i; 32]))
}

pub fn arb_node_id() -> impl Strategy<Value = NodeId> {
    (1u8..9).prop_map(|i| NodeId::new([i; 16]))
}

pub fn arb_dot() -> impl Strategy<Value = Dot> {
    (arb_replica_id(), 0u64..100).prop_map(|(id, counter)| Dot::new(id, counter))
}

pub fn arb_order_key() -> impl Strategy<Value = OrderKey> {
    proptest::collection::vec(any::<u8>(), 0..12).prop_map(OrderKey::from)
}

pub fn arb_payload() -> impl Strategy<Value = Option<Vec<u8>>> {
    proptest::option::of(proptest::collection::vec(any::<u8>(), 0..48))
}

pub fn arb_known_state() -> impl Strategy<Value = KnownState> {
    proptest::collection::vec(arb_dot(), 0..16).prop_map(|dots| dots.into_iter().collect())
}

pub fn arb_op_kind() -> impl Strategy<Value = OpKind> {
    prop_oneof![
        (arb_node_id(), arb_node_id(), arb_order_key(), arb_payload()).prop_map(
            |(parent, node, order_key, payload)| OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            }
        ),
        (arb_node_id(), arb_node_id(), arb_order_key()).prop_map(
            |(node, new_parent, order_key)| OpKind::Move {
                node,
                new_parent,
                order_key,
            }
        ),
        arb_node_id().prop_map(|node| OpKind::Delete { node }),
        arb_node_id().prop_map(|node| OpKind::Tombstone { node }),
        (arb_node_id(), arb_payload()).prop_map(|(node, payload)| OpKind::Payload {
            node,
            payload,
        }),
    ]
}

pub fn arb_signed_op() -> impl Strategy<Value = SignedOp> {
    (
        arb_op_kind(),
        arb_dot(),
        1u64..1000,
        arb_known_state(),
        proptest::option::of(proptest::collection::vec(any::<u8>(), 16)),
    )
        .prop_map(|(kind, dot, lamport, known_state, proof)| {
            let known_state = match kind {
                OpKind::Delete { .. } => Some(known_state),
                _ => None,
            };
            SignedOp {
                op: Op {
                    meta: OpMeta {
                        dot,
                        lamport,
                        known_state,
                    },
                    kind,
                },
                auth: OpAuth {
                    sig: [7; 64],
                    proof_ref: proof
                        .map(|p| crate::token::TokenId::new(p.try_into().unwrap())),
                },
            }
        })
}
