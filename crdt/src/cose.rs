//! Deterministic CBOR and COSE_Sign1.
//!
//! All envelopes in this crate (capability tokens, certs, sealed blobs,
//! known-state vectors) are CBOR in RFC 8949 core deterministic form: map
//! keys sorted by their encoded bytes, shortest-form integers. Tokens and
//! certs are COSE_Sign1 structures signed with Ed25519 (alg -8).

use crate::crypto::{self, Keypair};
use crate::id::ReplicaId;
use anyhow::{anyhow, Result};
use ciborium::value::Value;

/// COSE algorithm identifier for EdDSA.
const ALG_EDDSA: i64 = -8;

pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|err| anyhow!("cbor encode: {}", err))?;
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Value> {
    ciborium::de::from_reader(bytes).map_err(|err| anyhow!("cbor decode: {}", err))
}

/// Builds a map value with entries sorted by their encoded key bytes, which
/// is the core deterministic ordering.
pub fn canonical_map(mut entries: Vec<(Value, Value)>) -> Result<Value> {
    let mut keyed = Vec::with_capacity(entries.len());
    for (key, value) in entries.drain(..) {
        let bytes = encode(&key)?;
        keyed.push((bytes, key, value));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(Value::Map(
        keyed.into_iter().map(|(_, k, v)| (k, v)).collect(),
    ))
}

pub fn map_get<'a>(map: &'a [(Value, Value)], key: &Value) -> Option<&'a Value> {
    map.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

pub fn map_get_text<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map_get(map, &Value::Text(key.into()))
}

pub fn map_get_int<'a>(map: &'a [(Value, Value)], key: i64) -> Option<&'a Value> {
    map_get(map, &Value::Integer(key.into()))
}

fn sig_structure(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let value = Value::Array(vec![
        Value::Text("Signature1".into()),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
        Value::Bytes(payload.to_vec()),
    ]);
    encode(&value)
}

fn protected_header() -> Result<Vec<u8>> {
    let map = canonical_map(vec![(
        Value::Integer(1.into()),
        Value::Integer(ALG_EDDSA.into()),
    )])?;
    encode(&map)
}

/// Signs `payload` as a COSE_Sign1 structure and returns its encoded bytes.
pub fn sign1(keypair: &Keypair, payload: &[u8]) -> Result<Vec<u8>> {
    let protected = protected_header()?;
    let sig = keypair.sign(&sig_structure(&protected, payload)?);
    let value = Value::Array(vec![
        Value::Bytes(protected),
        Value::Map(Vec::new()),
        Value::Bytes(payload.to_vec()),
        Value::Bytes(sig.to_vec()),
    ]);
    encode(&value)
}

fn parse(bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>, [u8; 64])> {
    let value = decode(bytes)?;
    let parts = value
        .as_array()
        .filter(|a| a.len() == 4)
        .ok_or_else(|| anyhow!("cose: expected a 4 element array"))?;
    let protected = parts[0]
        .as_bytes()
        .ok_or_else(|| anyhow!("cose: bad protected header"))?;
    let header = decode(protected)?;
    let alg = header
        .as_map()
        .and_then(|m| map_get_int(m, 1))
        .and_then(|v| v.as_integer())
        .ok_or_else(|| anyhow!("cose: missing alg"))?;
    if i128::from(alg) != i128::from(ALG_EDDSA) {
        return Err(anyhow!("cose: unsupported alg {:?}", alg));
    }
    let payload = parts[2]
        .as_bytes()
        .ok_or_else(|| anyhow!("cose: bad payload"))?;
    let sig = parts[3]
        .as_bytes()
        .filter(|s| s.len() == 64)
        .ok_or_else(|| anyhow!("cose: bad signature"))?;
    let mut sig64 = [0; 64];
    sig64.copy_from_slice(sig);
    Ok((protected.clone(), payload.clone(), sig64))
}

/// Verifies a COSE_Sign1 structure against `signer` and returns the payload.
pub fn verify1(bytes: &[u8], signer: &ReplicaId) -> Result<Vec<u8>> {
    let (protected, payload, sig) = parse(bytes)?;
    crypto::verify(signer, &sig_structure(&protected, &payload)?, &sig)?;
    Ok(payload)
}

/// Extracts the payload of a COSE_Sign1 structure without verifying the
/// signature. Used to discover claims (like the signer chain) that determine
/// which key to verify against.
pub fn peek_payload(bytes: &[u8]) -> Result<Vec<u8>> {
    let (_, payload, _) = parse(bytes)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign1_roundtrip() {
        let keypair = Keypair::generate();
        let bytes = sign1(&keypair, b"claims").unwrap();
        assert_eq!(verify1(&bytes, &keypair.replica_id()).unwrap(), b"claims");
        assert!(verify1(&bytes, &Keypair::generate().replica_id()).is_err());
        assert_eq!(peek_payload(&bytes).unwrap(), b"claims");
    }

    #[test]
    fn tampered_payload_rejected() {
        let keypair = Keypair::generate();
        let bytes = sign1(&keypair, b"claims").unwrap();
        let value = decode(&bytes).unwrap();
        let mut parts = value.as_array().unwrap().clone();
        parts[2] = Value::Bytes(b"forged".to_vec());
        let forged = encode(&Value::Array(parts)).unwrap();
        assert!(verify1(&forged, &keypair.replica_id()).is_err());
    }

    #[test]
    fn canonical_map_sorts_keys() {
        let a = canonical_map(vec![
            (Value::Text("bb".into()), Value::Integer(1.into())),
            (Value::Text("a".into()), Value::Integer(2.into())),
            (Value::Integer(3.into()), Value::Integer(3.into())),
        ])
        .unwrap();
        let b = canonical_map(vec![
            (Value::Integer(3.into()), Value::Integer(3.into())),
            (Value::Text("a".into()), Value::Integer(2.into())),
            (Value::Text("bb".into()), Value::Integer(1.into())),
        ])
        .unwrap();
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }
}
