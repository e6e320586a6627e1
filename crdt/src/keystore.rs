//! Keystore and payload encryption.
//!
//! Every secret persisted on a device is sealed under a single device wrap
//! key. A sealed blob is a CBOR envelope `{v, t, alg, nonce, ct}` whose AEAD
//! additional data binds it to its domain tag and doc, so a blob copied
//! between docs fails to open. Payload bytes are encrypted under a per-doc
//! keyring whose keys rotate; ciphertexts carry the key id they were sealed
//! with so old payloads stay readable after rotation.

use crate::cose;
use crate::crypto::Key;
use crate::id::DocId;
use anyhow::{anyhow, bail, Result};
use ciborium::value::Value;
use std::collections::BTreeMap;

const ENVELOPE_VERSION: u64 = 1;
const ALG: &str = "A256GCM";
const PAYLOAD_TAG: &str = "treecrdt/payload-encrypted/v1";
const WRAP_KEY: &[u8] = b"\x00device-wrap-key";

/// The kinds of sealed blobs the keystore holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlobKind {
    /// Issuer secret and replica secret of a doc the device created.
    DocKeyBundle,
    /// The doc's payload keyring.
    DocPayloadKey,
    /// The issuer secret alone.
    IssuerKey,
    /// Replica secret plus locally held capability tokens.
    LocalIdentity,
}

impl BlobKind {
    fn tag(&self) -> &'static str {
        match self {
            Self::DocKeyBundle => "treecrdt/doc-key-bundle/v1",
            Self::DocPayloadKey => "treecrdt/doc-payload-key/v1",
            Self::IssuerKey => "treecrdt/issuer-key/v1",
            Self::LocalIdentity => "treecrdt/local-identity/v1",
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            Self::DocKeyBundle => 1,
            Self::DocPayloadKey => 2,
            Self::IssuerKey => 3,
            Self::LocalIdentity => 4,
        }
    }
}

fn envelope_aad(tag: &str, doc: &DocId, label: Option<&[u8]>) -> Vec<u8> {
    let mut aad = Vec::with_capacity(tag.len() + 33 + label.map_or(0, |l| l.len() + 1));
    aad.extend_from_slice(tag.as_bytes());
    aad.extend_from_slice(doc.as_ref());
    if let Some(label) = label {
        aad.push(0);
        aad.extend_from_slice(label);
    }
    aad
}

fn seal_envelope(key: &Key, tag: &str, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let (nonce, ct) = key.seal(aad, plaintext);
    let value = cose::canonical_map(vec![
        (Value::Text("v".into()), Value::Integer(ENVELOPE_VERSION.into())),
        (Value::Text("t".into()), Value::Text(tag.into())),
        (Value::Text("alg".into()), Value::Text(ALG.into())),
        (Value::Text("nonce".into()), Value::Bytes(nonce.to_vec())),
        (Value::Text("ct".into()), Value::Bytes(ct)),
    ])?;
    cose::encode(&value)
}

struct Envelope {
    tag: String,
    nonce: [u8; 12],
    ct: Vec<u8>,
    kid: Option<String>,
}

fn parse_envelope(bytes: &[u8]) -> Result<Envelope> {
    let value = cose::decode(bytes)?;
    let map = value
        .as_map()
        .ok_or_else(|| anyhow!("sealed blob: expected map"))?;
    let v = cose::map_get_text(map, "v")
        .and_then(|v| v.as_integer())
        .map(|i| i128::from(i))
        .ok_or_else(|| anyhow!("sealed blob: missing version"))?;
    if v != ENVELOPE_VERSION as i128 {
        bail!("sealed blob: unsupported version {}", v);
    }
    let tag = cose::map_get_text(map, "t")
        .and_then(|v| v.as_text())
        .ok_or_else(|| anyhow!("sealed blob: missing tag"))?
        .to_string();
    let alg = cose::map_get_text(map, "alg")
        .and_then(|v| v.as_text())
        .ok_or_else(|| anyhow!("sealed blob: missing alg"))?;
    if alg != ALG {
        bail!("sealed blob: unsupported alg {}", alg);
    }
    let nonce = cose::map_get_text(map, "nonce")
        .and_then(|v| v.as_bytes())
        .filter(|n| n.len() == 12)
        .ok_or_else(|| anyhow!("sealed blob: bad nonce"))?;
    let mut nonce12 = [0; 12];
    nonce12.copy_from_slice(nonce);
    let ct = cose::map_get_text(map, "ct")
        .and_then(|v| v.as_bytes())
        .cloned()
        .ok_or_else(|| anyhow!("sealed blob: missing ct"))?;
    let kid = cose::map_get_text(map, "kid")
        .and_then(|v| v.as_text())
        .map(|s| s.to_string());
    Ok(Envelope {
        tag,
        nonce: nonce12,
        ct,
        kid,
    })
}

fn open_envelope(key: &Key, expected_tag: &str, aad: &[u8], bytes: &[u8]) -> Result<Vec<u8>> {
    let envelope = parse_envelope(bytes)?;
    if envelope.tag != expected_tag {
        bail!("sealed blob: tag mismatch");
    }
    key.open(aad, &envelope.nonce, &envelope.ct)
}

/// Device local store for sealed secrets.
pub struct Keystore {
    tree: sled::Tree,
    wrap: Key,
}

impl Keystore {
    /// Opens the keystore, generating the device wrap key on first use.
    pub fn new(tree: sled::Tree) -> Result<Self> {
        let wrap = match tree.get(WRAP_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 32] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| anyhow!("corrupt device wrap key"))?;
                Key::new(bytes)
            }
            None => {
                let key = Key::generate();
                tree.insert(WRAP_KEY, key.as_bytes().as_ref())?;
                key
            }
        };
        Ok(Self { tree, wrap })
    }

    fn blob_key(doc: &DocId, kind: BlobKind, label: Option<&[u8]>) -> Vec<u8> {
        let mut key = Vec::with_capacity(33 + label.map_or(0, |l| l.len()));
        key.extend_from_slice(doc.as_ref());
        key.push(kind.discriminant());
        if let Some(label) = label {
            key.extend_from_slice(label);
        }
        key
    }

    /// Seals `plaintext` and stores it for `(doc, kind, label)`.
    pub fn seal_blob(
        &self,
        doc: &DocId,
        kind: BlobKind,
        label: Option<&[u8]>,
        plaintext: &[u8],
    ) -> Result<()> {
        let aad = envelope_aad(kind.tag(), doc, label);
        let sealed = seal_envelope(&self.wrap, kind.tag(), &aad, plaintext)?;
        self.tree
            .insert(Self::blob_key(doc, kind, label), sealed)?;
        Ok(())
    }

    /// Opens the sealed blob stored for `(doc, kind, label)`.
    pub fn open_blob(
        &self,
        doc: &DocId,
        kind: BlobKind,
        label: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let bytes = match self.tree.get(Self::blob_key(doc, kind, label))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let aad = envelope_aad(kind.tag(), doc, label);
        Ok(Some(open_envelope(&self.wrap, kind.tag(), &aad, &bytes)?))
    }

    pub fn remove_blob(&self, doc: &DocId, kind: BlobKind, label: Option<&[u8]>) -> Result<()> {
        self.tree.remove(Self::blob_key(doc, kind, label))?;
        Ok(())
    }
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Keystore").finish_non_exhaustive()
    }
}

fn valid_kid(kid: &str) -> bool {
    !kid.is_empty()
        && kid.len() <= 128
        && kid
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'))
}

/// Outcome of decrypting payload bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decrypted {
    Plain(Vec<u8>),
    /// The ciphertext names a key epoch this ring doesn't hold.
    KeyMissing { kid: String },
}

/// Per-doc payload key ring with rotation.
#[derive(Clone, Debug)]
pub struct Keyring {
    active: String,
    keys: BTreeMap<String, Key>,
}

impl Keyring {
    pub fn new(kid: &str) -> Result<Self> {
        if !valid_kid(kid) {
            bail!("invalid key id {:?}", kid);
        }
        let mut keys = BTreeMap::new();
        keys.insert(kid.to_string(), Key::generate());
        Ok(Self {
            active: kid.to_string(),
            keys,
        })
    }

    pub fn active_kid(&self) -> &str {
        &self.active
    }

    /// Adds a fresh key under `kid` and makes it active. Old keys remain for
    /// decrypting historical payloads.
    pub fn rotate(&mut self, kid: &str) -> Result<()> {
        if !valid_kid(kid) {
            bail!("invalid key id {:?}", kid);
        }
        if self.keys.contains_key(kid) {
            bail!("key id {:?} already present", kid);
        }
        self.keys.insert(kid.to_string(), Key::generate());
        self.active = kid.to_string();
        Ok(())
    }

    /// Drops a key epoch. Payloads sealed under it become undecryptable.
    pub fn remove(&mut self, kid: &str) -> Result<()> {
        if kid == self.active {
            bail!("cannot remove the active key");
        }
        self.keys
            .remove(kid)
            .ok_or_else(|| anyhow!("unknown key id {:?}", kid))?;
        Ok(())
    }

    /// Encrypts payload bytes under the active key, tagging the ciphertext
    /// with its kid.
    pub fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let key = self.keys.get(&self.active).expect("active key present");
        let aad = PAYLOAD_TAG.as_bytes();
        let (nonce, ct) = key.seal(aad, payload);
        let value = cose::canonical_map(vec![
            (Value::Text("v".into()), Value::Integer(ENVELOPE_VERSION.into())),
            (Value::Text("t".into()), Value::Text(PAYLOAD_TAG.into())),
            (Value::Text("alg".into()), Value::Text(ALG.into())),
            (Value::Text("nonce".into()), Value::Bytes(nonce.to_vec())),
            (Value::Text("ct".into()), Value::Bytes(ct)),
            (Value::Text("kid".into()), Value::Text(self.active.clone())),
        ])?;
        cose::encode(&value)
    }

    /// Decrypts a payload envelope, reporting the missing epoch when the
    /// ciphertext's kid is not in the ring.
    pub fn decrypt(&self, bytes: &[u8]) -> Result<Decrypted> {
        let envelope = parse_envelope(bytes)?;
        if envelope.tag != PAYLOAD_TAG {
            bail!("not an encrypted payload envelope");
        }
        let kid = envelope
            .kid
            .ok_or_else(|| anyhow!("encrypted payload missing kid"))?;
        let key = match self.keys.get(&kid) {
            Some(key) => key,
            None => return Ok(Decrypted::KeyMissing { kid }),
        };
        let plain = key.open(PAYLOAD_TAG.as_bytes(), &envelope.nonce, &envelope.ct)?;
        Ok(Decrypted::Plain(plain))
    }

    /// Decrypts if `bytes` is an encrypted payload envelope, passes
    /// plaintext through untouched. Apps may mix encrypted and plaintext
    /// payloads in one doc.
    pub fn maybe_decrypt(&self, bytes: &[u8]) -> Result<Decrypted> {
        if is_encrypted_payload(bytes) {
            self.decrypt(bytes)
        } else {
            Ok(Decrypted::Plain(bytes.to_vec()))
        }
    }

    /// Serializes the ring for sealing into the keystore.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let keys = self
            .keys
            .iter()
            .map(|(kid, key)| {
                (
                    Value::Text(kid.clone()),
                    Value::Bytes(key.as_bytes().to_vec()),
                )
            })
            .collect();
        let value = cose::canonical_map(vec![
            (Value::Text("active".into()), Value::Text(self.active.clone())),
            (Value::Text("keys".into()), cose::canonical_map(keys)?),
        ])?;
        cose::encode(&value)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value = cose::decode(bytes)?;
        let map = value
            .as_map()
            .ok_or_else(|| anyhow!("keyring: expected map"))?;
        let active = cose::map_get_text(map, "active")
            .and_then(|v| v.as_text())
            .ok_or_else(|| anyhow!("keyring: missing active kid"))?
            .to_string();
        let keys = cose::map_get_text(map, "keys")
            .and_then(|v| v.as_map())
            .ok_or_else(|| anyhow!("keyring: missing keys"))?
            .iter()
            .map(|(kid, key)| {
                let kid = kid
                    .as_text()
                    .filter(|k| valid_kid(k))
                    .ok_or_else(|| anyhow!("keyring: bad kid"))?;
                let key = key
                    .as_bytes()
                    .filter(|k| k.len() == 32)
                    .ok_or_else(|| anyhow!("keyring: bad key"))?;
                let mut k = [0; 32];
                k.copy_from_slice(key);
                Ok((kid.to_string(), Key::new(k)))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        if !keys.contains_key(&active) {
            bail!("keyring: active kid not in ring");
        }
        Ok(Self { active, keys })
    }
}

/// Is this byte string a self-describing encrypted payload envelope?
pub fn is_encrypted_payload(bytes: &[u8]) -> bool {
    cose::decode(bytes)
        .ok()
        .and_then(|value| {
            value.as_map().map(|map| {
                cose::map_get_text(map, "t")
                    .and_then(|v| v.as_text())
                    .map(|t| t == PAYLOAD_TAG)
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memstore() -> Keystore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Keystore::new(db.open_tree("secrets").unwrap()).unwrap()
    }

    #[test]
    fn blob_bound_to_doc() {
        let store = memstore();
        let doc = DocId::new([1; 32]);
        store
            .seal_blob(&doc, BlobKind::IssuerKey, None, b"issuer-secret")
            .unwrap();
        assert_eq!(
            store.open_blob(&doc, BlobKind::IssuerKey, None).unwrap(),
            Some(b"issuer-secret".to_vec())
        );
        // the raw sealed bytes fail to open under another doc's aad
        let sealed = store
            .tree
            .get(Keystore::blob_key(&doc, BlobKind::IssuerKey, None))
            .unwrap()
            .unwrap();
        let other = DocId::new([2; 32]);
        let aad = envelope_aad(BlobKind::IssuerKey.tag(), &other, None);
        assert!(open_envelope(&store.wrap, BlobKind::IssuerKey.tag(), &aad, &sealed).is_err());
    }

    #[test]
    fn blob_label_binds() {
        let store = memstore();
        let doc = DocId::new([1; 32]);
        store
            .seal_blob(&doc, BlobKind::LocalIdentity, Some(&b"replica-a"[..]), b"ka")
            .unwrap();
        store
            .seal_blob(&doc, BlobKind::LocalIdentity, Some(&b"replica-b"[..]), b"kb")
            .unwrap();
        assert_eq!(
            store
                .open_blob(&doc, BlobKind::LocalIdentity, Some(&b"replica-a"[..]))
                .unwrap(),
            Some(b"ka".to_vec())
        );
        assert_eq!(
            store
                .open_blob(&doc, BlobKind::LocalIdentity, Some(&b"replica-b"[..]))
                .unwrap(),
            Some(b"kb".to_vec())
        );
    }

    #[test]
    fn keyring_rotation() {
        let mut ring = Keyring::new("epoch-1").unwrap();
        let before = ring.encrypt(b"before").unwrap();
        ring.rotate("epoch-2").unwrap();
        let after = ring.encrypt(b"after").unwrap();

        assert_eq!(
            ring.decrypt(&before).unwrap(),
            Decrypted::Plain(b"before".to_vec())
        );
        assert_eq!(
            ring.decrypt(&after).unwrap(),
            Decrypted::Plain(b"after".to_vec())
        );

        ring.remove("epoch-1").unwrap();
        assert_eq!(
            ring.decrypt(&before).unwrap(),
            Decrypted::KeyMissing {
                kid: "epoch-1".into()
            }
        );
    }

    #[test]
    fn maybe_decrypt_passes_plaintext() {
        let ring = Keyring::new("epoch-1").unwrap();
        assert_eq!(
            ring.maybe_decrypt(b"plain bytes").unwrap(),
            Decrypted::Plain(b"plain bytes".to_vec())
        );
        let ct = ring.encrypt(b"secret").unwrap();
        assert_eq!(
            ring.maybe_decrypt(&ct).unwrap(),
            Decrypted::Plain(b"secret".to_vec())
        );
    }

    #[test]
    fn keyring_roundtrip() {
        let mut ring = Keyring::new("epoch-1").unwrap();
        ring.rotate("epoch-2").unwrap();
        let ct = ring.encrypt(b"x").unwrap();
        let decoded = Keyring::decode(&ring.encode().unwrap()).unwrap();
        assert_eq!(decoded.active_kid(), "epoch-2");
        assert_eq!(decoded.decrypt(&ct).unwrap(), Decrypted::Plain(b"x".to_vec()));
    }

    #[test]
    fn bad_kid_rejected() {
        assert!(Keyring::new("").is_err());
        assert!(Keyring::new("has space").is_err());
        assert!(Keyring::new(&"x".repeat(129)).is_err());
        assert!(Keyring::new("epoch_1:a.b-c").is_ok());
    }
}
