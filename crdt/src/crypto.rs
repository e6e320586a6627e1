use crate::id::ReplicaId;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, Result};
use ed25519_dalek::{PublicKey, SecretKey, Signature, Signer, Verifier};

/// An Ed25519 keypair stored as its 32 byte secret seed.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Keypair([u8; 32]);

impl Keypair {
    pub fn new(secret: [u8; 32]) -> Self {
        Self(secret)
    }

    pub fn generate() -> Self {
        let mut secret = [0; 32];
        getrandom::getrandom(&mut secret).expect("csprng failure");
        Self(secret)
    }

    fn to_keypair(self) -> ed25519_dalek::Keypair {
        let secret = SecretKey::from_bytes(&self.0).unwrap();
        let public = PublicKey::from(&secret);
        ed25519_dalek::Keypair { secret, public }
    }

    pub fn replica_id(self) -> ReplicaId {
        ReplicaId::new(self.to_keypair().public.to_bytes())
    }

    pub fn sign(self, payload: &[u8]) -> [u8; 64] {
        self.to_keypair().sign(payload).to_bytes()
    }
}

impl From<Keypair> for [u8; 32] {
    fn from(keypair: Keypair) -> Self {
        keypair.0
    }
}

impl AsRef<[u8]> for Keypair {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Keypair({:?})", self.replica_id())
    }
}

/// Verifies an Ed25519 signature made by `replica` over `payload`.
pub fn verify(replica: &ReplicaId, payload: &[u8], sig: &[u8; 64]) -> Result<()> {
    let public = PublicKey::from_bytes(replica.as_ref())
        .map_err(|_| anyhow!("invalid replica public key"))?;
    let sig = Signature::from(*sig);
    public
        .verify(payload, &sig)
        .map_err(|_| anyhow!("signature verification failed"))?;
    Ok(())
}

/// A 32 byte AES-256-GCM key.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Key([u8; 32]);

impl Key {
    pub fn new(key: [u8; 32]) -> Self {
        Self(key)
    }

    pub fn generate() -> Self {
        let mut key = [0; 32];
        getrandom::getrandom(&mut key).expect("csprng failure");
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Seals `msg` under a fresh random 12 byte nonce, binding `aad`.
    /// Returns the nonce and ciphertext (tag appended).
    pub fn seal(&self, aad: &[u8], msg: &[u8]) -> ([u8; 12], Vec<u8>) {
        let mut nonce = [0; 12];
        getrandom::getrandom(&mut nonce).expect("csprng failure");
        let cipher = Aes256Gcm::new_from_slice(&self.0).expect("key is 32 bytes");
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg, aad })
            .expect("aead seal");
        (nonce, ct)
    }

    /// Opens a sealed message. Fails when the key, nonce, ciphertext or aad
    /// don't match what was sealed.
    pub fn open(&self, aad: &[u8], nonce: &[u8; 12], ct: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.0).expect("key is 32 bytes");
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad })
            .map_err(|_| anyhow!("aead authentication failure"))
    }
}

impl From<Key> for [u8; 32] {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Key(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"payload");
        verify(&keypair.replica_id(), b"payload", &sig).unwrap();
        assert!(verify(&keypair.replica_id(), b"tampered", &sig).is_err());
        assert!(verify(&Keypair::generate().replica_id(), b"payload", &sig).is_err());
    }

    #[test]
    fn seal_open_binds_aad() {
        let key = Key::generate();
        let (nonce, ct) = key.seal(b"aad-x", b"secret");
        assert_eq!(key.open(b"aad-x", &nonce, &ct).unwrap(), b"secret");
        assert!(key.open(b"aad-y", &nonce, &ct).is_err());
        assert!(Key::generate().open(b"aad-x", &nonce, &ct).is_err());
    }
}
