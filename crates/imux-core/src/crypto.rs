//! Cryptographic primitives for imux links.
//!
//! Every transport link, control or pool, runs a Noise_XX handshake before any
//! message crosses it. The handshake authenticates the server's static key,
//! which the client pins by fingerprint (see `imux_services::known_hosts`).
//!
//! After the handshake each direction gets its own half: a [`Sealer`] for the
//! writer task and an [`Opener`] for the reader task. Both share the same
//! stateless transport under a short-lived lock, so a link's read and write
//! loops never contend for more than a single encrypt/decrypt call.
//!
//! All key material derives ZeroizeOnDrop.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::RngCore;
use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Derive a link identifier from the two handshake nonces.
///
///   link_key = BLAKE3(initiator_nonce || responder_nonce)
pub fn derive_link_key(initiator_nonce: &[u8; 16], responder_nonce: &[u8; 16]) -> [u8; 32] {
    let mut combined = [0u8; 32];
    combined[..16].copy_from_slice(initiator_nonce);
    combined[16..].copy_from_slice(responder_nonce);
    hash(&combined)
}

/// Human-comparable fingerprint of a static public key.
///
/// This is the string stored in the known-hosts file and shown in the
/// trust prompt.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    hex::encode(hash(public_key))
}

// ── Keypair ───────────────────────────────────────────────────────────────────

const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// A host's long-term static X25519 keypair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Load the keypair stored at `path`, generating and saving a new one if
    /// the file does not exist yet.
    ///
    /// The file holds the 32 raw private key bytes. A file of any other length
    /// is rejected rather than silently replaced, since replacing it would
    /// change this host's fingerprint.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let private: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::BadKeyFile(path.display().to_string()))?;
                Ok(Self::from_private(private))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, keypair.private_bytes().as_slice())?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                }
                tracing::info!(path = %path.display(), "generated new host keypair");
                Ok(keypair)
            }
            Err(e) => Err(CryptoError::Io(e)),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public)
    }
}

// ── Noise Handshake ───────────────────────────────────────────────────────────

/// Generate a cryptographically random 16-byte nonce.
pub fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Client side of the Noise_XX handshake.
pub struct NoiseInitiator {
    state: HandshakeState,
    initiator_nonce: [u8; 16],
}

impl NoiseInitiator {
    /// Begin a handshake. Returns the state and Noise message 1.
    pub fn new(keypair: &Keypair) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_initiator()?;

        let mut msg1 = vec![0u8; 48];
        let len = state.write_message(&[], &mut msg1)?;
        msg1.truncate(len);

        Ok((
            Self {
                state,
                initiator_nonce: generate_nonce(),
            },
            msg1,
        ))
    }

    pub fn nonce(&self) -> &[u8; 16] {
        &self.initiator_nonce
    }

    /// Read message 2, write message 3, and enter transport mode.
    pub fn finish(
        mut self,
        msg2: &[u8],
        responder_nonce: &[u8; 16],
    ) -> Result<(SecureSession, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; msg2.len()];
        self.state.read_message(msg2, &mut payload)?;

        let mut msg3 = vec![0u8; 96];
        let len = self.state.write_message(&[], &mut msg3)?;
        msg3.truncate(len);

        let link_key = derive_link_key(&self.initiator_nonce, responder_nonce);
        let session = SecureSession::from_handshake(self.state, link_key)?;
        Ok((session, msg3))
    }
}

/// Server side of the Noise_XX handshake.
pub struct NoiseResponder {
    state: HandshakeState,
    responder_nonce: [u8; 16],
}

impl NoiseResponder {
    pub fn new(keypair: &Keypair) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_responder()?;

        Ok(Self {
            state,
            responder_nonce: generate_nonce(),
        })
    }

    pub fn nonce(&self) -> &[u8; 16] {
        &self.responder_nonce
    }

    /// Read message 1 and write message 2.
    pub fn respond(
        mut self,
        msg1: &[u8],
        initiator_nonce: &[u8; 16],
    ) -> Result<(ResponderPending, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; msg1.len()];
        self.state.read_message(msg1, &mut payload)?;

        let mut msg2 = vec![0u8; 96];
        let len = self.state.write_message(&[], &mut msg2)?;
        msg2.truncate(len);

        Ok((
            ResponderPending {
                state: self.state,
                link_key: derive_link_key(initiator_nonce, &self.responder_nonce),
            },
            msg2,
        ))
    }
}

/// Responder waiting for message 3.
pub struct ResponderPending {
    state: HandshakeState,
    link_key: [u8; 32],
}

impl ResponderPending {
    pub fn finish(mut self, msg3: &[u8]) -> Result<SecureSession, CryptoError> {
        let mut payload = vec![0u8; msg3.len()];
        self.state.read_message(msg3, &mut payload)?;
        SecureSession::from_handshake(self.state, self.link_key)
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A completed handshake: the peer's identity plus the transport keys.
pub struct SecureSession {
    /// Identical on both ends of the link.
    pub link_key: [u8; 32],
    /// The peer's static public key, authenticated by the handshake.
    pub remote_static: [u8; 32],
    transport: StatelessTransportState,
}

impl SecureSession {
    fn from_handshake(state: HandshakeState, link_key: [u8; 32]) -> Result<Self, CryptoError> {
        let remote_static: [u8; 32] = state
            .get_remote_static()
            .ok_or(CryptoError::MissingRemoteStatic)?
            .try_into()
            .map_err(|_| CryptoError::MissingRemoteStatic)?;
        let transport = state.into_stateless_transport_mode()?;
        Ok(Self {
            link_key,
            remote_static,
            transport,
        })
    }

    /// Fingerprint of the peer's static key.
    pub fn remote_fingerprint(&self) -> String {
        fingerprint(&self.remote_static)
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (Sealer, Opener) {
        let transport = Arc::new(Mutex::new(self.transport));
        (
            Sealer {
                transport: transport.clone(),
                next_nonce: 0,
            },
            Opener {
                transport,
                expected_nonce: 0,
            },
        )
    }
}

/// Size of the explicit nonce carried ahead of every ciphertext.
pub const NONCE_LEN: usize = 8;
/// Poly1305 tag appended by ChaChaPoly.
pub const TAG_LEN: usize = 16;

/// Encrypting half of a link.
///
/// Wire format per segment: `[u64 nonce LE] [ciphertext + 16-byte MAC]`.
pub struct Sealer {
    transport: Arc<Mutex<StatelessTransportState>>,
    next_nonce: u64,
}

impl Sealer {
    /// Encrypt `plaintext` into `out`, which ends up
    /// `8 + plaintext.len() + 16` bytes long.
    pub fn seal(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = self.next_nonce;
        self.next_nonce += 1;

        out.clear();
        out.extend_from_slice(&nonce.to_le_bytes());
        out.resize(NONCE_LEN + plaintext.len() + TAG_LEN, 0);

        let written = {
            let transport = self.transport.lock().map_err(|_| CryptoError::Poisoned)?;
            transport.write_message(nonce, plaintext, &mut out[NONCE_LEN..])?
        };
        out.truncate(NONCE_LEN + written);
        Ok(())
    }
}

/// Decrypting half of a link.
///
/// Links ride on TCP, so segments arrive in the order they were sealed. Any
/// nonce other than the next expected one is a replay or an injection.
pub struct Opener {
    transport: Arc<Mutex<StatelessTransportState>>,
    expected_nonce: u64,
}

impl Opener {
    pub fn open(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::TooShort);
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&ciphertext[..NONCE_LEN]);
        let nonce = u64::from_le_bytes(nonce_bytes);
        if nonce != self.expected_nonce {
            return Err(CryptoError::UnexpectedNonce {
                expected: self.expected_nonce,
                got: nonce,
            });
        }

        out.resize(ciphertext.len() - NONCE_LEN, 0);
        let written = {
            let transport = self.transport.lock().map_err(|_| CryptoError::Poisoned)?;
            transport.read_message(nonce, &ciphertext[NONCE_LEN..], out)?
        };
        out.truncate(written);

        self.expected_nonce += 1;
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("handshake finished without a remote static key")]
    MissingRemoteStatic,

    #[error("ciphertext too short (need at least 24 bytes: 8 nonce + 16 MAC)")]
    TooShort,

    #[error("unexpected nonce {got}, expected {expected}")]
    UnexpectedNonce { expected: u64, got: u64 },

    #[error("transport state lock poisoned")]
    Poisoned,

    #[error("key file {0} is not a 32-byte private key")]
    BadKeyFile(String),

    #[error("key file I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_sessions(ikp: &Keypair, rkp: &Keypair) -> (SecureSession, SecureSession) {
        let (initiator, msg1) = NoiseInitiator::new(ikp).unwrap();
        let i_nonce = *initiator.nonce();

        let responder = NoiseResponder::new(rkp).unwrap();
        let r_nonce = *responder.nonce();
        let (pending, msg2) = responder.respond(&msg1, &i_nonce).unwrap();

        let (i_session, msg3) = initiator.finish(&msg2, &r_nonce).unwrap();
        let r_session = pending.finish(&msg3).unwrap();
        (i_session, r_session)
    }

    #[test]
    fn handshake_agrees_on_link_key_and_identities() {
        let ikp = Keypair::generate();
        let rkp = Keypair::generate();
        let (i, r) = completed_sessions(&ikp, &rkp);

        assert_eq!(i.link_key, r.link_key);
        assert_eq!(i.remote_static, rkp.public);
        assert_eq!(r.remote_static, ikp.public);
        assert_eq!(i.remote_fingerprint(), rkp.fingerprint());
    }

    #[test]
    fn noise_message_sizes_match_wire_structs() {
        use crate::wire::{HandshakeComplete, HandshakeInit, HandshakeResponse};

        let ikp = Keypair::generate();
        let rkp = Keypair::generate();
        let (initiator, msg1) = NoiseInitiator::new(&ikp).unwrap();
        let i_nonce = *initiator.nonce();
        let responder = NoiseResponder::new(&rkp).unwrap();
        let r_nonce = *responder.nonce();
        let (_pending, msg2) = responder.respond(&msg1, &i_nonce).unwrap();
        let (_session, msg3) = initiator.finish(&msg2, &r_nonce).unwrap();

        assert_eq!(msg1.len() + 16, std::mem::size_of::<HandshakeInit>());
        assert_eq!(msg2.len() + 16, std::mem::size_of::<HandshakeResponse>());
        assert_eq!(msg3.len(), std::mem::size_of::<HandshakeComplete>());
    }

    #[test]
    fn sealed_segments_open_in_both_directions() {
        let (i, r) = completed_sessions(&Keypair::generate(), &Keypair::generate());
        let (mut i_seal, mut i_open) = i.split();
        let (mut r_seal, mut r_open) = r.split();

        let mut ct = Vec::new();
        let mut pt = Vec::new();
        i_seal.seal(b"ping", &mut ct).unwrap();
        assert_eq!(ct.len(), NONCE_LEN + 4 + TAG_LEN);
        r_open.open(&ct, &mut pt).unwrap();
        assert_eq!(pt, b"ping");

        r_seal.seal(b"pong", &mut ct).unwrap();
        i_open.open(&ct, &mut pt).unwrap();
        assert_eq!(pt, b"pong");
    }

    #[test]
    fn replayed_segment_is_rejected() {
        let (i, r) = completed_sessions(&Keypair::generate(), &Keypair::generate());
        let (mut seal, _) = i.split();
        let (_, mut open) = r.split();

        let mut ct = Vec::new();
        let mut pt = Vec::new();
        seal.seal(b"once only", &mut ct).unwrap();
        open.open(&ct, &mut pt).unwrap();

        let err = open.open(&ct, &mut pt).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::UnexpectedNonce {
                expected: 1,
                got: 0
            }
        ));
    }

    #[test]
    fn tampered_segment_is_rejected() {
        let (i, r) = completed_sessions(&Keypair::generate(), &Keypair::generate());
        let (mut seal, _) = i.split();
        let (_, mut open) = r.split();

        let mut ct = Vec::new();
        seal.seal(b"important data", &mut ct).unwrap();
        ct[12] ^= 0xFF;

        let mut pt = Vec::new();
        assert!(open.open(&ct, &mut pt).is_err());
        assert!(open.open(&[0u8; 20], &mut pt).is_err());
    }

    #[test]
    fn keypair_survives_reload_from_disk() {
        let dir = std::env::temp_dir().join(format!("imux-keypair-test-{}", std::process::id()));
        let path = dir.join("host.key");
        let _ = std::fs::remove_dir_all(&dir);

        let first = Keypair::load_or_generate(&path).unwrap();
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.public, second.public);

        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            Keypair::load_or_generate(&path),
            Err(CryptoError::BadKeyFile(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
