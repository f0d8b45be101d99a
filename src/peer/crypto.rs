//! Message Stream Encryption (MSE) primitives: the Diffie-Hellman key
//! agreement, SHA-1 key derivation, and ARC4 stream-cipher bootstrap that
//! back the obfuscated handshake (spec §4.2).
//!
//! This module only deals in bytes and numbers; it knows nothing about
//! sockets or the `PeerConnection` state machine. [`peer::handshake`] drives
//! it against a live connection.

use std::sync::OnceLock;

use num_bigint::BigUint;
use rand::RngCore;
use rc4::{KeyInit, Rc4, StreamCipher};

/// The ARC4 cipher keyed with a 20-byte SHA-1 digest, as used throughout
/// MSE. `rc4`'s `Rc4` type is generic over key size; `Rc4Cipher` pins it to
/// the one key size this protocol ever uses.
pub type Rc4Cipher = Rc4<rc4::consts::U20>;
use sha1::{Digest, Sha1};

use crate::Sha1Hash;

/// The 768-bit MSE prime, fixed by the specification.
const DH_PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A63A36210000000000090563";

/// The DH generator.
const DH_GENERATOR: u64 = 2;

/// Public DH values are always transmitted as exactly this many big-endian
/// bytes, zero-padded on the left.
pub const DH_PUBLIC_LEN: usize = 96;

/// The exclusive upper bound on each side's random padding length.
pub const PAD_MAX: u16 = 200;

/// Number of ARC4 keystream bytes discarded after keying, before any real
/// use, on both sides of each direction's cipher.
const ARC4_WARMUP_LEN: usize = 1024;

/// The initiator gives up looking for the responder's VC after this many
/// decrypted bytes without a match.
pub const INITIATOR_VC_SCAN_LIMIT: usize = 520;

/// The responder gives up looking for `HASH('req1' || S)` after this many
/// incoming bytes without a match.
pub const RESPONDER_VC_SCAN_LIMIT: usize = 532;

/// Reject a negotiated padding length greater than this.
pub const PAD_CEILING: u16 = 512;

/// The only crypto mode this implementation offers or accepts: full RC4
/// encryption of the stream (mode 1, "plaintext", is never selected).
pub const CRYPTO_PROVIDE: u32 = 0x0000_0002;

/// The 8 zero bytes used as a stream synchronization marker.
pub const VC: [u8; 8] = [0; 8];

fn dh_prime() -> &'static BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME.get_or_init(|| {
        BigUint::parse_bytes(DH_PRIME_HEX.as_bytes(), 16)
            .expect("DH prime literal is valid hex")
    })
}

/// Generates a private DH exponent from 160 random bits, as specified.
pub fn generate_private_key() -> BigUint {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    BigUint::from_bytes_be(&bytes)
}

/// Computes `g^private mod P`.
pub fn compute_public_key(private: &BigUint) -> BigUint {
    BigUint::from(DH_GENERATOR).modpow(private, dh_prime())
}

/// Computes the shared secret `S = peer_public^our_private mod P`.
pub fn compute_shared_secret(peer_public: &BigUint, our_private: &BigUint) -> BigUint {
    peer_public.modpow(our_private, dh_prime())
}

/// Renders a DH value (public key or shared secret) as exactly
/// [`DH_PUBLIC_LEN`] big-endian bytes, zero-padded on the left.
pub fn to_fixed_bytes(n: &BigUint) -> [u8; DH_PUBLIC_LEN] {
    let raw = n.to_bytes_be();
    assert!(
        raw.len() <= DH_PUBLIC_LEN,
        "DH value does not fit in {} bytes",
        DH_PUBLIC_LEN
    );
    let mut out = [0u8; DH_PUBLIC_LEN];
    out[DH_PUBLIC_LEN - raw.len()..].copy_from_slice(&raw);
    out
}

/// Returns a random pad length in `[0, PAD_MAX)`.
pub fn random_pad_len() -> usize {
    (rand::thread_rng().next_u32() % PAD_MAX as u32) as usize
}

/// Returns `len` random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

fn sha1_concat(parts: &[&[u8]]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// `HASH('req1' || S)`.
pub fn req1(s: &[u8; DH_PUBLIC_LEN]) -> Sha1Hash {
    sha1_concat(&[b"req1", s])
}

/// `HASH('req2' || SKEY)`.
pub fn req2(skey: &Sha1Hash) -> Sha1Hash {
    sha1_concat(&[b"req2", skey])
}

/// `HASH('req3' || S)`.
pub fn req3(s: &[u8; DH_PUBLIC_LEN]) -> Sha1Hash {
    sha1_concat(&[b"req3", s])
}

/// `HASH('keyA' || S || SKEY)`: the initiator's send / responder's receive
/// key.
pub fn key_a(s: &[u8; DH_PUBLIC_LEN], skey: &Sha1Hash) -> Sha1Hash {
    sha1_concat(&[b"keyA", s, skey])
}

/// `HASH('keyB' || S || SKEY)`: the responder's send / initiator's receive
/// key.
pub fn key_b(s: &[u8; DH_PUBLIC_LEN], skey: &Sha1Hash) -> Sha1Hash {
    sha1_concat(&[b"keyB", s, skey])
}

/// XORs two 20-byte hashes together.
pub fn xor20(a: &Sha1Hash, b: &Sha1Hash) -> Sha1Hash {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Builds an ARC4 cipher from a 20-byte SHA-1 key and discards the first
/// [`ARC4_WARMUP_LEN`] keystream bytes, as required before any real use.
pub fn keyed_and_warmed_up(key: &Sha1Hash) -> Rc4Cipher {
    let mut cipher = Rc4Cipher::new_from_slice(key).expect("key is exactly 20 bytes");
    let mut discard = vec![0u8; ARC4_WARMUP_LEN];
    cipher.apply_keystream(&mut discard);
    cipher
}
