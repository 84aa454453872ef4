// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The RTMP handshake: C0/C1/C2 ↔ S0/S1/S2.
//!
//! Ported from `examples/original_source/protocol_rtmp_handshak.{h,cpp}`.
//! Two strategies are supported, matching a real Flash/FMLE client:
//!
//! - **Simple**: C1/S1 carry only a time+version header followed by 1528
//!   random bytes; no digest, no key exchange.
//! - **Complex** (schema0/schema1): C1/S1 additionally carry a key block
//!   (a 128-byte Diffie-Hellman public key at a randomized offset inside a
//!   764-byte block) and a digest block (a 32-byte HMAC-SHA256 digest at a
//!   randomized offset inside another 764-byte block), with schema0 placing
//!   the key block before the digest block and schema1 the reverse. The
//!   server tries schema0, falls back to schema1, and falls back to a plain
//!   simple handshake if neither digest validates — mirroring a real
//!   server tolerating both Flash Player generations and non-Adobe clients.
//!
//! The Diffie-Hellman exchange (RFC 2409's 1024-bit MODP group, generator
//! 2) is only used to derive a shared secret for SWF verification / RTMPE,
//! neither of which this system implements; we still perform the exchange
//! because a real client checks that S1's key block parses into a valid
//! public key.

use hmac::{Hmac, Mac};
use num_bigint::{BigUint, RandBigInt};
use rand::RngCore;
use rtmpkit_core::error::{Error, Result};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

const C1S1_SIZE: usize = 1536;
const C2S2_SIZE: usize = 1536;
const KEY_BLOCK_SIZE: usize = 764;
const DIGEST_BLOCK_SIZE: usize = 764;
const DH_KEY_SIZE: usize = 128;

const GENUINE_FMS_KEY: [u8; 68] = [
    0x47, 0x65, 0x6e, 0x75, 0x69, 0x6e, 0x65, 0x20, 0x41, 0x64, 0x6f, 0x62, 0x65, 0x20, 0x46, 0x6c, 0x61, 0x73, 0x68,
    0x20, 0x4d, 0x65, 0x64, 0x69, 0x61, 0x20, 0x53, 0x65, 0x72, 0x76, 0x65, 0x72, 0x20, 0x30, 0x30, 0x31, 0xf0, 0xee,
    0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e, 0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e, 0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29,
    0x80, 0x6f, 0xab, 0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb, 0x31, 0xae,
];

const GENUINE_FP_KEY: [u8; 62] = [
    0x47, 0x65, 0x6e, 0x75, 0x69, 0x6e, 0x65, 0x20, 0x41, 0x64, 0x6f, 0x62, 0x65, 0x20, 0x46, 0x6c, 0x61, 0x73, 0x68,
    0x20, 0x50, 0x6c, 0x61, 0x79, 0x65, 0x72, 0x20, 0x30, 0x30, 0x31, 0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8,
    0x2e, 0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e, 0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab, 0x93, 0xb8, 0xe6,
    0x36, 0xcf, 0xeb, 0x31, 0xae,
];

const RFC2409_PRIME_1024_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381",
    "FFFFFFFFFFFFFFFF",
);

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// A 1024-bit Diffie-Hellman keypair over the RFC 2409 MODP group.
pub struct DiffieHellman {
    p: BigUint,
    private_key: BigUint,
    public_key: BigUint,
}

impl DiffieHellman {
    /// Generates a keypair, regenerating until the public key serializes to
    /// exactly 128 bytes (matching `SDH::Initialize(true)`'s retry loop —
    /// `BigUint::to_bytes_be` drops leading zero bytes, so an undersized key
    /// would otherwise silently shrink the key block).
    ///
    /// # Errors
    /// [`Error::Crypto`] if the prime constant fails to parse (never happens
    /// in practice; the constant is fixed at compile time).
    pub fn generate() -> Result<Self> {
        let p = BigUint::parse_bytes(RFC2409_PRIME_1024_HEX.as_bytes(), 16)
            .ok_or_else(|| Error::Crypto("invalid RFC2409 prime constant".into()))?;
        let g = BigUint::from(2u32);
        let mut rng = rand::thread_rng();
        loop {
            let private_key = rng.gen_biguint_below(&p);
            let public_key = public_key_of(&private_key, &g, &p);
            if public_key.to_bytes_be().len() == DH_KEY_SIZE {
                return Ok(Self { p, private_key, public_key });
            }
        }
    }

    /// This side's public key, left-padded to exactly 128 bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; DH_KEY_SIZE] {
        pad_to(&self.public_key.to_bytes_be(), DH_KEY_SIZE)
    }

    /// Computes the shared secret from the peer's public key bytes.
    #[must_use]
    pub fn shared_secret(&self, peer_public_key: &[u8]) -> Vec<u8> {
        let peer = BigUint::from_bytes_be(peer_public_key);
        peer.modpow(&self.private_key, &self.p).to_bytes_be()
    }
}

fn public_key_of(private_key: &BigUint, g: &BigUint, p: &BigUint) -> BigUint {
    g.modpow(private_key, p)
}

fn pad_to(bytes: &[u8], len: usize) -> [u8; DH_KEY_SIZE] {
    let mut out = [0u8; DH_KEY_SIZE];
    debug_assert!(len == DH_KEY_SIZE);
    let start = DH_KEY_SIZE.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(DH_KEY_SIZE)..]);
    out
}

/// Which half of the 1536-byte C1/S1 body holds the key block first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// key block, then digest block.
    Schema0,
    /// digest block, then key block.
    Schema1,
}

/// An offset-randomized 764-byte block: `random0 | payload | random1`,
/// terminated by (schema0's key block) or preceded by (schema0's digest
/// block) a 4-byte offset field that determines how `random0`/`random1`
/// split around `payload`.
struct Block {
    random0: Vec<u8>,
    payload: Vec<u8>,
    random1: Vec<u8>,
}

fn valid_offset(offset: u32, max_offset: usize) -> usize {
    let bytes = offset.to_le_bytes();
    let sum: usize = bytes.iter().map(|b| *b as usize).sum();
    sum % max_offset
}

impl Block {
    fn generate(payload: Vec<u8>, block_size: usize) -> Self {
        let payload_len = payload.len();
        let max_offset = block_size - payload_len - 4;
        let mut rng = rand::thread_rng();
        let offset = rng.next_u32();
        let random0_len = valid_offset(offset, max_offset.max(1));
        let random1_len = block_size - 4 - random0_len - payload_len;
        let mut random0 = vec![0u8; random0_len];
        let mut random1 = vec![0u8; random1_len];
        rng.fill_bytes(&mut random0);
        rng.fill_bytes(&mut random1);
        Self { random0, payload, random1 }
    }

    fn offset(&self) -> u32 {
        self.random0.len() as u32
    }
}

/// Parses a schema0 key block: `random0 | key(128) | random1 | offset(4)`.
fn parse_key_block(raw: &[u8]) -> Result<Block> {
    if raw.len() != KEY_BLOCK_SIZE {
        return Err(Error::Handshake(format!("key block must be {KEY_BLOCK_SIZE} bytes, got {}", raw.len())));
    }
    let offset_bytes: [u8; 4] = raw[KEY_BLOCK_SIZE - 4..].try_into().expect("slice is 4 bytes");
    let offset = u32::from_le_bytes(offset_bytes);
    let max_offset = KEY_BLOCK_SIZE - DH_KEY_SIZE - 4;
    let random0_len = valid_offset(offset, max_offset);
    let random0 = raw[..random0_len].to_vec();
    let payload = raw[random0_len..random0_len + DH_KEY_SIZE].to_vec();
    let random1 = raw[random0_len + DH_KEY_SIZE..KEY_BLOCK_SIZE - 4].to_vec();
    Ok(Block { random0, payload, random1 })
}

fn write_key_block(block: &Block) -> [u8; KEY_BLOCK_SIZE] {
    let mut out = [0u8; KEY_BLOCK_SIZE];
    let mut pos = 0;
    out[pos..pos + block.random0.len()].copy_from_slice(&block.random0);
    pos += block.random0.len();
    out[pos..pos + block.payload.len()].copy_from_slice(&block.payload);
    pos += block.payload.len();
    out[pos..pos + block.random1.len()].copy_from_slice(&block.random1);
    out[KEY_BLOCK_SIZE - 4..].copy_from_slice(&block.offset().to_le_bytes());
    out
}

/// Parses a digest block: `offset(4) | random0 | digest(32) | random1`.
fn parse_digest_block(raw: &[u8]) -> Result<Block> {
    if raw.len() != DIGEST_BLOCK_SIZE {
        return Err(Error::Handshake(format!("digest block must be {DIGEST_BLOCK_SIZE} bytes, got {}", raw.len())));
    }
    let offset_bytes: [u8; 4] = raw[..4].try_into().expect("slice is 4 bytes");
    let offset = u32::from_le_bytes(offset_bytes);
    let max_offset = DIGEST_BLOCK_SIZE - 32 - 4;
    let random0_len = valid_offset(offset, max_offset);
    let random0 = raw[4..4 + random0_len].to_vec();
    let payload = raw[4 + random0_len..4 + random0_len + 32].to_vec();
    let random1 = raw[4 + random0_len + 32..DIGEST_BLOCK_SIZE].to_vec();
    Ok(Block { random0, payload, random1 })
}

fn write_digest_block(block: &Block) -> [u8; DIGEST_BLOCK_SIZE] {
    let mut out = [0u8; DIGEST_BLOCK_SIZE];
    out[..4].copy_from_slice(&block.offset().to_le_bytes());
    let mut pos = 4;
    out[pos..pos + block.random0.len()].copy_from_slice(&block.random0);
    pos += block.random0.len();
    out[pos..pos + block.payload.len()].copy_from_slice(&block.payload);
    pos += block.payload.len();
    out[pos..pos + block.random1.len()].copy_from_slice(&block.random1);
    out
}

/// A parsed complex-handshake C1 or S1 body (the 1536 bytes following the
/// single C0/S0 version byte): 4-byte time, 4-byte version, then a key block
/// and digest block in the order `schema` dictates.
struct C1S1 {
    schema: Schema,
    time: u32,
    version: u32,
    key: Block,
    digest: Block,
}

/// The digest block with its 32-byte payload excluded but its 4-byte offset
/// field retained: `offset(4) | random0 | random1` (732 bytes).
fn digest_block_without_payload(block: &Block) -> Vec<u8> {
    let mut out = Vec::with_capacity(DIGEST_BLOCK_SIZE - 32);
    out.extend_from_slice(&block.offset().to_le_bytes());
    out.extend_from_slice(&block.random0);
    out.extend_from_slice(&block.random1);
    out
}

impl C1S1 {
    /// Reassembles the full 1536-byte body with only the 32-byte digest
    /// payload excised, for `CalcC1Digest`/`CalcS1Digest`'s "joined bytes"
    /// input: `time(4) | version(4) | <blocks, digest payload removed>` =
    /// 1504 bytes (`spec.md` §4.C: "the digest is computed over the
    /// 1504-byte c1-without-digest").
    fn joined_bytes_without_digest(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(C1S1_SIZE - 32);
        out.extend_from_slice(&self.time.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        match self.schema {
            Schema::Schema0 => {
                out.extend_from_slice(&write_key_block(&self.key));
                out.extend_from_slice(&digest_block_without_payload(&self.digest));
            },
            Schema::Schema1 => {
                out.extend_from_slice(&digest_block_without_payload(&self.digest));
                out.extend_from_slice(&write_key_block(&self.key));
            },
        }
        out
    }

    fn to_bytes(&self) -> [u8; C1S1_SIZE] {
        let mut out = [0u8; C1S1_SIZE];
        out[0..4].copy_from_slice(&self.time.to_be_bytes());
        out[4..8].copy_from_slice(&self.version.to_be_bytes());
        let key_bytes = write_key_block(&self.key);
        let digest_bytes = write_digest_block(&self.digest);
        match self.schema {
            Schema::Schema0 => {
                out[8..8 + KEY_BLOCK_SIZE].copy_from_slice(&key_bytes);
                out[8 + KEY_BLOCK_SIZE..].copy_from_slice(&digest_bytes);
            },
            Schema::Schema1 => {
                out[8..8 + DIGEST_BLOCK_SIZE].copy_from_slice(&digest_bytes);
                out[8 + DIGEST_BLOCK_SIZE..].copy_from_slice(&key_bytes);
            },
        }
        out
    }

    fn parse(body: &[u8; C1S1_SIZE], schema: Schema) -> Result<Self> {
        let time = u32::from_be_bytes(body[0..4].try_into().expect("slice is 4 bytes"));
        let version = u32::from_be_bytes(body[4..8].try_into().expect("slice is 4 bytes"));
        let rest = &body[8..];
        let (key, digest) = match schema {
            Schema::Schema0 => {
                (parse_key_block(&rest[..KEY_BLOCK_SIZE])?, parse_digest_block(&rest[KEY_BLOCK_SIZE..])?)
            },
            Schema::Schema1 => {
                (parse_key_block(&rest[DIGEST_BLOCK_SIZE..])?, parse_digest_block(&rest[..DIGEST_BLOCK_SIZE])?)
            },
        };
        Ok(Self { schema, time, version, key, digest })
    }

    fn digest_bytes(&self) -> [u8; 32] {
        self.digest.payload.clone().try_into().expect("digest payload is 32 bytes")
    }
}

fn calc_digest(c1s1: &C1S1, hmac_key: &[u8]) -> [u8; 32] {
    hmac_sha256(hmac_key, &c1s1.joined_bytes_without_digest())
}

/// Attempts to parse and validate `c1_body` as a complex-handshake C1 under
/// the given `schema`, returning the parsed structure on success.
fn try_validate_c1(c1_body: &[u8; C1S1_SIZE], schema: Schema) -> Option<C1S1> {
    let parsed = C1S1::parse(c1_body, schema).ok()?;
    let expected = calc_digest(&parsed, &GENUINE_FP_KEY[..30]);
    if expected == parsed.digest_bytes() {
        Some(parsed)
    } else {
        None
    }
}

/// The time/version header S1 carries; time is always 0 (matching a real
/// server, which doesn't echo C1's timestamp) and version names this
/// server's synthetic FMS build.
const S1_TIME: u32 = 0;
const S1_VERSION: u32 = 0x0d0e_0a0c;

/// Builds a complex-handshake S1 whose key block carries our DH public key
/// and whose digest is signed with `GenuineFMSKey`.
fn build_s1(schema: Schema, dh: &DiffieHellman) -> C1S1 {
    let key = Block::generate(dh.public_key_bytes().to_vec(), KEY_BLOCK_SIZE);
    let mut digest = Block::generate(vec![0u8; 32], DIGEST_BLOCK_SIZE);
    let mut s1 = C1S1 {
        schema,
        time: S1_TIME,
        version: S1_VERSION,
        key,
        digest: Block { random0: digest.random0.clone(), payload: vec![0u8; 32], random1: digest.random1.clone() },
    };
    let signature = calc_digest(&s1, &GENUINE_FMS_KEY[..36]);
    digest.payload = signature.to_vec();
    s1.digest = digest;
    s1
}

/// Computes the C2/S2 digest given the peer's C1/S1 digest bytes and the
/// 1504 bytes of C2/S2 random payload, per `c2s2::C2Create`/`S2Create`.
fn calc_c2s2_digest(peer_digest: &[u8; 32], random: &[u8], hmac_key: &[u8]) -> [u8; 32] {
    let temp_key = hmac_sha256(hmac_key, peer_digest);
    hmac_sha256(&temp_key, random)
}

/// Result of a completed server-side handshake: whether the complex path
/// (with a validated digest) was taken, the derived DH shared secret
/// when it was, and the real client IP recovered from a proxy prologue
/// (if any preceded the real C0C1).
pub struct HandshakeOutcome {
    pub complex: bool,
    pub shared_secret: Option<Vec<u8>>,
    pub proxy_real_ip: Option<std::net::Ipv4Addr>,
}

const PROXY_PROLOGUE_MARKER: u8 = 0xF3;
const PROXY_PROLOGUE_MAX_LEN: u16 = 1024;

/// Peeks for a non-standard proxy prologue ahead of the real C0C1
/// (`spec.md` §4.C): if the first byte is `0xF3`, the next two bytes (big
/// endian) give the prologue body length `N` (at most 1024); when `N >= 4`
/// the body's first four bytes are the downstream client's real IPv4
/// address in network order. The remaining stream starts at the real C0C1
/// regardless of whether a prologue was present.
///
/// # Errors
/// [`Error::Io`] on a transport failure, [`Error::Handshake`] if the
/// declared length exceeds [`PROXY_PROLOGUE_MAX_LEN`].
async fn read_proxy_prologue<S>(stream: &mut S) -> Result<(u8, Option<std::net::Ipv4Addr>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = stream.read_u8().await?;
    if first != PROXY_PROLOGUE_MARKER {
        return Ok((first, None));
    }
    let len = stream.read_u16().await?;
    if len > PROXY_PROLOGUE_MAX_LEN {
        return Err(Error::Handshake(format!("proxy prologue length {len} exceeds max {PROXY_PROLOGUE_MAX_LEN}")));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    let real_ip = if len >= 4 {
        Some(std::net::Ipv4Addr::new(body[0], body[1], body[2], body[3]))
    } else {
        None
    };
    let version = stream.read_u8().await?;
    Ok((version, real_ip))
}

/// Performs the server side of the handshake over an already-connected
/// stream: reads an optional proxy prologue, then C0+C1, tries schema0 then
/// schema1, falls back to a simple handshake if neither validates, writes
/// S0+S1+S2, then reads C2.
///
/// # Errors
/// [`Error::Io`] on a transport failure, [`Error::Handshake`] on a malformed
/// C0 version byte, an oversized proxy prologue, or a malformed block layout.
pub async fn server_handshake<S>(stream: &mut S) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (version, proxy_real_ip) = read_proxy_prologue(stream).await?;
    let mut c1_only = vec![0u8; C1S1_SIZE];
    stream.read_exact(&mut c1_only).await?;
    let mut c0c1 = Vec::with_capacity(1 + C1S1_SIZE);
    c0c1.push(version);
    c0c1.extend_from_slice(&c1_only);
    let version = c0c1[0];
    if version != 3 {
        return Err(Error::Handshake(format!("unsupported handshake version {version}")));
    }
    let c1_body: [u8; C1S1_SIZE] = c0c1[1..].try_into().expect("c1 body is 1536 bytes");

    let parsed_c1 =
        try_validate_c1(&c1_body, Schema::Schema0).or_else(|| try_validate_c1(&c1_body, Schema::Schema1));

    let mut s0s1s2 = Vec::with_capacity(1 + C1S1_SIZE + C2S2_SIZE);
    s0s1s2.push(3u8);

    let outcome = if let Some(c1) = parsed_c1 {
        let dh = DiffieHellman::generate()?;
        let shared_secret = dh.shared_secret(&c1.key.payload);
        let s1 = build_s1(c1.schema, &dh);
        s0s1s2.extend_from_slice(&s1.to_bytes());

        let mut random = vec![0u8; C2S2_SIZE - 32];
        rand::thread_rng().fill_bytes(&mut random);
        let s2_digest = calc_c2s2_digest(&c1.digest_bytes(), &random, &GENUINE_FMS_KEY);
        s0s1s2.extend_from_slice(&random);
        s0s1s2.extend_from_slice(&s2_digest);

        HandshakeOutcome { complex: true, shared_secret: Some(shared_secret), proxy_real_ip }
    } else {
        // Simple handshake: S1 echoes time/version with random payload, S2
        // echoes C1 verbatim (a real server accepts any C2 back).
        let mut s1 = [0u8; C1S1_SIZE];
        rand::thread_rng().fill_bytes(&mut s1[8..]);
        s0s1s2.extend_from_slice(&s1);
        s0s1s2.extend_from_slice(&c1_body);

        HandshakeOutcome { complex: false, shared_secret: None, proxy_real_ip }
    };

    stream.write_all(&s0s1s2).await?;
    stream.flush().await?;

    let mut c2 = vec![0u8; C2S2_SIZE];
    stream.read_exact(&mut c2).await?;

    Ok(outcome)
}

/// Performs the client side of a simple handshake over an already-connected
/// stream: writes C0+C1, reads S0+S1+S2, then writes C2 echoing S1 verbatim.
/// Used by the edge token traverse client connecting to an upstream origin
/// (`spec.md` §4.J "Supplement"), which never needs the complex digest path
/// since it is talking to another RtmpKit-family server.
///
/// # Errors
/// [`Error::Io`] on a transport failure, [`Error::Handshake`] if the peer's
/// S0 version byte is unsupported.
pub async fn client_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0c1 = vec![3u8];
    c0c1.extend_from_slice(&[0u8; C1S1_SIZE]);
    rand::thread_rng().fill_bytes(&mut c0c1[9..]); // leave time+version header zeroed
    stream.write_all(&c0c1).await?;
    stream.flush().await?;

    let mut s0s1s2 = vec![0u8; 1 + C1S1_SIZE + C2S2_SIZE];
    stream.read_exact(&mut s0s1s2).await?;
    if s0s1s2[0] != 3 {
        return Err(Error::Handshake(format!("unsupported handshake version {}", s0s1s2[0])));
    }
    let s1 = &s0s1s2[1..1 + C1S1_SIZE];

    stream.write_all(s1).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_valid_offset_is_bounded() {
        for offset in [0u32, 1, 0xffff_ffff, 0x1234_5678] {
            assert!(valid_offset(offset, 632) < 632);
        }
    }

    #[test]
    fn test_dh_shared_secret_matches_both_directions() {
        let alice = DiffieHellman::generate().unwrap();
        let bob = DiffieHellman::generate().unwrap();
        let alice_secret = alice.shared_secret(&bob.public_key_bytes());
        let bob_secret = bob.shared_secret(&alice.public_key_bytes());
        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn test_dh_public_key_is_128_bytes() {
        let dh = DiffieHellman::generate().unwrap();
        assert_eq!(dh.public_key_bytes().len(), DH_KEY_SIZE);
    }

    #[test]
    fn test_key_block_roundtrip() {
        let block = Block::generate(vec![7u8; DH_KEY_SIZE], KEY_BLOCK_SIZE);
        let raw = write_key_block(&block);
        let parsed = parse_key_block(&raw).unwrap();
        assert_eq!(parsed.payload, vec![7u8; DH_KEY_SIZE]);
    }

    #[test]
    fn test_digest_block_roundtrip() {
        let block = Block::generate(vec![9u8; 32], DIGEST_BLOCK_SIZE);
        let raw = write_digest_block(&block);
        let parsed = parse_digest_block(&raw).unwrap();
        assert_eq!(parsed.payload, vec![9u8; 32]);
    }

    #[test]
    fn test_c1_digest_validates_when_correctly_signed() {
        let key = Block::generate(vec![1u8; DH_KEY_SIZE], KEY_BLOCK_SIZE);
        let digest_shell = Block::generate(vec![0u8; 32], DIGEST_BLOCK_SIZE);
        let mut c1 = C1S1 { schema: Schema::Schema0, time: 0, version: 1, key, digest: digest_shell };
        let signature = calc_digest(&c1, &GENUINE_FP_KEY[..30]);
        c1.digest.payload = signature.to_vec();

        let body = c1.to_bytes();
        let parsed = try_validate_c1(&body, Schema::Schema0);
        assert!(parsed.is_some());
    }

    #[test]
    fn test_c1_digest_rejects_tampered_payload() {
        let key = Block::generate(vec![1u8; DH_KEY_SIZE], KEY_BLOCK_SIZE);
        let digest_shell = Block::generate(vec![0u8; 32], DIGEST_BLOCK_SIZE);
        let mut c1 = C1S1 { schema: Schema::Schema0, time: 0, version: 1, key, digest: digest_shell };
        c1.digest.payload = vec![0xaa; 32];
        let body = c1.to_bytes();
        assert!(try_validate_c1(&body, Schema::Schema0).is_none());
    }

    #[test]
    fn test_c1_digest_validates_under_schema1_too() {
        let key = Block::generate(vec![1u8; DH_KEY_SIZE], KEY_BLOCK_SIZE);
        let digest_shell = Block::generate(vec![0u8; 32], DIGEST_BLOCK_SIZE);
        let mut c1 = C1S1 { schema: Schema::Schema1, time: 0x1234_5678, version: 1, key, digest: digest_shell };
        let signature = calc_digest(&c1, &GENUINE_FP_KEY[..30]);
        c1.digest.payload = signature.to_vec();

        let body = c1.to_bytes();
        assert!(try_validate_c1(&body, Schema::Schema1).is_some());
    }

    #[test]
    fn test_joined_bytes_without_digest_is_1504_bytes_and_preserves_time_and_offset() {
        let key = Block::generate(vec![1u8; DH_KEY_SIZE], KEY_BLOCK_SIZE);
        let digest_shell = Block::generate(vec![0u8; 32], DIGEST_BLOCK_SIZE);
        let offset_before = digest_shell.offset();
        let c1 = C1S1 { schema: Schema::Schema0, time: 0xaabb_ccdd, version: 1, key, digest: digest_shell };
        let joined = c1.joined_bytes_without_digest();
        assert_eq!(joined.len(), C1S1_SIZE - 32);
        assert_eq!(&joined[0..4], &0xaabb_ccddu32.to_be_bytes());
        let digest_offset_in_joined = 8 + KEY_BLOCK_SIZE;
        assert_eq!(&joined[digest_offset_in_joined..digest_offset_in_joined + 4], &offset_before.to_le_bytes());
    }

    #[tokio::test]
    async fn test_server_handshake_completes_over_duplex_simple_client() {
        let (mut client, mut server) = duplex(64 * 1024);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });

        let mut c0c1 = vec![3u8];
        c0c1.extend_from_slice(&[0u8; C1S1_SIZE]);
        client.write_all(&c0c1).await.unwrap();

        let mut s0s1s2 = vec![0u8; 1 + C1S1_SIZE + C2S2_SIZE];
        client.read_exact(&mut s0s1s2).await.unwrap();
        assert_eq!(s0s1s2[0], 3);

        let mut c2 = vec![0u8; C2S2_SIZE];
        rand::thread_rng().fill_bytes(&mut c2);
        client.write_all(&c2).await.unwrap();

        let outcome = server_task.await.unwrap().unwrap();
        assert!(!outcome.complex);
        assert!(outcome.proxy_real_ip.is_none());
    }

    #[tokio::test]
    async fn test_server_handshake_recovers_real_ip_from_proxy_prologue() {
        let (mut client, mut server) = duplex(64 * 1024);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });

        let mut prologue = vec![PROXY_PROLOGUE_MARKER];
        prologue.extend_from_slice(&4u16.to_be_bytes());
        prologue.extend_from_slice(&[203, 0, 113, 7]);
        client.write_all(&prologue).await.unwrap();

        let mut c0c1 = vec![3u8];
        c0c1.extend_from_slice(&[0u8; C1S1_SIZE]);
        client.write_all(&c0c1).await.unwrap();

        let mut s0s1s2 = vec![0u8; 1 + C1S1_SIZE + C2S2_SIZE];
        client.read_exact(&mut s0s1s2).await.unwrap();

        let mut c2 = vec![0u8; C2S2_SIZE];
        rand::thread_rng().fill_bytes(&mut c2);
        client.write_all(&c2).await.unwrap();

        let outcome = server_task.await.unwrap().unwrap();
        assert_eq!(outcome.proxy_real_ip, Some(std::net::Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[tokio::test]
    async fn test_client_handshake_completes_against_server_handshake() {
        let (mut client, mut server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });
        client_handshake(&mut client).await.unwrap();
        let outcome = server_task.await.unwrap().unwrap();
        assert!(!outcome.complex);
    }
}
