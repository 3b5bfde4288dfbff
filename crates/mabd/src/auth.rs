//! Credential construction for the MAB variants.
//!
//! MAB authenticates a station with its MAC as both identity and
//! password. Depending on the configured variant this becomes an
//! EAP-Response/Identity (with MD5 rounds against server
//! challenges), a locally computed CHAP pair, or an RFC 2865 §5.2
//! obfuscated User-Password.

use md5::{Digest, Md5};
use rand::RngCore;

/// Octets of a CHAP / EAP-MD5 challenge.
pub const CHALLENGE_LEN: usize = 16;
/// Octets of an MD5 digest.
pub const MD5_LEN: usize = 16;

/// EAP packet codes.
pub const EAP_CODE_REQUEST: u8 = 1;
pub const EAP_CODE_RESPONSE: u8 = 2;
/// EAP type: Identity.
pub const EAP_TYPE_IDENTITY: u8 = 1;
/// EAP type: MD5-Challenge.
pub const EAP_TYPE_MD5: u8 = 4;

/// Fills a fresh random challenge.
pub fn challenge_generate(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

fn md5_of(parts: &[&[u8]]) -> [u8; MD5_LEN] {
    let mut h = Md5::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

/// CHAP-Password attribute value: `id || MD5(id || password ||
/// challenge)`.
pub fn chap_password(id: u8, password: &str, challenge: &[u8]) -> Vec<u8> {
    let digest = md5_of(&[&[id], password.as_bytes(), challenge]);
    let mut out = Vec::with_capacity(1 + MD5_LEN);
    out.push(id);
    out.extend_from_slice(&digest);
    out
}

/// A constructed EAP-Response/Identity packet.
pub fn eap_identity_response(id: u8, identity: &str) -> Vec<u8> {
    let len = (5 + identity.len()) as u16;
    let mut out = Vec::with_capacity(len as usize);
    out.push(EAP_CODE_RESPONSE);
    out.push(id);
    out.extend_from_slice(&len.to_be_bytes());
    out.push(EAP_TYPE_IDENTITY);
    out.extend_from_slice(identity.as_bytes());
    out
}

/// An EAP-Response/MD5-Challenge packet answering `challenge`.
pub fn eap_md5_response(id: u8, password: &str, challenge: &[u8]) -> Vec<u8> {
    let digest = md5_of(&[&[id], password.as_bytes(), challenge]);
    let len = (5 + 1 + MD5_LEN) as u16;
    let mut out = Vec::with_capacity(len as usize);
    out.push(EAP_CODE_RESPONSE);
    out.push(id);
    out.extend_from_slice(&len.to_be_bytes());
    out.push(EAP_TYPE_MD5);
    out.push(MD5_LEN as u8);
    out.extend_from_slice(&digest);
    out
}

/// Extracts `(id, challenge)` from an EAP-Request/MD5-Challenge
/// packet carried in a server EAP-Message attribute.
pub fn eap_md5_challenge_parse(eap: &[u8]) -> Option<(u8, Vec<u8>)> {
    if eap.len() < 6 || eap[0] != EAP_CODE_REQUEST || eap[4] != EAP_TYPE_MD5 {
        return None;
    }
    let id = eap[1];
    let value_size = eap[5] as usize;
    if eap.len() < 6 + value_size || value_size == 0 {
        return None;
    }
    Some((id, eap[6..6 + value_size].to_vec()))
}

/// RFC 2865 §5.2 User-Password obfuscation: the password is padded
/// to a 16-octet multiple and XORed chunk-wise with a running MD5 of
/// the shared secret and the previous ciphertext block (the Request
/// Authenticator for the first block).
pub fn pap_password_obfuscate(secret: &str, authenticator: &[u8; 16], password: &str) -> Vec<u8> {
    let mut padded = password.as_bytes().to_vec();
    let target = padded.len().div_ceil(16).max(1) * 16;
    padded.resize(target, 0);
    let mut out = Vec::with_capacity(padded.len());
    let mut prev: Vec<u8> = authenticator.to_vec();
    for chunk in padded.chunks(16) {
        let mask = md5_of(&[secret.as_bytes(), &prev]);
        let cipher: Vec<u8> = chunk.iter().zip(mask.iter()).map(|(p, m)| p ^ m).collect();
        prev = cipher.clone();
        out.extend_from_slice(&cipher);
    }
    out
}
