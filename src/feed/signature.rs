//! WebSub content-distribution signatures.
//!
//! When a subscription carries `hub.secret`, the hub signs each delivery with
//! an HMAC of the raw body and sends it as `X-Hub-Signature: <alg>=<hex>`.
//! YouTube's hub uses `sha1`; `sha256` is accepted as well.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha1,
    Sha256,
}

impl SignatureAlgorithm {
    fn prefix(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha1 => "sha1=",
            SignatureAlgorithm::Sha256 => "sha256=",
        }
    }
}

/// Parses `sha1=<hex>` or `sha256=<hex>`.
///
/// Returns `None` for malformed headers. Never panics.
pub fn parse_signature_header(header: &str) -> Option<(SignatureAlgorithm, Vec<u8>)> {
    let header = header.trim();
    let (alg, hex_sig) = if let Some(rest) = header.strip_prefix("sha1=") {
        (SignatureAlgorithm::Sha1, rest)
    } else if let Some(rest) = header.strip_prefix("sha256=") {
        (SignatureAlgorithm::Sha256, rest)
    } else {
        return None;
    };
    Some((alg, hex::decode(hex_sig).ok()?))
}

/// Computes the HMAC of `payload` under `secret`.
pub fn compute_signature(alg: SignatureAlgorithm, payload: &[u8], secret: &[u8]) -> Vec<u8> {
    match alg {
        SignatureAlgorithm::Sha1 => HmacSha1::new_from_slice(secret)
            .map(|mac| mac.chain_update(payload).finalize().into_bytes().to_vec())
            .unwrap_or_default(),
        SignatureAlgorithm::Sha256 => HmacSha256::new_from_slice(secret)
            .map(|mac| mac.chain_update(payload).finalize().into_bytes().to_vec())
            .unwrap_or_default(),
    }
}

pub fn format_signature_header(alg: SignatureAlgorithm, signature: &[u8]) -> String {
    format!("{}{}", alg.prefix(), hex::encode(signature))
}

/// Verifies a delivery signature in constant time.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some((alg, expected)) = parse_signature_header(signature_header) else {
        return false;
    };

    match alg {
        SignatureAlgorithm::Sha1 => HmacSha1::new_from_slice(secret)
            .is_ok_and(|mac| mac.chain_update(payload).verify_slice(&expected).is_ok()),
        SignatureAlgorithm::Sha256 => HmacSha256::new_from_slice(secret)
            .is_ok_and(|mac| mac.chain_update(payload).verify_slice(&expected).is_ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALGS: [SignatureAlgorithm; 2] = [SignatureAlgorithm::Sha1, SignatureAlgorithm::Sha256];

    #[test]
    fn parse_both_algorithms() {
        assert_eq!(
            parse_signature_header("sha1=1234abcd"),
            Some((SignatureAlgorithm::Sha1, vec![0x12, 0x34, 0xab, 0xcd]))
        );
        assert_eq!(
            parse_signature_header("sha256=ABCD"),
            Some((SignatureAlgorithm::Sha256, vec![0xab, 0xcd]))
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(parse_signature_header(""), None);
        assert_eq!(parse_signature_header("1234abcd"), None);
        assert_eq!(parse_signature_header("md5=1234"), None);
        assert_eq!(parse_signature_header("sha1=xyz"), None);
        assert_eq!(parse_signature_header("sha256=abc"), None);
    }

    /// RFC 2202 test case 2.
    #[test]
    fn sha1_known_vector() {
        let sig = compute_signature(
            SignatureAlgorithm::Sha1,
            b"what do ya want for nothing?",
            b"Jefe",
        );
        assert_eq!(hex::encode(sig), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn signature_lengths() {
        assert_eq!(compute_signature(SignatureAlgorithm::Sha1, b"x", b"k").len(), 20);
        assert_eq!(compute_signature(SignatureAlgorithm::Sha256, b"x", b"k").len(), 32);
    }

    #[test]
    fn verify_rejects_wrong_secret_and_modified_body() {
        for alg in ALGS {
            let header = format_signature_header(alg, &compute_signature(alg, b"<feed/>", b"s1"));
            assert!(verify_signature(b"<feed/>", &header, b"s1"));
            assert!(!verify_signature(b"<feed/>", &header, b"s2"));
            assert!(!verify_signature(b"<feed />", &header, b"s1"));
        }
    }

    #[test]
    fn verify_rejects_cross_algorithm_header() {
        let sig = compute_signature(SignatureAlgorithm::Sha256, b"body", b"s");
        let header = format_signature_header(SignatureAlgorithm::Sha1, &sig);
        assert!(!verify_signature(b"body", &header, b"s"));
    }

    proptest! {
        #[test]
        fn sign_verify_roundtrip(payload: Vec<u8>, secret: Vec<u8>, use_sha1: bool) {
            let alg = if use_sha1 { SignatureAlgorithm::Sha1 } else { SignatureAlgorithm::Sha256 };
            let header = format_signature_header(alg, &compute_signature(alg, &payload, &secret));
            prop_assert!(verify_signature(&payload, &header, &secret));
        }

        #[test]
        fn malformed_header_never_panics(header: String, payload: Vec<u8>, secret: Vec<u8>) {
            let _ = parse_signature_header(&header);
            let _ = verify_signature(&payload, &header, &secret);
        }
    }
}
