use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Checks a detached hex signature over a release manifest.
///
/// Decoding problems and bad signatures are both errors: a release that
/// claims to be signed and is not is never installable.
pub fn verify_release_signature(
    payload: &[u8],
    trusted_key_hex: &str,
    signature_hex: &str,
) -> Result<()> {
    let key_bytes: [u8; 32] = decode_fixed(trusted_key_hex, "trusted release key")?;
    let signature_bytes: [u8; 64] = decode_fixed(signature_hex, "release signature")?;

    let key = VerifyingKey::from_bytes(&key_bytes).context("trusted release key is not a valid Ed25519 key")?;
    let signature = Signature::from_bytes(&signature_bytes);

    key.verify(payload, &signature)
        .map_err(|_| anyhow!("release signature does not match the trusted release key"))
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(value.trim()).with_context(|| format!("failed to decode {what} hex"))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow!("invalid {what} length: expected {N} bytes, got {len}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 8032 test vector 1 (empty message).
    const PUBLIC_KEY_HEX: &str = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";
    const SIGNATURE_HEX: &str = concat!(
        "e5564300c360ac729086e2cc806e828a84877f1eb8e5d974d873e06522490155",
        "5fb8821590a33bacc61e39701cf9b46bd25bf5f0595bbe24655141438e7a100b"
    );

    #[test]
    fn accepts_matching_signature() {
        verify_release_signature(b"", PUBLIC_KEY_HEX, SIGNATURE_HEX)
            .expect("signature must verify");
    }

    #[test]
    fn rejects_tampered_manifest() {
        let err = verify_release_signature(b"version = \"9.9.9\"", PUBLIC_KEY_HEX, SIGNATURE_HEX)
            .expect_err("tampered payload must fail");
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn rejects_malformed_hex_and_lengths() {
        assert!(verify_release_signature(b"", "zz", SIGNATURE_HEX).is_err());
        assert!(verify_release_signature(b"", "00", SIGNATURE_HEX).is_err());
        assert!(verify_release_signature(b"", PUBLIC_KEY_HEX, "zz").is_err());

        let err = verify_release_signature(b"", PUBLIC_KEY_HEX, "00")
            .expect_err("short signature must fail");
        assert!(err.to_string().contains("expected 64 bytes, got 1"));
    }
}
