//! QR pairing payload construction (spec.md §4.E). The server hands the
//! client a batch of candidate `ref` strings in its "pair-device" iq; the
//! client turns each into a displayable QR string the phone scans.

use base64::Engine;

/// Builds the QR string for a single `ref`: `ref,base64(noise_pub),
/// base64(identity_pub),base64(adv_secret)` (spec.md §4.E). The caller is
/// responsible for rotating through one `ref` per ~20s until pairing
/// completes or the batch is exhausted.
pub fn build_qr_payload(qr_ref: &str, noise_pub: &[u8; 32], identity_pub: &[u8; 32], adv_secret: &[u8; 32]) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    format!(
        "{},{},{},{}",
        qr_ref,
        engine.encode(noise_pub),
        engine.encode(identity_pub),
        engine.encode(adv_secret)
    )
}

/// Builds one QR payload per candidate ref, preserving server order so the
/// caller can publish them in sequence.
pub fn build_qr_payloads(refs: &[String], noise_pub: &[u8; 32], identity_pub: &[u8; 32], adv_secret: &[u8; 32]) -> Vec<String> {
    refs.iter()
        .map(|r| build_qr_payload(r, noise_pub, identity_pub, adv_secret))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_has_four_comma_separated_fields() {
        let payload = build_qr_payload("abc123", &[1u8; 32], &[2u8; 32], &[3u8; 32]);
        assert_eq!(payload.split(',').count(), 4);
        assert!(payload.starts_with("abc123,"));
    }

    #[test]
    fn batch_preserves_ref_order() {
        let refs = vec!["r1".to_string(), "r2".to_string(), "r3".to_string()];
        let payloads = build_qr_payloads(&refs, &[0u8; 32], &[0u8; 32], &[0u8; 32]);
        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].starts_with("r1,"));
        assert!(payloads[2].starts_with("r3,"));
    }
}
