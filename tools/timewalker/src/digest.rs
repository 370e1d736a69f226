use crate::errors::TimewalkerError;
use sha2::{Digest, Sha256};

pub fn hex_bytes(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Inverse of [`hex_bytes`].
pub fn decode_hex(text: &str) -> Result<Vec<u8>, TimewalkerError> {
    hex::decode(text).map_err(|e| TimewalkerError::ReplayReconstruction(format!("bad hex payload: {e}")))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_decoding_rejects_malformed_input() {
        assert_eq!(
            decode_hex(&hex_bytes(b"\x1b[0m\xff")).expect("decode"),
            b"\x1b[0m\xff".to_vec()
        );
        assert!(matches!(
            decode_hex("abc"),
            Err(TimewalkerError::ReplayReconstruction(_))
        ));
        assert!(decode_hex("zz").is_err());
        assert_eq!(decode_hex("").expect("empty"), Vec::<u8>::new());
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
