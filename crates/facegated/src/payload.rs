//! Base64 / data-URL image payloads.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use std::path::Path;
use thiserror::Error;

/// Standard alphabet, padding optional.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const DATA_IMAGE_PREFIX: &str = "data:image";

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("image payload is empty")]
    Empty,
    #[error("invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn is_data_url(value: &str) -> bool {
    value.starts_with(DATA_IMAGE_PREFIX)
}

/// Strip a `data:image/...;base64,` header, splitting on the first comma only.
/// Plain base64 is returned unchanged. A data URL without a comma has no
/// payload.
pub fn strip_data_url_prefix(value: &str) -> &str {
    if !is_data_url(value) {
        return value;
    }
    value.split_once(',').map(|(_, data)| data).unwrap_or("")
}

/// Decode a base64 payload, with or without a data-URL header.
/// ASCII whitespace (line breaks from MIME encoders) is ignored.
pub fn decode(value: &str) -> Result<Vec<u8>, PayloadError> {
    let data = strip_data_url_prefix(value);
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(PayloadError::Empty);
    }
    Ok(PAYLOAD_ENGINE.decode(compact.as_bytes())?)
}

/// Decode `value` and write the bytes to `dest`. Returns the bytes written.
pub async fn materialize(value: &str, dest: &Path) -> Result<u64, PayloadError> {
    let bytes = decode(value)?;
    tokio::fs::write(dest, &bytes)
        .await
        .map_err(|source| PayloadError::Write {
            path: dest.display().to_string(),
            source,
        })?;
    tracing::debug!(path = %dest.display(), bytes = bytes.len(), "image payload written");
    Ok(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_data_url_prefix("data:image/jpeg;base64,QUJD"), "QUJD");
        assert_eq!(strip_data_url_prefix("QUJD"), "QUJD");
        // Only the first comma splits.
        assert_eq!(strip_data_url_prefix("data:image/png;base64,QU,JD"), "QU,JD");
        assert_eq!(strip_data_url_prefix("data:image/png;base64"), "");
    }

    #[test]
    fn test_decode_variants() {
        let encoded = STANDARD.encode(JPEG_MAGIC);
        assert_eq!(decode(&encoded).unwrap(), JPEG_MAGIC);
        assert_eq!(decode(&format!("data:image/jpeg;base64,{encoded}")).unwrap(), JPEG_MAGIC);
        assert_eq!(decode(encoded.trim_end_matches('=')).unwrap(), JPEG_MAGIC);

        let wrapped = format!("{}\n{}", &encoded[..8], &encoded[8..]);
        assert_eq!(decode(&wrapped).unwrap(), JPEG_MAGIC);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode(""), Err(PayloadError::Empty)));
        assert!(matches!(decode("data:image/jpeg;base64,"), Err(PayloadError::Empty)));
        assert!(matches!(decode("not*base64!"), Err(PayloadError::Base64(_))));
    }

    #[tokio::test]
    async fn test_materialize_reproduces_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("capture_V1_20240101_000000.jpg");
        let original: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let payload = format!("data:image/jpeg;base64,{}", STANDARD.encode(&original));

        let written = materialize(&payload, &dest).await.unwrap();

        assert_eq!(written, original.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), original);
    }

    #[tokio::test]
    async fn test_materialize_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("gone/capture.jpg");
        let err = materialize("QUJD", &dest).await.unwrap_err();
        assert!(matches!(err, PayloadError::Write { .. }));
    }
}
