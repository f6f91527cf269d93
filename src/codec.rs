//! Body codecs for hook-materialised bodies.
//!
//! The proxy advertises `Accept-Encoding: gzip,deflate` upstream, so these
//! are the only encodings a hook can encounter when it reads a body. When a
//! hook re-assigns a body with a `Content-Encoding` still set, the body is
//! recompressed with the same codec before it goes back on the wire.

use crate::error::ProxyError;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{Read, Write};

/// Compress `bytes` with the named encoding (`gzip` or `deflate`).
pub fn compress(encoding: &str, bytes: &[u8]) -> Result<Vec<u8>, ProxyError> {
    match normalise(encoding).as_str() {
        "gzip" => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(bytes)
                .and_then(|_| enc.finish())
                .map_err(|e| ProxyError::Codec(format!("gzip encode: {}", e)))
        }
        "deflate" => {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(bytes)
                .and_then(|_| enc.finish())
                .map_err(|e| ProxyError::Codec(format!("deflate encode: {}", e)))
        }
        "identity" | "" => Ok(bytes.to_vec()),
        other => Err(ProxyError::Codec(format!(
            "unsupported content encoding: {}",
            other
        ))),
    }
}

/// Decompress `bytes` with the named encoding.
pub fn decompress(encoding: &str, bytes: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let mut out = Vec::new();
    match normalise(encoding).as_str() {
        "gzip" => GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|e| ProxyError::Codec(format!("gzip decode: {}", e)))?,
        "deflate" => ZlibDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|e| ProxyError::Codec(format!("deflate decode: {}", e)))?,
        "identity" | "" => return Ok(bytes.to_vec()),
        other => {
            return Err(ProxyError::Codec(format!(
                "unsupported content encoding: {}",
                other
            )))
        }
    };
    Ok(out)
}

// content-coding tokens are case-insensitive
fn normalise(encoding: &str) -> String {
    encoding.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let body = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let packed = compress("gzip", &body).unwrap();
        assert!(packed.len() < body.len());
        assert_eq!(decompress("gzip", &packed).unwrap(), body);
    }

    #[test]
    fn deflate_round_trip() {
        let body = b"abcabcabcabc".repeat(50);
        let packed = compress("deflate", &body).unwrap();
        assert_eq!(decompress("deflate", &packed).unwrap(), body);
    }

    #[test]
    fn identity_passes_through() {
        assert_eq!(compress("identity", b"raw").unwrap(), b"raw");
        assert_eq!(decompress("", b"raw").unwrap(), b"raw");
    }

    #[test]
    fn encoding_tokens_are_case_insensitive() {
        let body = b"mixed case coding".repeat(10);
        let packed = compress("GZIP", &body).unwrap();
        assert_eq!(decompress("Gzip", &packed).unwrap(), body);

        let packed = compress(" Deflate ", &body).unwrap();
        assert_eq!(decompress("DEFLATE", &packed).unwrap(), body);
    }

    #[test]
    fn unknown_encoding_rejected() {
        assert!(matches!(
            compress("br", b"x"),
            Err(ProxyError::Codec(_))
        ));
        assert!(matches!(
            decompress("zstd", b"x"),
            Err(ProxyError::Codec(_))
        ));
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        assert!(matches!(
            decompress("gzip", b"definitely not gzip"),
            Err(ProxyError::Codec(_))
        ));
    }
}
