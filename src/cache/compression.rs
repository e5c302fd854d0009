//! Value Compression
//!
//! Large values are LZ4-compressed before they enter a shard, so tier
//! budgets are charged for the bytes actually held in memory. Values at or
//! below the threshold, and values that do not shrink enough, are kept as
//! they are.
//!
//! ```text
//! put ──► len > threshold? ──no──► stored raw
//!               │
//!              yes ──► lz4 ──► ratio < max_ratio? ──no──► stored raw
//!                                     │
//!                                    yes ──► stored compressed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    /// Values are stored as given
    None,
    /// LZ4 block format with the raw length prepended
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Compression settings for cached values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    /// Values up to this size are never compressed
    pub threshold_bytes: u64,
    /// Compressed output is kept only below this fraction of the input
    pub max_ratio: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            threshold_bytes: 16 * 1024,
            max_ratio: 0.9,
        }
    }
}

impl CompressionConfig {
    pub fn disabled() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold_bytes: u64) -> Self {
        self.threshold_bytes = threshold_bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_ratio > 0.0 && self.max_ratio <= 1.0) {
            return Err(Error::Config(
                "cache.compression.max_ratio must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// A value as held by a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Bytes,
    pub encoding: CompressionAlgorithm,
    /// Length of the value before encoding
    pub raw_len: u64,
}

impl Payload {
    pub fn raw(data: Bytes) -> Self {
        Self {
            raw_len: data.len() as u64,
            data,
            encoding: CompressionAlgorithm::None,
        }
    }

    #[inline]
    pub fn stored_len(&self) -> u64 {
        self.data.len() as u64
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::raw(data)
    }
}

/// Compression counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompressionStats {
    /// Values stored compressed
    pub compressed: u64,
    /// Values above the threshold that did not shrink enough
    pub incompressible: u64,
    /// Raw bytes of the values stored compressed
    pub bytes_in: u64,
    /// Stored bytes of those values
    pub bytes_out: u64,
    pub failures: u64,
}

impl CompressionStats {
    /// Stored over raw bytes for compressed values. 1.0 when none were.
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    compressed: AtomicU64,
    incompressible: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    failures: AtomicU64,
}

/// Encodes values on the way into the cache and decodes them on the way out.
#[derive(Debug)]
pub struct CompressionManager {
    config: CompressionConfig,
    counters: Counters,
}

impl CompressionManager {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Encode `value`. Never fails: anything that cannot be compressed
    /// usefully is stored raw.
    pub fn compress(&self, value: Bytes) -> Payload {
        let raw_len = value.len() as u64;
        if self.config.algorithm == CompressionAlgorithm::None || raw_len <= self.config.threshold_bytes {
            return Payload::raw(value);
        }

        let compressed = match lz4::block::compress(&value, None, true) {
            Ok(compressed) => compressed,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(size = raw_len, error = %e, "Compression failed, storing raw");
                return Payload::raw(value);
            }
        };

        let stored = compressed.len() as u64;
        if (stored as f64) >= raw_len as f64 * self.config.max_ratio {
            self.counters.incompressible.fetch_add(1, Ordering::Relaxed);
            return Payload::raw(value);
        }

        self.counters.compressed.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_in.fetch_add(raw_len, Ordering::Relaxed);
        self.counters.bytes_out.fetch_add(stored, Ordering::Relaxed);
        Payload {
            data: Bytes::from(compressed),
            encoding: CompressionAlgorithm::Lz4,
            raw_len,
        }
    }

    /// Restore the original value.
    pub fn decompress(&self, data: Bytes, encoding: CompressionAlgorithm) -> Result<Bytes> {
        match encoding {
            CompressionAlgorithm::None => Ok(data),
            CompressionAlgorithm::Lz4 => lz4::block::decompress(&data, None)
                .map(Bytes::from)
                .map_err(|e| {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    Error::Compression(format!("lz4 decode: {}", e))
                }),
        }
    }

    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            compressed: self.counters.compressed.load(Ordering::Relaxed),
            incompressible: self.counters.incompressible.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(threshold: u64) -> CompressionManager {
        CompressionManager::new(CompressionConfig::default().with_threshold(threshold))
    }

    #[test]
    fn test_small_values_stay_raw() {
        let m = manager(1024);
        let payload = m.compress(Bytes::from(vec![b'a'; 1024]));
        assert_eq!(payload.encoding, CompressionAlgorithm::None);
        assert_eq!(payload.stored_len(), 1024);
        assert_eq!(m.stats().compressed, 0);
    }

    #[test]
    fn test_repetitive_value_compresses_and_restores() {
        let m = manager(1024);
        let value = Bytes::from("object body ".repeat(1000));
        let payload = m.compress(value.clone());

        assert_eq!(payload.encoding, CompressionAlgorithm::Lz4);
        assert_eq!(payload.raw_len, value.len() as u64);
        assert!(payload.stored_len() < value.len() as u64 / 4);

        let restored = m.decompress(payload.data, payload.encoding).unwrap();
        assert_eq!(restored, value);

        let stats = m.stats();
        assert_eq!(stats.compressed, 1);
        assert!(stats.ratio() < 0.25);
    }

    #[test]
    fn test_incompressible_value_stays_raw() {
        let m = manager(64);
        // xorshift noise does not compress
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let payload = m.compress(Bytes::from(noise));
        assert_eq!(payload.encoding, CompressionAlgorithm::None);
        assert_eq!(m.stats().incompressible, 1);
    }

    #[test]
    fn test_disabled_never_compresses() {
        let m = CompressionManager::new(CompressionConfig::disabled().with_threshold(0));
        let payload = m.compress(Bytes::from(vec![0u8; 100_000]));
        assert_eq!(payload.encoding, CompressionAlgorithm::None);
    }

    #[test]
    fn test_corrupt_data_fails_to_decode() {
        let m = manager(0);
        let err = m
            .decompress(Bytes::from_static(b"\x10\x00\x00\x00junk"), CompressionAlgorithm::Lz4)
            .unwrap_err();
        assert!(matches!(err, Error::Compression(_)));
        assert_eq!(m.stats().failures, 1);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let config = CompressionConfig {
            max_ratio: 0.0,
            ..CompressionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
