//! Configuration structures for Meridian subsystems.

use crate::error::{MeridianError, Result};
use serde::{Deserialize, Serialize};

/// Options for a 2-D geo index.
///
/// `bits` controls key precision; `min`/`max` bound the coordinate
/// domain, closed at the bottom and open at the top.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoIndexOptions {
    /// Number of (x,y) bit pairs stored per key, in [1, 32].
    pub bits: u32,
    /// Lower bound of the coordinate domain (inclusive).
    pub min: f64,
    /// Upper bound of the coordinate domain (exclusive).
    pub max: f64,
}

impl Default for GeoIndexOptions {
    fn default() -> Self {
        Self {
            // 26 bits over lat/long is roughly one-foot resolution.
            bits: 26,
            min: -180.0,
            max: 180.0,
        }
    }
}

impl GeoIndexOptions {
    /// Validates the option combination.
    pub fn validate(&self) -> Result<()> {
        if self.bits < 1 || self.bits > 32 {
            return Err(MeridianError::InvalidIndexConfig(format!(
                "bits in geo index must be between 1 and 32, got {}",
                self.bits
            )));
        }
        if !(self.min < self.max) {
            return Err(MeridianError::InvalidIndexConfig(format!(
                "geo index domain is empty: [{}, {})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Options controlling a journal recovery run.
///
/// These replace process-global flags: the host constructs them from its
/// command line and passes them in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RecoveryOptions {
    /// Log every journal entry while replaying.
    pub dump_journal: bool,
    /// Parse and verify the journal without mutating data files.
    pub scan_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_options_defaults() {
        let opts = GeoIndexOptions::default();
        assert_eq!(opts.bits, 26);
        assert_eq!(opts.min, -180.0);
        assert_eq!(opts.max, 180.0);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_geo_options_bits_bounds() {
        let mut opts = GeoIndexOptions::default();
        opts.bits = 0;
        assert!(opts.validate().is_err());
        opts.bits = 33;
        assert!(opts.validate().is_err());
        opts.bits = 32;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_geo_options_empty_domain() {
        let opts = GeoIndexOptions {
            bits: 26,
            min: 10.0,
            max: 10.0,
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_recovery_options_defaults() {
        let opts = RecoveryOptions::default();
        assert!(!opts.dump_journal);
        assert!(!opts.scan_only);
    }

    #[test]
    fn test_geo_options_serde_roundtrip() {
        let original = GeoIndexOptions {
            bits: 20,
            min: 0.0,
            max: 1024.0,
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: GeoIndexOptions = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original.bits, deserialized.bits);
        assert_eq!(original.min, deserialized.min);
        assert_eq!(original.max, deserialized.max);
    }
}
