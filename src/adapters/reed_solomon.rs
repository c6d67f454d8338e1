//! Reed-Solomon Erasure Coder
//!
//! Implements the `ErasureCoder` port using the `reed-solomon-erasure` crate.
//! A segment is split into `min_sectors` data sectors and extended with
//! parity sectors up to `num_sectors`.

use std::sync::Arc;

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, instrument};

use crate::domain::ports::ErasureCoder;
use crate::error::{Error, Result};

/// Reed-Solomon erasure coder over GF(2^8).
#[derive(Clone)]
pub struct ReedSolomonCoder {
    rs: Arc<ReedSolomon>,
    min_sectors: usize,
    num_sectors: usize,
}

impl std::fmt::Debug for ReedSolomonCoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReedSolomonCoder")
            .field("min_sectors", &self.min_sectors)
            .field("num_sectors", &self.num_sectors)
            .finish()
    }
}

impl ReedSolomonCoder {
    /// Create a coder producing `num_sectors` sectors, any `min_sectors` of
    /// which recover the segment.
    pub fn new(min_sectors: usize, num_sectors: usize) -> Result<Self> {
        if min_sectors == 0 {
            return Err(Error::InvalidEcConfig(
                "min_sectors must be greater than 0".to_string(),
            ));
        }
        if num_sectors <= min_sectors {
            return Err(Error::InvalidEcConfig(format!(
                "num_sectors ({}) must exceed min_sectors ({})",
                num_sectors, min_sectors
            )));
        }

        let rs = ReedSolomon::new(min_sectors, num_sectors - min_sectors).map_err(|e| {
            Error::InvalidEcConfig(format!("Failed to create Reed-Solomon codec: {}", e))
        })?;

        Ok(Self {
            rs: Arc::new(rs),
            min_sectors,
            num_sectors,
        })
    }

    /// Standard 4-of-6 layout.
    pub fn standard_4_6() -> Result<Self> {
        Self::new(4, 6)
    }

    /// Ratio of stored bytes to user bytes.
    pub fn overhead(&self) -> f64 {
        self.num_sectors as f64 / self.min_sectors as f64
    }
}

impl ErasureCoder for ReedSolomonCoder {
    fn min_sectors(&self) -> usize {
        self.min_sectors
    }

    fn num_sectors(&self) -> usize {
        self.num_sectors
    }

    #[instrument(skip(self, data), fields(data_len = data.len()))]
    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Err(Error::EcEncodingFailed(
                "cannot encode an empty segment".to_string(),
            ));
        }

        let sector_len = data.len().div_ceil(self.min_sectors);
        let mut sectors: Vec<Vec<u8>> = Vec::with_capacity(self.num_sectors);

        for chunk in data.chunks(sector_len) {
            let mut sector = chunk.to_vec();
            sector.resize(sector_len, 0);
            sectors.push(sector);
        }
        // Short input can leave trailing data sectors entirely empty
        while sectors.len() < self.num_sectors {
            sectors.push(vec![0u8; sector_len]);
        }

        self.rs
            .encode(&mut sectors)
            .map_err(|e| Error::EcEncodingFailed(format!("Reed-Solomon encoding failed: {}", e)))?;

        debug!(
            "Encoded {} bytes into {} sectors of {} bytes",
            data.len(),
            self.num_sectors,
            sector_len
        );

        Ok(sectors)
    }

    #[instrument(skip(self, sectors))]
    fn recover(&self, sectors: &mut [Option<Vec<u8>>], out_len: usize) -> Result<Vec<u8>> {
        if sectors.len() != self.num_sectors {
            return Err(Error::InvalidEcConfig(format!(
                "Expected {} sectors, got {}",
                self.num_sectors,
                sectors.len()
            )));
        }

        let available = sectors.iter().filter(|s| s.is_some()).count();
        if available < self.min_sectors {
            return Err(Error::InsufficientShards {
                available,
                required: self.min_sectors,
            });
        }

        self.rs
            .reconstruct_data(sectors)
            .map_err(|e| Error::EcReconstructionFailed(e.to_string()))?;

        let mut data = Vec::with_capacity(out_len);
        for sector in sectors.iter().take(self.min_sectors).flatten() {
            data.extend_from_slice(sector);
        }
        if data.len() < out_len {
            return Err(Error::EcReconstructionFailed(format!(
                "recovered {} bytes, {} requested",
                data.len(),
                out_len
            )));
        }
        data.truncate(out_len);

        Ok(data)
    }
}
