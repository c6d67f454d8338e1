//! Segment lifecycle
//!
//! Drives one segment from claimed to dispatched: fetch the plaintext
//! (local copy first, repair download otherwise), erasure code it, seal
//! every sector that still needs uploading and hand the segment to the
//! dispatcher. Cleanup runs at the end whatever happened.
//!
//! # Memory
//!
//! A segment enters with `sector_size * (min + total)` bytes granted:
//!
//! - `sector_size * min` covers the plaintext and is returned once encoding
//!   is done (or the attempt aborts)
//! - `sector_size` per slot is returned when that slot is uploaded,
//!   trimmed, fails to encrypt, or was already stored before the attempt

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::upload::download::{DownloadBuffer, DownloadParams};
use crate::upload::segment::{needs_download, SegmentPhase, UnfinishedSegment};
use crate::upload::UploadContext;

/// Repair downloads are never urgent.
const REPAIR_LATENCY_TARGET: Duration = Duration::from_millis(200);

impl UploadContext {
    /// Run the full lifecycle of a claimed segment whose memory has been
    /// granted.
    #[instrument(skip_all, fields(segment = %segment.id))]
    pub async fn retrieve_and_dispatch_segment(&self, segment: &Arc<UnfinishedSegment>) {
        if let Err(e) = self.prepare_segment(segment).await {
            warn!(error = %e, "segment attempt aborted");
        }
        self.cleanup_segment(segment).await;
    }

    async fn prepare_segment(&self, segment: &Arc<UnfinishedSegment>) -> Result<()> {
        let erasure_coding_memory = segment.erasure_coding_memory();
        let completed_memory = {
            let state = segment.lock();
            state.sector_slots.iter().filter(|claimed| **claimed).count() as u64
                * segment.sector_size
        };

        segment
            .lock()
            .transition(&segment.id, SegmentPhase::RetrievingData);
        if let Err(e) = self.retrieve_logical_data(segment).await {
            self.abort_segment(segment, erasure_coding_memory + completed_memory);
            return Err(e);
        }

        segment.lock().transition(&segment.id, SegmentPhase::Encoding);
        let logical = segment.lock().logical_data.take();
        let encoded = match logical {
            Some(data) => segment.file.erasure_coder().encode(&data),
            None => Err(Error::Internal("logical data missing after retrieval".to_string())),
        };
        let sectors = match encoded {
            Ok(sectors) => sectors,
            Err(e) => {
                self.abort_segment(segment, erasure_coding_memory + completed_memory);
                return Err(e);
            }
        };
        segment.lock().memory_released += erasure_coding_memory;
        self.memory.return_memory(erasure_coding_memory);

        segment.lock().transition(&segment.id, SegmentPhase::Encrypting);
        self.encrypt_sectors(segment, sectors);

        segment.lock().memory_released += completed_memory;
        self.memory.return_memory(completed_memory);

        self.dispatch_segment(segment);
        Ok(())
    }

    /// Seal every sector whose slot is still free. A sector that fails to
    /// seal is never sent: its slot is claimed and its memory returned.
    /// The slot stays empty for this attempt; the segment comes back as stuck.
    fn encrypt_sectors(&self, segment: &Arc<UnfinishedSegment>, sectors: Vec<Vec<u8>>) {
        let cipher = segment.file.cipher();
        let claimed = segment.lock().sector_slots.clone();

        let sealed: Vec<Option<Result<Bytes>>> = sectors
            .iter()
            .zip(&claimed)
            .map(|(sector, claimed)| {
                if *claimed {
                    None
                } else {
                    Some(cipher.encrypt(sector).map(Bytes::from))
                }
            })
            .collect();
        drop(sectors);

        let mut failed = 0u64;
        {
            let mut state = segment.lock();
            for (i, result) in sealed.into_iter().enumerate() {
                match result {
                    Some(Ok(data)) => state.physical_data[i] = Some(data),
                    Some(Err(e)) => {
                        warn!(segment = %segment.id, sector = i, error = %e, "sector encryption failed, not sending it");
                        state.physical_data[i] = None;
                        state.sector_slots[i] = true;
                        state.memory_released += segment.sector_size;
                        failed += 1;
                    }
                    None => state.physical_data[i] = None,
                }
            }
        }

        if failed > 0 {
            for _ in 0..failed {
                self.metrics.encryption_failure();
            }
            self.memory.return_memory(failed * segment.sector_size);
        }
    }

    /// Give up the attempt: return the memory not tied to a slot and let
    /// cleanup trim the rest.
    fn abort_segment(&self, segment: &Arc<UnfinishedSegment>, memory: u64) {
        {
            let mut state = segment.lock();
            state.workers_remaining = 0;
            state.memory_released += memory;
            state.logical_data = None;
        }
        self.memory.return_memory(memory);
        self.metrics.segment_aborted();
    }

    /// Fill `logical_data` with the segment's plaintext, padded to the
    /// segment length.
    pub async fn retrieve_logical_data(&self, segment: &Arc<UnfinishedSegment>) -> Result<()> {
        let completed = segment.completed();
        let download = needs_download(
            completed,
            segment.min_sectors,
            segment.total_sectors,
            self.config.repair_download_threshold,
        );

        let mut data = match segment.file.local_path() {
            None if download => self.download_logical_data(segment).await?,
            None => {
                return Err(Error::FileNotAvailableLocally {
                    path: segment.file.path().to_string(),
                })
            }
            Some(path) => match read_local_range(&path, segment.offset, segment.length).await {
                Ok(data) => {
                    self.metrics.disk_retrieval();
                    debug!(segment = %segment.id, bytes = data.len(), "read segment from disk");
                    data
                }
                Err(e) if download => {
                    debug!(segment = %segment.id, error = %e, "local read failed, downloading");
                    self.download_logical_data(segment).await?
                }
                Err(e) => return Err(e),
            },
        };

        data.resize(segment.length as usize, 0);
        segment.lock().logical_data = Some(data);
        Ok(())
    }

    /// Rebuild the segment's plaintext from the sectors already on hosts.
    pub async fn download_logical_data(&self, segment: &Arc<UnfinishedSegment>) -> Result<Vec<u8>> {
        let file = &segment.file;
        let file_size = file.file_size();
        let mut length = segment.length;
        if segment.id.index + 1 == file.num_segments() && file_size % segment.length != 0 {
            length = file_size % segment.length;
        }

        let buffer = DownloadBuffer::new(segment.length as usize);
        let download = self.downloader.request_download(DownloadParams {
            destination: buffer.clone(),
            file: file.snapshot(),
            offset: segment.offset,
            length,
            priority: 0,
            latency_target: REPAIR_LATENCY_TARGET,
            overdrive: 0,
            needs_memory: false,
        })?;

        let entry = Arc::clone(file);
        download.on_complete(move |_| entry.set_access_time(Utc::now()));

        tokio::select! {
            _ = download.wait() => {}
            _ = self.tasks.stop_token().cancelled() => {
                return Err(Error::Interrupted("repair download interrupted by stop call".to_string()));
            }
        }
        if let Some(e) = download.err() {
            return Err(e);
        }

        self.metrics.network_retrieval();
        info!(segment = %segment.id, bytes = length, "segment rebuilt from hosts");
        Ok(buffer.take())
    }
}

/// Read up to `length` bytes at `offset`. A short read at end of file is
/// not an error.
async fn read_local_range(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    let failed = |e: std::io::Error| Error::LocalReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    let mut file = tokio::fs::File::open(path).await.map_err(failed)?;
    file.seek(SeekFrom::Start(offset)).await.map_err(failed)?;
    let mut data = Vec::with_capacity(length as usize);
    file.take(length)
        .read_to_end(&mut data)
        .await
        .map_err(failed)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_read_local_range_handles_eof() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let data = read_local_range(file.path(), 4, 4).await.unwrap();
        assert_eq!(data, b"4567");

        let tail = read_local_range(file.path(), 8, 100).await.unwrap();
        assert_eq!(tail, b"89");
    }

    #[tokio::test]
    async fn test_read_local_range_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_local_range(&dir.path().join("gone"), 0, 4).await;
        assert!(matches!(result, Err(Error::LocalReadFailed { .. })));
    }
}
