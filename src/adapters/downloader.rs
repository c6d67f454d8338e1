//! Host-Backed Downloader
//!
//! Implements the `Downloader` port by fetching sectors straight from the
//! hosts recorded in a file snapshot. For every segment touched by the
//! requested range it fetches `min + overdrive` sectors in parallel, falls
//! back to the remaining sectors if too few arrive, decrypts them, recovers
//! the segment and copies the overlap into the destination buffer.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, instrument};

use crate::domain::ports::{Downloader, FileSnapshot, HostId, HostSession, SectorLocation};
use crate::error::{Error, Result};
use crate::upload::download::{Download, DownloadParams};

/// Downloader reading from registered host sessions.
#[derive(Default)]
pub struct HostDownloader {
    hosts: Arc<DashMap<HostId, Arc<dyn HostSession>>>,
}

impl std::fmt::Debug for HostDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDownloader")
            .field("hosts", &self.hosts.len())
            .finish()
    }
}

impl HostDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a host's sectors reachable.
    pub fn register(&self, session: Arc<dyn HostSession>) {
        self.hosts.insert(session.host_id().clone(), session);
    }

    pub fn unregister(&self, host: &HostId) -> bool {
        self.hosts.remove(host).is_some()
    }
}

impl Downloader for HostDownloader {
    fn request_download(&self, params: DownloadParams) -> Result<Arc<Download>> {
        if params.length == 0 {
            return Err(Error::DownloadFailed("empty download range".to_string()));
        }
        if params.file.segment_size() == 0 {
            return Err(Error::DownloadFailed(format!(
                "{} has no segment geometry",
                params.file.path
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("no runtime for download: {}", e)))?;

        let download = Download::new(&params);
        let hosts = Arc::clone(&self.hosts);
        let handle = Arc::clone(&download);
        runtime.spawn(async move {
            let result = fetch_range(&hosts, &params).await;
            handle.complete(result.err());
        });
        Ok(download)
    }
}

#[instrument(skip_all, fields(path = %params.file.path, offset = params.offset, length = params.length))]
async fn fetch_range(
    hosts: &DashMap<HostId, Arc<dyn HostSession>>,
    params: &DownloadParams,
) -> Result<()> {
    let segment_size = params.file.segment_size();
    let end = params.offset + params.length;
    let first = params.offset / segment_size;
    let last = (end - 1) / segment_size;
    debug!(
        priority = params.priority,
        latency_target_ms = params.latency_target.as_millis() as u64,
        "download started"
    );

    for index in first..=last {
        let plaintext = fetch_segment(hosts, &params.file, index, params.overdrive).await?;
        let segment_start = index * segment_size;
        let from = params.offset.max(segment_start);
        let to = end.min(segment_start + segment_size);
        params.destination.write_at(
            (from - params.offset) as usize,
            &plaintext[(from - segment_start) as usize..(to - segment_start) as usize],
        );
    }
    Ok(())
}

async fn fetch_segment(
    hosts: &DashMap<HostId, Arc<dyn HostSession>>,
    file: &FileSnapshot,
    index: u64,
    overdrive: usize,
) -> Result<Vec<u8>> {
    let min_sectors = file.coder.min_sectors();
    let locations = file.sectors.get(index as usize).cloned().unwrap_or_default();
    let candidates: Vec<usize> = (0..file.coder.num_sectors())
        .filter(|i| locations.get(*i).is_some_and(|copies| !copies.is_empty()))
        .collect();
    if candidates.len() < min_sectors {
        return Err(Error::InsufficientShards {
            available: candidates.len(),
            required: min_sectors,
        });
    }

    let mut sectors: Vec<Option<Vec<u8>>> = vec![None; file.coder.num_sectors()];
    let (first_wave, rest) = candidates.split_at((min_sectors + overdrive).min(candidates.len()));
    for wave in [first_wave, rest] {
        let fetched = join_all(
            wave.iter()
                .map(|i| fetch_sector(hosts, file, &locations[*i])),
        )
        .await;
        for (i, sector) in wave.iter().zip(fetched) {
            sectors[*i] = sector;
        }
        if sectors.iter().filter(|s| s.is_some()).count() >= min_sectors {
            break;
        }
    }

    file.coder
        .recover(&mut sectors, file.segment_size() as usize)
}

/// First copy of a sector that can be fetched and opened.
async fn fetch_sector(
    hosts: &DashMap<HostId, Arc<dyn HostSession>>,
    file: &FileSnapshot,
    copies: &[SectorLocation],
) -> Option<Vec<u8>> {
    for copy in copies {
        let Some(session) = hosts.get(&copy.host).map(|s| Arc::clone(s.value())) else {
            continue;
        };
        match session.download_sector(&copy.root).await {
            Ok(sealed) => match file.cipher.decrypt(&sealed) {
                Ok(sector) => return Some(sector),
                Err(e) => debug!(host = %copy.host, error = %e, "sector failed to open"),
            },
            Err(e) => debug!(host = %copy.host, error = %e, "sector fetch failed"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ChaChaCipher, MemoryHost, ReedSolomonCoder};
    use crate::domain::ports::{Cipher, ErasureCoder, FileId, StoragePath};
    use crate::upload::download::DownloadBuffer;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::time::Duration;

    /// Encode, seal and store one segment; returns its snapshot row.
    async fn store_segment(
        hosts: &[Arc<MemoryHost>],
        coder: &ReedSolomonCoder,
        cipher: &ChaChaCipher,
        data: &[u8],
    ) -> Vec<Vec<SectorLocation>> {
        let mut row = Vec::new();
        for (i, sector) in coder.encode(data).unwrap().into_iter().enumerate() {
            let host = &hosts[i % hosts.len()];
            let sealed = cipher.encrypt(&sector).unwrap();
            let root = host.upload_sector(Bytes::from(sealed)).await.unwrap();
            row.push(vec![SectorLocation {
                host: host.host_id().clone(),
                root,
            }]);
        }
        row
    }

    fn params(file: FileSnapshot, offset: u64, length: u64) -> DownloadParams {
        DownloadParams {
            destination: DownloadBuffer::new(length as usize),
            file,
            offset,
            length,
            priority: 0,
            latency_target: Duration::from_millis(200),
            overdrive: 0,
            needs_memory: false,
        }
    }

    async fn setup() -> (HostDownloader, Vec<Arc<MemoryHost>>, FileSnapshot, Vec<u8>) {
        let coder = ReedSolomonCoder::new(2, 4).unwrap();
        let cipher = ChaChaCipher::new(&[5u8; 32]);
        let hosts: Vec<_> = (0..4).map(|i| MemoryHost::new(&format!("h{i}"))).collect();
        let downloader = HostDownloader::new();
        for host in &hosts {
            downloader.register(host.clone());
        }

        // Two segments of 32 bytes each
        let plaintext: Vec<u8> = (0..64u8).collect();
        let rows = vec![
            store_segment(&hosts, &coder, &cipher, &plaintext[..32]).await,
            store_segment(&hosts, &coder, &cipher, &plaintext[32..]).await,
        ];
        let file = FileSnapshot {
            id: FileId::new(),
            path: StoragePath::new("dl/file"),
            file_size: 64,
            sector_size: 16,
            coder: Arc::new(coder),
            cipher: Arc::new(cipher),
            sectors: rows,
        };
        (downloader, hosts, file, plaintext)
    }

    #[tokio::test]
    async fn test_download_range_across_segments() {
        let (downloader, _hosts, file, plaintext) = setup().await;
        let p = params(file, 20, 30);
        let buffer = p.destination.clone();

        let download = downloader.request_download(p).unwrap();
        download.wait().await;

        assert!(download.err().is_none());
        assert_eq!(buffer.take(), plaintext[20..50].to_vec());
    }

    #[tokio::test]
    async fn test_download_survives_lost_hosts() {
        let (downloader, hosts, file, plaintext) = setup().await;
        hosts[0].set_offline(true);
        downloader.unregister(hosts[1].host_id());

        let p = params(file, 0, 64);
        let buffer = p.destination.clone();
        let download = downloader.request_download(p).unwrap();
        download.wait().await;

        assert!(download.err().is_none());
        assert_eq!(buffer.take(), plaintext);
    }

    #[tokio::test]
    async fn test_download_fails_below_min_sectors() {
        let (downloader, hosts, file, _) = setup().await;
        for host in &hosts[..3] {
            host.set_offline(true);
        }

        let download = downloader.request_download(params(file, 0, 16)).unwrap();
        download.wait().await;
        assert_matches!(download.err(), Some(Error::DownloadFailed(_)));
    }

    #[test]
    fn test_request_needs_runtime() {
        let coder = ReedSolomonCoder::new(2, 4).unwrap();
        let file = FileSnapshot {
            id: FileId::new(),
            path: StoragePath::new("x"),
            file_size: 16,
            sector_size: 8,
            coder: Arc::new(coder),
            cipher: Arc::new(ChaChaCipher::generate()),
            sectors: vec![],
        };
        assert_matches!(
            HostDownloader::new().request_download(params(file, 0, 16)),
            Err(Error::Internal(_))
        );
    }
}
