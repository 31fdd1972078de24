//! Chunked file transfer over direct channels.
//!
//! Sending reads the source incrementally, one chunk at a time, and fans
//! each chunk out to every live destination. Receiving reassembles purely
//! by chunk index, so chunks may arrive in any order; a missing index
//! stalls the transfer until its channel closes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use cyfr_shared::protocol::{ChannelMessage, FileChunk, FileInfo};
use cyfr_shared::{PeerId, ProtocolError, TransferId};

use crate::transport::{DirectChannel, TransportError};

/// Bytes reserved for the JSON framing of one `file-chunk` record.
const CHUNK_RECORD_OVERHEAD: usize = 256;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("No destination channel to send to")]
    NoDestinations,

    #[error("File of {size} bytes needs more than {max} chunks", max = u32::MAX)]
    TooLarge { size: u64 },

    #[error("Source ended after {read} of {expected} bytes")]
    ShortRead { expected: u64, read: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encode(#[from] ProtocolError),
}

// ---------------------------------------------------------------------------
// Chunk plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    chunk_size: usize,
}

impl ChunkPlan {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// The configured size, shrunk until one base64-encoded chunk record fits
    /// every channel's message limit.
    pub fn for_channels<'a>(
        configured: usize,
        channels: impl IntoIterator<Item = &'a Arc<dyn DirectChannel>>,
    ) -> Self {
        let limit = channels
            .into_iter()
            .map(|channel| channel.max_message_size())
            .min()
            .map(|max| max.saturating_sub(CHUNK_RECORD_OVERHEAD) / 4 * 3)
            .unwrap_or(configured);
        Self::new(configured.min(limit))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// `ceil(length / chunk_size)`.
    pub fn chunk_count(&self, length: u64) -> Result<u32, TransferError> {
        let count = length.div_ceil(self.chunk_size as u64);
        u32::try_from(count).map_err(|_| TransferError::TooLarge { size: length })
    }

    /// Length of chunk `index` for a file of `length` bytes.
    pub fn chunk_len(&self, length: u64, index: u32) -> usize {
        let start = u64::from(index) * self.chunk_size as u64;
        let remaining = length.saturating_sub(start);
        remaining.min(self.chunk_size as u64) as usize
    }
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub content_type: String,
}

impl FileMetadata {
    fn announcement(&self, id: &TransferId) -> ChannelMessage {
        ChannelMessage::FileInfo(FileInfo {
            file_id: id.clone(),
            file_name: self.name.clone(),
            file_size: self.size,
            file_type: self.content_type.clone(),
        })
    }
}

impl From<&FileInfo> for FileMetadata {
    fn from(info: &FileInfo) -> Self {
        Self {
            name: info.file_name.clone(),
            size: info.file_size,
            content_type: info.file_type.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub peer: PeerId,
    pub channel: Arc<dyn DirectChannel>,
}

/// Outcome of one outbound transfer across all its destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub transfer_id: TransferId,
    pub total_chunks: u32,
    pub delivered: Vec<PeerId>,
    pub failed: Vec<(PeerId, TransportError)>,
}

/// One file on its way to one or more peers, sharing a single id and a
/// single read of the source.
#[derive(Debug)]
pub struct OutboundTransfer {
    id: TransferId,
    metadata: FileMetadata,
    plan: ChunkPlan,
    destinations: Vec<Destination>,
    pacing: Duration,
}

impl OutboundTransfer {
    pub fn new(
        metadata: FileMetadata,
        destinations: Vec<Destination>,
        chunk_size: usize,
        pacing: Duration,
    ) -> Result<Self, TransferError> {
        if destinations.is_empty() {
            return Err(TransferError::NoDestinations);
        }
        let plan = ChunkPlan::for_channels(chunk_size, destinations.iter().map(|d| &d.channel));
        plan.chunk_count(metadata.size)?;
        Ok(Self {
            id: TransferId::new(),
            metadata,
            plan,
            destinations,
            pacing,
        })
    }

    pub fn id(&self) -> &TransferId {
        &self.id
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn plan(&self) -> ChunkPlan {
        self.plan
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.destinations.iter().map(|d| d.peer.clone()).collect()
    }

    /// Announce, then stream every chunk in index order. `on_progress` is
    /// called with `(chunks_sent, total_chunks)` after each chunk.
    pub async fn run<R, F>(self, mut reader: R, mut on_progress: F) -> Result<TransferReport, TransferError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(u32, u32) + Send,
    {
        let total_chunks = self.plan.chunk_count(self.metadata.size)?;
        let mut live = Vec::with_capacity(self.destinations.len());
        let mut failed = Vec::new();

        let announcement = self.metadata.announcement(&self.id).to_bytes()?;
        for destination in self.destinations {
            match destination.channel.send(announcement.clone()).await {
                Ok(()) => live.push(destination),
                Err(e) => {
                    warn!(transfer = %self.id, peer = %destination.peer, error = %e, "Announcement failed");
                    failed.push((destination.peer, e));
                }
            }
        }

        info!(
            transfer = %self.id,
            file = %self.metadata.name,
            size = self.metadata.size,
            chunks = total_chunks,
            destinations = live.len(),
            "Sending file"
        );

        let mut buf = vec![0u8; self.plan.chunk_size()];
        let mut read: u64 = 0;

        for index in 0..total_chunks {
            if live.is_empty() {
                break;
            }

            let len = self.plan.chunk_len(self.metadata.size, index);
            let chunk = &mut buf[..len];
            if let Err(e) = reader.read_exact(chunk).await {
                return Err(match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => TransferError::ShortRead {
                        expected: self.metadata.size,
                        read,
                    },
                    _ => TransferError::Io(e),
                });
            }
            read += len as u64;

            let record = ChannelMessage::FileChunk(FileChunk {
                file_id: self.id.clone(),
                chunk_index: index,
                total_chunks,
                data: chunk.to_vec(),
            })
            .to_bytes()?;

            let mut still_live = Vec::with_capacity(live.len());
            for destination in live {
                match destination.channel.send(record.clone()).await {
                    Ok(()) => still_live.push(destination),
                    Err(e) => {
                        warn!(
                            transfer = %self.id,
                            peer = %destination.peer,
                            chunk = index,
                            error = %e,
                            "Destination failed mid-transfer"
                        );
                        failed.push((destination.peer, e));
                    }
                }
            }
            live = still_live;

            on_progress(index + 1, total_chunks);

            if !self.pacing.is_zero() && index + 1 < total_chunks {
                tokio::time::sleep(self.pacing).await;
            }
        }

        let delivered: Vec<PeerId> = live.into_iter().map(|d| d.peer).collect();
        debug!(transfer = %self.id, delivered = delivered.len(), failed = failed.len(), "Transfer finished");

        Ok(TransferReport {
            transfer_id: self.id,
            total_chunks,
            delivered,
            failed,
        })
    }
}

// ---------------------------------------------------------------------------
// Receiving
// ---------------------------------------------------------------------------

/// A fully reassembled inbound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub from: PeerId,
    pub transfer_id: TransferId,
    pub metadata: FileMetadata,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Pending,
    /// Zero-length files complete on announcement.
    Complete(ReceivedFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Dropped,
    Progress { received: u32, total: u32 },
    Complete(ReceivedFile),
}

#[derive(Debug)]
struct PendingTransfer {
    metadata: FileMetadata,
    total_chunks: Option<u32>,
    chunks: BTreeMap<u32, Vec<u8>>,
}

/// A transfer that was abandoned before completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedTransfer {
    pub from: PeerId,
    pub transfer_id: TransferId,
    pub metadata: FileMetadata,
    pub received: u32,
}

/// Pending inbound transfers keyed by `(source peer, transfer id)`.
#[derive(Debug, Default)]
pub struct InboundTransfers {
    pending: HashMap<(PeerId, TransferId), PendingTransfer>,
}

impl InboundTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn on_announcement(&mut self, from: &PeerId, info: &FileInfo) -> AnnounceOutcome {
        let metadata = FileMetadata::from(info);

        if metadata.size == 0 {
            debug!(peer = %from, transfer = %info.file_id, "Empty file announced");
            return AnnounceOutcome::Complete(ReceivedFile {
                from: from.clone(),
                transfer_id: info.file_id.clone(),
                metadata,
                data: Vec::new(),
            });
        }

        let key = (from.clone(), info.file_id.clone());
        let previous = self.pending.insert(
            key,
            PendingTransfer {
                metadata,
                total_chunks: None,
                chunks: BTreeMap::new(),
            },
        );
        if previous.is_some() {
            warn!(peer = %from, transfer = %info.file_id, "Transfer re-announced, restarting it");
        }
        AnnounceOutcome::Pending
    }

    pub fn on_chunk(&mut self, from: &PeerId, chunk: FileChunk) -> ChunkOutcome {
        let key = (from.clone(), chunk.file_id.clone());
        let Some(pending) = self.pending.get_mut(&key) else {
            debug!(peer = %from, transfer = %chunk.file_id, "Chunk for unknown transfer dropped");
            return ChunkOutcome::Dropped;
        };

        if chunk.total_chunks == 0 || chunk.chunk_index >= chunk.total_chunks {
            warn!(
                peer = %from,
                transfer = %chunk.file_id,
                index = chunk.chunk_index,
                total = chunk.total_chunks,
                "Chunk index out of range, dropped"
            );
            return ChunkOutcome::Dropped;
        }

        match pending.total_chunks {
            Some(total) if total != chunk.total_chunks => {
                warn!(
                    peer = %from,
                    transfer = %chunk.file_id,
                    expected = total,
                    got = chunk.total_chunks,
                    "Chunk disagrees on total count, dropped"
                );
                return ChunkOutcome::Dropped;
            }
            Some(_) => {}
            None => pending.total_chunks = Some(chunk.total_chunks),
        }

        let total = chunk.total_chunks;
        pending.chunks.insert(chunk.chunk_index, chunk.data);
        let received = pending.chunks.len() as u32;

        if received < total {
            return ChunkOutcome::Progress { received, total };
        }

        let Some(done) = self.pending.remove(&key) else {
            return ChunkOutcome::Dropped;
        };
        let data: Vec<u8> = done.chunks.into_values().flatten().collect();
        if data.len() as u64 != done.metadata.size {
            warn!(
                peer = %from,
                transfer = %key.1,
                declared = done.metadata.size,
                actual = data.len(),
                "Received size differs from announcement"
            );
        }
        info!(peer = %from, transfer = %key.1, file = %done.metadata.name, "File received");

        ChunkOutcome::Complete(ReceivedFile {
            from: key.0,
            transfer_id: key.1,
            metadata: done.metadata,
            data,
        })
    }

    /// Fail and purge every pending transfer from `peer`.
    pub fn fail_from(&mut self, peer: &PeerId) -> Vec<AbandonedTransfer> {
        let keys: Vec<_> = self
            .pending
            .keys()
            .filter(|(from, _)| from == peer)
            .cloned()
            .collect();
        let mut abandoned: Vec<_> = keys
            .into_iter()
            .filter_map(|key| {
                let pending = self.pending.remove(&key)?;
                Some(AbandonedTransfer {
                    from: key.0,
                    transfer_id: key.1,
                    received: pending.chunks.len() as u32,
                    metadata: pending.metadata,
                })
            })
            .collect();
        abandoned.sort_by(|a, b| a.transfer_id.as_str().cmp(b.transfer_id.as_str()));
        abandoned
    }

    /// Fail and purge everything.
    pub fn fail_all(&mut self) -> Vec<AbandonedTransfer> {
        self.pending
            .drain()
            .map(|((from, transfer_id), pending)| AbandonedTransfer {
                from,
                transfer_id,
                received: pending.chunks.len() as u32,
                metadata: pending.metadata,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::negotiator::SessionId;
    use crate::transport::{PeerConnector, TransportEvent};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    fn info(id: &str, size: u64) -> FileInfo {
        FileInfo {
            file_id: TransferId::from(id),
            file_name: "notes.bin".into(),
            file_size: size,
            file_type: "application/octet-stream".into(),
        }
    }

    fn split(data: &[u8], chunk_size: usize, id: &str) -> Vec<FileChunk> {
        let plan = ChunkPlan::new(chunk_size);
        let total = plan.chunk_count(data.len() as u64).unwrap();
        data.chunks(chunk_size)
            .enumerate()
            .map(|(i, bytes)| FileChunk {
                file_id: TransferId::from(id),
                chunk_index: i as u32,
                total_chunks: total,
                data: bytes.to_vec(),
            })
            .collect()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_plan_for_40000_bytes() {
        let plan = ChunkPlan::new(16_384);
        assert_eq!(plan.chunk_count(40_000).unwrap(), 3);
        assert_eq!(plan.chunk_len(40_000, 0), 16_384);
        assert_eq!(plan.chunk_len(40_000, 1), 16_384);
        assert_eq!(plan.chunk_len(40_000, 2), 7_232);
        assert_eq!(plan.chunk_count(0).unwrap(), 0);
        assert_eq!(plan.chunk_count(16_384).unwrap(), 1);
        assert_eq!(plan.chunk_count(16_385).unwrap(), 2);
    }

    #[test]
    fn test_too_many_chunks_is_rejected() {
        let plan = ChunkPlan::new(1);
        assert!(matches!(
            plan.chunk_count(u64::from(u32::MAX) + 1),
            Err(TransferError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let data = sample(40_000);
        let chunks = split(&data, 16_384, "t1");
        let from = PeerId::from("sender");
        let mut inbound = InboundTransfers::new();
        assert_eq!(
            inbound.on_announcement(&from, &info("t1", 40_000)),
            AnnounceOutcome::Pending
        );

        assert_eq!(
            inbound.on_chunk(&from, chunks[2].clone()),
            ChunkOutcome::Progress { received: 1, total: 3 }
        );
        assert_eq!(
            inbound.on_chunk(&from, chunks[0].clone()),
            ChunkOutcome::Progress { received: 2, total: 3 }
        );
        match inbound.on_chunk(&from, chunks[1].clone()) {
            ChunkOutcome::Complete(file) => {
                assert_eq!(file.data, data);
                assert_eq!(file.metadata.name, "notes.bin");
                assert_eq!(file.from, from);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_duplicate_chunk_is_idempotent() {
        let data = sample(100);
        let chunks = split(&data, 40, "t");
        let from = PeerId::from("p");
        let mut inbound = InboundTransfers::new();
        inbound.on_announcement(&from, &info("t", 100));

        inbound.on_chunk(&from, chunks[0].clone());
        assert_eq!(
            inbound.on_chunk(&from, chunks[0].clone()),
            ChunkOutcome::Progress { received: 1, total: 3 }
        );
        inbound.on_chunk(&from, chunks[1].clone());
        match inbound.on_chunk(&from, chunks[2].clone()) {
            ChunkOutcome::Complete(file) => assert_eq!(file.data, data),
            other => panic!("expected completion, got {other:?}"),
        }
        // A late duplicate after completion refers to an unknown transfer.
        assert_eq!(inbound.on_chunk(&from, chunks[2].clone()), ChunkOutcome::Dropped);
    }

    #[test]
    fn test_invalid_chunks_are_dropped() {
        let from = PeerId::from("p");
        let mut inbound = InboundTransfers::new();
        let chunks = split(&sample(100), 40, "t");

        // Before the announcement.
        assert_eq!(inbound.on_chunk(&from, chunks[0].clone()), ChunkOutcome::Dropped);

        inbound.on_announcement(&from, &info("t", 100));
        inbound.on_chunk(&from, chunks[0].clone());

        let mut wrong_total = chunks[1].clone();
        wrong_total.total_chunks = 4;
        assert_eq!(inbound.on_chunk(&from, wrong_total), ChunkOutcome::Dropped);

        let mut out_of_range = chunks[1].clone();
        out_of_range.chunk_index = 3;
        assert_eq!(inbound.on_chunk(&from, out_of_range), ChunkOutcome::Dropped);

        // Same id from another peer is a different transfer.
        assert_eq!(
            inbound.on_chunk(&PeerId::from("other"), chunks[1].clone()),
            ChunkOutcome::Dropped
        );
        assert_eq!(inbound.len(), 1);
    }

    #[test]
    fn test_zero_length_file_completes_on_announcement() {
        let from = PeerId::from("p");
        let mut inbound = InboundTransfers::new();
        match inbound.on_announcement(&from, &info("empty", 0)) {
            AnnounceOutcome::Complete(file) => assert!(file.data.is_empty()),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_fail_from_purges_only_that_peer() {
        let mut inbound = InboundTransfers::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        inbound.on_announcement(&a, &info("t1", 10));
        inbound.on_announcement(&a, &info("t2", 10));
        inbound.on_announcement(&b, &info("t3", 10));

        let failed = inbound.fail_from(&a);
        let ids: Vec<_> = failed.iter().map(|f| f.transfer_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound.fail_all().len(), 1);
        assert!(inbound.is_empty());
    }

    proptest! {
        #[test]
        fn prop_reassembly_ignores_delivery_order(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            chunk_size in 1usize..600,
            seed in any::<u64>(),
        ) {
            let mut chunks = split(&data, chunk_size, "prop");
            chunks.shuffle(&mut StdRng::seed_from_u64(seed));

            let from = PeerId::from("p");
            let mut inbound = InboundTransfers::new();
            inbound.on_announcement(&from, &info("prop", data.len() as u64));

            let mut result = None;
            for chunk in chunks {
                if let ChunkOutcome::Complete(file) = inbound.on_chunk(&from, chunk) {
                    result = Some(file.data);
                }
            }
            prop_assert_eq!(result, Some(data));
        }
    }

    async fn channel_pair(
        network: &MemoryNetwork,
        remote: &str,
    ) -> (Arc<dyn DirectChannel>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx_local, mut rx_local) = mpsc::unbounded_channel();
        let (tx_remote, rx_remote) = mpsc::unbounded_channel();
        let local = network.connector(tx_local);
        let far = network.connector(tx_remote);
        let local_id = SessionId {
            local: PeerId::from("sender"),
            remote: PeerId::from(remote),
            generation: 1,
        };
        let remote_id = SessionId {
            local: PeerId::from(remote),
            remote: PeerId::from("sender"),
            generation: 1,
        };
        let offer = local.create_offer(&local_id).await.unwrap();
        let answer = far.accept_offer(&remote_id, &offer).await.unwrap();
        local.apply_answer(&local_id, &answer).await.unwrap();
        loop {
            if let Some(TransportEvent::Established { channel, .. }) = rx_local.recv().await {
                return (channel, rx_remote);
            }
        }
    }

    fn drain_records(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<ChannelMessage> {
        let mut records = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Message { data, .. } = event {
                records.push(ChannelMessage::from_slice(&data).unwrap());
            }
        }
        records
    }

    #[tokio::test]
    async fn test_send_announces_then_streams_in_order() {
        let network = MemoryNetwork::new();
        let (channel, mut rx) = channel_pair(&network, "receiver").await;
        let data = sample(40_000);

        let transfer = OutboundTransfer::new(
            FileMetadata {
                name: "big.bin".into(),
                size: data.len() as u64,
                content_type: "application/octet-stream".into(),
            },
            vec![Destination {
                peer: PeerId::from("receiver"),
                channel,
            }],
            16_384,
            Duration::ZERO,
        )
        .unwrap();

        let mut progress = Vec::new();
        let report = transfer
            .run(&data[..], |sent, total| progress.push((sent, total)))
            .await
            .unwrap();
        assert_eq!(report.total_chunks, 3);
        assert_eq!(report.delivered, vec![PeerId::from("receiver")]);
        assert!(report.failed.is_empty());
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);

        let records = drain_records(&mut rx);
        assert_eq!(records.len(), 4);
        assert!(matches!(&records[0], ChannelMessage::FileInfo(info) if info.file_size == 40_000));
        let sizes: Vec<_> = records[1..]
            .iter()
            .map(|r| match r {
                ChannelMessage::FileChunk(c) => (c.chunk_index, c.data.len()),
                other => panic!("unexpected record {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![(0, 16_384), (1, 16_384), (2, 7_232)]);
    }

    #[tokio::test]
    async fn test_one_failed_destination_does_not_stop_the_others() {
        let network = MemoryNetwork::new();
        let (good, mut good_rx) = channel_pair(&network, "good").await;
        let (bad, _bad_rx) = channel_pair(&network, "bad").await;
        bad.close().await;
        let data = sample(1000);

        let transfer = OutboundTransfer::new(
            FileMetadata {
                name: "f".into(),
                size: 1000,
                content_type: String::new(),
            },
            vec![
                Destination { peer: PeerId::from("bad"), channel: bad },
                Destination { peer: PeerId::from("good"), channel: good },
            ],
            300,
            Duration::ZERO,
        )
        .unwrap();

        let report = transfer.run(&data[..], |_, _| {}).await.unwrap();
        assert_eq!(report.delivered, vec![PeerId::from("good")]);
        assert_eq!(
            report.failed,
            vec![(PeerId::from("bad"), TransportError::ChannelClosed)]
        );
        assert_eq!(drain_records(&mut good_rx).len(), 1 + 4);
    }

    #[tokio::test]
    async fn test_short_read_aborts() {
        let network = MemoryNetwork::new();
        let (channel, _rx) = channel_pair(&network, "r").await;
        let transfer = OutboundTransfer::new(
            FileMetadata {
                name: "liar".into(),
                size: 500,
                content_type: String::new(),
            },
            vec![Destination { peer: PeerId::from("r"), channel }],
            128,
            Duration::ZERO,
        )
        .unwrap();

        let data = sample(200);
        let err = transfer.run(&data[..], |_, _| {}).await.unwrap_err();
        assert!(matches!(err, TransferError::ShortRead { expected: 500, read: 128 }));
    }

    #[tokio::test]
    async fn test_chunk_size_shrinks_to_channel_limit() {
        let network = MemoryNetwork::with_max_message_size(1256);
        let (channel, _rx) = channel_pair(&network, "r").await;
        let plan = ChunkPlan::for_channels(16_384, [&channel]);
        assert_eq!(plan.chunk_size(), 750);
        assert_eq!(ChunkPlan::for_channels(512, [&channel]).chunk_size(), 512);

        assert!(matches!(
            OutboundTransfer::new(
                FileMetadata { name: "x".into(), size: 1, content_type: String::new() },
                Vec::new(),
                16_384,
                Duration::ZERO,
            ),
            Err(TransferError::NoDestinations)
        ));
    }
}
