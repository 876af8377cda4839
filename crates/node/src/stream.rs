//! Cuts a byte stream into fixed-size segments delivered over a bounded channel.

use crate::error::{SpError, SpResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use strata_protocol::{ObjectId, RedundancyType};
use tokio::sync::mpsc;

pub const STREAM_CHANNEL_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEntry {
    pub object_id: ObjectId,
    pub replica_idx: i32,
    pub segment_idx: u32,
    pub redundancy_type: RedundancyType,
    pub data: Vec<u8>,
    /// Set on the last entry of a stream that ended cleanly.
    pub eof: bool,
    pub error: Option<SpError>,
}

#[derive(Debug, Clone, Copy)]
struct StreamMeta {
    object_id: ObjectId,
    replica_idx: i32,
    segment_size: usize,
    redundancy_type: RedundancyType,
}

struct Writer {
    buf: Vec<u8>,
    next_segment: u32,
    tx: Option<mpsc::Sender<PayloadEntry>>,
}

pub struct PayloadStream {
    init: AtomicBool,
    closed: AtomicBool,
    meta: OnceLock<StreamMeta>,
    writer: tokio::sync::Mutex<Writer>,
    rx: Mutex<Option<mpsc::Receiver<PayloadEntry>>>,
}

impl Default for PayloadStream {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadStream {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        Self {
            init: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            meta: OnceLock::new(),
            writer: tokio::sync::Mutex::new(Writer {
                buf: Vec::new(),
                next_segment: 0,
                tx: Some(tx),
            }),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Binds the stream to an object. Only the first call succeeds.
    pub fn init(
        &self,
        object_id: ObjectId,
        replica_idx: i32,
        segment_size: u64,
        redundancy_type: RedundancyType,
    ) -> SpResult<()> {
        if segment_size == 0 {
            return Err(SpError::InvalidParameters("segment size is zero".into()));
        }
        let segment_size = usize::try_from(segment_size)
            .map_err(|_| SpError::InvalidParameters(format!("segment size {segment_size}")))?;
        if self.init.swap(true, Ordering::AcqRel) {
            return Err(SpError::Stream("stream already initialized".into()));
        }
        let _ = self.meta.set(StreamMeta {
            object_id,
            replica_idx,
            segment_size,
            redundancy_type,
        });
        Ok(())
    }

    /// Receiving half; available once.
    pub fn entries(&self) -> Option<mpsc::Receiver<PayloadEntry>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn meta(&self) -> SpResult<StreamMeta> {
        if !self.init.load(Ordering::Acquire) {
            return Err(SpError::Stream("stream is not initialized".into()));
        }
        self.meta
            .get()
            .copied()
            .ok_or_else(|| SpError::Stream("stream is not initialized".into()))
    }

    fn entry(meta: &StreamMeta, segment_idx: u32, data: Vec<u8>) -> PayloadEntry {
        PayloadEntry {
            object_id: meta.object_id,
            replica_idx: meta.replica_idx,
            segment_idx,
            redundancy_type: meta.redundancy_type,
            data,
            eof: false,
            error: None,
        }
    }

    async fn send(tx: &mpsc::Sender<PayloadEntry>, entry: PayloadEntry) -> SpResult<()> {
        tx.send(entry)
            .await
            .map_err(|_| SpError::Stream("stream reader is gone".into()))
    }

    pub async fn write(&self, data: &[u8]) -> SpResult<usize> {
        let meta = self.meta()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(SpError::Stream("stream is closed".into()));
        }
        let mut w = self.writer.lock().await;
        let tx = w
            .tx
            .clone()
            .ok_or_else(|| SpError::Stream("stream is closed".into()))?;
        w.buf.extend_from_slice(data);
        while w.buf.len() >= meta.segment_size {
            let rest = w.buf.split_off(meta.segment_size);
            let segment = std::mem::replace(&mut w.buf, rest);
            let idx = w.next_segment;
            w.next_segment += 1;
            Self::send(&tx, Self::entry(&meta, idx, segment)).await?;
        }
        Ok(data.len())
    }

    /// Flushes the partial last segment and ends the stream with an EOF entry.
    pub async fn close(&self) -> SpResult<()> {
        let meta = self.meta()?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut w = self.writer.lock().await;
        let Some(tx) = w.tx.take() else {
            return Ok(());
        };
        if !w.buf.is_empty() {
            let segment = std::mem::take(&mut w.buf);
            let idx = w.next_segment;
            w.next_segment += 1;
            Self::send(&tx, Self::entry(&meta, idx, segment)).await?;
        }
        let mut end = Self::entry(&meta, w.next_segment, Vec::new());
        end.eof = true;
        Self::send(&tx, end).await
    }

    /// Ends the stream with one error entry; buffered data is dropped.
    pub async fn close_with_error(&self, err: SpError) -> SpResult<()> {
        let meta = self.meta()?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut w = self.writer.lock().await;
        let Some(tx) = w.tx.take() else {
            return Ok(());
        };
        w.buf.clear();
        let mut end = Self::entry(&meta, w.next_segment, Vec::new());
        end.error = Some(err);
        Self::send(&tx, end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<PayloadEntry>) -> Vec<PayloadEntry> {
        let mut out = Vec::new();
        while let Some(entry) = rx.recv().await {
            out.push(entry);
        }
        out
    }

    #[tokio::test]
    async fn segments_then_eof() {
        let stream = PayloadStream::new();
        stream
            .init(ObjectId::from(7), -1, 4, RedundancyType::Replica)
            .expect("init");
        let rx = stream.entries().expect("receiver");
        let reader = tokio::spawn(drain(rx));

        let payload: Vec<u8> = (0u8..10).collect();
        stream.write(&payload[..3]).await.expect("write");
        stream.write(&payload[3..]).await.expect("write");
        stream.close().await.expect("close");

        let entries = reader.await.expect("join");
        assert_eq!(entries.len(), 4);
        let data: Vec<u8> = entries.iter().flat_map(|e| e.data.clone()).collect();
        assert_eq!(data, payload);
        for (i, e) in entries[..3].iter().enumerate() {
            assert_eq!(e.segment_idx, i as u32);
            assert!(!e.eof);
        }
        assert_eq!(entries[2].data.len(), 2);
        assert!(entries[3].eof && entries[3].data.is_empty());
    }

    #[tokio::test]
    async fn exact_multiple_has_no_empty_data_entry() {
        let stream = PayloadStream::new();
        stream
            .init(ObjectId::from(1), 0, 5, RedundancyType::ErasureCode)
            .expect("init");
        let rx = stream.entries().expect("receiver");
        let reader = tokio::spawn(drain(rx));
        stream.write(&[9; 10]).await.expect("write");
        stream.close().await.expect("close");
        let entries = reader.await.expect("join");
        assert_eq!(entries.len(), 3);
        assert!(entries[2].eof);
    }

    #[tokio::test]
    async fn error_close_yields_one_error_entry() {
        let stream = PayloadStream::new();
        stream
            .init(ObjectId::from(1), 0, 5, RedundancyType::ErasureCode)
            .expect("init");
        let rx = stream.entries().expect("receiver");
        let reader = tokio::spawn(drain(rx));
        stream.write(&[1, 2]).await.expect("write");
        stream
            .close_with_error(SpError::Stream("boom".into()))
            .await
            .expect("close");
        let entries = reader.await.expect("join");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error, Some(SpError::Stream("boom".into())));
        assert!(stream.write(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn close_reports_a_vanished_reader() {
        let stream = PayloadStream::new();
        stream
            .init(ObjectId::from(3), 1, 8, RedundancyType::ErasureCode)
            .expect("init");
        drop(stream.entries().expect("receiver"));
        stream.write(&[1, 2, 3]).await.expect("buffered write");
        assert!(matches!(stream.close().await, Err(SpError::Stream(_))));

        let failed = PayloadStream::new();
        failed
            .init(ObjectId::from(3), 2, 8, RedundancyType::ErasureCode)
            .expect("init");
        drop(failed.entries().expect("receiver"));
        assert!(failed
            .close_with_error(SpError::Stream("encode".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn misuse_is_rejected() {
        let stream = PayloadStream::new();
        assert!(stream.write(&[1]).await.is_err());
        assert!(stream
            .init(ObjectId::from(1), 0, 0, RedundancyType::Replica)
            .is_err());
        stream
            .init(ObjectId::from(1), 0, 4, RedundancyType::Replica)
            .expect("init");
        assert!(stream
            .init(ObjectId::from(1), 0, 4, RedundancyType::Replica)
            .is_err());
        assert!(stream.entries().is_some());
        assert!(stream.entries().is_none());
    }
}
