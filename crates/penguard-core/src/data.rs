//! Data ingestion pipeline.
//!
//! Notified values land in a bounded per-device raw buffer. A periodic job
//! takes the oldest unprocessed frames of each device in batches, decodes
//! them through a [`FrameDecoder`] and appends the readings to a bounded
//! per-device history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use penguard_types::{ProcessedReading, RawFrame};

use crate::buffer::RingBuffer;
use crate::error::Result;
use crate::events::{EventDispatcher, SystemEvent};

/// Turns a batch of raw frames into readings.
///
/// A decoder returns one reading per frame. Malformed frames should become
/// error readings; an `Err` rejects the whole batch.
pub trait FrameDecoder: Send + Sync {
    /// Decode a batch of frames, oldest first.
    fn decode(&self, frames: &[RawFrame]) -> Result<Vec<ProcessedReading>>;
}

/// Decoder for the detector's `Amp Sum: … | Top Freq: … Hz` summary lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryLineDecoder;

impl FrameDecoder for SummaryLineDecoder {
    fn decode(&self, frames: &[RawFrame]) -> Result<Vec<ProcessedReading>> {
        Ok(frames.iter().map(RawFrame::parse).collect())
    }
}

/// Selection of processed readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataQuery {
    /// Every stored reading.
    #[default]
    All,
    /// The newest `n` readings.
    Last(usize),
    /// Readings with `start <= timestamp <= end`.
    TimeRange {
        /// Inclusive lower bound.
        start: OffsetDateTime,
        /// Inclusive upper bound.
        end: OffsetDateTime,
    },
}

impl DataQuery {
    /// Build a query from optional filters. A time range wins over a count.
    pub fn from_filters(
        last: Option<usize>,
        range: Option<(OffsetDateTime, OffsetDateTime)>,
    ) -> Self {
        match (range, last) {
            (Some((start, end)), _) => DataQuery::TimeRange { start, end },
            (None, Some(n)) => DataQuery::Last(n),
            (None, None) => DataQuery::All,
        }
    }
}

/// Outcome of one processing tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingSummary {
    /// Devices whose batch decoded.
    pub devices: usize,
    /// Readings produced.
    pub readings: usize,
    /// Devices whose batch was rejected.
    pub failed: usize,
}

struct DeviceBuffers {
    raw: RingBuffer<RawFrame>,
    processed: RingBuffer<ProcessedReading>,
}

enum BatchOutcome {
    Decoded(Vec<ProcessedReading>),
    Failed { error: String, frames: Vec<RawFrame> },
}

impl DeviceBuffers {
    fn new(capacity: usize) -> Self {
        Self {
            raw: RingBuffer::new(capacity),
            processed: RingBuffer::new(capacity),
        }
    }

    fn pending(&self) -> usize {
        self.raw.iter().filter(|frame| !frame.processed).count()
    }

    /// Decode up to `max` oldest unprocessed frames and mark them processed,
    /// whether or not decoding succeeded.
    fn process_batch(&mut self, decoder: &dyn FrameDecoder, max: usize) -> Option<BatchOutcome> {
        let batch: Vec<RawFrame> = self
            .raw
            .iter()
            .filter(|frame| !frame.processed)
            .take(max)
            .cloned()
            .collect();
        if batch.is_empty() {
            return None;
        }

        let result = decoder.decode(&batch);

        for frame in self
            .raw
            .iter_mut()
            .filter(|frame| !frame.processed)
            .take(batch.len())
        {
            frame.processed = true;
        }

        Some(match result {
            Ok(readings) => {
                for reading in &readings {
                    self.processed.push(reading.clone());
                }
                BatchOutcome::Decoded(readings)
            }
            Err(e) => BatchOutcome::Failed {
                error: e.to_string(),
                frames: batch
                    .into_iter()
                    .map(|frame| RawFrame {
                        processed: true,
                        ..frame
                    })
                    .collect(),
            },
        })
    }
}

/// Buffers raw frames and turns them into readings.
pub struct DataManager {
    buffers: RwLock<HashMap<String, Arc<Mutex<DeviceBuffers>>>>,
    decoder: Arc<dyn FrameDecoder>,
    events: EventDispatcher,
    max_buffer_size: usize,
    max_batch_size: usize,
    processing_interval: Duration,
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("max_buffer_size", &self.max_buffer_size)
            .field("max_batch_size", &self.max_batch_size)
            .field("processing_interval", &self.processing_interval)
            .finish_non_exhaustive()
    }
}

impl DataManager {
    /// Create a manager using the summary line decoder.
    pub fn new(
        events: EventDispatcher,
        max_buffer_size: usize,
        max_batch_size: usize,
        processing_interval: Duration,
    ) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            decoder: Arc::new(SummaryLineDecoder),
            events,
            max_buffer_size,
            max_batch_size,
            processing_interval,
        }
    }

    /// Replace the frame decoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn FrameDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    async fn buffers_for(&self, address: &str) -> Arc<Mutex<DeviceBuffers>> {
        if let Some(buffers) = self.buffers.read().await.get(address) {
            return Arc::clone(buffers);
        }
        let mut all = self.buffers.write().await;
        Arc::clone(
            all.entry(address.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(DeviceBuffers::new(self.max_buffer_size)))),
        )
    }

    async fn existing(&self, address: &str) -> Option<Arc<Mutex<DeviceBuffers>>> {
        self.buffers.read().await.get(address).cloned()
    }

    /// Buffer a notified value for `address`.
    pub async fn add_data(&self, address: &str, data: Bytes) {
        let buffers = self.buffers_for(address).await;
        let frame = RawFrame::new(OffsetDateTime::now_utc(), data.clone());
        let timestamp = frame.timestamp;

        let evicted = buffers.lock().await.raw.push(frame);
        if evicted.is_some_and(|frame| !frame.processed) {
            debug!(address, "Raw buffer full, dropped an unprocessed frame");
        }

        self.events.send(SystemEvent::DataReceived {
            address: address.to_string(),
            data,
            timestamp,
        });
    }

    /// Run one processing pass over every device.
    pub async fn process_buffers(&self) -> ProcessingSummary {
        let devices: Vec<(String, Arc<Mutex<DeviceBuffers>>)> = self
            .buffers
            .read()
            .await
            .iter()
            .map(|(address, buffers)| (address.clone(), Arc::clone(buffers)))
            .collect();

        let mut summary = ProcessingSummary::default();
        for (address, buffers) in devices {
            let outcome = buffers
                .lock()
                .await
                .process_batch(self.decoder.as_ref(), self.max_batch_size);

            match outcome {
                None => {}
                Some(BatchOutcome::Decoded(readings)) => {
                    debug!(address = %address, count = readings.len(), "Processed batch");
                    summary.devices += 1;
                    summary.readings += readings.len();
                    self.events
                        .send(SystemEvent::DataProcessed { address, readings });
                }
                Some(BatchOutcome::Failed { error, frames }) => {
                    warn!(
                        address = %address,
                        frames = frames.len(),
                        "Batch decoding failed: {}", error
                    );
                    summary.failed += 1;
                    self.events.send(SystemEvent::ProcessingError {
                        address,
                        error,
                        frames,
                    });
                }
            }
        }
        summary
    }

    /// Spawn the periodic processing job.
    pub fn start_processing(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(manager.processing_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Data processing cancelled, shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.process_buffers().await;
                    }
                }
            }
        })
    }

    /// Processed readings of a device. Unknown addresses yield nothing.
    pub async fn get_device_data(&self, address: &str, query: DataQuery) -> Vec<ProcessedReading> {
        let Some(buffers) = self.existing(address).await else {
            return Vec::new();
        };
        let buffers = buffers.lock().await;
        let processed = &buffers.processed;

        match query {
            DataQuery::All => processed.to_vec(),
            DataQuery::Last(n) => processed.last(n).cloned().collect(),
            DataQuery::TimeRange { start, end } => processed
                .iter()
                .filter(|reading| reading.timestamp >= start && reading.timestamp <= end)
                .cloned()
                .collect(),
        }
    }

    /// Drop every buffer of a device. Returns whether anything was stored.
    pub async fn clear_device_data(&self, address: &str) -> bool {
        self.buffers.write().await.remove(address).is_some()
    }

    /// Raw frames of a device, oldest first.
    pub async fn raw_frames(&self, address: &str) -> Vec<RawFrame> {
        match self.existing(address).await {
            Some(buffers) => buffers.lock().await.raw.to_vec(),
            None => Vec::new(),
        }
    }

    /// Unprocessed frames of a device.
    pub async fn pending_count(&self, address: &str) -> usize {
        match self.existing(address).await {
            Some(buffers) => buffers.lock().await.pending(),
            None => 0,
        }
    }

    /// Addresses with buffered data, sorted.
    pub async fn tracked_devices(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.buffers.read().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}
