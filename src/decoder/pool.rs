//! Decoder worker pool with high/low water back-pressure

use super::{DecodeContext, Decoded, Encoding, decode};
use crate::cache::{ArticleCache, Saved};
use crate::error::DecodeError;
use crate::types::{ArticleId, ServerId};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One fetched body waiting to be decoded
#[derive(Debug)]
pub struct DecodeJob {
    /// Article address
    pub id: ArticleId,
    /// Server that delivered the body
    pub server: ServerId,
    /// Article body as the NNTP client returned it
    pub raw: Vec<u8>,
    /// Decode context
    pub ctx: DecodeContext,
    /// Spill to disk regardless of cache room (file identity not yet checked)
    pub force_disk: bool,
}

/// What the decoder learned, without the payload (which went to the cache)
#[derive(Clone, Debug, Default)]
pub struct DecodedMeta {
    /// File name carried by the framing
    pub filename: Option<String>,
    /// Whole-file size declared by the framing
    pub file_size: Option<u64>,
    /// Offset in the target file
    pub data_begin: Option<u64>,
    /// Decoded byte count
    pub data_size: u64,
    /// CRC32 of the decoded bytes
    pub crc: u32,
    /// 16K-signature
    pub signature: Option<[u8; 16]>,
    /// Encoding used
    pub encoding: Option<Encoding>,
}

impl From<&Decoded> for DecodedMeta {
    fn from(d: &Decoded) -> Self {
        Self {
            filename: d.filename.clone(),
            file_size: d.file_size,
            data_begin: d.data_begin,
            data_size: d.data_size,
            crc: d.crc,
            signature: d.signature,
            encoding: d.encoding,
        }
    }
}

/// Result of one decode, posted back to the scheduling loop
#[derive(Debug)]
pub enum DecodeOutcome {
    /// Payload is in the cache
    Ready {
        /// Article address
        id: ArticleId,
        /// Server that delivered it
        server: ServerId,
        /// Framing details
        meta: DecodedMeta,
        /// Declared vs computed CRC when they disagree (bytes were saved anyway)
        crc_mismatch: Option<(Option<u32>, u32)>,
    },
    /// Pre-check header block confirmed the article exists
    Checked {
        /// Article address
        id: ArticleId,
        /// Server that answered
        server: ServerId,
    },
    /// Nothing usable came out
    Failed {
        /// Article address
        id: ArticleId,
        /// Server that delivered the body
        server: ServerId,
        /// Why
        error: DecodeError,
    },
    /// The payload could not be stored
    SaveFailed {
        /// Article address
        id: ArticleId,
        /// Server that delivered it
        server: ServerId,
        /// Storage error
        error: std::io::Error,
    },
    /// The job was deleted; the payload was discarded at the save step
    Dropped {
        /// Article address
        id: ArticleId,
    },
}

struct Pressure {
    depth: AtomicUsize,
    high: usize,
    low: usize,
    delayed: watch::Sender<bool>,
}

impl Pressure {
    fn push(&self) {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > self.high {
            self.delayed.send_if_modified(|d| !std::mem::replace(d, true));
        }
    }

    fn pop(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if depth < self.low {
            self.delayed.send_if_modified(|d| std::mem::replace(d, false));
        }
    }
}

/// Fixed pool of interchangeable decode workers
pub struct DecoderPool {
    tx: mpsc::Sender<DecodeJob>,
    pressure: Arc<Pressure>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl DecoderPool {
    /// Spawn `workers` decode tasks. Outcomes go to `outcomes`.
    pub fn start(
        workers: usize,
        high_water: usize,
        low_water: usize,
        cache: Arc<ArticleCache>,
        outcomes: mpsc::UnboundedSender<DecodeOutcome>,
    ) -> Self {
        // Capacity covers the high-water mark plus bodies still in flight.
        let (tx, rx) = mpsc::channel(high_water.saturating_mul(4).max(64));
        let rx = Arc::new(Mutex::new(rx));
        let (delayed, _) = watch::channel(false);
        let pressure = Arc::new(Pressure {
            depth: AtomicUsize::new(0),
            high: high_water,
            low: low_water,
            delayed,
        });
        let cancel = CancellationToken::new();

        let handles = (0..workers.max(2))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let cache = Arc::clone(&cache);
                let outcomes = outcomes.clone();
                let pressure = Arc::clone(&pressure);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                _ = cancel.cancelled() => None,
                                job = rx.recv() => job,
                            }
                        };
                        let Some(job) = job else { break };
                        pressure.pop();
                        let outcome = process(job, &cache).await;
                        if outcomes.send(outcome).is_err() {
                            break;
                        }
                    }
                    tracing::debug!(worker, "decoder worker stopped");
                })
            })
            .collect();

        Self {
            tx,
            pressure,
            workers: std::sync::Mutex::new(handles),
            cancel,
        }
    }

    /// Queue a body for decoding
    pub async fn submit(&self, job: DecodeJob) -> Result<(), DecodeJob> {
        self.pressure.push();
        match self.tx.send(job).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(job)) => {
                self.pressure.pop();
                Err(job)
            }
        }
    }

    /// Bodies waiting for a worker
    pub fn queue_len(&self) -> usize {
        self.pressure.depth.load(Ordering::SeqCst)
    }

    /// Back-pressure signal: `true` while the queue is above the high-water mark
    /// and until it drains below the low-water mark
    pub fn delayed(&self) -> watch::Receiver<bool> {
        self.pressure.delayed.subscribe()
    }

    /// Current back-pressure state
    pub fn is_delayed(&self) -> bool {
        *self.pressure.delayed.borrow()
    }

    /// Stop the workers, waiting at most `timeout` for each
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("decoder worker did not stop in time, abandoning it");
            }
        }
    }
}

async fn process(job: DecodeJob, cache: &ArticleCache) -> DecodeOutcome {
    let DecodeJob {
        id,
        server,
        raw,
        ctx,
        force_disk,
    } = job;

    let result = match tokio::task::spawn_blocking(move || decode(&raw, ctx)).await {
        Ok(result) => result,
        Err(e) => Err(DecodeError::MalformedPayload(format!(
            "decoder task failed: {e}"
        ))),
    };

    let (mut decoded, crc_mismatch) = match result {
        Ok(_) if ctx.precheck => {
            return DecodeOutcome::Checked { id, server };
        }
        Ok(decoded) => (decoded, None),
        Err(DecodeError::BadData {
            decoded,
            expected,
            computed,
        }) => (*decoded, Some((expected, computed))),
        Err(error) => return DecodeOutcome::Failed { id, server, error },
    };

    let meta = DecodedMeta::from(&decoded);
    let data = std::mem::take(&mut decoded.data);
    match cache.save(&id, data, force_disk).await {
        Ok(Saved::Dropped) => DecodeOutcome::Dropped { id },
        Ok(_) => DecodeOutcome::Ready {
            id,
            server,
            meta,
            crc_mismatch,
        },
        Err(error) => DecodeOutcome::SaveFailed { id, server, error },
    }
}
