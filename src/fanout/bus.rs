// =============================================================================
// Fan-out bus — per-subscriber bounded queues with coalescing
// =============================================================================
//
// Two logical channels per subscriber session:
//
//   * status — latest account snapshot; latest-wins (queue depth 1).
//   * stream — bar previews, live indicators, condition checklists and
//     strategy events; bounded queue, oldest frames dropped on overflow.
//
// Frames are encoded once at publish time: a MessagePack map with named
// fields, zlib-compressed, delivered as one WebSocket binary frame.  The WS
// frame boundary is the length delimiter, so no inner prefix is added.
//
// Coalescing is a subscriber property: "raw" drains the queue on every
// publish wake-up, an integer second count samples the most recent frame at
// that cadence (the WS task drives the cadence; see api::ws).
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::indicators::IndicatorSnapshot;
use crate::market_data::Bar;
use crate::sim::{AccountView, Position};
use crate::strategy::trend_pullback::ConditionChecklist;
use crate::types::Trade;

/// Stream-channel queue depth; oldest frames are dropped beyond this.
const STREAM_QUEUE_DEPTH: usize = 256;

// =============================================================================
// Frames
// =============================================================================

/// One lifecycle event on the stream channel.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<Trade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// A stream frame keyed by strategy id.  Field names match the wire shape
/// the dashboard consumes: `k` kline, `i` indicators, `cond` checklist,
/// `ev` events.
#[derive(Debug, Clone, Serialize)]
pub struct StreamFrame {
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<Bar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i: Option<IndicatorSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond: Option<ConditionChecklist>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ev: Vec<StreamEvent>,
}

impl StreamFrame {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            k: None,
            i: None,
            cond: None,
            ev: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.k.is_none() && self.i.is_none() && self.cond.is_none() && self.ev.is_empty()
    }
}

/// Encode a frame: MessagePack with named fields, then zlib.
pub fn encode_frame<T: Serialize>(frame: &T) -> anyhow::Result<Vec<u8>> {
    use std::io::Write;
    let packed = rmp_serde::to_vec_named(frame)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&packed)?;
    Ok(encoder.finish()?)
}

// =============================================================================
// Subscribers
// =============================================================================

/// Which logical channel a subscriber session is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Status,
    Stream,
}

/// Per-subscriber push cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushInterval {
    /// Forward every producer update.
    Raw,
    /// Sample the most recent frame every N seconds.
    Seconds(u64),
}

impl PushInterval {
    /// Parse the config / query form: "raw" or a positive integer.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("raw") {
            return Some(Self::Raw);
        }
        s.parse::<u64>().ok().filter(|&n| n > 0).map(Self::Seconds)
    }
}

/// One connected session's queue.  The WS task drains it; producers push
/// encoded frames.
pub struct Subscriber {
    pub id: u64,
    pub channel: Channel,
    /// Only frames for this strategy are delivered; `None` means all.
    pub strategy: Option<String>,
    pub push_interval: PushInterval,
    queue: Mutex<VecDeque<Arc<Vec<u8>>>>,
    pub notify: Notify,
}

impl Subscriber {
    /// Drain every queued frame (raw cadence).
    pub fn drain(&self) -> Vec<Arc<Vec<u8>>> {
        self.queue.lock().drain(..).collect()
    }

    /// Take only the most recent frame (coalesced cadence).
    pub fn take_latest(&self) -> Option<Arc<Vec<u8>>> {
        let mut q = self.queue.lock();
        let last = q.pop_back();
        q.clear();
        last
    }

    fn push(&self, frame: Arc<Vec<u8>>) {
        let mut q = self.queue.lock();
        match self.channel {
            Channel::Status => {
                // Latest-wins.
                q.clear();
                q.push_back(frame);
            }
            Channel::Stream => {
                while q.len() >= STREAM_QUEUE_DEPTH {
                    q.pop_front();
                }
                q.push_back(frame);
            }
        }
        drop(q);
        self.notify.notify_one();
    }
}

// =============================================================================
// Hub
// =============================================================================

/// Registry of live subscribers.  Publishing encodes once and fans the
/// shared bytes out to every matching queue.
pub struct FanoutHub {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    default_interval: PushInterval,
}

impl FanoutHub {
    pub fn new(default_interval: PushInterval) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            default_interval,
        }
    }

    pub fn subscribe(
        &self,
        channel: Channel,
        strategy: Option<String>,
        push_interval: Option<PushInterval>,
    ) -> Arc<Subscriber> {
        let sub = Arc::new(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            channel,
            strategy,
            push_interval: push_interval.unwrap_or(self.default_interval),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        self.subscribers.write().push(sub.clone());
        info!(id = sub.id, channel = ?sub.channel, "subscriber attached");
        sub
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.write();
        subs.retain(|s| s.id != id);
        info!(id, remaining = subs.len(), "subscriber detached");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Publish the latest account view on the status channel.
    pub fn publish_status(&self, strategy: &str, view: &AccountView) {
        let encoded = match encode_frame(view) {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                warn!(error = %e, "failed to encode status frame");
                return;
            }
        };
        self.fan_out(Channel::Status, strategy, encoded);
    }

    /// Publish a stream frame.
    pub fn publish_stream(&self, frame: &StreamFrame) {
        if frame.is_empty() {
            return;
        }
        let encoded = match encode_frame(frame) {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                warn!(error = %e, "failed to encode stream frame");
                return;
            }
        };
        self.fan_out(Channel::Stream, &frame.strategy, encoded);
    }

    fn fan_out(&self, channel: Channel, strategy: &str, encoded: Arc<Vec<u8>>) {
        let subs = self.subscribers.read();
        let mut delivered = 0usize;
        for sub in subs.iter() {
            if sub.channel != channel {
                continue;
            }
            if let Some(filter) = &sub.strategy {
                if filter != strategy {
                    continue;
                }
            }
            sub.push(encoded.clone());
            delivered += 1;
        }
        debug!(?channel, strategy, delivered, "frame fanned out");
    }
}
