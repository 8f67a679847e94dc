//! Sensor sources and output sinks.
//!
//! The perception node never talks to a sensor driver or a transport
//! directly.  Inbound data arrives through a [`FrameSource`] as a stream of
//! [`SensorMessage`]s; outbound results leave through an [`OutputSink`].
//!
//! # Overview
//!
//! - [`FrameSource`] – trait every inbound adapter implements.
//! - [`ChannelSource`] – in-process source fed through an mpsc sender.
//! - [`ReplaySource`][crate::replay::ReplaySource] – JSON-lines recording.
//! - [`OutputSink`] – trait for publishing pipeline results.
//! - [`BusSink`] – publishes results as [`Event`]s on the [`EventBus`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use lidarfx_types::{Event, EventPayload, KeypointSet, PerceptionError, PointCloud, Quaternion};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bus::{EventBus, Topic};

/// Source name stamped on every event published by [`BusSink`].
pub const BUS_SINK_SOURCE: &str = "lidarfx-middleware::bus_sink";

/// One inbound sensor message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorMessage {
    /// A LiDAR frame in the sensor's own frame.
    Frame(PointCloud),
    /// An inertial orientation sample.
    Orientation(Quaternion),
}

/// Every inbound adapter implements this trait.
///
/// # Contract
///
/// `sensor_stream` hands out the adapter's messages in arrival order.  A
/// source may be single-use: once its stream has been taken, later calls
/// return an empty stream.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Stream of inbound frames and orientation samples.
    async fn sensor_stream(&self) -> BoxStream<'static, SensorMessage>;
}

/// Every outbound adapter implements this trait.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Hand off the levelled, cropped cloud of one frame.
    async fn publish_filtered(&self, cloud: PointCloud) -> Result<usize, PerceptionError>;

    /// Hand off the described keypoints of one frame.
    async fn publish_keypoints(&self, keypoints: KeypointSet) -> Result<usize, PerceptionError>;

    /// Report a frame that produced no output.
    async fn report_dropped(&self, frame_id: String, reason: String)
    -> Result<usize, PerceptionError>;
}

// ────────────────────────────────────────────────────────────────────────────
// ChannelSource
// ────────────────────────────────────────────────────────────────────────────

/// Source backed by a tokio mpsc channel.  The stream ends once every
/// sender has been dropped.
pub struct ChannelSource {
    receiver: Mutex<Option<mpsc::Receiver<SensorMessage>>>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<SensorMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                receiver: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn sensor_stream(&self) -> BoxStream<'static, SensorMessage> {
        let taken = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(rx) => Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|msg| (msg, rx))
            })),
            None => Box::pin(stream::empty()),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BusSink
// ────────────────────────────────────────────────────────────────────────────

/// Publishes pipeline output on an [`EventBus`].
#[derive(Clone, Debug)]
pub struct BusSink {
    bus: Arc<EventBus>,
}

impl BusSink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

#[async_trait]
impl OutputSink for BusSink {
    async fn publish_filtered(&self, cloud: PointCloud) -> Result<usize, PerceptionError> {
        self.bus.publish_to(
            Topic::FilteredCloud,
            Event::new(BUS_SINK_SOURCE, EventPayload::FilteredCloud(cloud)),
        )
    }

    async fn publish_keypoints(&self, keypoints: KeypointSet) -> Result<usize, PerceptionError> {
        self.bus.publish_to(
            Topic::Keypoints,
            Event::new(BUS_SINK_SOURCE, EventPayload::Keypoints(keypoints)),
        )
    }

    async fn report_dropped(
        &self,
        frame_id: String,
        reason: String,
    ) -> Result<usize, PerceptionError> {
        self.bus.publish_to(
            Topic::Diagnostics,
            Event::new(BUS_SINK_SOURCE, EventPayload::FrameDropped { frame_id, reason }),
        )
    }
}
