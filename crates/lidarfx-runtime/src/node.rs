//! The perception node: sensor stream in, pipeline output out.
//!
//! [`PerceptionNode`] drains a [`FrameSource`].  Orientation samples update
//! the shared [`OrientationTracker`] as they arrive; each frame runs through
//! the [`FramePipeline`] on a blocking worker so the async runtime stays
//! responsive, and both results go to the [`OutputSink`].  Frames are
//! handled one at a time in arrival order.

use std::sync::Arc;

use futures_util::StreamExt;
use lidarfx_middleware::{FrameSource, OutputSink, SensorMessage};
use lidarfx_perception::{FrameOutput, FramePipeline, OrientationTracker};
use lidarfx_types::PointCloud;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Counters reported when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeSummary {
    pub frames_processed: usize,
    pub frames_dropped: usize,
    pub orientation_updates: usize,
    /// Frames levelled with an orientation older than the configured limit.
    pub stale_frames: usize,
    pub keypoints_emitted: usize,
}

/// Long-running driver around one [`FramePipeline`].
pub struct PerceptionNode {
    pipeline: Arc<FramePipeline>,
    tracker: Arc<OrientationTracker>,
    sink: Arc<dyn OutputSink>,
}

impl PerceptionNode {
    pub fn new(pipeline: FramePipeline, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            tracker: Arc::new(OrientationTracker::new()),
            sink,
        }
    }

    /// Share an existing tracker, e.g. one also fed by another task.
    pub fn with_tracker(mut self, tracker: Arc<OrientationTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> Arc<OrientationTracker> {
        Arc::clone(&self.tracker)
    }

    /// Run until `source` is exhausted.
    pub async fn run(&self, source: &dyn FrameSource) -> NodeSummary {
        let (_keep_open, shutdown) = watch::channel(false);
        self.run_until(source, shutdown).await
    }

    /// Run until `source` is exhausted or `shutdown` turns `true`.  A frame
    /// already being processed is finished first.
    pub async fn run_until(
        &self,
        source: &dyn FrameSource,
        mut shutdown: watch::Receiver<bool>,
    ) -> NodeSummary {
        let mut summary = NodeSummary::default();
        let mut stream = source.sensor_stream().await;

        let stop = async move {
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                // Sender gone without asking to stop: never fire.
                std::future::pending::<()>().await;
            }
        };
        tokio::pin!(stop);

        loop {
            let msg = tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("shutdown requested, stopping node");
                    break;
                }
                msg = stream.next() => msg,
            };
            let Some(msg) = msg else {
                debug!("sensor stream ended");
                break;
            };

            match msg {
                SensorMessage::Orientation(q) => {
                    let sample = self.tracker.update_from_quaternion(q);
                    summary.orientation_updates += 1;
                    debug!(roll = sample.roll, pitch = sample.pitch, "orientation updated");
                }
                SensorMessage::Frame(cloud) => self.handle_frame(cloud, &mut summary).await,
            }
        }

        info!(
            frames = summary.frames_processed,
            dropped = summary.frames_dropped,
            keypoints = summary.keypoints_emitted,
            "node stopped"
        );
        summary
    }

    async fn handle_frame(&self, cloud: PointCloud, summary: &mut NodeSummary) {
        let frame_id = cloud.frame_id.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let tracker = Arc::clone(&self.tracker);

        let output = match tokio::task::spawn_blocking(move || pipeline.process(&cloud, &tracker))
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(frame_id = %frame_id, error = %e, "frame processing failed");
                summary.frames_dropped += 1;
                if let Err(e) = self.sink.report_dropped(frame_id, e.to_string()).await {
                    warn!(error = %e, "could not report dropped frame");
                }
                return;
            }
        };

        summary.frames_processed += 1;
        if output.stats.orientation_stale {
            summary.stale_frames += 1;
        }
        summary.keypoints_emitted += output.keypoints.keypoints.len();
        self.publish(output).await;
    }

    async fn publish(&self, output: FrameOutput) {
        let FrameOutput {
            filtered,
            keypoints,
            ..
        } = output;
        if let Err(e) = self.sink.publish_filtered(filtered).await {
            warn!(error = %e, "filtered cloud not published");
        }
        if let Err(e) = self.sink.publish_keypoints(keypoints).await {
            warn!(error = %e, "keypoints not published");
        }
    }
}
