//! Output channels: the seam between acquisition devices and the server.
//!
//! A channel aggregates one optional video buffer and any number of named
//! tool-pose buffers, and answers batched "everything after timestamp T"
//! queries with assembled [`TrackedFrame`]s. The server only depends on the
//! [`FrameChannel`] trait; acquisition devices (or the simulated source)
//! own the buffers and write into them from their own threads.

use crate::buffer::{FrameBuffer, StreamPayload, TemporalLookup};
use crate::error::{Error, ItemError, Result};
use crate::frame::TrackedFrame;
use crate::math::Matrix4x4;
use log::{debug, warn};
use std::sync::Arc;

pub trait FrameChannel: Send + Sync {
    fn id(&self) -> &str;

    fn has_video_source(&self) -> bool;

    /// True when the channel can produce frames right now: video present for
    /// a video channel, any tool pose present for a tracking-only channel.
    fn data_available(&self) -> bool;

    /// Start of the commonly-available window across all buffers.
    fn oldest_timestamp(&self) -> Result<f64>;

    /// End of the commonly-available window across all buffers.
    fn most_recent_timestamp(&self) -> Result<f64>;

    /// Assemble frames strictly newer than `after_ts`, oldest first, at most
    /// `max_frames` of them.
    fn tracked_frames(&self, after_ts: f64, max_frames: usize) -> Result<Vec<TrackedFrame>>;
}

/// Channel backed by in-process [`FrameBuffer`]s.
pub struct BufferChannel {
    id: String,
    video: Option<Arc<FrameBuffer>>,
    tools: Vec<(String, Arc<FrameBuffer>)>,
}

impl BufferChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            video: None,
            tools: Vec::new(),
        }
    }

    pub fn with_video(mut self, buffer: Arc<FrameBuffer>) -> Self {
        self.video = Some(buffer);
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, buffer: Arc<FrameBuffer>) -> Self {
        self.tools.push((name.into(), buffer));
        self
    }

    /// The buffer that paces frame assembly: video when present, otherwise
    /// the first tool.
    fn master_buffer(&self) -> Option<&Arc<FrameBuffer>> {
        self.video
            .as_ref()
            .or_else(|| self.tools.first().map(|(_, buffer)| buffer))
    }

    fn buffers(&self) -> impl Iterator<Item = &Arc<FrameBuffer>> {
        self.video
            .iter()
            .chain(self.tools.iter().map(|(_, buffer)| buffer))
    }

    fn frame_at(&self, master_uid: u64) -> Result<TrackedFrame> {
        let master = self
            .master_buffer()
            .ok_or_else(|| Error::Channel(format!("channel {} has no buffers", self.id)))?;
        let item = master.item_from_uid(master_uid).map_err(Error::from)?;

        let mut frame = TrackedFrame::new(item.filtered_ts);
        frame.custom_fields = item.custom_fields.clone();

        match &item.payload {
            StreamPayload::Image(image) => frame.image = Some(image.clone()),
            StreamPayload::Transform(matrix) => {
                // Tracking-only channel: the master buffer is the first tool.
                if let Some((name, _)) = self.tools.first() {
                    frame.set_transform(name.clone(), *matrix, item.status);
                }
            }
        }

        // Remaining tools contribute poses interpolated to the frame time.
        let skip_first_tool = self.video.is_none();
        for (n, (name, buffer)) in self.tools.iter().enumerate() {
            if skip_first_tool && n == 0 {
                continue;
            }
            match buffer.item_from_time(item.filtered_ts, TemporalLookup::Interpolated) {
                Ok(tool_item) => {
                    if let Some(matrix) = tool_item.payload.as_transform() {
                        frame.set_transform(name.clone(), *matrix, tool_item.status);
                    }
                }
                Err(err) => {
                    debug!(
                        "channel {}: no {} pose at {:.6}s ({err})",
                        self.id, name, item.filtered_ts
                    );
                    frame.transforms.insert(
                        name.clone(),
                        crate::frame::FrameTransform {
                            matrix: Matrix4x4::identity(),
                            valid: false,
                        },
                    );
                }
            }
        }

        Ok(frame)
    }
}

impl FrameChannel for BufferChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_video_source(&self) -> bool {
        self.video.is_some()
    }

    fn data_available(&self) -> bool {
        match &self.video {
            Some(video) => video.num_items() > 0,
            None => self.tools.iter().any(|(_, buffer)| buffer.num_items() > 0),
        }
    }

    fn oldest_timestamp(&self) -> Result<f64> {
        let mut oldest: Option<f64> = None;
        for buffer in self.buffers() {
            let ts = buffer.oldest_timestamp().map_err(Error::from)?;
            oldest = Some(oldest.map_or(ts, |acc: f64| acc.max(ts)));
        }
        oldest.ok_or_else(|| Error::Channel(format!("channel {} has no buffers", self.id)))
    }

    fn most_recent_timestamp(&self) -> Result<f64> {
        let mut latest: Option<f64> = None;
        for buffer in self.buffers() {
            let ts = buffer.latest_timestamp().map_err(Error::from)?;
            latest = Some(latest.map_or(ts, |acc: f64| acc.min(ts)));
        }
        latest.ok_or_else(|| Error::Channel(format!("channel {} has no buffers", self.id)))
    }

    fn tracked_frames(&self, after_ts: f64, max_frames: usize) -> Result<Vec<TrackedFrame>> {
        let master = self
            .master_buffer()
            .ok_or_else(|| Error::Channel(format!("channel {} has no buffers", self.id)))?;

        let latest_uid = match master.latest_uid() {
            Ok(uid) => uid,
            Err(ItemError::NotFound) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        // First uid strictly after the cutoff.
        let mut uid = match master.uid_from_time(after_ts) {
            Ok(closest) => {
                let mut uid = closest;
                while uid <= latest_uid {
                    match master.timestamp_from_uid(uid) {
                        Ok(ts) if ts > after_ts => break,
                        Ok(_) => uid += 1,
                        Err(_) => return Ok(Vec::new()),
                    }
                }
                uid
            }
            Err(ItemError::NotAvailableYet) => return Ok(Vec::new()),
            Err(ItemError::NotAvailableAnymore) => master.oldest_uid().map_err(Error::from)?,
            Err(ItemError::NotFound) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut frames = Vec::new();
        while uid <= latest_uid && frames.len() < max_frames {
            match self.frame_at(uid) {
                Ok(frame) => frames.push(frame),
                Err(err) => warn!("channel {}: skipping frame uid {uid}: {err}", self.id),
            }
            uid += 1;
        }
        Ok(frames)
    }
}

/// All output channels known to the process, in registration order.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Vec<Arc<dyn FrameChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Arc<dyn FrameChannel>) {
        self.channels.push(channel);
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn all(&self) -> &[Arc<dyn FrameChannel>] {
        &self.channels
    }

    pub fn find(&self, id: &str) -> Option<Arc<dyn FrameChannel>> {
        self.channels.iter().find(|c| c.id() == id).cloned()
    }

    pub fn first(&self) -> Option<Arc<dyn FrameChannel>> {
        self.channels.first().cloned()
    }

    /// Channel used for broadcasting: the configured id when registered,
    /// otherwise the first known channel, otherwise none (command-only).
    pub fn resolve_broadcast(&self, configured_id: &str) -> Option<Arc<dyn FrameChannel>> {
        match self.find(configured_id) {
            Some(channel) => Some(channel),
            None => {
                if !configured_id.is_empty() && !self.is_empty() {
                    warn!(
                        "output channel '{configured_id}' not found, falling back to first channel"
                    );
                }
                self.first()
            }
        }
    }
}
