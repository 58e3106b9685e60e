//! Synthetic acquisition source for hardware-free runs.
//!
//! Produces a scrolling-gradient ultrasound lookalike and a probe pose that
//! sweeps around the Z axis, written into channel buffers at a configurable
//! rate from a background thread. The streaming path downstream of the
//! channel is exercised exactly as with a real device.

use crate::buffer::{
    FrameBuffer, ImageFormat, ImageFrame, ImageOrientation, ImageType, ItemStatus, PixelType,
    StreamPayload,
};
use crate::channel::BufferChannel;
use crate::clock::Clock;
use crate::config::SimulatedSourceConfig;
use crate::error::Result;
use crate::math::rotation_z;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct SimulatedSource {
    config: SimulatedSourceConfig,
    clock: Arc<Clock>,
    video: Arc<FrameBuffer>,
    tool: Arc<FrameBuffer>,
    running: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl SimulatedSource {
    pub fn new(config: SimulatedSourceConfig, clock: Arc<Clock>) -> Self {
        Self {
            config,
            clock,
            video: Arc::new(FrameBuffer::new("SimVideo")),
            tool: Arc::new(FrameBuffer::new("SimTracker")),
            running: Arc::new(AtomicBool::new(false)),
            producer: None,
        }
    }

    /// The output channel fed by this source; register it with the server's
    /// channel registry before starting either.
    pub fn channel(&self) -> BufferChannel {
        BufferChannel::new(self.config.output_channel_id.clone())
            .with_video(Arc::clone(&self.video))
            .with_tool(self.config.transform_name.clone(), Arc::clone(&self.tool))
    }

    pub fn start(&mut self) -> Result<()> {
        let [width, height] = self.config.image_size;
        let format = ImageFormat {
            size: [width, height, 1],
            pixel_type: PixelType::U8,
            components: 1,
            image_type: ImageType::BMode,
            orientation: ImageOrientation::Mf,
        };
        let period = Duration::from_secs_f64(1.0 / self.config.frame_rate_hz.max(0.1));

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let clock = Arc::clone(&self.clock);
        let video = Arc::clone(&self.video);
        let tool = Arc::clone(&self.tool);

        self.producer = Some(
            std::thread::Builder::new()
                .name("sim-source".to_string())
                .spawn(move || {
                    debug!("simulated source started");
                    let mut index = 0u64;
                    let mut pixels = vec![0u8; format.frame_bytes()];
                    while running.load(Ordering::SeqCst) {
                        let now = clock.system_time();
                        fill_gradient(&mut pixels, width, height, index);

                        let _ = video.add(
                            StreamPayload::Image(ImageFrame::new(format, pixels.clone())),
                            index,
                            now,
                            None,
                            ItemStatus::Ok,
                            None,
                        );
                        // One probe sweep every ~6 s at 30 fps.
                        let _ = tool.add(
                            StreamPayload::Transform(rotation_z(index as f64 * 0.035)),
                            index,
                            now,
                            None,
                            ItemStatus::Ok,
                            None,
                        );

                        index += 1;
                        std::thread::sleep(period);
                    }
                    debug!("simulated source exiting");
                })?,
        );
        info!(
            "simulated source running at {:.1} fps ({}x{} frames)",
            self.config.frame_rate_hz, width, height
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(producer) = self.producer.take() {
            let _ = producer.join();
        }
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scrolling diagonal gradient; enough structure to verify orientation and
/// motion on a viewer.
fn fill_gradient(pixels: &mut [u8], width: usize, height: usize, shift: u64) {
    for row in 0..height {
        for col in 0..width {
            pixels[row * width + col] = ((row + col + shift as usize) % 256) as u8;
        }
    }
}
