//! Asynchronous command execution.
//!
//! Requests are queued from the receiver thread and executed in FIFO order
//! on the processor's own worker thread. Responses accumulate until the
//! sender drains them at the top of its tick. Every accepted request
//! produces at least one response unless its handler deliberately returns
//! none.

use super::{CommandRequest, CommandResponse};
use crate::channel::ChannelRegistry;
use crate::error::Result;
use crate::igtl::ImageMetaItem;
use crate::math::Matrix4x4;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Resources handlers may consult.
pub struct HandlerContext {
    pub channels: Arc<ChannelRegistry>,
}

pub trait CommandHandler: Send + Sync {
    fn execute(&self, request: &CommandRequest, ctx: &HandlerContext) -> Vec<CommandResponse>;
}

impl<F> CommandHandler for F
where
    F: Fn(&CommandRequest, &HandlerContext) -> Vec<CommandResponse> + Send + Sync,
{
    fn execute(&self, request: &CommandRequest, ctx: &HandlerContext) -> Vec<CommandResponse> {
        self(request, ctx)
    }
}

enum Work {
    Command(CommandRequest),
    GetImage { client_id: u64, device_name: String },
    GetImageMeta { client_id: u64, device_name: String },
}

pub struct CommandProcessor {
    work_tx: Sender<Work>,
    work_rx: Receiver<Work>,
    handlers: Arc<Mutex<HashMap<String, Box<dyn CommandHandler>>>>,
    responses: Arc<Mutex<Vec<CommandResponse>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandProcessor {
    pub fn new() -> Self {
        let (work_tx, work_rx) = unbounded();
        Self {
            work_tx,
            work_rx,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            responses: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Register a handler for a command name.
    pub fn register_handler(&self, name: impl Into<String>, handler: Box<dyn CommandHandler>) {
        self.handlers.lock().insert(name.into(), handler);
    }

    /// Spawn the worker thread.
    pub fn start(&self, ctx: HandlerContext) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let work_rx = self.work_rx.clone();
        let handlers = Arc::clone(&self.handlers);
        let responses = Arc::clone(&self.responses);

        let worker = std::thread::Builder::new()
            .name("command-processor".to_string())
            .spawn(move || {
                debug!("command processor started");
                while running.load(Ordering::SeqCst) {
                    let work = match work_rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(work) => work,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let produced = execute(work, &handlers.lock(), &ctx);
                    responses.lock().extend(produced);
                }
                debug!("command processor exiting");
            })?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    /// Queue a remote command for execution. Dedupe against previously seen
    /// uids happens at the receive edge, before this call.
    pub fn queue_command(&self, request: CommandRequest) {
        if request.uid.is_empty() {
            info!(
                "received command from device {}: {}",
                request.device_prefix, request.command_xml
            );
        } else {
            info!(
                "received command from device {} with uid {}: {}",
                request.device_prefix, request.uid, request.command_xml
            );
        }
        let _ = self.work_tx.send(Work::Command(request));
    }

    pub fn queue_get_image(&self, client_id: u64, device_name: String) {
        let _ = self.work_tx.send(Work::GetImage {
            client_id,
            device_name,
        });
    }

    pub fn queue_get_image_meta(&self, client_id: u64, device_name: String) {
        let _ = self.work_tx.send(Work::GetImageMeta {
            client_id,
            device_name,
        });
    }

    /// Take every response produced since the last drain, FIFO.
    pub fn drain_responses(&self) -> Vec<CommandResponse> {
        std::mem::take(&mut *self.responses.lock())
    }
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn execute(
    work: Work,
    handlers: &HashMap<String, Box<dyn CommandHandler>>,
    ctx: &HandlerContext,
) -> Vec<CommandResponse> {
    match work {
        Work::Command(request) => {
            let name = match command_name(&request.command_xml) {
                Ok(name) => name,
                Err(message) => {
                    return vec![CommandResponse::String {
                        client_id: request.client_id,
                        success: false,
                        message,
                        device_name: request.response_device_name(),
                    }]
                }
            };
            match handlers.get(&name) {
                Some(handler) => handler.execute(&request, ctx),
                None => {
                    warn!("no handler registered for command {name}");
                    vec![CommandResponse::String {
                        client_id: request.client_id,
                        success: false,
                        message: format!("Unknown command: {name}"),
                        device_name: request.response_device_name(),
                    }]
                }
            }
        }
        Work::GetImage {
            client_id,
            device_name,
        } => get_image(client_id, device_name, ctx),
        Work::GetImageMeta { client_id, .. } => get_image_meta(client_id, ctx),
    }
}

/// `Name` attribute of the `<Command/>` root element.
fn command_name(xml: &str) -> std::result::Result<String, String> {
    let doc =
        roxmltree::Document::parse(xml).map_err(|e| format!("Malformed command XML: {e}"))?;
    let root = doc.root_element();
    if root.tag_name().name() != "Command" {
        return Err(format!(
            "Expected Command element, got {}",
            root.tag_name().name()
        ));
    }
    root.attribute("Name")
        .map(str::to_string)
        .ok_or_else(|| "Command element has no Name attribute".to_string())
}

/// Serve the latest frame of the named channel (any video channel when the
/// name matches nothing). Successful lookups broadcast as IMAGE.
fn get_image(client_id: u64, device_name: String, ctx: &HandlerContext) -> Vec<CommandResponse> {
    let channel = ctx
        .channels
        .find(&device_name)
        .or_else(|| ctx.channels.first());
    let Some(channel) = channel else {
        return vec![CommandResponse::String {
            client_id,
            success: false,
            message: format!("No channel available for image {device_name}"),
            device_name,
        }];
    };

    match channel.tracked_frames(f64::NEG_INFINITY, usize::MAX) {
        Ok(frames) => match frames.into_iter().rev().find_map(|frame| frame.image) {
            Some(image) => vec![CommandResponse::Image {
                client_id,
                image_name: device_name,
                image,
                image_to_reference: Matrix4x4::identity(),
            }],
            None => vec![CommandResponse::String {
                client_id,
                success: false,
                message: format!("Channel {} holds no image data", channel.id()),
                device_name,
            }],
        },
        Err(err) => vec![CommandResponse::String {
            client_id,
            success: false,
            message: format!("Failed to read channel {}: {err}", channel.id()),
            device_name,
        }],
    }
}

/// Describe every channel that currently carries video.
fn get_image_meta(client_id: u64, ctx: &HandlerContext) -> Vec<CommandResponse> {
    let mut items = Vec::new();
    for channel in ctx.channels.all() {
        if !channel.has_video_source() || !channel.data_available() {
            continue;
        }
        if let Ok(frames) = channel.tracked_frames(f64::NEG_INFINITY, usize::MAX) {
            let latest_image = frames.into_iter().rev().find_map(|frame| {
                let timestamp = frame.timestamp;
                frame.image.map(|image| (timestamp, image))
            });
            if let Some((timestamp, image)) = latest_image {
                items.push(ImageMetaItem {
                    name: channel.id().to_string(),
                    id: channel.id().to_string(),
                    modality: "US".to_string(),
                    patient_name: String::new(),
                    patient_id: String::new(),
                    timestamp,
                    size: [
                        image.format.size[0] as u16,
                        image.format.size[1] as u16,
                        image.format.size[2] as u16,
                    ],
                    pixel_type: image.format.pixel_type,
                });
            }
        }
    }
    vec![CommandResponse::ImageMeta { client_id, items }]
}
