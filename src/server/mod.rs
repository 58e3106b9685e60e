//! The streaming server: three long-lived worker threads sharing a client
//! roster.
//!
//! - the **acceptor** waits for TCP connections and registers clients;
//! - the **sender** drains the broadcast channel and fans frames out to
//!   every client according to its subscription, interleaving command
//!   responses and keep-alives;
//! - the **receiver** reads inbound message headers from every client and
//!   routes bodies to the command processor.
//!
//! Each worker runs against a pair of flags: `requested` is written by the
//! supervisor, `running` by the thread itself. `stop()` clears `requested`
//! in reverse dependency order (receiver, sender, acceptor) and spins until
//! each `running` flag falls; socket timeouts bound how long that takes.

mod acceptor;
mod receiver;
pub mod registry;
mod sender;

pub use registry::{Client, ClientRegistry, ClientSnapshot};

use crate::channel::{ChannelRegistry, FrameChannel};
use crate::clock::Clock;
use crate::command::{CommandProcessor, HandlerContext};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::igtl::{DefaultMessageFactory, MessageFactory};
use crate::transforms::TransformRepository;
use log::{info, log, Level};
use parking_lot::Mutex;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Receive/send timeout applied to every client socket.
pub(crate) const CLIENT_SOCKET_TIMEOUT: Duration = Duration::from_millis(500);
/// Sleep between accept polls; bounds the acceptor's shutdown latency.
pub(crate) const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Sleep when no client is connected.
pub(crate) const NO_CLIENT_SLEEP: Duration = Duration::from_millis(200);
/// Sleep after a channel read error.
pub(crate) const DELAY_ON_SENDING_ERROR: Duration = Duration::from_millis(20);
/// Sleep when the channel produced nothing new.
pub(crate) const DELAY_ON_NO_NEW_FRAMES: Duration = Duration::from_millis(5);
/// Poll interval while waiting for a worker to stop.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// When the producer overruns the reader, skip this far past the oldest
/// still-available timestamp so the next read has comfortable margin before
/// eviction catches up with it again.
pub(crate) const SAMPLING_SKIPPING_MARGIN_SEC: f64 = 0.1;

pub(crate) const NUMBER_OF_RETRY_ATTEMPTS: usize = 10;
pub(crate) const DELAY_BETWEEN_RETRY_ATTEMPTS: Duration = Duration::from_millis(100);

/// requested: supervisor-owned; running: thread-owned.
#[derive(Default)]
pub(crate) struct WorkerFlags {
    requested: AtomicBool,
    running: AtomicBool,
}

impl WorkerFlags {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn unrequest(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// State shared by the worker threads.
pub(crate) struct ServerState {
    pub config: ServerConfig,
    pub clock: Arc<Clock>,
    pub registry: ClientRegistry,
    pub processor: Arc<CommandProcessor>,
    pub factory: Arc<dyn MessageFactory>,
    pub channels: Arc<ChannelRegistry>,
    pub repository: Option<Arc<dyn TransformRepository>>,
    pub connection: WorkerFlags,
    pub sender: WorkerFlags,
    pub receiver: WorkerFlags,
    pub broadcast_start_time: Mutex<f64>,
}

impl ServerState {
    /// Log level for "no data yet": quiet during the configured grace
    /// period after start, warning once it has expired.
    pub fn grace_period_log_level(&self) -> Level {
        let elapsed = self.clock.system_time() - *self.broadcast_start_time.lock();
        if elapsed > self.config.missing_input_grace_period_sec {
            Level::Warn
        } else {
            Level::Debug
        }
    }
}

/// OpenIGTLink streaming server.
///
/// Owns the shared state, the command processor, and the worker threads.
/// Collaborating acquisition components (channels, transform repository)
/// are injected before [`start`](Self::start); the server never outlives
/// them by construction of the shutdown order.
pub struct IgtlServer {
    state: Arc<ServerState>,
    acceptor_thread: Option<JoinHandle<()>>,
    sender_thread: Option<JoinHandle<()>>,
    receiver_thread: Option<JoinHandle<()>>,
}

impl IgtlServer {
    pub fn new(config: ServerConfig, channels: ChannelRegistry) -> Self {
        Self::with_parts(
            config,
            channels,
            Arc::new(DefaultMessageFactory::new()),
            None,
            Arc::new(Clock::new()),
        )
    }

    pub fn with_parts(
        config: ServerConfig,
        channels: ChannelRegistry,
        factory: Arc<dyn MessageFactory>,
        repository: Option<Arc<dyn TransformRepository>>,
        clock: Arc<Clock>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                clock,
                registry: ClientRegistry::new(),
                processor: Arc::new(CommandProcessor::new()),
                factory,
                channels: Arc::new(channels),
                repository,
                connection: WorkerFlags::default(),
                sender: WorkerFlags::default(),
                receiver: WorkerFlags::default(),
                broadcast_start_time: Mutex::new(0.0),
            }),
            acceptor_thread: None,
            sender_thread: None,
            receiver_thread: None,
        }
    }

    pub fn clock(&self) -> Arc<Clock> {
        Arc::clone(&self.state.clock)
    }

    pub fn processor(&self) -> Arc<CommandProcessor> {
        Arc::clone(&self.state.processor)
    }

    pub fn num_connected_clients(&self) -> usize {
        self.state.registry.num_connected()
    }

    pub fn is_running(&self) -> bool {
        self.state.connection.is_running()
            || self.state.sender.is_running()
            || self.state.receiver.is_running()
    }

    /// Bind the listening socket and spawn the three workers plus the
    /// command processor. A bind failure aborts the start.
    pub fn start(&mut self) -> Result<()> {
        if self.acceptor_thread.is_some() {
            return Err(Error::Server("server already started".to_string()));
        }

        let bind_addr = format!("0.0.0.0:{}", self.state.config.listening_port);
        let listener = TcpListener::bind(&bind_addr)
            .map_err(|e| Error::Server(format!("cannot create server socket on {bind_addr}: {e}")))?;
        listener.set_nonblocking(true)?;

        *self.state.broadcast_start_time.lock() = self.state.clock.system_time();

        self.state.processor.start(HandlerContext {
            channels: Arc::clone(&self.state.channels),
        })?;

        self.state.connection.request();
        let state = Arc::clone(&self.state);
        self.acceptor_thread = Some(
            std::thread::Builder::new()
                .name("connection-acceptor".to_string())
                .spawn(move || acceptor::run(&state, listener))?,
        );
        info!(
            "OpenIGTLink server started on port: {}",
            self.state.config.listening_port
        );

        self.state.sender.request();
        let state = Arc::clone(&self.state);
        self.sender_thread = Some(
            std::thread::Builder::new()
                .name("data-sender".to_string())
                .spawn(move || sender::run(&state))?,
        );

        self.state.receiver.request();
        let state = Arc::clone(&self.state);
        self.receiver_thread = Some(
            std::thread::Builder::new()
                .name("data-receiver".to_string())
                .spawn(move || receiver::run(&state))?,
        );

        let defaults = &self.state.config.default_client_info;
        if !defaults.message_types.is_empty() {
            info!(
                "server default message types to send: {}",
                defaults.message_types.join(" ")
            );
        }
        if !defaults.transform_names.is_empty() {
            info!(
                "server default transform names to send: {}",
                defaults.transform_names.join(" ")
            );
        }
        if !defaults.string_names.is_empty() {
            info!(
                "server default string names to send: {}",
                defaults.string_names.join(" ")
            );
        }
        if !defaults.image_streams.is_empty() {
            let streams: Vec<String> = defaults
                .image_streams
                .iter()
                .map(|s| {
                    format!(
                        "{} (EmbeddedTransformToFrame: {})",
                        s.name, s.embedded_transform_to_frame
                    )
                })
                .collect();
            info!("server default images to send: {}", streams.join(" "));
        }

        Ok(())
    }

    /// Stop the workers in reverse dependency order, then the processor.
    pub fn stop(&mut self) {
        if let Some(thread) = self.receiver_thread.take() {
            self.state.receiver.unrequest();
            while self.state.receiver.is_running() {
                std::thread::sleep(STOP_POLL_INTERVAL);
            }
            let _ = thread.join();
        }

        if let Some(thread) = self.sender_thread.take() {
            self.state.sender.unrequest();
            while self.state.sender.is_running() {
                std::thread::sleep(STOP_POLL_INTERVAL);
            }
            let _ = thread.join();
        }

        if let Some(thread) = self.acceptor_thread.take() {
            self.state.connection.unrequest();
            while self.state.connection.is_running() {
                std::thread::sleep(STOP_POLL_INTERVAL);
            }
            let _ = thread.join();
            info!("OpenIGTLink server stopped");
        }

        self.state.processor.stop();
    }

    /// Resolve the broadcast channel the way the sender will: configured id
    /// first, then any channel. Exposed for diagnostics.
    pub fn broadcast_channel(&self) -> Option<Arc<dyn FrameChannel>> {
        self.state
            .channels
            .resolve_broadcast(&self.state.config.output_channel_id)
    }
}

impl Drop for IgtlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Log at a runtime-selected level (the grace-period mechanic).
pub(crate) fn log_dynamic(level: Level, message: &str) {
    log!(level, "{message}");
}
