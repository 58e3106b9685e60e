//! tarang-server daemon entry point.

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tarang_server::channel::ChannelRegistry;
use tarang_server::transforms::MemoryTransformRepository;
use tarang_server::{Clock, Error, IgtlServer, Result, ServerConfig};

#[derive(Parser)]
#[command(name = "tarang-server", version, about = "OpenIGTLink streaming server")]
struct Args {
    /// Server configuration file (XML)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("tarang-server v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("using config: {}", args.config.display());
    let config = ServerConfig::from_file(&args.config)?;

    let clock = Arc::new(Clock::new());

    #[cfg(feature = "sim")]
    let (channels, mut sim_source) = {
        let mut channels = ChannelRegistry::new();
        let source = match &config.simulated_source {
            Some(sim_config) => {
                let mut source = tarang_server::source::SimulatedSource::new(
                    sim_config.clone(),
                    Arc::clone(&clock),
                );
                channels.register(Arc::new(source.channel()));
                source.start()?;
                Some(source)
            }
            None => None,
        };
        (channels, source)
    };
    #[cfg(not(feature = "sim"))]
    let channels = {
        if config.simulated_source.is_some() {
            log::warn!(
                "config names a SimulatedSource but this build has no sim support; ignoring"
            );
        }
        ChannelRegistry::new()
    };

    let repository: Arc<dyn tarang_server::transforms::TransformRepository> =
        Arc::new(MemoryTransformRepository::new());
    let mut server = IgtlServer::with_parts(
        config,
        channels,
        Arc::new(tarang_server::igtl::DefaultMessageFactory::new()),
        Some(repository),
        clock,
    );
    server.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("error setting Ctrl-C handler: {e}")))?;

    info!("server running, press Ctrl-C to stop");
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down...");
    server.stop();
    #[cfg(feature = "sim")]
    if let Some(source) = sim_source.as_mut() {
        source.stop();
    }

    info!("tarang-server stopped");
    Ok(())
}
