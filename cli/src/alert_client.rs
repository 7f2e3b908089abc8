use std::sync::Arc;

use anyhow::Result;
use tokio::signal;

use lib_alerts::{
    AlertSink, DeliveryChannel, DeliveryLoop, LongPollChannel, LoopState, PollLoop, StreamChannel, StreamLoop,
};

mod client_logic;
use client_logic::config::{self, Mode};
use client_logic::console::ConsoleSink;
use client_logic::logger;

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;

    let delivery_config = config.delivery_config()?;
    log::info!("{}", delivery_config);

    let sink = Arc::new(ConsoleSink::new());
    match config.mode() {
        Mode::Poll => {
            let channel = LongPollChannel::from_config(&delivery_config)?;
            let delivery: PollLoop<_> = DeliveryLoop::from_config(&delivery_config, channel, sink)?;
            run(delivery, config.reset).await?;
        }
        Mode::Stream => {
            let channel = StreamChannel::from_config(&delivery_config)?;
            let delivery: StreamLoop<_> = DeliveryLoop::from_config(&delivery_config, channel, sink)?;
            run(delivery, config.reset).await?;
        }
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn run<C: DeliveryChannel, S: AlertSink>(mut delivery: DeliveryLoop<C, S>, reset: bool) -> Result<()> {
    if reset {
        match delivery.reset().await {
            Ok(()) => log::info!("Server delivery cursor reset."),
            Err(e) => log::warn!("Cursor reset failed, continuing from the current position: {}", e),
        }
    }

    delivery.start().await?;
    log::info!("Delivering alerts for client {}", delivery.client_id().unwrap_or("?"));

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = delivery.wait_for_state(LoopState::Terminated) => {
            log::error!("Delivery loop terminated, giving up.");
        }
    }

    delivery.stop().await;

    let snapshot = delivery.metrics().snapshot();
    log::info!("Delivery metrics: {}", serde_json::to_string(&snapshot)?);
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("SIGTERM handler unavailable: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
