//! BSP Monitor - headless EEG streaming pipeline driven by a simulated ADC
//!
//! Usage: `bsp-monitor [config.json] [--seconds N] [--records]`

mod app;
mod simulator;

use anyhow::{bail, Context, Result};
use app::{MonitorApp, MonitorConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn parse_args() -> Result<MonitorConfig> {
    let mut config = MonitorConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seconds" => {
                let value = args.next().context("--seconds needs a value")?;
                let seconds: f64 = value.parse().with_context(|| format!("Invalid duration: {}", value))?;
                config.duration_secs = Some(seconds);
            }
            "--records" => config.use_records = true,
            path if !path.starts_with("--") => {
                let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
                let duration = config.duration_secs;
                let use_records = config.use_records;
                config = serde_json::from_str(&text).with_context(|| format!("Invalid monitor config {}", path))?;
                config.duration_secs = duration.or(config.duration_secs);
                config.use_records |= use_records;
            }
            other => bail!("Unknown option: {}", other),
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = parse_args()?;
    info!("Starting BSP Monitor: simulated ADC -> normalizer -> scheduler -> buffers -> band powers");

    let app = MonitorApp::new(config)?;
    let context = std::sync::Arc::clone(app.context());
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            interrupt.cancel();
        }
    });

    let stats = app.run(cancel).await?;
    if let Some(snapshot) = context.snapshot() {
        info!(
            sequence = ?snapshot.last_sequence_id,
            buffered = ?snapshot.buffered,
            "final buffer state"
        );
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
