use anyhow::Result;
use proctel_daemon::{
    config::{Config, GeneralConfig},
    stats::Snapshot,
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

fn load_config() -> Config {
    let config_path = Config::config_path();
    if config_path.exists() {
        Config::load(&config_path).unwrap_or_else(|e| {
            warn!("Failed to load config {:?}: {}, using defaults", config_path, e);
            Config::default()
        })
    } else {
        info!("No config file found, using defaults");
        Config::default()
    }
}

fn log_snapshot(snap: &Snapshot, general: &GeneralConfig) {
    info!(
        "Scanned {} processes ({} skipped, {} with partial data)",
        snap.len(),
        snap.skipped.len(),
        snap.errors.len()
    );

    if general.log_top {
        if let Some(top) = &snap.top {
            for p in top.by_cpu.iter().flatten() {
                info!(
                    "top cpu: pid {} {} total {} ms",
                    p.pid,
                    p.name,
                    p.cpu.total_ticks.unwrap_or_default()
                );
            }
            for p in top.by_memory.iter().flatten() {
                info!(
                    "top memory: pid {} {} rss {} bytes",
                    p.pid,
                    p.name,
                    p.memory.rss_bytes.unwrap_or_default()
                );
            }
        }
    }

    match serde_json::to_string(&snap.ordered) {
        Ok(json) => debug!("snapshot: {}", json),
        Err(e) => warn!("Failed to serialize snapshot: {}", e),
    }
}

#[cfg(any(target_os = "linux", windows))]
async fn monitoring_loop(
    stats: std::sync::Arc<proctel_daemon::stats::ProcessStats<proctel_daemon::collector::NativeCollector>>,
    general: GeneralConfig,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(general.sample_interval.max(1)));

    loop {
        interval.tick().await;

        let scanner = std::sync::Arc::clone(&stats);
        match tokio::task::spawn_blocking(move || scanner.fetch_all()).await {
            Ok(Ok(snap)) => log_snapshot(&snap, &general),
            Ok(Err(e)) => error!("Scan failed: {}", e),
            Err(e) => error!("Scan task failed: {}", e),
        }
    }
}

#[cfg(any(target_os = "linux", windows))]
#[tokio::main]
async fn main() -> Result<()> {
    use anyhow::Context;
    use proctel_daemon::stats::ProcessStats;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("proctel starting...");

    let config = load_config();
    let stats = ProcessStats::native(config.stats.clone()).context("invalid name or environment pattern")?;
    let stats = std::sync::Arc::new(stats);

    tokio::select! {
        _ = monitoring_loop(stats, config.general.clone()) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutting down");
        }
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", windows)))]
fn main() -> Result<()> {
    anyhow::bail!("proctel only supports Linux and Windows")
}
