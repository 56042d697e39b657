use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use chairbook::clock::SystemClock;
use chairbook::config::Config;
use chairbook::outbound::{LogAuditSink, LogNotifier};
use chairbook::ports::Ports;
use chairbook::reminder::ReminderScheduler;
use chairbook::store::MemoryStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    chairbook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(MemoryStore::open(&config.wal_path())?);
    let ports = Ports::from_store(store.clone(), Arc::new(LogAuditSink), Arc::new(LogNotifier));

    let scheduler = ReminderScheduler::new(&ports, Arc::new(SystemClock), config.reminder());
    let handle = scheduler.start();

    info!("chairbook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  bookings: {}", store.booking_count());
    info!("  utc_offset: {}", config.utc_offset);
    info!(
        "  reminders: daily at {:02}:00, checked every {}s",
        config.reminder_hour,
        config.reminder_tick.as_secs()
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping reminder scheduler");
    scheduler.stop();
    handle.await?;
    info!("chairbook stopped");
    Ok(())
}
