use anyhow::Context;
use rombridge::config::{self, AppSettings};
use rombridge::logging;
use rombridge::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_dir = config::get_config_dir()?;
    std::fs::create_dir_all(&config_dir).context("creating config directory")?;
    let filter = AppSettings::load(&config_dir)
        .map(|s| s.logging.filter)
        .unwrap_or_else(|_| logging::DEFAULT_LOG_FILTER.to_string());
    logging::init_tracing(&filter);

    let state = AppState::load().context("loading application state")?;

    let local = state.local_device.device();
    println!(
        "{:<24} local      {:>5.1}% used{}",
        local.name,
        local.storage_usage_percent(),
        if local.has_low_storage() { " (low storage)" } else { "" }
    );

    let connections = state.repository.list_connections();
    let reports = state.manager.check_all_connection_statuses(&connections, true).await;
    for connection in &connections {
        let Some(report) = reports.iter().find(|r| r.connection_id == connection.id) else {
            continue;
        };
        let marker = if connection.is_default { "*" } else { " " };
        let status = format!("{:?}", report.status).to_lowercase();
        let detail = report.last_error.as_deref().map(|e| format!(" ({})", e)).unwrap_or_default();
        println!(
            "{}{:<23} {:<10} {}{}",
            marker,
            connection.name,
            status,
            connection.connection_string(),
            detail
        );
    }

    Ok(())
}
