mod admin;
mod health;
mod problem;
mod router;
mod scheduler;
mod tap;
mod telemetry;
mod trigger;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use reqwest::Client;
use tracing::info;
use url::Url;

use mirrorwatch_probe::{DohResolver, DomainProber, HttpHeadProber, ProbeSettings, PROBE_USER_AGENT};
use mirrorwatch_storage::Database;
use mirrorwatch_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "registry", url = %config.database_url, "database ready");

    let doh_endpoint = Url::parse(&config.probe.doh_endpoint)?;
    let doh_client = Client::builder().user_agent(PROBE_USER_AGENT).build()?;
    let resolver = DohResolver::new(doh_endpoint, doh_client, config.probe.dns_timeout);
    let head = HttpHeadProber::new(config.probe.http_timeout)?;
    let prober = DomainProber::new(
        Arc::new(resolver),
        Arc::new(head),
        ProbeSettings {
            http_timeout: config.probe.http_timeout,
            dns_timeout: config.probe.dns_timeout,
        },
    );

    let tap_hub = tap::TapHub::new();
    let health = health::HealthCheckService::new(
        database.clone(),
        prober,
        tap_hub.clone(),
        config.probe.concurrency,
    );

    if let Some(interval) = config.check_interval {
        scheduler::HealthCheckScheduler::new(health.clone(), interval).spawn();
    }

    let state = router::AppState::new(metrics, tap_hub, database, health);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
