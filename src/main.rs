use clap::Parser;
use color_eyre::eyre::Result;
use socks5_pool::checker::{CheckerConfig, ProxyChecker};
use socks5_pool::config::{Cli, PoolConfig};
use socks5_pool::pool::ProxyPool;
use socks5_pool::refresh::{self, refresh_channel, ScrapeTiming};
use socks5_pool::scraper;
use socks5_pool::socks::Server;
use socks5_pool::status::StatusServer;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("socks5_pool=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = PoolConfig::from_cli(args)?;

    info!("socks5-pool starting...");
    info!("  listen:   {}", config.listen_addr);
    info!("  status:   {}", config.status_addr);
    info!("  source:   {}", config.scrape_url);
    info!("  scrape:   every {:?}", config.scrape_interval);

    let pool = Arc::new(ProxyPool::new());
    let timing = Arc::new(ScrapeTiming::new());
    let checker = Arc::new(ProxyChecker::with_config(
        CheckerConfig::new()
            .with_timeout(config.check_timeout)
            .with_max_concurrent(config.max_concurrent),
    ));

    // Initial scrape + check before serving traffic.
    refresh_pool(&config, &pool, &timing, &checker).await;
    if pool.size() == 0 {
        warn!("no alive proxies found, will retry on next scrape cycle");
    }

    let (refresh_handle, mut refresh_rx) = refresh_channel();

    // Background: periodic scrape + manual refresh.
    {
        let config = config.clone();
        let pool = Arc::clone(&pool);
        let timing = Arc::clone(&timing);
        let checker = Arc::clone(&checker);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.scrape_interval);
            // The first tick of an interval completes immediately; the
            // initial refresh already happened, so consume it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        refresh_pool(&config, &pool, &timing, &checker).await;
                    }
                    Some(()) = refresh_rx.recv() => {
                        info!("manual refresh triggered");
                        refresh_pool(&config, &pool, &timing, &checker).await;
                        ticker.reset();
                    }
                }
            }
        });
    }

    // Background: random proxy rotation every 5-9 minutes.
    tokio::spawn(refresh::rotation_loop(Arc::clone(&pool)));

    // Background: status dashboard.
    {
        let status = Arc::new(StatusServer::new(
            Arc::clone(&pool),
            Arc::clone(&timing),
            refresh_handle,
        ));
        let status_addr = config.status_addr;
        tokio::spawn(async move {
            if let Err(e) = status.run(status_addr).await {
                error!("status server failed: {}", e);
            }
        });
    }

    // SOCKS5 server blocks until shutdown.
    let server = Server::new(config.listen_addr, Arc::clone(&pool));
    tokio::select! {
        result = server.run() => result?,
        _ = signal::ctrl_c() => info!("shutdown signal received"),
    }

    Ok(())
}

/// One refresh cycle: scrape candidates, verify them, swap the pool, record
/// the timing. Scrape failures leave the pool untouched.
async fn refresh_pool(
    config: &PoolConfig,
    pool: &ProxyPool,
    timing: &ScrapeTiming,
    checker: &ProxyChecker,
) {
    let candidates = match scraper::scrape(&config.scrape_url).await {
        Ok(candidates) => candidates,
        Err(e) => {
            error!("scrape failed: {}", e);
            return;
        }
    };

    let alive = checker.check(candidates).await;
    pool.update(alive);
    timing.record(config.scrape_interval);
    info!("pool refreshed: {} alive proxies", pool.size());
}
