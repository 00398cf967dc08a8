use sentinel_gateway::config::Config;
use sentinel_gateway::server::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.general.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let server = Server::bind(cfg.build()?)?;
    let shutdown = server.shutdown_handle();
    let mut event_loop = tokio::task::spawn_blocking(move || server.run());

    tokio::select! {
        res = &mut event_loop => {
            res??;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            shutdown.stop();
            event_loop.await??;
        }
    }

    Ok(())
}
