use std::path::PathBuf;

use clap::Parser;
use eyre::{Result, WrapErr};
use meadowlark::cluster::{self, Supervisor, WorkerLink};
use meadowlark::config::Config;
use meadowlark::middleware::FaultIsolation;
use meadowlark::{Failsafe, Server, site, telemetry};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Worker processes to supervise; 0 serves from this process
    #[clap(short, long)]
    workers: Option<usize>,

    /// Port to listen on
    #[clap(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).wrap_err("failed to load configuration")?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    telemetry::init(config.env)?;

    let worker = WorkerLink::from_env()?;
    if worker.is_none() && config.workers > 0 {
        info!(workers = config.workers, "starting in cluster mode");
        Supervisor::new(config.workers)?.run().await?;
        return Ok(());
    }

    let addr = config.listen_addr();
    let server = match worker {
        Some(_) => Server::bind_shared(&addr),
        None => Server::bind(&addr),
    }
    .wrap_err_with(|| format!("failed to bind {addr}"))?;
    let handle = server.handle();
    let failsafe = Failsafe::new(config.failsafe());

    let mut isolation = FaultIsolation::builder(handle.clone(), failsafe.clone())
        .error_page(site::server_error)
        .backstop();
    if let Some(link) = worker {
        info!(worker = link.id(), "starting as cluster worker");
        isolation = isolation.worker(link);

        let handle = handle.clone();
        tokio::spawn(async move {
            cluster::released().await;
            info!("released by supervisor");
            handle.stop_accepting();
        });
    }

    info!(
        env = ?config.env,
        "Meadowlark started on http://localhost:{}; press Ctrl-C to terminate",
        server.local_addr().port()
    );
    server.serve(site::router(isolation.build(), handle)).await?;

    // A faulted process does not outlive its drain.
    if failsafe.is_armed() {
        failsafe.expedite();
    }
    Ok(())
}
