mod core;
mod server;
mod utils;
mod workers;

use crate::utils::log_file::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use crate::workers::args::{Args, Command};
use crate::workers::receiver::StationOutcome;
use crate::workers::station::DirectoryProducer;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    // Initialize the global data directory (must happen before any persistence access)
    crate::utils::data_dir::init(args.conf.as_deref())?;

    // Note: webrtc_ice generates many "unknown TransactionID" warnings for late-arriving
    // STUN responses, which are normal. Filter these out to reduce noise.
    let filter = match args.verbose {
        0 => "warn,capture_relay=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };

    // File layer keeps the full history; stderr shows the same filtered stream.
    let file_layer = FileLogLayer::new(&crate::utils::data_dir::log_path())?;
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match &args.command {
        Command::Server(server) => {
            let tokens = args.token_table(&server.tokens)?;
            let config = server.resolve(tokens, crate::utils::data_dir::database_path());
            crate::server::run(config, sos).await
        }
        Command::Station(station) => {
            let config = station.resolve()?;
            let producer = Arc::new(DirectoryProducer::new(
                config.capture_dir.clone(),
                config.download_base.clone(),
            ));
            crate::workers::station::run(config, producer, sos).await
        }
        Command::Receiver(receiver) => {
            let config = receiver.resolve(crate::utils::data_dir::get().join("downloads"))?;
            let summary = crate::workers::receiver::run(config, sos).await?;

            let mut stations: Vec<_> = summary.stations.iter().collect();
            stations.sort_by(|a, b| a.0.cmp(b.0));
            println!("request {}", summary.request_id);
            for (station_id, outcome) in stations {
                match outcome {
                    StationOutcome::Downloaded { path, bytes } => {
                        println!("  {station_id}: {bytes} bytes -> {}", path.display())
                    }
                    StationOutcome::Failed(error) => println!("  {station_id}: failed ({error})"),
                }
            }
            if summary.succeeded() == 0 {
                anyhow::bail!("no station delivered a file");
            }
            Ok(())
        }
    }
}
