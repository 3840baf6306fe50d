use crate::args::AnnounceArgs;
use clap::Parser;
use fx_announce::announce::{AnnounceError, Announcer};
use fx_announce_logging::FxLogger;
use log::{debug, info};
use std::io;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

mod args;

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = AnnounceArgs::parse();

    let mut logger = FxLogger::builder();
    logger.root_level(args.log_level);
    if let Some(path) = &args.log_file {
        logger.log_file(path);
    }
    let _logger = logger.build().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let cancel = CancellationToken::new();
    let announcer = Announcer::new(args.bind, args.config(), &cancel)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let request = args.request();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Received interrupt signal, cancelling the announce");
            signal_cancel.cancel();
        }
    });

    debug!("Announcing {} from {}", args, announcer);
    let start = Instant::now();
    let result = match announcer
        .announce(args.tracker.as_str(), &request, &cancel)
        .await
    {
        Ok(e) => e,
        Err(AnnounceError::Cancelled) => {
            info!("Announce to {} has been cancelled", args.tracker);
            return Ok(());
        }
        Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
    };
    let time_taken = start.elapsed();

    info!(
        "Tracker {} responded in {}.{:03} seconds",
        args.tracker,
        time_taken.as_secs(),
        time_taken.subsec_millis()
    );
    for peer in &result.peers {
        println!("{}", peer);
    }
    println!(
        "{} peers, next announce in {}s",
        result.peers.len(),
        result.interval.as_secs()
    );

    Ok(())
}
