use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use humio_exporter::{
    api::{self, ApiState},
    client::HttpJobClient,
    config::{self, Cli},
    logging,
    metrics::MetricRegistry,
    poller::PollLoop,
    ExporterError, Result,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logger(&cli.log_level, cli.log_format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => {
            info!("Humio_exporter exited with exit 0");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Humio_exporter exited due to error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let queries = config::load(&cli.config)?;
    let settings = cli.poll_settings()?;
    let addr = cli.listen_addr()?;

    let mut registry = MetricRegistry::new()?;
    for query in &queries {
        registry.declare(&query.metric_name, &query.labels)?;
    }
    let registry = Arc::new(registry);

    let client = Arc::new(HttpJobClient::new(
        &cli.humio_url,
        cli.api_token.clone(),
        cli.request_timeout()?,
    )?);

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    let server_shutdown = CancellationToken::new();
    let server_stop = server_shutdown.clone();
    let mut server = tokio::spawn(api::serve(
        addr,
        ApiState {
            registry: registry.clone(),
        },
        async move { server_stop.cancelled().await },
    ));

    let poll = PollLoop::start(client, registry, &queries, settings, &token).await?;
    let mut polling = std::pin::pin!(poll.run(token.clone()));

    let outcome = tokio::select! {
        outcome = &mut polling => outcome,
        served = &mut server => {
            // The server only stops on its own when it fails; wind the
            // loop down so the jobs still get cancelled.
            token.cancel();
            let _ = polling.await;
            return match served {
                Ok(Ok(())) => Err(ExporterError::Internal("metrics server stopped".to_string())),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ExporterError::Internal(e.to_string())),
            };
        }
    };

    server_shutdown.cancel();
    let _ = server.await;
    outcome
}

async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                token.cancel();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("Received os signal 'interrupt'"),
            _ = term.recv() => info!("Received os signal 'terminated'"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received os signal 'interrupt'");
    }

    token.cancel();
}
