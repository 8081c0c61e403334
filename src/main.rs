use anyhow::Result;
use clap::Parser;
use rs_workflow_stream::{
    cli::Args,
    client::{WorkflowClient, get_or_init, reset_instance},
    config::Config,
    feed::FeedOptions,
    formatter::OutputFormat,
    monitoring::setup_metrics,
    tracing_setup::{LogOptions, setup_tracing},
    transport::StaticToken,
    types::WorkflowEvent,
    ui::{UIController, UIOptions, WorkflowEventReceiver, WorkflowEventSender},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_tracing(&LogOptions {
        level: args.log_level.clone(),
        json: args.json_logs,
        ansi: !args.no_color,
    })?;
    info!(
        "Starting workflow stream client v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_args(&args)?;

    if config.metrics.enabled {
        setup_metrics(config.metrics.port).await?;
        info!("Metrics server started on port {}", config.metrics.port);
    }

    let tokens = Arc::new(StaticToken(args.token.clone()));
    let client = get_or_init(|| WorkflowClient::connect_websocket(config.clone(), tokens))?;

    let (event_tx, event_rx): (WorkflowEventSender, WorkflowEventReceiver) =
        mpsc::unbounded_channel();
    let mut ui = UIController::new(
        client.clone(),
        event_rx,
        args.runs.clone(),
        OutputFormat::from(config.output.format.as_str()),
        UIOptions {
            colored: config.output.colored,
            quiet: config.output.quiet,
            csv_export: config.output.csv_export,
            max_events: config.output.max_printed,
            health_interval: config.health.check_interval,
        },
    );

    let mut feeds = Vec::with_capacity(args.runs.len());
    for run in &args.runs {
        let forward = event_tx.clone();
        let options = FeedOptions::new().on_event(move |event: &WorkflowEvent| {
                let _ = forward.send(event.clone());
            });
        feeds.push(client.subscribe(run.as_str(), options).await?);
    }
    drop(event_tx);

    info!(runs = feeds.len(), "Following workflow runs. Press Ctrl+C to stop...");
    ui.run().await;

    for feed in feeds {
        feed.close().await;
    }
    reset_instance().await;

    info!("Client stopped successfully");
    Ok(())
}
