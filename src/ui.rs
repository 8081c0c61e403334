/// file: src/ui.rs
/// description: ui presentation layer that renders workflow events and client lifecycle changes
use crate::{
    client::WorkflowClient,
    events::{ClientEvent, EventReceiver},
    formatter::{Colors, EventFormatter, OutputFormat},
    monitoring::HealthStatus,
    types::WorkflowEvent,
};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};

pub type WorkflowEventSender = mpsc::UnboundedSender<WorkflowEvent>;
pub type WorkflowEventReceiver = mpsc::UnboundedReceiver<WorkflowEvent>;

pub struct UIOptions {
    pub colored: bool,
    pub quiet: bool,
    pub csv_export: bool,
    pub max_events: u64,
    pub health_interval: Duration,
}

pub struct UIController {
    client: WorkflowClient,
    lifecycle: EventReceiver,
    workflow_events: WorkflowEventReceiver,
    formatter: EventFormatter,
    runs: Vec<String>,
    quiet_mode: bool,
    header_printed: bool,
    max_events: Option<u64>,
    health_interval: Duration,
    started: Instant,
}

impl UIController {
    pub fn new(
        client: WorkflowClient,
        workflow_events: WorkflowEventReceiver,
        runs: Vec<String>,
        format: OutputFormat,
        options: UIOptions,
    ) -> Self {
        Self {
            lifecycle: client.lifecycle(),
            client,
            workflow_events,
            formatter: EventFormatter::new(
                format,
                options.colored,
                options.quiet,
                options.csv_export,
            ),
            runs,
            quiet_mode: options.quiet,
            header_printed: false,
            max_events: (options.max_events > 0).then_some(options.max_events),
            health_interval: options.health_interval,
            started: Instant::now(),
        }
    }

    /// Runs until Ctrl+C, a terminal connection failure or the event limit.
    pub async fn run(&mut self) {
        self.print_startup_banner();

        let mut health = tokio::time::interval(self.health_interval.max(Duration::from_secs(1)));
        health.tick().await;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    self.formatter.print_status("STOPPING", "Interrupted, shutting down");
                    break;
                }
                lifecycle = self.lifecycle.recv() => match lifecycle {
                    Ok(event) => {
                        if !self.handle_client_event(event) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Lifecycle receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(event) = self.workflow_events.recv() => {
                    if !self.handle_workflow_event(&event) {
                        break;
                    }
                }
                _ = health.tick() => self.log_health(),
            }
        }

        self.formatter
            .print_summary(self.started.elapsed().as_secs());
    }

    fn handle_client_event(&mut self, event: ClientEvent) -> bool {
        match event {
            ClientEvent::Connecting { url } => {
                self.formatter.print_status("CONNECTING", &url);
            }
            ClientEvent::Connected {
                connection_id,
                resubscribed,
            } => {
                self.formatter.print_status(
                    "CONNECTED",
                    &format!("ID: {} ({} runs subscribed)", connection_id, resubscribed),
                );
                self.ensure_header();
            }
            ClientEvent::SubscriptionSent { topic } => {
                self.formatter.print_status("SUBSCRIBED", &topic);
            }
            ClientEvent::UnsubscriptionSent { topic } => {
                debug!(topic = %topic, "Unsubscribed");
            }
            ClientEvent::FrameDiscarded { reason } => {
                debug!("Frame discarded: {}", reason);
            }
            ClientEvent::Reconnecting { attempt, delay } => {
                self.formatter.print_status(
                    "RECONNECTING",
                    &format!("Attempt {} in {:.1}s...", attempt, delay.as_secs_f64()),
                );
            }
            ClientEvent::Disconnected { reason } => {
                self.formatter.print_status("DISCONNECTED", &reason);
            }
            ClientEvent::Failed { failure } => {
                self.formatter.print_status("ERROR", &failure.to_string());
                return false;
            }
            ClientEvent::Stopping => {
                self.formatter.print_status("STOPPING", "Client shutting down");
                return false;
            }
        }
        true
    }

    fn handle_workflow_event(&mut self, event: &WorkflowEvent) -> bool {
        self.ensure_header();
        self.formatter.print_event(event);

        if let Some(max_events) = self.max_events
            && self.formatter.event_count() >= max_events
        {
            self.formatter.print_status(
                "STOPPING",
                &format!("Reached configured max events ({max_events})"),
            );
            return false;
        }
        true
    }

    fn ensure_header(&mut self) {
        if !self.header_printed {
            self.formatter.print_header();
            self.header_printed = true;
        }
    }

    fn log_health(&self) {
        let health = HealthStatus::from_stats(&self.client.stats(), self.started.elapsed());
        if health.is_healthy {
            info!(health = %health.to_json(), "Health check");
        } else {
            warn!(health = %health.to_json(), "Health check");
        }
    }

    fn print_startup_banner(&self) {
        if self.quiet_mode {
            return;
        }

        let runs = self.runs.join(", ");
        println!();
        println!(
            "{}{}╔══════════════════════════════════════════════════════════════════════════════╗{}",
            Colors::BOLD,
            Colors::BRIGHT_CYAN,
            Colors::RESET
        );
        println!(
            "{}{}║                          WORKFLOW EVENT STREAM                               ║{}",
            Colors::BOLD,
            Colors::BRIGHT_CYAN,
            Colors::RESET
        );
        println!(
            "{}{}╚══════════════════════════════════════════════════════════════════════════════╝{}",
            Colors::BOLD,
            Colors::BRIGHT_CYAN,
            Colors::RESET
        );
        println!(
            " Version: {}{}{} │ Runs: {}{}{}",
            Colors::BRIGHT_GREEN,
            env!("CARGO_PKG_VERSION"),
            Colors::RESET,
            Colors::BRIGHT_YELLOW,
            runs,
            Colors::RESET
        );
        println!();
    }
}
