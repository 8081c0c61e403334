use crate::types::{Phase, WorkflowEvent};

// ANSI color codes
pub struct Colors;

impl Colors {
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
    pub const DIM: &'static str = "\x1b[2m";

    pub const RED: &'static str = "\x1b[31m";
    pub const YELLOW: &'static str = "\x1b[33m";
    pub const WHITE: &'static str = "\x1b[37m";
    pub const GRAY: &'static str = "\x1b[90m";

    pub const BRIGHT_RED: &'static str = "\x1b[91m";
    pub const BRIGHT_GREEN: &'static str = "\x1b[92m";
    pub const BRIGHT_YELLOW: &'static str = "\x1b[93m";
    pub const BRIGHT_BLUE: &'static str = "\x1b[94m";
    pub const BRIGHT_MAGENTA: &'static str = "\x1b[95m";
    pub const BRIGHT_CYAN: &'static str = "\x1b[96m";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Csv,
    Json,
    Minimal,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "csv" => OutputFormat::Csv,
            "json" => OutputFormat::Json,
            "minimal" => OutputFormat::Minimal,
            _ => OutputFormat::Table,
        }
    }
}

const TABLE_TOP: &str =
    "┌─────────┬──────────────────────┬──────────────────────┬───────┬────────┬──────────┐";
const TABLE_SEPARATOR: &str =
    "├─────────┼──────────────────────┼──────────────────────┼───────┼────────┼──────────┤";

pub struct EventFormatter {
    format: OutputFormat,
    colored: bool,
    quiet: bool,
    csv_export: bool,
    event_count: u64,
}

impl EventFormatter {
    pub fn new(format: OutputFormat, colored: bool, quiet: bool, csv_export: bool) -> Self {
        Self {
            format,
            colored,
            quiet,
            csv_export,
            event_count: 0,
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn print_header(&self) {
        if self.quiet {
            return;
        }
        match self.format {
            OutputFormat::Table => {
                for line in self.table_header() {
                    println!("{}", line);
                }
            }
            OutputFormat::Csv => println!("{}", Self::csv_header()),
            OutputFormat::Json | OutputFormat::Minimal => {}
        }
    }

    pub fn print_event(&mut self, event: &WorkflowEvent) {
        self.event_count += 1;
        println!("{}", self.format_event(event));

        if self.csv_export {
            eprintln!("{}", self.csv_row(event));
        }
    }

    /// Renders `event` as the row for the current count.
    pub fn format_event(&self, event: &WorkflowEvent) -> String {
        match self.format {
            OutputFormat::Table => self.table_row(event),
            OutputFormat::Csv => self.csv_row(event),
            OutputFormat::Json => self.json_row(event),
            OutputFormat::Minimal => self.minimal_row(event),
        }
    }

    fn paint(&self, color: &'static str) -> &'static str {
        if self.colored { color } else { "" }
    }

    fn phase_color(&self, phase: Phase) -> &'static str {
        self.paint(match phase {
            Phase::Start => Colors::BRIGHT_BLUE,
            Phase::End => Colors::BRIGHT_GREEN,
            Phase::Fail => Colors::BRIGHT_RED,
        })
    }

    fn table_header(&self) -> [String; 3] {
        let frame = |line: &str| {
            if self.colored {
                format!("{}{}{}{}", Colors::BOLD, Colors::GRAY, line, Colors::RESET)
            } else {
                line.to_string()
            }
        };
        let labels = format!(
            "│ {:<7} │ {:<20} │ {:<20} │ {:<5} │ {:<6} │ {:<8} │",
            "COUNT", "RUN", "NODE", "PHASE", "ISSUES", "TIME"
        );
        [frame(TABLE_TOP), frame(&labels), frame(TABLE_SEPARATOR)]
    }

    fn table_row(&self, event: &WorkflowEvent) -> String {
        let gray = self.paint(Colors::GRAY);
        let reset = self.paint(Colors::RESET);
        let issue_color = if event.error_count() > 0 {
            self.paint(Colors::RED)
        } else if event.issues.is_empty() {
            ""
        } else {
            self.paint(Colors::YELLOW)
        };

        format!(
            "{gray}│{reset} {:<7} {gray}│{reset} {:<20} {gray}│{reset} {:<20} {gray}│{reset} {}{:<5}{reset} {gray}│{reset} {}{:<6}{reset} {gray}│{reset} {:<8} {gray}│{reset}",
            self.event_count,
            truncate(&event.run_id, 20),
            truncate(&event.node_name, 20),
            self.phase_color(event.phase),
            event.phase.as_str(),
            issue_color,
            event.issues.len(),
            event.datetime_local().format("%H:%M:%S"),
        )
    }

    fn csv_header() -> &'static str {
        "count,run_id,node_name,phase,issues,errors,local_time,timestamp"
    }

    fn csv_row(&self, event: &WorkflowEvent) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.event_count,
            csv_field(&event.run_id),
            csv_field(&event.node_name),
            event.phase,
            event.issues.len(),
            event.error_count(),
            event.datetime_local().format("%Y-%m-%d %H:%M:%S"),
            event.timestamp.to_rfc3339()
        )
    }

    fn json_row(&self, event: &WorkflowEvent) -> String {
        let json_obj = serde_json::json!({
            "count": self.event_count,
            "run_id": event.run_id,
            "node_name": event.node_name,
            "phase": event.phase,
            "timestamp": event.timestamp,
            "metrics": event.metrics,
            "issues": event.issues,
            "data": event.data,
        });
        serde_json::to_string(&json_obj).unwrap_or_default()
    }

    fn minimal_row(&self, event: &WorkflowEvent) -> String {
        let symbol = match event.phase {
            Phase::Start => "▶",
            Phase::End => "✓",
            Phase::Fail => "✗",
        };
        format!(
            "{} {}{}{} {} {}",
            event.datetime_local().format("%H:%M:%S"),
            self.phase_color(event.phase),
            symbol,
            self.paint(Colors::RESET),
            event.node_name,
            event.run_id
        )
    }

    pub fn print_status(&self, status: &str, message: &str) {
        if self.quiet && status != "ERROR" {
            return;
        }

        let (color, symbol) = match status {
            "CONNECTING" => (Colors::BRIGHT_YELLOW, "*"),
            "CONNECTED" => (Colors::BRIGHT_GREEN, "+"),
            "SUBSCRIBED" => (Colors::BRIGHT_BLUE, "~"),
            "RECONNECTING" => (Colors::BRIGHT_YELLOW, ">"),
            "DISCONNECTED" => (Colors::BRIGHT_RED, "X"),
            "ERROR" => (Colors::BRIGHT_RED, "!"),
            "STOPPING" => (Colors::BRIGHT_MAGENTA, "!"),
            _ => (Colors::WHITE, "-"),
        };

        println!(
            "{}{}[{}]{} {} {}",
            self.paint(Colors::BOLD),
            self.paint(color),
            status,
            self.paint(Colors::RESET),
            symbol,
            message
        );
    }

    pub fn print_summary(&self, duration_secs: u64) {
        if self.quiet {
            return;
        }

        let rate = if duration_secs > 0 {
            self.event_count as f64 / duration_secs as f64
        } else {
            0.0
        };

        println!();
        println!(
            "{}{}Summary: {} events in {}s ({:.2} events/sec){}",
            self.paint(Colors::BOLD),
            self.paint(Colors::BRIGHT_CYAN),
            self.event_count,
            duration_secs,
            rate,
            self.paint(Colors::RESET)
        );
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut out: String = value.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
