//! Terminal output: spinners and colored text.
//!
//! Uses `indicatif` for the drain spinner and `console` for styling. Logs go
//! to stderr through `tracing`; everything here is the human-facing result on
//! stdout.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use certflow::audit::AuditRecord;
use certflow::orchestrator::DrainReport;
use certflow::service::{ApplicationView, Statistics};
use certflow::state_machine::{Application, State};

/// Spinner shown while the outbox drains.
pub struct DrainProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl DrainProgress {
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn update(&self, message: &str) {
        self.pb.set_message(message.to_string());
    }

    pub fn stop(&self, message: &str) {
        self.pb.finish_and_clear();
        println!("  {} {message}", self.yellow.apply_to("■"));
    }

    /// Stop the spinner and print the totals. Dead letters show in red,
    /// pending retries in yellow.
    pub fn finish(&self, report: &DrainReport) {
        self.pb.finish_and_clear();
        println!(
            "  {} {} delivered ({} already applied)",
            self.green.apply_to("✓"),
            report.delivered,
            report.skipped
        );
        if report.retried > 0 {
            println!(
                "  {} {} scheduled for retry",
                self.yellow.apply_to("↻"),
                report.retried
            );
        }
        if report.dead_lettered > 0 {
            println!(
                "  {} {} dead-lettered, application put on hold",
                self.red.apply_to("✗"),
                report.dead_lettered
            );
        }
    }
}

fn state_style(state: State) -> Style {
    match state {
        State::CertificateIssued | State::Approved => Style::new().green().bold(),
        State::Rejected | State::Cancelled | State::Expired | State::DocumentRejected => {
            Style::new().red().bold()
        }
        State::OnHold | State::DocumentRevision => Style::new().yellow().bold(),
        _ => Style::new().cyan(),
    }
}

/// One line per step while the demo advances.
pub fn print_step(app: &Application) {
    let dim = Style::new().dim();
    println!(
        "  {} {:<24} {}",
        dim.apply_to(format!("v{:<3}", app.version)),
        state_style(app.current_state).apply_to(app.current_state),
        dim.apply_to(format!("step {}/8", app.current_step)),
    );
}

pub fn print_view(view: &ApplicationView) {
    let app = &view.application;
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    println!(
        "{} {}  {}",
        bold.apply_to(&app.application_number),
        dim.apply_to(app.id),
        state_style(app.current_state).apply_to(app.current_state)
    );
    println!(
        "  applicant {}  version {}  step {}/8  payment cycle {}",
        app.applicant_id, app.version, app.current_step, app.payment_cycle
    );
    if let Some(from) = app.held_from {
        println!("  held from {}", state_style(from).apply_to(from));
    }
    println!();
    for entry in &view.history {
        let from = entry
            .from_state
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "  {} {} {} → {}  {} by {}",
            dim.apply_to(format!("v{:<3}", entry.version)),
            dim.apply_to(entry.at.format("%Y-%m-%d %H:%M:%S")),
            from,
            state_style(entry.to_state).apply_to(entry.to_state),
            bold.apply_to(&entry.action),
            entry.actor
        );
        if !entry.note.is_empty() {
            println!("        {}", dim.apply_to(&entry.note));
        }
    }
}

pub fn print_list(apps: &[Application]) {
    if apps.is_empty() {
        println!("  no applications");
        return;
    }
    for app in apps {
        println!(
            "  {}  {}  {:<24} v{}",
            app.application_number,
            app.id,
            state_style(app.current_state).apply_to(app.current_state),
            app.version
        );
    }
}

pub fn print_statistics(stats: &Statistics) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to("─── Statistics ───"));
    println!("  total {}  active {}", stats.total, stats.active);
    println!(
        "  issued {}  rejected {}  on hold {}",
        stats.certificates_issued, stats.rejected, stats.on_hold
    );
    if let Some(ms) = stats.average_completion_ms {
        println!("  average completion {:.1}s", ms as f64 / 1000.0);
    }
    for (state, count) in &stats.by_state {
        println!("  {:<24} {count}", state_style(*state).apply_to(state));
    }
}

/// Pretty JSON audit summary.
pub fn print_audit(record: &AuditRecord) {
    let style = state_style(record.current_state);
    println!();
    println!("{}", style.apply_to("─── Audit Record ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(record).unwrap_or_default()
    );
}
