use std::cell::OnceCell;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use keel_core::{InstallStatus, InstallationState};
use keel_installer::ExecutionObserver;
use keel_planner::{BackupSnapshot, Step, TransitionPlan};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    if std::io::stdout().is_terminal() && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        let line = render_status_line(self.style, status, message);
        match (self.style, status_badge_style(status)) {
            (OutputStyle::Rich, Some(badge_style)) => {
                let badge = format!("[{}]", status.to_ascii_uppercase());
                println!(
                    "{}",
                    line.replacen(&badge, &colorize(badge_style, &badge), 1)
                );
            }
            _ => println!("{line}"),
        }
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.style, title) {
            println!();
            println!("{}", colorize(section_style(), &line));
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_progress(self, label: &str) -> StepProgress {
        StepProgress::new(self.style, label)
    }
}

/// Progress display for one transition, fed by executor callbacks.
///
/// The bar is created once the executor reports the plan, which for
/// `resume` is only known after the checkpoint has been read.
pub(crate) struct StepProgress {
    style: OutputStyle,
    label: String,
    progress_bar: OnceCell<ProgressBar>,
    started_at: Instant,
}

impl StepProgress {
    fn new(style: OutputStyle, label: &str) -> Self {
        Self {
            style,
            label: label.to_string(),
            progress_bar: OnceCell::new(),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn finish(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        println!(
            "{} {}/{} steps in {}",
            colorize(progress_label_style(), &self.label),
            progress_bar.position(),
            progress_bar.length().unwrap_or_default(),
            format_elapsed(self.started_at.elapsed())
        );
    }
}

impl ExecutionObserver for StepProgress {
    fn transition_started(&self, plan: &TransitionPlan, first_step: usize) {
        if self.style != OutputStyle::Rich || plan.steps.is_empty() {
            return;
        }
        let progress_bar = self
            .progress_bar
            .get_or_init(|| new_step_bar(plan.steps.len() as u64, &self.label));
        progress_bar.set_position(first_step as u64);
    }

    fn step_started(&self, _index: usize, step: &Step) {
        if let Some(progress_bar) = self.progress_bar.get() {
            progress_bar.set_message(step.to_string());
        }
    }

    fn step_committed(&self, _index: usize, _step: &Step) {
        if let Some(progress_bar) = self.progress_bar.get() {
            progress_bar.inc(1);
        }
    }

    fn step_rolled_back(&self, _index: usize, step: &Step) {
        if let Some(progress_bar) = self.progress_bar.get() {
            progress_bar.set_message(format!("undo {step}"));
        }
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("[{}] {message}", status.to_ascii_uppercase()),
    }
}

pub(crate) fn format_state_lines(
    state: &InstallationState,
    active: Option<&str>,
    snapshots: &[BackupSnapshot],
) -> Vec<String> {
    let mut lines = vec![
        format!("version: {}", state.current_version()),
        format!("status: {}", state.status()),
        format!(
            "last transition: {}",
            state.last_transition_id().unwrap_or("none")
        ),
        format!("active: {}", active.unwrap_or("none")),
    ];

    if state.manifest().is_empty() {
        lines.push("components: none".to_string());
    } else {
        lines.push(format!("components ({}):", state.manifest().len()));
        for (name, component) in state.manifest().iter() {
            let short = component.checksum.get(..12).unwrap_or(&component.checksum);
            lines.push(format!("  {name} {} sha256:{short}", component.version));
        }
    }

    let targets = snapshots
        .iter()
        .filter(|snapshot| !snapshot.version.same_precedence(state.current_version()))
        .map(|snapshot| snapshot.version.to_string())
        .collect::<Vec<_>>();
    if targets.is_empty() {
        lines.push("rollback targets: none".to_string());
    } else {
        lines.push(format!("rollback targets: {}", targets.join(", ")));
    }

    match state.status() {
        InstallStatus::Stable => {}
        InstallStatus::InProgress => {
            lines.push("hint: run `keelctl resume` or `keelctl abort`".to_string())
        }
        InstallStatus::Failed => lines.push("hint: run `keelctl repair`".to_string()),
    }
    lines
}

pub(crate) fn format_plan_lines(plan: &TransitionPlan) -> Vec<String> {
    plan.steps
        .iter()
        .enumerate()
        .map(|(index, step)| format!("  {:>2}. {step}", index + 1))
        .collect()
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(format!("== {title} ==")),
    }
}

fn status_badge_style(status: &str) -> Option<Style> {
    let color = match status {
        "ok" => AnsiColor::BrightGreen,
        "warn" => AnsiColor::BrightYellow,
        "error" => AnsiColor::BrightRed,
        "step" => AnsiColor::BrightCyan,
        _ => return None,
    };
    Some(Style::new().fg_color(Some(color.into())).effects(Effects::BOLD))
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn new_step_bar(total: u64, label: &str) -> ProgressBar {
    let progress_bar = ProgressBar::new(total.max(1));
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.cyan.bold} {msg:<28} [{bar:20.cyan/blue}] {pos:>2}/{len:2} {elapsed_precise}",
    ) {
        progress_bar.set_style(style.progress_chars("=>-"));
    }
    progress_bar.set_message(label.to_string());
    progress_bar.enable_steady_tick(Duration::from_millis(80));
    progress_bar
}
