use crate::channels::errors::ErrorEvent;
use crate::event_bus::Event;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta / dark pink
pub const RESET_COLOR: &str = "\x1b[0m";

/// Rendered output for a telemetry item that can be consumed by sinks.
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> EventRender;
    fn render_errors(&self, errors: &[ErrorEvent]) -> Vec<EventRender>;
}

/// Controls whether rendered output carries ANSI color codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FormatterMode {
    /// Detect TTY-ness of stderr and color accordingly.
    #[default]
    Auto,
    Colored,
    Plain,
}

impl FormatterMode {
    fn colored(self) -> bool {
        match self {
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
            FormatterMode::Auto => std::io::IsTerminal::is_terminal(&std::io::stderr()),
        }
    }
}

#[derive(Default)]
pub struct PlainFormatter {
    colored: bool,
}

impl PlainFormatter {
    pub fn new() -> Self {
        Self {
            colored: FormatterMode::Auto.colored(),
        }
    }

    pub fn with_mode(mode: FormatterMode) -> Self {
        Self {
            colored: mode.colored(),
        }
    }

    fn color(&self, code: &str, text: &str) -> String {
        if self.colored {
            format!("{code}{text}{RESET_COLOR}")
        } else {
            text.to_string()
        }
    }
}

impl PlainFormatter {
    fn format_error_chain(
        &self,
        error: &crate::channels::errors::LadderError,
        indent: usize,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(cause) = &error.cause {
            let indent_str = "  ".repeat(indent);
            lines.push(format!(
                "{}\n",
                self.color(LINE_COLOR, &format!("{}cause: {}", indent_str, cause.message))
            ));
            lines.extend(self.format_error_chain(cause, indent + 1));
        }
        lines
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> EventRender {
        let line = format!("{}\n", self.color(LINE_COLOR, &event.to_string()));
        EventRender {
            context: event.scope_label().map(|s| s.to_string()),
            lines: vec![line],
        }
    }

    fn render_errors(&self, errors: &[ErrorEvent]) -> Vec<EventRender> {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mut lines = Vec::new();
                let scope_str = self.color(CONTEXT_COLOR, &format!("{:?}", e.scope));
                lines.push(format!("[{}] {} | {}\n", i, e.when, scope_str));
                lines.push(format!(
                    "{}\n",
                    self.color(LINE_COLOR, &format!("  error: {}", e.error.message))
                ));
                lines.extend(self.format_error_chain(&e.error, 1));
                if !e.tags.is_empty() {
                    lines.push(format!(
                        "{}\n",
                        self.color(LINE_COLOR, &format!("  tags: {:?}", e.tags))
                    ));
                }
                if !e.context.is_null() {
                    lines.push(format!(
                        "{}\n",
                        self.color(LINE_COLOR, &format!("  context: {}", e.context))
                    ));
                }
                EventRender {
                    context: Some(format!("{:?}", e.scope)),
                    lines,
                }
            })
            .collect()
    }
}
