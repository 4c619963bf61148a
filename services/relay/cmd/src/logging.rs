//! Console log format shared by the relay binaries.
//!
//! Lines look like
//! `[2024-01-01 12:00:00.000] [relay-session       ] [ℹ INFO   ] message key=value`.
//! The bracketed name is the service name, or `<service>-<component>` when the
//! event carries a `component` field.

use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SERVICE_NAME_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 9;

/// Log an info event tagged with a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log a warning tagged with a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Install the global subscriber.
///
/// `crates` get `level`; everything else stays at `info`.
pub fn init(service_name: &str, level: &str, crates: &[&str]) -> anyhow::Result<()> {
    let mut env_filter = EnvFilter::new("info");
    for name in crates {
        env_filter = env_filter.add_directive(format!("{}={}", name, level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(RedbLogFormatter::new(service_name))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}

/// Event formatter with fixed-width service and level columns
pub struct RedbLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl RedbLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: colors_supported(),
        }
    }

    #[cfg(test)]
    fn without_colors(mut self) -> Self {
        self.color_enabled = false;
        self
    }

    fn format_service_name(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SERVICE_NAME_WIDTH {
            let cut: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn format_log_level(level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn render(&self, level: &tracing::Level, fields: &FieldVisitor, timestamp: &str) -> String {
        let color = self.color_for_level(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        let mut line = format!(
            "{}[{}] [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            self.format_service_name(fields.component.as_deref()),
            color,
            Self::format_log_level(level),
            reset,
            fields.message
        );
        for (name, value) in &fields.extra {
            line.push_str(&format!(" {}={}", name, value));
        }
        line.push_str(reset);
        line
    }
}

impl<S, N> FormatEvent<S, N> for RedbLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();

        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        writeln!(writer, "{}", self.render(event.metadata().level(), &fields, &timestamp))
    }
}

/// Pulls `message` and `component` out of an event; keeps the rest in order
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.record_str(field, &unquoted);
    }
}

fn colors_supported() -> bool {
    std::env::var("TERM").map(|t| t != "dumb").unwrap_or(false) && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_column_is_fixed_width() {
        let formatter = RedbLogFormatter::new("relay").without_colors();
        assert_eq!(formatter.format_service_name(None), format!("{:<20}", "relay"));
        assert_eq!(formatter.format_service_name(Some("http")), format!("{:<20}", "relay-http"));

        let long = formatter.format_service_name(Some("a-very-long-component-name"));
        assert_eq!(long.chars().count(), SERVICE_NAME_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_render_appends_extra_fields() {
        let formatter = RedbLogFormatter::new("relay").without_colors();
        let fields = FieldVisitor {
            message: "Session closed".to_string(),
            component: None,
            extra: vec![("key", "room-42".to_string()), ("outcome", "shutdown".to_string())],
        };

        let line = formatter.render(&tracing::Level::INFO, &fields, "2024-01-01 00:00:00.000");
        assert_eq!(
            line,
            format!(
                "[2024-01-01 00:00:00.000] [{:<20}] [{:<9}] Session closed key=room-42 outcome=shutdown",
                "relay", "ℹ INFO"
            )
        );
    }
}
