//! Output formatting for the CLI.

use std::io::IsTerminal;

use serde::Serialize;

/// Output format for structured data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-friendly text, with ANSI color on a TTY.
    #[default]
    Text,
    /// Machine-parseable JSON.
    Json,
}

impl OutputFormat {
    /// Resolve from the `--json` flag.
    #[must_use]
    pub const fn resolve(json: bool) -> Self {
        if json { Self::Json } else { Self::Text }
    }

    /// Whether ANSI color is appropriate: text format, a TTY on stdout, and
    /// `NO_COLOR` unset.
    #[must_use]
    pub fn should_use_color(self) -> bool {
        self == Self::Text
            && std::env::var_os("NO_COLOR").is_none()
            && std::io::stdout().is_terminal()
    }

    /// Serialize data for `--json` output.
    ///
    /// # Errors
    /// Serialization failures only.
    pub fn serialize<T: Serialize>(self, data: &T) -> anyhow::Result<String> {
        serde_json::to_string_pretty(data)
            .map_err(|e| anyhow::anyhow!("JSON serialization failed: {e}"))
    }
}

/// Wrap `text` in an ANSI color when allowed, pass it through otherwise.
#[must_use]
pub fn paint(format: OutputFormat, code: &str, text: &str) -> String {
    if format.should_use_color() {
        format!("\x1b[{code}m{text}\x1b[0m")
    } else {
        text.to_owned()
    }
}

/// Status prefixes for doctor-style line output.
#[must_use]
pub const fn status_prefix(severity: crate::error::Severity) -> &'static str {
    match severity {
        crate::error::Severity::Critical => "[CRIT]",
        crate::error::Severity::Error => "[FAIL]",
        crate::error::Severity::Warning => "[WARN]",
        crate::error::Severity::Info => "[INFO]",
    }
}
