//! Output formatters for test results
//!
//! Provides JSON, Table, and summary output formats.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;

use crate::models::{RunSummary, TestResult, TestStatus, TestUnit};
use crate::scheduling::{ConstraintScheduler, DependencyResolver};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Static view of a plan: constraint groups and dependency edges
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Listing {
    /// Class name to test ids, in discovery order
    pub classes: BTreeMap<String, Vec<String>>,
    pub constraint_groups: Vec<Vec<String>>,
    /// (dependent, dependency)
    pub edges: Vec<(String, String)>,
    pub deselected: Vec<String>,
}

impl Listing {
    pub fn from_units(units: &[TestUnit], max_passes: usize) -> Self {
        let mut resolver = DependencyResolver::new(max_passes);
        let mut listing = Listing::default();
        for unit in units {
            resolver.register(unit);
            listing
                .classes
                .entry(unit.class_name.clone())
                .or_default()
                .push(unit.id.clone());
            if !unit.selected {
                listing.deselected.push(unit.id.clone());
            }
        }
        resolver.seal();

        listing.constraint_groups = ConstraintScheduler::groups(
            units
                .iter()
                .map(|u| (u.id.as_str(), u.constraint_keys.as_slice())),
        );
        listing.edges = resolver.edges();
        listing
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        if self.format == OutputFormat::JsonPretty {
            serde_json::to_string_pretty(value).unwrap_or_default()
        } else {
            serde_json::to_string(value).unwrap_or_default()
        }
    }

    /// Format a single test result
    pub fn format_result(&self, result: &TestResult) -> String {
        match self.format {
            OutputFormat::Table => self.format_result_table(result),
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(result),
            OutputFormat::Summary => self.format_result_summary(result),
        }
    }

    fn status_label(&self, status: TestStatus) -> String {
        let label = format!("{} {}", status.symbol(), status);
        if !self.colorize {
            return label;
        }
        let color = match status {
            TestStatus::Passed => "32",
            TestStatus::Failed => "31",
            TestStatus::Skipped => "33",
        };
        format!("\x1b[{color}m{label}\x1b[0m")
    }

    fn format_result_table(&self, result: &TestResult) -> String {
        let mut line = format!(
            "{:32} {} [{:>6}ms] x{}",
            format!("{}::{}", result.class_name, result.id),
            self.status_label(result.status),
            result.duration_ms,
            result.attempts
        );
        if let Some(message) = result.message() {
            line.push_str(&format!("\n      {message}"));
        }
        line
    }

    fn format_result_summary(&self, result: &TestResult) -> String {
        format!(
            "{} {} ({}ms)",
            result.status.symbol(),
            result.id,
            result.duration_ms
        )
    }

    /// Format a session summary
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(summary),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str(&format!(
            "║  Test Session - {:44} ║\n",
            summary.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
        ));
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        for result in summary.results.iter().filter(|r| r.visible) {
            output.push_str(&format!("  {}\n", self.format_result_table(result)));
        }

        output.push_str("────────────────────────────────────────────────────────────────\n");
        let pass_str = if self.colorize {
            format!("\x1b[32m{}\x1b[0m", summary.passed)
        } else {
            summary.passed.to_string()
        };
        let fail_str = if self.colorize && summary.failed > 0 {
            format!("\x1b[31m{}\x1b[0m", summary.failed)
        } else {
            summary.failed.to_string()
        };
        output.push_str(&format!(
            "  Total: {} | Pass: {} | Fail: {} | Skip: {}",
            summary.total, pass_str, fail_str, summary.skipped
        ));
        if summary.hidden > 0 {
            output.push_str(&format!(" | Hidden: {}", summary.hidden));
        }
        output.push('\n');
        output.push_str(&format!(
            "  Pass Rate: {:5.1}% | Duration: {}ms\n",
            summary.pass_rate(),
            summary.duration_ms
        ));

        if !summary.diagnostics.is_empty() {
            output.push_str("\n  Warnings:\n");
            for diagnostic in &summary.diagnostics {
                output.push_str(&format!("   - {diagnostic}\n"));
            }
        }
        if let Some(reason) = &summary.aborted {
            let line = format!("  ABORTED: {reason}");
            if self.colorize {
                output.push_str(&format!("\n\x1b[31m{line}\x1b[0m\n"));
            } else {
                output.push_str(&format!("\n{line}\n"));
            }
        }
        output
    }

    fn format_summary_brief(&self, summary: &RunSummary) -> String {
        let mut line = format!(
            "{}/{} passed ({:.1}%), {} failed, {} skipped in {}ms",
            summary.passed,
            summary.total,
            summary.pass_rate(),
            summary.failed,
            summary.skipped,
            summary.duration_ms
        );
        if summary.aborted.is_some() {
            line.push_str(" [aborted]");
        }
        line
    }

    /// Format a plan listing
    pub fn format_listing(&self, listing: &Listing) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(listing),
            OutputFormat::Table | OutputFormat::Summary => self.format_listing_table(listing),
        }
    }

    fn format_listing_table(&self, listing: &Listing) -> String {
        let mut output = String::new();

        output.push_str("Tests:\n");
        for (class, ids) in &listing.classes {
            output.push_str(&format!("  {class}\n"));
            for id in ids {
                let marker = if listing.deselected.contains(id) {
                    " (deselected)"
                } else {
                    ""
                };
                output.push_str(&format!("    - {id}{marker}\n"));
            }
        }

        output.push_str("\nConstraint groups:\n");
        if listing.constraint_groups.is_empty() {
            output.push_str("  (none)\n");
        }
        for (i, group) in listing.constraint_groups.iter().enumerate() {
            output.push_str(&format!("  {:2}. {}\n", i + 1, group.join(", ")));
        }

        output.push_str("\nDependencies:\n");
        if listing.edges.is_empty() {
            output.push_str("  (none)\n");
        }
        for (dependent, dependency) in &listing.edges {
            output.push_str(&format!("  {dependent} -> {dependency}\n"));
        }
        output
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

/// Write a session summary to a file as pretty JSON
pub fn write_results_to_file(path: &str, summary: &RunSummary) -> anyhow::Result<()> {
    let formatter = ResultFormatter::new(OutputFormat::JsonPretty).no_color();
    let content = formatter.format_summary(summary);

    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;

    Ok(())
}
