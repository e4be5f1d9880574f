//! Rendering a [`RunSummary`] for people and for machines.

use crate::engine::RunSummary;
use crate::mutation::analyzer::{EffectivenessReport, Finding};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

pub fn render(summary: &RunSummary, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(render_text(summary)),
        OutputFormat::Json => render_json(summary),
    }
}

pub fn render_json(summary: &RunSummary) -> Result<String> {
    serde_json::to_string_pretty(summary).context("Failed to serialize run summary")
}

/// Write the rendered report to `path`, or stdout when `path` is `None`.
pub fn emit(rendered: &str, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write report to {}", path.display())),
        None => {
            println!("{}", rendered);
            Ok(())
        }
    }
}

pub fn render_text(summary: &RunSummary) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "killrate: {} ({}) at {}",
        summary.project,
        summary.language,
        summary.root.display()
    ));
    lines.push(format!("threshold: {}", percent(Some(summary.threshold))));
    if summary.interrupted {
        lines.push("run interrupted: results are partial".to_string());
    }
    lines.push(String::new());

    if summary.reports.is_empty() {
        lines.push("No source/test pairs were scored.".to_string());
    } else {
        lines.extend(score_table(summary));
    }

    for report in &summary.reports {
        lines.extend(report_details(report));
    }

    if !summary.unmapped.is_empty() {
        lines.push(String::new());
        lines.push(format!("Unmapped tests ({}):", summary.unmapped.len()));
        for test in &summary.unmapped {
            match &test.best_candidate {
                Some(c) => lines.push(format!(
                    "  - {} (best guess {} via {} at {:.2})",
                    test.test_file.display(),
                    c.source_file.display(),
                    c.strategy,
                    c.confidence
                )),
                None => lines.push(format!("  - {}", test.test_file.display())),
            }
        }
    }

    if !summary.skipped.is_empty() {
        lines.push(String::new());
        lines.push(format!("Skipped pairs ({}):", summary.skipped.len()));
        for pair in &summary.skipped {
            lines.push(format!(
                "  - {} -> {}: {}",
                pair.test_file.display(),
                pair.source_file.display(),
                pair.reason
            ));
        }
    }

    lines.push(String::new());
    let stats = &summary.cache_stats;
    lines.push(format!(
        "cache: {} hits, {} misses, {} entries",
        stats.hits, stats.misses, stats.entries
    ));

    let below = summary.below_threshold().len();
    if below == 0 {
        lines.push("result: all scored tests meet the threshold".to_string());
    } else {
        lines.push(format!("result: {} test(s) below the threshold", below));
    }

    lines.join("\n")
}

fn score_table(summary: &RunSummary) -> Vec<String> {
    let rows: Vec<[String; 7]> = summary
        .reports
        .iter()
        .map(|r| {
            [
                r.test_file.display().to_string(),
                r.source_file.display().to_string(),
                percent(r.score),
                r.killed.to_string(),
                r.survived.to_string(),
                (r.timed_out + r.errored).to_string(),
                if r.is_below(summary.threshold) { "LOW" } else { "" }.to_string(),
            ]
        })
        .collect();

    let header = ["TEST", "SOURCE", "SCORE", "KILLED", "SURVIVED", "INCONCL.", ""];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let format_row = |cells: &[&str]| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![format_row(&header)];
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        lines.push(format_row(&cells));
    }
    lines
}

fn report_details(report: &EffectivenessReport) -> Vec<String> {
    let mut lines = Vec::new();
    let has_details = !report.survivors.is_empty()
        || !report.inconclusive.is_empty()
        || !report.alternative_sources.is_empty()
        || !report.recommendations.is_empty();
    if !has_details {
        return lines;
    }

    lines.push(String::new());
    lines.push(format!(
        "{} -> {} ({})",
        report.test_file.display(),
        report.source_file.display(),
        percent(report.score)
    ));

    if !report.alternative_sources.is_empty() {
        let alternatives: Vec<String> = report
            .alternative_sources
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        lines.push(format!("  ambiguous mapping, also close: {}", alternatives.join(", ")));
    }

    if !report.survivors.is_empty() {
        lines.push(format!("  survivors ({}):", report.survivors.len()));
        for finding in &report.survivors {
            lines.extend(finding_lines(finding));
        }
    }

    if !report.inconclusive.is_empty() {
        lines.push(format!("  inconclusive ({}):", report.inconclusive.len()));
        for finding in &report.inconclusive {
            lines.extend(finding_lines(finding));
        }
    }

    for recommendation in &report.recommendations {
        lines.push(format!("  hint [{}]: {}", recommendation.kind, recommendation.message));
    }

    lines
}

fn finding_lines(finding: &Finding) -> Vec<String> {
    let mut lines = vec![
        format!(
            "    {}:{} [{}] {}",
            finding.source_file.display(),
            finding.line_number,
            finding.kind,
            finding.outcome
        ),
        format!("      - {}", finding.original_text.trim()),
        format!("      + {}", finding.mutated_text.trim()),
    ];
    if let Some(detail) = finding.detail.as_deref().and_then(|d| d.lines().next()) {
        lines.push(format!("      ({})", detail.trim()));
    }
    lines
}

fn percent(score: Option<f64>) -> String {
    match score {
        Some(s) => format!("{:.0}%", s * 100.0),
        None => "n/a".to_string(),
    }
}
