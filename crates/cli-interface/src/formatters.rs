//! Plain-text report formatting

use console::style;

use common::models::{BatchSummary, CaptionOutcome, ModelArtifactState, VariantSummary};
use common::utils::{format_bytes, truncate_string};

/// Table of variants with state and sizes
pub fn format_variant_table(variants: &[VariantSummary]) -> String {
    let id_width = variants
        .iter()
        .map(|v| v.id.len())
        .max()
        .unwrap_or(2)
        .max("ID".len());

    let mut out = format!(
        "{:<id_width$}  {:<14}  {:>21}  {}\n",
        "ID",
        "STATE",
        "SIZE",
        "DESCRIPTION",
        id_width = id_width
    );

    for variant in variants {
        let size = match variant.state {
            ModelArtifactState::NotPresent => format_bytes(variant.expected_size_bytes),
            _ => format!(
                "{} / {}",
                format_bytes(variant.size_bytes),
                format_bytes(variant.expected_size_bytes)
            ),
        };
        out.push_str(&format!(
            "{:<id_width$}  {:<14}  {:>21}  {}\n",
            variant.id,
            variant.state.to_string(),
            size,
            truncate_string(&variant.description, 60),
            id_width = id_width
        ));
    }

    out
}

/// One line per outcome
pub fn format_outcome(outcome: &CaptionOutcome) -> String {
    let name = outcome.image_path.display();

    if let Some(reason) = &outcome.skipped {
        return format!("{} {}: {}", style("skipped").yellow(), name, reason);
    }

    match (&outcome.caption, &outcome.error) {
        (Some(caption), _) if outcome.success => {
            format!("{} {}: {}", style("ok").green(), name, truncate_string(caption, 100))
        }
        (_, Some(error)) => format!("{} {}: {}", style("failed").red(), name, error),
        _ => format!("{} {}", style("failed").red(), name),
    }
}

/// Closing line of a batch
pub fn format_summary(summary: &BatchSummary) -> String {
    let line = summary.to_string();
    if summary.failed > 0 {
        style(line).red().to_string()
    } else {
        style(line).green().to_string()
    }
}
