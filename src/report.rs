//! Human-readable rendering of a run report.
use crate::engine::{Outcome, RunReport};
use crate::error::ErrorKind;

pub fn render_text(report: &RunReport) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        &format!("Manifest scope: {}/{}", report.platform, report.branch),
    );
    push_line(&mut out, "File integrity status:");
    for classification in &report.classifications {
        let mut line = format!(
            "\t{}: {}",
            classification.relative_path,
            classification.state.label()
        );
        if let Some(detail) = &classification.detail {
            line.push_str(&format!(" ({detail})"));
        }
        push_line(&mut out, &line);
    }
    push_line(&mut out, "");
    render_outcome(&mut out, report);
    out
}

fn render_outcome(out: &mut String, report: &RunReport) {
    match &report.outcome {
        Outcome::Success { patched, deleted } => {
            if patched.is_empty() && deleted.is_empty() {
                push_line(out, "No files need patching!");
            } else {
                for path in patched {
                    push_line(out, &format!("\tPatched: {path}"));
                }
                for path in deleted {
                    push_line(out, &format!("\tDeleted: {path}"));
                }
                push_line(
                    out,
                    &format!(
                        "Applied successfully to {} file(s) in {:.2} second(s).",
                        patched.len() + deleted.len(),
                        report.elapsed_ms as f64 / 1000.0
                    ),
                );
            }
        }
        Outcome::Checked { pending } => {
            if *pending == 0 {
                push_line(out, "All files are already fixed.");
            } else {
                for step in &report.plan {
                    push_line(
                        out,
                        &format!("\tPending: {} ({:?})", step.relative_path, step.action),
                    );
                }
                push_line(
                    out,
                    &format!("{pending} file(s) need patching. Run `assetpatch fix` to apply."),
                );
            }
        }
        Outcome::AbortedMismatch { paths } => {
            push_line(
                out,
                &format!(
                    "Aborted: {} file(s) match neither the original nor the fixed checksum:",
                    paths.len()
                ),
            );
            for path in paths {
                push_line(out, &format!("\t{path}"));
            }
            push_line(
                out,
                "No files were modified. Verify the integrity of the installation (or reinstall it), then try again.",
            );
        }
        Outcome::Aborted {
            kind,
            detail,
            patched,
        } => {
            push_line(out, &format!("Aborted ({}): {detail}", kind_label(*kind)));
            if !patched.is_empty() {
                push_line(
                    out,
                    &format!(
                        "{} file(s) were already patched and were left in place; re-run to finish.",
                        patched.len()
                    ),
                );
            }
            if *kind == ErrorKind::Network {
                push_line(out, "Check your internet connection and try again.");
            }
        }
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Environment => "environment error",
        ErrorKind::IntegrityMismatch => "integrity mismatch",
        ErrorKind::Network => "network error",
        ErrorKind::PartialPatch => "partial patch",
    }
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push('\n');
}
