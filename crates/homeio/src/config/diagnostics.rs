use std::collections::HashSet;
use std::ops::Range;
use std::path::PathBuf;

/// Source information for where a diagnostic came from
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub file_path: PathBuf,
    pub content: String,
}

/// A diagnostic message that can be either a warning or an error
#[derive(Debug, Clone)]
pub enum Diagnostic {
    Warning(Warning),
    Error(Error),
}

/// Warning messages that don't prevent config loading
#[derive(Debug, Clone)]
pub enum Warning {
    EmptyConfig { file_path: PathBuf },
}

/// Error messages that indicate problems with the config
#[derive(Debug, Clone)]
pub enum Error {
    Merge(MergeError),
    Validation(ValidationError),
}

/// The same field set in more than one file
#[derive(Debug, Clone)]
pub struct MergeError {
    pub field_path: String,
    pub message: String,
    pub conflicts: Vec<MergeConflictLocation>,
}

#[derive(Debug, Clone)]
pub struct MergeConflictLocation {
    pub file_path: PathBuf,
    pub span: Range<usize>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
    /// Where the offending value sits, when it was set in a file
    pub span: Option<Range<usize>>,
    pub source: Option<SourceInfo>,
}

/// Failure to read the config files at all.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read '{}': {error}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to parse '{}': {error}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },

    #[error("Import cycle detected at '{}': involves {} file(s)", path.display(), cycle.len())]
    ImportCycle { path: PathBuf, cycle: Vec<PathBuf> },
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        matches!(self, Diagnostic::Error(_))
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Diagnostic::Warning(_))
    }
}

/// Format all diagnostics for display using Ariadne
pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    use ariadne::Color;
    use ariadne::Label;
    use ariadne::Report;
    use ariadne::ReportKind;
    use ariadne::Source;

    let mut output = Vec::new();

    for diagnostic in diagnostics {
        match diagnostic {
            Diagnostic::Warning(Warning::EmptyConfig { file_path }) => {
                let msg = format!(
                    "Warning: Config file '{}' is empty and has no effect\n",
                    file_path.display()
                );
                output.extend_from_slice(msg.as_bytes());
            }
            Diagnostic::Error(Error::Merge(merge_error)) => {
                let Some(first) = merge_error.conflicts.first() else {
                    continue;
                };
                let mut report = Report::build(
                    ReportKind::Error,
                    (
                        first.file_path.to_string_lossy().to_string(),
                        first.span.clone(),
                    ),
                )
                .with_message(format!("Merge conflict in field '{}'", merge_error.field_path))
                .with_note(&merge_error.message);

                for (idx, conflict) in merge_error.conflicts.iter().enumerate() {
                    let label_msg = if idx == 0 {
                        "first definition here"
                    } else {
                        "conflicts with this definition"
                    };
                    report = report.with_label(
                        Label::new((
                            conflict.file_path.to_string_lossy().to_string(),
                            conflict.span.clone(),
                        ))
                        .with_message(label_msg)
                        .with_color(if idx == 0 { Color::Red } else { Color::Yellow }),
                    );
                }

                let finished = report.finish();
                let mut written = HashSet::new();
                for conflict in &merge_error.conflicts {
                    let file_id = conflict.file_path.to_string_lossy().to_string();
                    if written.insert(file_id.clone()) {
                        finished
                            .write((file_id, Source::from(&conflict.content)), &mut output)
                            .ok();
                    }
                }
            }
            Diagnostic::Error(Error::Validation(validation_error)) => {
                match (&validation_error.span, &validation_error.source) {
                    (Some(span), Some(source)) => {
                        let file_id = source.file_path.to_string_lossy().to_string();
                        Report::build(ReportKind::Error, (file_id.clone(), span.clone()))
                            .with_message(format!(
                                "Validation error in '{}'",
                                validation_error.field_path
                            ))
                            .with_label(
                                Label::new((file_id.clone(), span.clone()))
                                    .with_message(&validation_error.message)
                                    .with_color(Color::Red),
                            )
                            .finish()
                            .write((file_id, Source::from(&source.content)), &mut output)
                            .ok();
                    }
                    _ => {
                        let msg = format!(
                            "Validation error in '{}': {}\n",
                            validation_error.field_path, validation_error.message
                        );
                        output.extend_from_slice(msg.as_bytes());
                    }
                }
            }
        }
    }

    String::from_utf8_lossy(&output).to_string()
}
