use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use toml::Spanned;

use super::HueApi;
use super::LogLevel;
use super::StoreBackend;
use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::LoadError;
use super::diagnostics::MergeConflictLocation;
use super::diagnostics::MergeError;
use super::diagnostics::SourceInfo;
use super::diagnostics::Warning;

/// One config file as written, every field optional and spanned.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    #[serde(default)]
    pub imports: Vec<String>,

    pub logging: Option<PartialLoggingConfig>,
    pub store: Option<PartialStoreConfig>,
    pub poll: Option<PartialPollConfig>,
    pub integrations: Option<PartialIntegrationsConfig>,

    #[serde(skip)]
    pub source: Option<SourceInfo>,

    /// Where each merged field was first set
    #[serde(skip)]
    pub origins: HashMap<String, MergeConflictLocation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialLoggingConfig {
    pub level: Option<Spanned<LogLevel>>,
    pub overrides: Option<HashMap<String, Spanned<LogLevel>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialStoreConfig {
    pub backend: Option<Spanned<StoreBackend>>,
    pub path: Option<Spanned<PathBuf>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialPollConfig {
    pub interval_secs: Option<Spanned<u64>>,
    pub adapter_timeout_secs: Option<Spanned<u64>>,
    pub concurrent: Option<Spanned<bool>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialIntegrationsConfig {
    pub govee: Option<PartialGoveeConfig>,
    pub hue: Option<PartialHueConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialGoveeConfig {
    pub api_key: Option<Spanned<String>>,
    pub api_key_env: Option<Spanned<String>>,
    pub base_url: Option<Spanned<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialHueConfig {
    pub bridge: Option<Spanned<String>>,
    pub api_key: Option<Spanned<String>>,
    pub api_key_env: Option<Spanned<String>>,
    pub api: Option<Spanned<HueApi>>,
}

impl PartialConfig {
    /// Load a single config file without processing imports
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            error: e,
        })?;

        let mut config: PartialConfig = toml::from_str(&content).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            error: e,
        })?;

        config.source = Some(SourceInfo {
            file_path: path.to_path_buf(),
            content,
        });

        Ok(config)
    }

    /// Load config files with import resolution
    ///
    /// Returns every loaded config in order, each file's imports before the file
    /// itself.
    pub fn load_with_imports(paths: &[PathBuf]) -> Result<Vec<Self>, LoadError> {
        let mut visited = HashSet::new();
        let mut all_configs = Vec::new();

        for path in paths {
            Self::load_recursive(path, &mut visited, &mut all_configs)?;
        }

        Ok(all_configs)
    }

    fn load_recursive(
        path: &Path,
        visited: &mut HashSet<PathBuf>,
        configs: &mut Vec<Self>,
    ) -> Result<(), LoadError> {
        let canonical_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        if visited.contains(&canonical_path) {
            return Err(LoadError::ImportCycle {
                path: canonical_path.clone(),
                cycle: visited.iter().cloned().collect(),
            });
        }

        visited.insert(canonical_path.clone());

        let config = Self::from_file(path)?;

        for import_path in &config.imports {
            let import_path_buf = PathBuf::from(import_path);

            // Relative imports resolve from the importing file's directory
            let resolved_path = if import_path_buf.is_absolute() {
                import_path_buf
            } else {
                let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
                parent_dir.join(import_path_buf)
            };

            Self::load_recursive(&resolved_path, visited, configs)?;
        }

        configs.push(config);

        // Sibling branches may import the same file
        visited.remove(&canonical_path);

        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.logging.is_none()
            && self.store.is_none()
            && self.poll.is_none()
            && self.integrations.is_none()
            && self.imports.is_empty()
    }

    /// Merge multiple partial configs together
    ///
    /// First-wins: the first file to set a field keeps it. A field set again in a
    /// later file is a conflict; merging carries on so every conflict is reported
    /// at once.
    pub fn merge<I>(configs: I) -> (Self, Vec<Diagnostic>)
    where
        I: IntoIterator<Item = Self>,
    {
        let mut result = PartialConfig::default();
        let mut merger = Merger::default();
        let mut imports = Vec::new();

        for config in configs {
            imports.extend(config.imports.iter().cloned());

            let source = config.source.clone().unwrap_or_else(|| SourceInfo {
                file_path: PathBuf::from("<unknown>"),
                content: String::new(),
            });

            if config.is_empty() {
                merger
                    .diagnostics
                    .push(Diagnostic::Warning(Warning::EmptyConfig {
                        file_path: source.file_path.clone(),
                    }));
            }

            if let Some(logging) = config.logging {
                let into = result.logging.get_or_insert_with(Default::default);
                merger.field(&source, "logging.level", &mut into.level, logging.level);
                if let Some(overrides) = logging.overrides {
                    let into_overrides = into.overrides.get_or_insert_with(HashMap::new);
                    for (target, level) in overrides {
                        let path = format!("logging.overrides.{}", target);
                        let mut slot = into_overrides.remove(&target);
                        merger.field(&source, &path, &mut slot, Some(level));
                        if let Some(level) = slot {
                            into_overrides.insert(target, level);
                        }
                    }
                }
            }

            if let Some(store) = config.store {
                let into = result.store.get_or_insert_with(Default::default);
                merger.field(&source, "store.backend", &mut into.backend, store.backend);
                merger.field(&source, "store.path", &mut into.path, store.path);
            }

            if let Some(poll) = config.poll {
                let into = result.poll.get_or_insert_with(Default::default);
                merger.field(
                    &source,
                    "poll.interval_secs",
                    &mut into.interval_secs,
                    poll.interval_secs,
                );
                merger.field(
                    &source,
                    "poll.adapter_timeout_secs",
                    &mut into.adapter_timeout_secs,
                    poll.adapter_timeout_secs,
                );
                merger.field(&source, "poll.concurrent", &mut into.concurrent, poll.concurrent);
            }

            if let Some(integrations) = config.integrations {
                let into = result.integrations.get_or_insert_with(Default::default);
                if let Some(govee) = integrations.govee {
                    let g = into.govee.get_or_insert_with(Default::default);
                    merger.field(&source, "integrations.govee.api_key", &mut g.api_key, govee.api_key);
                    merger.field(
                        &source,
                        "integrations.govee.api_key_env",
                        &mut g.api_key_env,
                        govee.api_key_env,
                    );
                    merger.field(
                        &source,
                        "integrations.govee.base_url",
                        &mut g.base_url,
                        govee.base_url,
                    );
                }
                if let Some(hue) = integrations.hue {
                    let h = into.hue.get_or_insert_with(Default::default);
                    merger.field(&source, "integrations.hue.bridge", &mut h.bridge, hue.bridge);
                    merger.field(&source, "integrations.hue.api_key", &mut h.api_key, hue.api_key);
                    merger.field(
                        &source,
                        "integrations.hue.api_key_env",
                        &mut h.api_key_env,
                        hue.api_key_env,
                    );
                    merger.field(&source, "integrations.hue.api", &mut h.api, hue.api);
                }
            }
        }

        result.imports = imports;
        result.origins = merger.first_set;

        (result, merger.diagnostics)
    }

    /// Where a merged field was set, for pointing validation errors at it.
    pub fn origin(&self, field_path: &str) -> (Option<std::ops::Range<usize>>, Option<SourceInfo>) {
        match self.origins.get(field_path) {
            Some(loc) => (
                Some(loc.span.clone()),
                Some(SourceInfo {
                    file_path: loc.file_path.clone(),
                    content: loc.content.clone(),
                }),
            ),
            None => (None, None),
        }
    }
}

/// Tracks where each field was first set while merging.
#[derive(Default)]
struct Merger {
    first_set: HashMap<String, MergeConflictLocation>,
    diagnostics: Vec<Diagnostic>,
}

impl Merger {
    fn field<T>(
        &mut self,
        source: &SourceInfo,
        field_path: &str,
        into: &mut Option<Spanned<T>>,
        value: Option<Spanned<T>>,
    ) {
        let Some(value) = value else {
            return;
        };
        let location = MergeConflictLocation {
            file_path: source.file_path.clone(),
            span: value.span(),
            content: source.content.clone(),
        };

        match self.first_set.get(field_path) {
            Some(first) => {
                self.diagnostics.push(Diagnostic::Error(Error::Merge(MergeError {
                    field_path: field_path.to_string(),
                    message: format!("'{}' is set in more than one config file", field_path),
                    conflicts: vec![first.clone(), location],
                })));
            }
            None => {
                *into = Some(value);
                self.first_set.insert(field_path.to_string(), location);
            }
        }
    }
}
