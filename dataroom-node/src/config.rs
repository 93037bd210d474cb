use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use dataroom_core::{CellValue, ColumnDef};
use dataroom_exec::{BackendOverride, DpConfig};
use dataroom_mpc::MpcConfig;
use dataroom_sql::ValidatorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendOverride>,
    #[serde(default)]
    pub dp: DpConfig,
    #[serde(default)]
    pub mpc: MpcConfig,
    #[serde(default)]
    pub datasets: Vec<DatasetSection>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSection {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Actor recorded on audit events issued by the CLI.
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            actor: default_actor(),
        }
    }
}

/// An in-memory dataset and its privacy budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatasetSection {
    pub id: String,
    pub organization: String,
    /// Defaults to the dataset id.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_budget")]
    pub budget: f64,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub rows: Vec<Vec<CellValue>>,
}

impl DatasetSection {
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.id)
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_actor() -> String {
    "dataroom-node".into()
}

const fn default_budget() -> f64 {
    1.0
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.datasets.is_empty() {
            return Err(ConfigError::Validation(
                "at least one dataset must be defined".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for dataset in &self.datasets {
            if !seen.insert(dataset.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "dataset '{}' is defined twice",
                    dataset.id
                )));
            }
            if !(dataset.budget >= 0.0 && dataset.budget.is_finite()) {
                return Err(ConfigError::Validation(format!(
                    "dataset '{}' budget must be a non-negative number",
                    dataset.id
                )));
            }
            if dataset.columns.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "dataset '{}' declares no columns",
                    dataset.id
                )));
            }
            if let Some(row) = dataset
                .rows
                .iter()
                .find(|row| row.len() != dataset.columns.len())
            {
                return Err(ConfigError::Validation(format!(
                    "dataset '{}' has a row with {} values for {} columns",
                    dataset.id,
                    row.len(),
                    dataset.columns.len()
                )));
            }
        }
        if self.validator.k_anonymity_floor == 0 {
            return Err(ConfigError::Validation(
                "k-anonymity floor must be greater than zero".into(),
            ));
        }
        if self.validator.minimum_epsilon <= 0.0 {
            return Err(ConfigError::Validation(
                "minimum epsilon must be greater than zero".into(),
            ));
        }
        if !(self.dp.default_delta > 0.0 && self.dp.default_delta < 1.0) {
            return Err(ConfigError::Validation(
                "dp default delta must lie in (0, 1)".into(),
            ));
        }
        if let Some((column, _)) = self
            .dp
            .bounds
            .iter()
            .find(|(_, bounds)| !(bounds.lower <= bounds.upper))
        {
            return Err(ConfigError::Validation(format!(
                "dp bounds for '{column}' have lower above upper"
            )));
        }
        if self.mpc.epsilon <= 0.0 || self.mpc.sensitivity <= 0.0 {
            return Err(ConfigError::Validation(
                "mpc epsilon and sensitivity must be greater than zero".into(),
            ));
        }
        if self.mpc.key_bits < 1024 {
            return Err(ConfigError::Validation(
                "mpc key-bits must be at least 1024".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        let columns = vec![
            ColumnDef::new("age", "integer"),
            ColumnDef::new("region", "text"),
            ColumnDef::new("revenue", "decimal"),
        ];
        let rows = |offset: f64| -> Vec<Vec<CellValue>> {
            (0..30)
                .map(|i| {
                    let i = f64::from(i);
                    vec![
                        (20.0 + i).into(),
                        (if i % 2.0 == 0.0 { "west" } else { "east" }).into(),
                        (offset + i).into(),
                    ]
                })
                .collect()
        };
        Self {
            node: NodeSection::default(),
            validator: ValidatorConfig::default(),
            backends: BTreeMap::new(),
            dp: DpConfig::default(),
            mpc: MpcConfig::default(),
            datasets: vec![
                DatasetSection {
                    id: "clinic-a".into(),
                    organization: "org-a".into(),
                    table: Some("visits".into()),
                    budget: 3.0,
                    columns: columns.clone(),
                    rows: rows(100.0),
                },
                DatasetSection {
                    id: "clinic-b".into(),
                    organization: "org-b".into(),
                    table: Some("visits".into()),
                    budget: 3.0,
                    columns,
                    rows: rows(200.0),
                },
            ],
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

/// Parses without validating. `Auto` is treated as TOML.
pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
    }
}

pub fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}
