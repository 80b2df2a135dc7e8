use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use graphfed_planner::{
    config::{DEFAULT_MAX_QUERY_DEPTH, DEFAULT_QUERY_TIMEOUT},
    FederationConfig,
    ServiceConfig,
};
use serde::Deserialize;
use tracing::instrument;

#[derive(Debug, Default, Deserialize, Parser)]
pub struct Config {
    /// Path of the config file
    #[clap(long, env = "CONFIG_FILE", default_value = "config.toml")]
    #[serde(skip)]
    pub file: PathBuf,

    #[clap(long, env, default_value = "127.0.0.1:8000")]
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Path segment the GraphQL endpoint is served under, the root when unset
    #[clap(long, env = "GRAPHQL_PATH")]
    #[serde(default)]
    pub path: Option<String>,

    #[clap(long, env, value_delimiter = ',')]
    #[serde(default)]
    pub forward_headers: Vec<String>,

    #[clap(long, env, default_value_t = DEFAULT_MAX_QUERY_DEPTH)]
    #[serde(default = "default_max_query_depth")]
    pub max_query_depth: usize,

    #[clap(long, env, default_value_t = default_query_timeout_ms())]
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[clap(long, env)]
    #[serde(default)]
    pub disable_query_planning: bool,

    #[clap(long, env)]
    #[serde(default)]
    pub debug_mode: bool,

    #[clap(skip)]
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// A service as written in the config file, the SDL may live in its own file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    #[serde(flatten)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub schema_file: Option<PathBuf>,
}

impl Config {
    /// Parse the config file and environment variables.
    /// If the config file exists, it will be parsed first and ignore
    /// environment variables.
    pub fn try_parse() -> anyhow::Result<Self> {
        let mut env_config = Config::parse();

        if Path::exists(&env_config.file) {
            let file_config = std::fs::read_to_string(&env_config.file)
                .with_context(|| format!("Failed to read config file '{}'.", env_config.file.display()))?;
            let mut file_config: Config = toml::from_str(&file_config)
                .with_context(|| format!("Failed to parse config file '{}'.", env_config.file.display()))?;
            file_config.file = env_config.file;

            // Override service endpoint with env var if set
            for entry in &mut file_config.services {
                let name = entry.service.name.to_ascii_uppercase().replace('-', "_");
                if let Ok(endpoint) = std::env::var(format!("SERVICE_{name}_ENDPOINT")) {
                    tracing::info!("Overriding service '{}' endpoint with env var", entry.service.name);
                    entry.service.endpoint = endpoint;
                }
            }

            Ok(file_config)
        } else {
            let env_prefix = "SERVICE_";

            let service_prefixes = std::env::vars()
                .filter_map(|(name, _)| {
                    name.strip_prefix(env_prefix)
                        .and_then(|name| name.split('_').next())
                        .filter(|prefix| !prefix.is_empty())
                        .map(ToString::to_string)
                })
                .collect::<BTreeSet<String>>();

            // Parse dynamically environment variables for services.
            // The following environment variables are parsed:
            // SERVICE_<SERVICE_NAME>_NAME
            // SERVICE_<SERVICE_NAME>_ENDPOINT
            // SERVICE_<SERVICE_NAME>_PATH
            // SERVICE_<SERVICE_NAME>_SCHEMA_FILE
            // SERVICE_<SERVICE_NAME>_TIMEOUT_MS
            let var = |prefix: &str, key: &str| std::env::var(format!("{env_prefix}{prefix}_{key}")).ok();
            let mut services = Vec::new();
            for prefix in service_prefixes {
                let endpoint = var(&prefix, "ENDPOINT").with_context(|| {
                    format!("Missing required environment variable '{env_prefix}{prefix}_ENDPOINT'.")
                })?;
                let name = var(&prefix, "NAME").unwrap_or_else(|| prefix.to_ascii_lowercase());

                let mut service = ServiceConfig::new(name, endpoint);
                if let Some(path) = var(&prefix, "PATH") {
                    service.path = path;
                }
                if let Some(timeout) = var(&prefix, "TIMEOUT_MS") {
                    let timeout = timeout
                        .parse()
                        .with_context(|| format!("Invalid value '{timeout}' of '{env_prefix}{prefix}_TIMEOUT_MS'."))?;
                    service.timeout = Duration::from_millis(timeout);
                }
                services.push(ServiceEntry {
                    service,
                    schema_file: var(&prefix, "SCHEMA_FILE").map(PathBuf::from),
                });
            }
            env_config.services = services;

            Ok(env_config)
        }
    }

    /// Assemble the gateway configuration, loading schema files relative to the config file.
    #[instrument(skip(self), err, level = "trace")]
    pub fn federation_config(&self) -> anyhow::Result<FederationConfig> {
        let base = self.file.parent().unwrap_or_else(|| Path::new(""));
        let mut services = Vec::with_capacity(self.services.len());
        for entry in &self.services {
            let mut service = entry.service.clone();
            if let Some(schema_file) = &entry.schema_file {
                let path = base.join(schema_file);
                service.schema = std::fs::read_to_string(&path).with_context(|| {
                    format!("Failed to read schema file '{}' of service '{}'.", path.display(), service.name)
                })?;
            }
            services.push(service);
        }

        Ok(FederationConfig {
            services,
            enable_query_planning: !self.disable_query_planning,
            max_query_depth: self.max_query_depth,
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            debug_mode: self.debug_mode,
            ..Default::default()
        })
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_max_query_depth() -> usize {
    DEFAULT_MAX_QUERY_DEPTH
}

fn default_query_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT.as_millis() as u64
}
