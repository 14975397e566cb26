use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use fois_api::{ClientCredentials, HttpClientConfig, TokenEndpoints};
use fois_core::{CatalogError, Endpoint, EndpointCatalog};
use fois_storage::BackoffPolicy;
use serde::Deserialize;
use thiserror::Error;

use crate::engine::EngineSettings;

const DEFAULT_TOKEN_URL: &str = "https://gw.crisapis.indianrail.gov.in/token";
const DEFAULT_REVOKE_URL: &str = "https://gw.crisapis.indianrail.gov.in/revoke";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set (environment or .env)")]
    Missing(&'static str),
    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("endpoint file {path}: {reason}")]
    EndpointFile { path: PathBuf, reason: String },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Postgres,
    Sheets,
    Memory,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sheets => "sheets",
            Self::Memory => "memory",
        }
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "sql" => Ok(Self::Postgres),
            "sheets" | "gsheet" | "google-sheets" => Ok(Self::Sheets),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown sink '{other}' (postgres, sheets, memory)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub credentials: ClientCredentials,
    pub token_endpoints: TokenEndpoints,
    pub sink: SinkKind,
    pub database_url: Option<String>,
    pub spreadsheet_id: Option<String>,
    pub google_credentials_path: PathBuf,
    pub zone_code: String,
    pub endpoints_file: Option<PathBuf>,
    pub call_delay: Duration,
    pub store_retry: BackoffPolicy,
    pub http_timeout: Duration,
    pub sync_cron: String,
}

#[derive(Debug, Deserialize)]
struct EndpointFile {
    endpoints: Vec<Endpoint>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let credentials = ClientCredentials::new(required("CLIENT_ID")?, required("CLIENT_SECRET")?);

        let sink = match get("FOIS_SINK") {
            Some(value) => value.parse::<SinkKind>().map_err(|reason| ConfigError::Invalid {
                name: "FOIS_SINK",
                value,
                reason,
            })?,
            None => SinkKind::Postgres,
        };

        let store_attempts = parse_or(&get, "FOIS_STORE_RETRIES", 3usize)?;
        if store_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "FOIS_STORE_RETRIES",
                value: "0".into(),
                reason: "at least one attempt is required".into(),
            });
        }
        let store_delay = parse_or(&get, "FOIS_STORE_RETRY_DELAY_SECS", 5u64)?;

        let config = Self {
            credentials,
            token_endpoints: TokenEndpoints {
                token_url: get("FOIS_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
                revoke_url: get("FOIS_REVOKE_URL")
                    .unwrap_or_else(|| DEFAULT_REVOKE_URL.to_string()),
            },
            sink,
            database_url: get("DATABASE_URL"),
            spreadsheet_id: get("GSHEET_ID"),
            google_credentials_path: get("GOOGLE_APPLICATION_CREDENTIALS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("gs_credentials.json")),
            zone_code: get("FOIS_ZONE").unwrap_or_else(|| "WR".to_string()),
            endpoints_file: get("FOIS_ENDPOINTS_FILE").map(PathBuf::from),
            call_delay: Duration::from_millis(parse_or(&get, "FOIS_CALL_DELAY_MS", 1000u64)?),
            store_retry: BackoffPolicy::fixed(store_attempts, Duration::from_secs(store_delay)),
            http_timeout: Duration::from_secs(parse_or(&get, "FOIS_HTTP_TIMEOUT_SECS", 30u64)?),
            sync_cron: get("FOIS_SYNC_CRON").unwrap_or_else(|| "0 30 6 * * *".to_string()),
        };
        config.validate_sink()?;
        Ok(config)
    }

    /// Connection parameters required by the selected sink.
    pub fn validate_sink(&self) -> Result<(), ConfigError> {
        match self.sink {
            SinkKind::Postgres if self.database_url.is_none() => {
                Err(ConfigError::Missing("DATABASE_URL"))
            }
            SinkKind::Sheets if self.spreadsheet_id.is_none() => {
                Err(ConfigError::Missing("GSHEET_ID"))
            }
            _ => Ok(()),
        }
    }

    pub fn load_catalog(&self) -> Result<EndpointCatalog, ConfigError> {
        match &self.endpoints_file {
            Some(path) => load_endpoint_file(path),
            None => Ok(EndpointCatalog::builtin()),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            zone_code: self.zone_code.clone(),
            store_retry: self.store_retry,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            ..Default::default()
        }
    }
}

pub fn load_endpoint_file(path: &Path) -> Result<EndpointCatalog, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|err| ConfigError::EndpointFile {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let file: EndpointFile =
        serde_yaml::from_str(&text).map_err(|err| ConfigError::EndpointFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    Ok(EndpointCatalog::new(file.endpoints)?)
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            value,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_follow_the_deployment() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("CLIENT_ID", "id"),
            ("CLIENT_SECRET", "secret"),
            ("DATABASE_URL", "postgres://localhost/fois"),
        ]))
        .expect("config");
        assert_eq!(config.sink, SinkKind::Postgres);
        assert_eq!(config.zone_code, "WR");
        assert_eq!(config.call_delay, Duration::from_secs(1));
        assert_eq!(config.store_retry.max_attempts, 3);
        assert_eq!(config.store_retry.delay, Duration::from_secs(5));
        assert_eq!(config.token_endpoints.token_url, DEFAULT_TOKEN_URL);
        assert_eq!(config.load_catalog().expect("catalog").len(), 3);
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        let err = SyncConfig::from_lookup(lookup(&[("CLIENT_ID", "id"), ("CLIENT_SECRET", " ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CLIENT_SECRET")));
    }

    #[test]
    fn sink_connection_parameters_are_required() {
        let base = [("CLIENT_ID", "id"), ("CLIENT_SECRET", "secret")];
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&base)),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));

        let mut sheets = base.to_vec();
        sheets.push(("FOIS_SINK", "sheets"));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&sheets)),
            Err(ConfigError::Missing("GSHEET_ID"))
        ));

        let mut memory = base.to_vec();
        memory.push(("FOIS_SINK", "memory"));
        let mut config = SyncConfig::from_lookup(lookup(&memory)).expect("memory needs nothing");
        config.sink = SinkKind::Postgres;
        assert!(matches!(
            config.validate_sink(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    fn invalid_numbers_and_sinks_are_reported() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("CLIENT_ID", "id"),
            ("CLIENT_SECRET", "secret"),
            ("FOIS_SINK", "memory"),
            ("FOIS_CALL_DELAY_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "FOIS_CALL_DELAY_MS",
                ..
            }
        ));

        let err = SyncConfig::from_lookup(lookup(&[
            ("CLIENT_ID", "id"),
            ("CLIENT_SECRET", "secret"),
            ("FOIS_SINK", "excel"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "FOIS_SINK", .. }));
    }

    #[test]
    fn endpoint_file_replaces_builtin_catalog() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "endpoints:\n  - name: fois_od_data\n    url: https://example.test/wghtleadntkmfrgt\n    date_offset_days: 2\n    zone_filter:\n      any_of: [srczone, dstnzone]\n"
        )
        .expect("write");

        let catalog = load_endpoint_file(file.path()).expect("catalog");
        assert_eq!(catalog.len(), 1);
        let endpoint = catalog.resolve("wghtleadntkmfrgt").expect("resolve");
        assert_eq!(endpoint.date_offset_days, 2);
        assert_eq!(endpoint.date_format, "%d-%m-%Y");
    }

    #[test]
    fn endpoint_file_with_unusable_dates_is_rejected_at_load() {
        let cases: [(&str, fn(&CatalogError) -> bool); 2] = [
            ("    date_format: \"%d-%m-%Y %H:%M\"\n", |err| {
                matches!(err, CatalogError::UnsupportedDateFormat { .. })
            }),
            ("    date_offset_days: 4611686018427387903\n", |err| {
                matches!(err, CatalogError::DateOffsetOutOfRange { .. })
            }),
        ];
        for (field, expected) in cases {
            let mut file = tempfile::NamedTempFile::new().expect("tempfile");
            write!(
                file,
                "endpoints:\n  - name: fois_indent_data\n    url: https://example.test/pndgindt\n{field}"
            )
            .expect("write");

            match load_endpoint_file(file.path()) {
                Err(ConfigError::Catalog(err)) => assert!(expected(&err), "{field}: {err:?}"),
                other => panic!("{field}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn unreadable_endpoint_file_is_a_config_error() {
        let err = load_endpoint_file(Path::new("/nonexistent/endpoints.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::EndpointFile { .. }));
    }
}
