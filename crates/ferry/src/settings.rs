//! Command-line and environment settings, mapped into typed configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use miette::Result;
use tracing::info;

use ferry_destination::{
    Credentials, DestinationClient, DestinationConfig, KeycloakConfig, KeycloakTokens,
    TokenProvider,
};
use ferry_engine::{EngineConfig, MigrationEngine, PoolConfig};
use ferry_store::MigrationStore;

/// Parse boolean from environment variable, accepting common truthy values.
pub fn parse_bool_env(s: &str) -> std::result::Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

/// Where migration state lives.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ferry.db"),
        }
    }
}

/// How destination calls are authenticated.
#[derive(Debug, Clone, Default)]
pub struct CredentialsConfig {
    pub static_token: Option<String>,
    pub keycloak: Option<KeycloakConfig>,
}

impl CredentialsConfig {
    fn provider(&self) -> Result<Arc<dyn TokenProvider>> {
        let primary: Option<Arc<dyn TokenProvider>> = match &self.keycloak {
            Some(config) => {
                let tokens = KeycloakTokens::new(config.clone())
                    .map_err(|e| miette::miette!("failed to create token client: {}", e))?;
                info!(realm = %config.realm, username = %config.username, "using Keycloak credentials");
                Some(Arc::new(tokens))
            }
            None => None,
        };
        if primary.is_none() && self.static_token.is_none() {
            return Err(miette::miette!(
                "no destination credentials: set FERRY_TOKEN or the FERRY_KEYCLOAK_* settings"
            ));
        }
        Ok(Arc::new(Credentials::new(primary, self.static_token.clone())))
    }
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// SQLite database holding migration state
    #[arg(long, env = "FERRY_DB_PATH", default_value = "ferry.db", global = true)]
    pub db_path: PathBuf,

    /// Destination system base URL
    #[arg(long, env = "FERRY_DESTINATION_URL", default_value = "http://localhost:8080", global = true)]
    pub destination_url: String,

    /// Automation endpoint path
    #[arg(
        long,
        env = "FERRY_AUTOMATION_PATH",
        default_value = "/nuxeo/api/v1/custom-automation/AC_Admin_RunOperation",
        global = true
    )]
    pub automation_path: String,

    /// Upload endpoint path
    #[arg(long, env = "FERRY_UPLOAD_PATH", default_value = "/nuxeo/api/v1/upload/", global = true)]
    pub upload_path: String,

    /// Connect timeout for destination calls, in seconds
    #[arg(long, env = "FERRY_CONNECT_TIMEOUT", default_value = "10", global = true)]
    pub connect_timeout: u64,

    /// Request timeout for destination calls, in seconds
    #[arg(long, env = "FERRY_REQUEST_TIMEOUT", default_value = "30", global = true)]
    pub request_timeout: u64,

    /// Log destination request and response bodies at DEBUG
    #[arg(long, env = "FERRY_LOG_REQUESTS", value_parser = parse_bool_env, default_value = "false", global = true)]
    pub log_requests: bool,

    /// Static bearer token (fallback when Keycloak is configured)
    #[arg(long, env = "FERRY_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Keycloak server URL
    #[arg(long, env = "FERRY_KEYCLOAK_URL", global = true)]
    pub keycloak_url: Option<String>,

    #[arg(long, env = "FERRY_KEYCLOAK_REALM", default_value = "ferry", global = true)]
    pub keycloak_realm: String,

    #[arg(long, env = "FERRY_KEYCLOAK_CLIENT_ID", default_value = "ferry-cli", global = true)]
    pub keycloak_client_id: String,

    #[arg(long, env = "FERRY_KEYCLOAK_USERNAME", global = true)]
    pub keycloak_username: Option<String>,

    #[arg(long, env = "FERRY_KEYCLOAK_PASSWORD", global = true, hide_env_values = true)]
    pub keycloak_password: Option<String>,

    /// Attempts before a failed record is permanently failed
    #[arg(long, env = "FERRY_MAX_ATTEMPTS", default_value = "3", global = true)]
    pub max_attempts: u32,

    /// Acting user when the legacy record names none
    #[arg(long, env = "FERRY_DEFAULT_USER", default_value = "migration-user", global = true)]
    pub default_user: String,

    /// Department used when the legacy record names none
    #[arg(long, env = "FERRY_DEFAULT_DEPARTMENT", default_value = "COF", global = true)]
    pub default_department: String,

    /// Destination tenant
    #[arg(long, env = "FERRY_TENANT", default_value = "ITBA", global = true)]
    pub tenant: String,

    /// Creation pool core workers
    #[arg(long, env = "FERRY_POOL_CORE", default_value = "5", global = true)]
    pub pool_core: usize,

    /// Creation pool maximum workers
    #[arg(long, env = "FERRY_POOL_MAX", default_value = "10", global = true)]
    pub pool_max: usize,

    /// Creation pool queue capacity
    #[arg(long, env = "FERRY_POOL_QUEUE", default_value = "50", global = true)]
    pub pool_queue: usize,

    /// Idle seconds before an overflow worker exits
    #[arg(long, env = "FERRY_POOL_KEEP_ALIVE", default_value = "60", global = true)]
    pub pool_keep_alive: u64,
}

impl Settings {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.db_path.clone(),
        }
    }

    pub fn destination_config(&self) -> DestinationConfig {
        DestinationConfig {
            base_url: self.destination_url.clone(),
            automation_path: self.automation_path.clone(),
            upload_path: self.upload_path.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            request_timeout: Duration::from_secs(self.request_timeout),
            log_requests: self.log_requests,
        }
    }

    pub fn credentials_config(&self) -> CredentialsConfig {
        let keycloak = match (&self.keycloak_url, &self.keycloak_username, &self.keycloak_password) {
            (Some(url), Some(username), Some(password)) if !url.trim().is_empty() => {
                Some(KeycloakConfig {
                    server_url: url.clone(),
                    realm: self.keycloak_realm.clone(),
                    client_id: self.keycloak_client_id.clone(),
                    username: username.clone(),
                    password: password.clone(),
                    max_retry_elapsed: Duration::from_secs(30),
                })
            }
            _ => None,
        };

        CredentialsConfig {
            static_token: self.token.clone().filter(|t| !t.trim().is_empty()),
            keycloak,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_attempts: self.max_attempts,
            default_user: self.default_user.clone(),
            default_department: self.default_department.clone(),
            tenant: self.tenant.clone(),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            core_size: self.pool_core,
            max_size: self.pool_max.max(self.pool_core),
            queue_capacity: self.pool_queue,
            keep_alive: Duration::from_secs(self.pool_keep_alive),
            ..Default::default()
        }
    }

    /// Open the store without destination access.
    pub fn open_store(&self) -> Result<Arc<MigrationStore>> {
        let config = self.store_config();
        let store = MigrationStore::open(&config.path)
            .map_err(|e| miette::miette!("failed to open {}: {}", config.path.display(), e))?;
        Ok(Arc::new(store))
    }

    /// Open the store and build the engine.
    ///
    /// Interrupted records are left alone here: only `serve`, as the long-lived
    /// owner of the database, recovers them at startup.
    pub fn build_engine(&self) -> Result<MigrationEngine> {
        let store = self.open_store()?;
        let tokens = self.credentials_config().provider()?;
        let destination = DestinationClient::new(self.destination_config(), tokens)
            .map_err(|e| miette::miette!("failed to create destination client: {}", e))?;

        Ok(MigrationEngine::new(
            store,
            Arc::new(destination),
            self.engine_config(),
            self.pool_config(),
        ))
    }
}
