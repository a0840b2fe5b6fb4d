use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use flow_auth::error::{config_error, ConfigErrorKind, Error};
use flow_auth::http::HttpClientConfig;
use flow_auth::oauth::{ClientAuthMethod, ClientConfig};
use flow_auth::providers::{Endpoints, Region};
use flow_auth::token::TokenRequestEncoding;
use log::LevelFilter;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STORE_PATH: &str = ".flow-auth/flows.json";

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// PingOne region whose authorization host serves the environment (na, eu, ca, ap, au).
    #[arg(long, env, default_value_t = Region::NorthAmerica)]
    pub region: Region,

    /// Authorization server base URL. Overrides the region when set.
    #[arg(long, env)]
    auth_base_url: Option<String>,

    /// Environment ID the flows run against.
    #[arg(short, long, env)]
    environment_id: Option<String>,

    /// Registered OAuth client ID.
    #[arg(long, env)]
    client_id: Option<String>,

    /// Client secret for confidential clients.
    #[arg(long, env, hide_env_values = true)]
    client_secret: Option<String>,

    /// How the client authenticates at the token endpoint.
    #[arg(long, env, default_value_t = ClientAuthMethod::ClientSecretPost)]
    pub client_auth_method: ClientAuthMethod,

    /// Path to a PEM RSA key for private_key_jwt.
    #[arg(long, env)]
    signing_key_path: Option<PathBuf>,

    /// Key ID placed in the header of signed client assertions.
    #[arg(long, env)]
    signing_key_id: Option<String>,

    /// Redirect URI registered for the client.
    #[arg(long, env)]
    pub redirect_uri: Option<String>,

    /// Requested scopes. Empty means the per-flow defaults.
    #[arg(long, env, value_delimiter = ',', use_value_delimiter = true)]
    pub scopes: Vec<String>,

    /// Fetch the OpenID discovery document and use the endpoints it advertises.
    #[arg(long, env, default_value_t = false)]
    pub discover: bool,

    /// Send token requests as JSON instead of form-encoded.
    #[arg(long, env, default_value_t = false)]
    pub token_request_json: bool,

    /// Unified flow store file.
    #[arg(long, env, default_value = DEFAULT_STORE_PATH)]
    pub store_path: PathBuf,

    /// Store file written by older versions. Its entries are migrated on first use.
    #[arg(long, env)]
    pub legacy_store_path: Option<PathBuf>,

    /// 64 hex characters. When set, stored values are encrypted with AES-256-GCM.
    #[arg(long, env, hide_env_values = true)]
    store_encryption_key: Option<String>,

    /// Fraction of a token's lifetime after which it is refreshed.
    #[arg(long, env, default_value_t = flow_auth::token::DEFAULT_TTL_PERCENT)]
    pub token_ttl_percent: f64,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, env, default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Retries for idempotent requests such as discovery.
    #[arg(long, env, default_value_t = 3)]
    pub http_max_retries: u32,

    /// Stop polling after this many seconds even if the grant is still alive.
    #[arg(long, env)]
    pub poll_timeout_secs: Option<u64>,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)),
        )]
    pub log_level_filter: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        load_dotenv();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn environment_id(&self) -> Result<&str, Error> {
        self.environment_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                config_error(
                    ConfigErrorKind::MissingField("environment_id"),
                    "set ENVIRONMENT_ID or --environment-id",
                )
            })
    }

    pub fn set_environment_id(mut self, environment_id: &str) -> Self {
        self.environment_id = Some(environment_id.to_string());
        self
    }

    pub fn set_auth_base_url(mut self, auth_base_url: &str) -> Self {
        self.auth_base_url = Some(auth_base_url.to_string());
        self
    }

    pub fn set_client(mut self, client_id: &str, client_secret: Option<&str>) -> Self {
        self.client_id = Some(client_id.to_string());
        self.client_secret = client_secret.map(str::to_string);
        self
    }

    pub fn auth_base_url(&self) -> &str {
        self.auth_base_url
            .as_deref()
            .unwrap_or_else(|| self.region.auth_base_url())
    }

    pub fn endpoints(&self) -> Result<Endpoints, Error> {
        Endpoints::from_base(self.auth_base_url(), self.environment_id()?)
    }

    /// Client settings, validated against the chosen authentication method.
    pub fn client(&self) -> Result<ClientConfig, Error> {
        let client_id = self.client_id.as_deref().unwrap_or_default();
        let mut client = match &self.client_secret {
            Some(secret) => ClientConfig::confidential(client_id, secret, self.client_auth_method),
            None => ClientConfig {
                auth_method: self.client_auth_method,
                ..ClientConfig::public(client_id)
            },
        };
        if let Some(path) = &self.signing_key_path {
            let pem = std::fs::read_to_string(path)?;
            client = client.with_signing_key(&pem, self.signing_key_id.as_deref());
        }
        client.validate()?;
        Ok(client)
    }

    pub fn store_encryption_key(&self) -> Option<&str> {
        self.store_encryption_key.as_deref()
    }

    pub fn http(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            max_retries: self.http_max_retries,
            ..HttpClientConfig::default()
        }
    }

    pub fn token_request_encoding(&self) -> TokenRequestEncoding {
        if self.token_request_json {
            TokenRequestEncoding::Json
        } else {
            TokenRequestEncoding::Form
        }
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_secs.map(Duration::from_secs)
    }
}

/// Load a `.env` file from the working directory, if there is one.
pub fn load_dotenv() {
    dotenv().ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_auth::ErrorKind;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["service"];
        argv.extend_from_slice(args);
        Config::parse_from(argv)
    }

    #[test]
    fn test_region_picks_auth_host() {
        let config = parse(&["--region", "eu", "--environment-id", "env-1"]);
        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints.token, "https://auth.pingone.eu/env-1/as/token");
    }

    #[test]
    fn test_base_url_overrides_region() {
        let config = parse(&["--region", "eu"])
            .set_environment_id("env-1")
            .set_auth_base_url("http://localhost:9000/");
        assert_eq!(
            config.endpoints().unwrap().authorization,
            "http://localhost:9000/env-1/as/authorize"
        );
    }

    #[test]
    fn test_missing_environment_id() {
        let err = parse(&[]).endpoints().unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Configuration(ConfigErrorKind::MissingField("environment_id"))
        );
    }

    #[test]
    fn test_basic_auth_needs_secret() {
        let config = parse(&["--client-id", "app", "--client-auth-method", "basic"]);
        assert!(config.client().is_err());

        let config = config.set_client("app", Some("shh"));
        assert_eq!(
            config.client().unwrap().auth_method,
            ClientAuthMethod::ClientSecretBasic
        );
    }

    #[test]
    fn test_scopes_are_comma_separated() {
        let config = parse(&["--scopes", "openid,profile,email"]);
        assert_eq!(config.scopes, vec!["openid", "profile", "email"]);
    }
}
