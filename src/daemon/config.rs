//! Configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{cmp, env, fs, io};

use log::LevelFilter;
use serde::de;
use serde::{Deserialize, Deserializer};

use crate::commons::{Error, WardResult};
use crate::constants::{CERTWARD_ENV_ADMIN_TOKEN, CERTWARD_ENV_LOG_LEVEL};

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn ip() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    fn port() -> u16 {
        3000
    }

    fn log_level() -> LevelFilter {
        match env::var(CERTWARD_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized log level '{level}' in env");
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./certward.log")
    }

    fn admin_token() -> Option<String> {
        env::var(CERTWARD_ENV_ADMIN_TOKEN).ok()
    }

    fn token_validity_hours() -> i64 {
        24
    }

    fn rpc_timeout_secs() -> u64 {
        30
    }

    fn ca_pacing_secs() -> u64 {
        60
    }

    fn check_interval_secs() -> u64 {
        3600
    }

    fn renew_interval_secs() -> u64 {
        3600
    }

    fn renew_before_days() -> i64 {
        30
    }

    fn renew_ttl_secs() -> i64 {
        3600
    }

    fn revoke_unresolvable_hours() -> i64 {
        168
    }

    fn enroll_endpoint() -> String {
        "/enroll".to_string()
    }

    fn collect_endpoint() -> String {
        "/collect".to_string()
    }

    fn revoke_endpoint() -> String {
        "/revoke".to_string()
    }

    fn bit_size() -> u32 {
        2048
    }

    fn term() -> u32 {
        12
    }

    fn cert_type() -> String {
        "SSL".to_string()
    }

    fn multi_domain_cert_type() -> String {
        "MultiDomainSSL".to_string()
    }

    fn format_type() -> String {
        "x509CO".to_string()
    }
}

//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::ip")]
    pub ip: IpAddr,

    #[serde(default = "ConfigDefaults::port")]
    pub port: u16,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    /// A master token granting administrative access when presented as a
    /// bearer token. Overridden by the environment.
    #[serde(default = "ConfigDefaults::admin_token")]
    pub admin_token: Option<String>,

    /// The HMAC secret issued tokens are signed with.
    pub token_secret: String,

    #[serde(default = "ConfigDefaults::token_validity_hours")]
    pub token_validity_hours: i64,

    #[serde(default = "ConfigDefaults::rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,

    /// Pause before every CA call. The CA rate-limits aggressively, so a
    /// backlog of lifecycle work is drained slowly on purpose.
    #[serde(default = "ConfigDefaults::ca_pacing_secs")]
    pub ca_pacing_secs: u64,

    #[serde(default = "ConfigDefaults::check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "ConfigDefaults::renew_interval_secs")]
    pub renew_interval_secs: u64,

    /// Subjects expiring within this many days are queued for renewal.
    #[serde(default = "ConfigDefaults::renew_before_days")]
    pub renew_before_days: i64,

    /// Renewal requests left on the queue longer than this are stale and
    /// expire; the next scan publishes fresh ones.
    #[serde(default = "ConfigDefaults::renew_ttl_secs")]
    pub renew_ttl_secs: i64,

    /// A subject unresolvable for longer than this is revoked and
    /// forgotten.
    #[serde(default = "ConfigDefaults::revoke_unresolvable_hours")]
    pub revoke_unresolvable_hours: i64,

    pub ca: CaConfig,

    #[serde(default)]
    pub cert_params: CertParams,
}

impl Config {
    /// Reads and verifies the config file.
    pub fn create(file: &Path) -> WardResult<Config> {
        let config = Self::read_config(file)?;
        config.verify()?;
        Ok(config)
    }

    fn read_config(file: &Path) -> WardResult<Config> {
        let bytes = fs::read_to_string(file).map_err(|e| {
            Error::IoError(io::Error::new(
                e.kind(),
                format!("Could not read config file '{}'", file.display()),
            ))
        })?;
        toml::from_str(&bytes).map_err(|e| {
            Error::custom(format!(
                "Error parsing config file '{}': {}",
                file.display(),
                e
            ))
        })
    }

    fn verify(&self) -> WardResult<()> {
        if self.token_secret.len() < 16 {
            return Err(Error::custom(
                "'token_secret' must be at least 16 characters",
            ));
        }
        if self.ca.url.is_empty() {
            return Err(Error::custom("'ca.url' must be set"));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Initializes logging as configured. Call once, at startup.
    pub fn init_logging(&self) -> WardResult<()> {
        match self.log_type {
            LogType::Stderr => self.fern_logger().chain(io::stderr()).apply(),
            LogType::File => {
                let file = fern::log_file(&self.log_file).map_err(|e| {
                    Error::custom(format!(
                        "Could not open log file '{}': {}",
                        self.log_file.display(),
                        e
                    ))
                })?;
                self.fern_logger().chain(file).apply()
            }
        }
        .map_err(|e| Error::custom(format!("Failed to init logging: {e}")))
    }

    fn fern_logger(&self) -> fern::Dispatch {
        // Frameworks are chatty at debug; keep them at warn unless the
        // operator asked for less than that anyway.
        let framework_level = cmp::min(self.log_level, LevelFilter::Warn);

        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}] [{}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(self.log_level)
            .level_for("hyper", framework_level)
            .level_for("reqwest", framework_level)
            .level_for("tokio", framework_level)
    }
}

//------------ LogType -------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stderr,
    File,
}

//------------ CaConfig ------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct CaConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub customer_uri: String,

    #[serde(default = "ConfigDefaults::enroll_endpoint")]
    pub enroll_endpoint: String,

    #[serde(default = "ConfigDefaults::collect_endpoint")]
    pub collect_endpoint: String,

    #[serde(default = "ConfigDefaults::revoke_endpoint")]
    pub revoke_endpoint: String,
}

//------------ CertParams ----------------------------------------------------

/// The fixed parts of every CSR and enrollment order.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CertParams {
    pub country: String,
    pub province: String,
    pub locality: String,
    pub organization: String,
    pub org_unit: String,

    pub bit_size: u32,

    /// Validity term in months, as the CA counts it.
    pub term: u32,

    pub cert_type: String,
    pub multi_domain_cert_type: String,
    pub format_type: String,
    pub comments: String,
}

impl Default for CertParams {
    fn default() -> Self {
        CertParams {
            country: String::new(),
            province: String::new(),
            locality: String::new(),
            organization: String::new(),
            org_unit: String::new(),
            bit_size: ConfigDefaults::bit_size(),
            term: ConfigDefaults::term(),
            cert_type: ConfigDefaults::cert_type(),
            multi_domain_cert_type: ConfigDefaults::multi_domain_cert_type(),
            format_type: ConfigDefaults::format_type(),
            comments: String::new(),
        }
    }
}

//------------ Deserialization helpers ---------------------------------------

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        token_secret = "correct horse battery staple"

        [ca]
        url = "https://ca.example.com/api"
        username = "certward"
        password = "hunter2"
        customer_uri = "example"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.verify().unwrap();

        assert_eq!(config.port, 3000);
        assert_eq!(config.ca_pacing_secs, 60);
        assert_eq!(config.revoke_unresolvable_hours, 168);
        assert_eq!(config.renew_before_days, 30);
        assert_eq!(config.log_type, LogType::Stderr);
        assert_eq!(config.ca.enroll_endpoint, "/enroll");
        assert_eq!(config.cert_params.bit_size, 2048);
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            ip = "0.0.0.0"
            port = 8443
            log_level = "debug"
            log_type = "file"
            log_file = "/var/log/certward.log"
            token_secret = "correct horse battery staple"
            admin_token = "super-secret"
            ca_pacing_secs = 0
            renew_before_days = 14
            revoke_unresolvable_hours = 336

            [ca]
            url = "https://ca.example.com/api"
            username = "certward"
            password = "hunter2"
            customer_uri = "example"
            enroll_endpoint = "/ssl/v1/enroll"

            [cert_params]
            country = "NL"
            organization = "Example Corp"
            bit_size = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 8443);
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.log_type, LogType::File);
        assert_eq!(config.admin_token.as_deref(), Some("super-secret"));
        assert_eq!(config.ca_pacing_secs, 0);
        assert_eq!(config.ca.enroll_endpoint, "/ssl/v1/enroll");
        assert_eq!(config.cert_params.bit_size, 4096);
        assert_eq!(config.cert_params.term, 12);
    }

    #[test]
    fn config_is_read_from_a_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::create(file.path()).unwrap();
        assert_eq!(config.port, 3000);

        assert!(Config::create(Path::new("/nonexistent.conf")).is_err());
    }

    #[test]
    fn short_secret_is_refused() {
        let config: Config = toml::from_str(
            r#"
            token_secret = "short"

            [ca]
            url = "https://ca.example.com/api"
            username = "certward"
            password = "hunter2"
            customer_uri = "example"
            "#,
        )
        .unwrap();

        assert!(config.verify().is_err());
    }
}
