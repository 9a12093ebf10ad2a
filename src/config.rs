use color_eyre::eyre::{eyre, Report, WrapErr};
use std::{env, fmt::Display, str::FromStr, time::Duration};
use tracing::info;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: String,
    pub database_url: Option<String>,
    /// Origin the scan-to-vote links point at.
    pub public_base_url: String,
    pub token_check_interval: Duration,
    pub result_refresh_interval: Duration,
    /// Lifetime of a credential that was never used to vote.
    pub token_ttl: Duration,
    pub token_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_owned(),
            database_url: None,
            public_base_url: "http://localhost:8080".to_owned(),
            token_check_interval: Duration::from_millis(1000),
            result_refresh_interval: Duration::from_millis(2000),
            token_ttl: Duration::from_secs(900),
            token_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Report> {
        let defaults = Self::default();
        let config = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            public_base_url: env::var("PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
            token_check_interval: Duration::from_millis(try_load(
                "TOKEN_CHECK_INTERVAL_MS",
                defaults.token_check_interval.as_millis() as u64,
            )?),
            result_refresh_interval: Duration::from_millis(try_load(
                "RESULT_REFRESH_INTERVAL_MS",
                defaults.result_refresh_interval.as_millis() as u64,
            )?),
            token_ttl: Duration::from_secs(try_load("TOKEN_TTL_SECS", defaults.token_ttl.as_secs())?),
            token_sweep_interval: Duration::from_secs(try_load(
                "TOKEN_SWEEP_INTERVAL_SECS",
                defaults.token_sweep_interval.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Report> {
        for (key, value) in [
            ("TOKEN_CHECK_INTERVAL_MS", self.token_check_interval),
            ("RESULT_REFRESH_INTERVAL_MS", self.result_refresh_interval),
            ("TOKEN_SWEEP_INTERVAL_SECS", self.token_sweep_interval),
            ("TOKEN_TTL_SECS", self.token_ttl),
        ] {
            if value.is_zero() {
                return Err(eyre!("{} must be greater than zero", key));
            }
        }
        Ok(())
    }

    /// Link a display encodes into its QR code.
    pub fn vote_url(&self, poll_id: impl Display, token: impl Display) -> String {
        format!(
            "{}/#/vote/{}/{}",
            self.public_base_url.trim_end_matches('/'),
            poll_id,
            token
        )
    }
}

fn try_load<T>(key: &str, default: T) -> Result<T, Report>
where
    T: FromStr + Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .wrap_err_with(|| format!("Invalid {} value {:?}", key, value)),
        Err(_) => {
            info!("{} not set, using default: {}", key, default);
            Ok(default)
        }
    }
}
