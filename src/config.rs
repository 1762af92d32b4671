use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::models::upload_session::DEFAULT_CHUNK_SIZE;

const ENV_PREFIX: &str = "PROGRESSIVE_UPLOAD_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub staging_dir: String,
    pub finished_dir: String,
    pub database_url: String,
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
    pub session_retention_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub orphan_retention_secs: u64,
    pub orphan_sweep_interval_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable chunked upload staging service")]
pub struct Args {
    /// Host to bind to (overrides PROGRESSIVE_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PROGRESSIVE_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunks are staged (overrides PROGRESSIVE_UPLOAD_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Directory receiving finished objects (overrides PROGRESSIVE_UPLOAD_FINISHED_DIR)
    #[arg(long)]
    pub finished_dir: Option<String>,

    /// Database URL, or `memory` for a non-durable session store
    /// (overrides PROGRESSIVE_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Chunk size used when a client does not pick one, in bytes
    #[arg(long)]
    pub default_chunk_size: Option<u64>,

    /// Largest accepted chunk request body, in bytes
    #[arg(long)]
    pub max_chunk_size: Option<u64>,

    /// Idle time after which an unfinished upload is expired, in seconds
    #[arg(long)]
    pub session_retention_secs: Option<u64>,

    /// How often expired uploads are swept, in seconds
    #[arg(long)]
    pub session_sweep_interval_secs: Option<u64>,

    /// Age after which unowned staging files are deleted, in seconds
    #[arg(long)]
    pub orphan_retention_secs: Option<u64>,

    /// How often the staging area is swept for orphans, in seconds
    #[arg(long)]
    pub orphan_sweep_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `PROGRESSIVE_UPLOAD_{name}`, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match env::var(&key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let cfg = Self {
            host: args.host.map_or_else(|| env_or("HOST", "0.0.0.0".to_string()), Ok)?,
            port: args.port.map_or_else(|| env_or("PORT", 3000), Ok)?,
            staging_dir: args
                .staging_dir
                .map_or_else(|| env_or("STAGING_DIR", "./data/progressive".to_string()), Ok)?,
            finished_dir: args
                .finished_dir
                .map_or_else(|| env_or("FINISHED_DIR", "./data/finished".to_string()), Ok)?,
            database_url: args.database_url.map_or_else(
                || {
                    env_or(
                        "DATABASE_URL",
                        "sqlite://./data/meta/progressive_upload.db".to_string(),
                    )
                },
                Ok,
            )?,
            default_chunk_size: args
                .default_chunk_size
                .map_or_else(|| env_or("DEFAULT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE), Ok)?,
            max_chunk_size: args
                .max_chunk_size
                .map_or_else(|| env_or("MAX_CHUNK_SIZE", 64 * 1024 * 1024), Ok)?,
            session_retention_secs: args
                .session_retention_secs
                .map_or_else(|| env_or("SESSION_RETENTION_SECS", 24 * 60 * 60), Ok)?,
            session_sweep_interval_secs: args
                .session_sweep_interval_secs
                .map_or_else(|| env_or("SESSION_SWEEP_INTERVAL_SECS", 60 * 60), Ok)?,
            orphan_retention_secs: args
                .orphan_retention_secs
                .map_or_else(|| env_or("ORPHAN_RETENTION_SECS", 48 * 60 * 60), Ok)?,
            orphan_sweep_interval_secs: args
                .orphan_sweep_interval_secs
                .map_or_else(|| env_or("ORPHAN_SWEEP_INTERVAL_SECS", 6 * 60 * 60), Ok)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.default_chunk_size == 0 {
            bail!("default chunk size must be positive");
        }
        if self.default_chunk_size > self.max_chunk_size {
            bail!(
                "default chunk size {} exceeds the maximum chunk size {}",
                self.default_chunk_size,
                self.max_chunk_size
            );
        }
        if self.session_sweep_interval_secs == 0 || self.orphan_sweep_interval_secs == 0 {
            bail!("sweep intervals must be positive");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether sessions are kept in process memory instead of SQLite.
    pub fn uses_memory_store(&self) -> bool {
        self.database_url == "memory"
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_override_defaults() {
        let cfg = AppConfig::merge(Args {
            port: Some(8080),
            database_url: Some("memory".into()),
            default_chunk_size: Some(512),
            session_sweep_interval_secs: Some(5),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.default_chunk_size, 512);
        assert!(cfg.uses_memory_store());
        assert_eq!(cfg.session_sweep_interval(), Duration::from_secs(5));
        assert!(cfg.addr().ends_with(":8080"));
    }

    #[test]
    fn rejects_inconsistent_sizes() {
        let err = AppConfig::merge(Args {
            default_chunk_size: Some(10),
            max_chunk_size: Some(5),
            ..Default::default()
        });
        assert!(err.is_err());

        let err = AppConfig::merge(Args {
            orphan_sweep_interval_secs: Some(0),
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
