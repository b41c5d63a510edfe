use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const DEFAULT_STORAGE_DIR: &str = "./data/objects";
const DEFAULT_DATABASE_URL: &str = "sqlite://./data/meta/photo_store.db";

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

/// API server configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub upload_dir: String,
    pub max_upload_bytes: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Photo upload and retrieval API")]
pub struct Args {
    /// Host to bind to (overrides PHOTO_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PHOTO_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides PHOTO_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides PHOTO_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory for transient upload spools (overrides PHOTO_STORE_UPLOAD_DIR)
    #[arg(long)]
    pub upload_dir: Option<String>,

    /// Largest accepted image in bytes (overrides PHOTO_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("PHOTO_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("PHOTO_STORE_PORT", 8000u16)?;
        let env_storage =
            env::var("PHOTO_STORE_STORAGE_DIR").unwrap_or_else(|_| DEFAULT_STORAGE_DIR.into());
        let env_db =
            env::var("PHOTO_STORE_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.into());
        let env_upload =
            env::var("PHOTO_STORE_UPLOAD_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_max_upload = env_or("PHOTO_STORE_MAX_UPLOAD_BYTES", 10 * 1024 * 1024u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            upload_dir: args.upload_dir.unwrap_or(env_upload),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resize worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub storage_dir: String,
    pub database_url: String,
    pub concurrency: usize,
    pub max_attempts: i64,
    pub lease: Duration,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    pub jpeg_quality: u8,
    pub reconcile_interval: Duration,
    pub reconcile_grace: Duration,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Derives resized renditions for uploaded photos")]
pub struct WorkerArgs {
    /// Directory where objects are stored (overrides PHOTO_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides PHOTO_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Consumer tasks in this process (overrides RESIZE_WORKER_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Deliveries before a job is dead-lettered (overrides RESIZE_WORKER_MAX_ATTEMPTS)
    #[arg(long)]
    pub max_attempts: Option<i64>,

    /// Per-job processing budget in seconds (overrides RESIZE_WORKER_JOB_TIMEOUT_SECS)
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,

    /// JPEG quality for renditions (overrides RESIZE_WORKER_JPEG_QUALITY)
    #[arg(long)]
    pub jpeg_quality: Option<u8>,
}

impl WorkerConfig {
    pub fn from_env_and_args() -> Result<Self> {
        let args = WorkerArgs::parse();

        let env_storage =
            env::var("PHOTO_STORE_STORAGE_DIR").unwrap_or_else(|_| DEFAULT_STORAGE_DIR.into());
        let env_db =
            env::var("PHOTO_STORE_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.into());

        let cfg = Self {
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            concurrency: match args.concurrency {
                Some(n) => n,
                None => env_or("RESIZE_WORKER_CONCURRENCY", 1usize)?,
            }
            .max(1),
            max_attempts: match args.max_attempts {
                Some(n) => n,
                None => env_or("RESIZE_WORKER_MAX_ATTEMPTS", 5i64)?,
            }
            .max(1),
            lease: Duration::from_secs(env_or("RESIZE_WORKER_LEASE_SECS", 120u64)?),
            job_timeout: Duration::from_secs(match args.job_timeout_secs {
                Some(secs) => secs,
                None => env_or("RESIZE_WORKER_JOB_TIMEOUT_SECS", 60u64)?,
            }),
            poll_interval: Duration::from_millis(env_or("RESIZE_WORKER_POLL_MS", 500u64)?),
            jpeg_quality: match args.jpeg_quality {
                Some(q) => q,
                None => env_or("RESIZE_WORKER_JPEG_QUALITY", 85u8)?,
            }
            .clamp(1, 100),
            reconcile_interval: Duration::from_secs(env_or(
                "RESIZE_WORKER_RECONCILE_INTERVAL_SECS",
                300u64,
            )?),
            reconcile_grace: Duration::from_secs(env_or(
                "RESIZE_WORKER_RECONCILE_GRACE_SECS",
                600u64,
            )?),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the consumer loop or the reconciler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.job_timeout >= self.lease {
            anyhow::bail!(
                "job timeout ({:?}) must be shorter than the lease ({:?})",
                self.job_timeout,
                self.lease
            );
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("RESIZE_WORKER_POLL_MS must be at least 1");
        }
        if self.reconcile_interval.is_zero() {
            anyhow::bail!("RESIZE_WORKER_RECONCILE_INTERVAL_SECS must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            storage_dir: "./data/objects".into(),
            database_url: DEFAULT_DATABASE_URL.into(),
            concurrency: 1,
            max_attempts: 5,
            lease: Duration::from_secs(120),
            job_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            jpeg_quality: 85,
            reconcile_interval: Duration::from_secs(300),
            reconcile_grace: Duration::from_secs(600),
        }
    }

    #[test]
    fn default_worker_config_is_valid() {
        worker_config().validate().unwrap();
    }

    #[test]
    fn zero_reconcile_interval_is_rejected() {
        let cfg = WorkerConfig {
            reconcile_interval: Duration::ZERO,
            ..worker_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("RECONCILE_INTERVAL"), "{err}");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let cfg = WorkerConfig {
            poll_interval: Duration::ZERO,
            ..worker_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("POLL_MS"), "{err}");
    }

    #[test]
    fn job_timeout_must_be_shorter_than_lease() {
        let cfg = WorkerConfig {
            job_timeout: Duration::from_secs(120),
            ..worker_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_or_falls_back_when_unset() {
        let port: u16 = env_or("PHOTO_STORE_TEST_SURELY_UNSET_VAR", 8123).unwrap();
        assert_eq!(port, 8123);
    }
}
