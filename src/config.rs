use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{Context, Result};

/// Tunables of the verification pipeline.
#[derive(Clone, Debug)]
pub struct AttendancePolicy {
    /// Maximum distance from the session anchor, in meters.
    pub geofence_radius_meters: f64,
    /// Descriptors closer than this (Euclidean) are considered a match.
    pub face_match_threshold: f32,
    /// TTL used when a QR token is re-issued without an explicit TTL.
    pub qr_ttl_minutes: i64,
    /// Upper bound on every call into an external store.
    pub storage_timeout: Duration,
    /// Number of events buffered per session before slow observers lag.
    pub event_buffer: usize,
}

impl Default for AttendancePolicy {
    fn default() -> Self {
        Self {
            geofence_radius_meters: 100.0,
            face_match_threshold: 0.6,
            qr_ttl_minutes: 15,
            storage_timeout: Duration::from_secs(3),
            event_buffer: 64,
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database.
    pub database_url: String,
    /// The URL of the Redis server.
    pub redis_url: String,
    /// The address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// The browser origin allowed by CORS.
    pub cors_origin: String,
    /// Mark attempts a single caller may make per minute.
    pub mark_attempts_per_minute: u32,
    /// How often overdue sessions are swept closed.
    pub session_sweep_interval: Duration,
    /// Verification policy.
    pub policy: AttendancePolicy,
}

fn var_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {}", key))
}

impl Config {
    /// Creates a new `Config` from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = AttendancePolicy::default();

        let policy = AttendancePolicy {
            geofence_radius_meters: var_or("GEOFENCE_RADIUS_METERS", "100")?,
            face_match_threshold: var_or("FACE_MATCH_THRESHOLD", "0.6")?,
            qr_ttl_minutes: var_or("QR_TTL_MINUTES", "15")?,
            storage_timeout: Duration::from_millis(var_or("STORAGE_TIMEOUT_MS", "3000")?),
            event_buffer: var_or("EVENT_BUFFER", &defaults.event_buffer.to_string())?,
        };

        if policy.qr_ttl_minutes <= 0 {
            anyhow::bail!("QR_TTL_MINUTES must be positive");
        }
        if policy.event_buffer == 0 {
            anyhow::bail!("EVENT_BUFFER must be at least 1");
        }

        let session_sweep_interval = Duration::from_secs(var_or("SESSION_SWEEP_SECONDS", "60")?);
        if session_sweep_interval.is_zero() {
            anyhow::bail!("SESSION_SWEEP_SECONDS must be at least 1");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            bind_addr: var_or("BIND_ADDR", "127.0.0.1:3000")?,
            cors_origin: env::var("CORS_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            mark_attempts_per_minute: var_or("MARK_ATTEMPTS_PER_MINUTE", "10")?,
            session_sweep_interval,
            policy,
        })
    }
}
