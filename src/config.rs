use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;
use dotenvy::dotenv;

/// CORS configuration mode
#[derive(Debug, Clone)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins (for public deployment behind the portfolio site)
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub admin_username: String,
    pub admin_password: String,
    pub cors_mode: CorsMode,
    pub disable_auth: bool,
    /// Fixed UTC offset in which "today" is computed for daily quotas
    pub reference_tz: FixedOffset,
    /// Hard ceiling on a single provider completion call
    pub completion_timeout: Duration,
    /// Visitor throttle: requests per rolling 60-second window
    pub visitor_rpm: u32,
    /// Visitor throttle: requests per reference-timezone calendar day
    pub visitor_rpd: u32,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let host = env::var("FOLIO_CHAT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("FOLIO_CHAT_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4300);

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("folio-chat");

        let disable_auth = env::var("FOLIO_CHAT_DISABLE_AUTH")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let admin_username = if disable_auth {
            env::var("FOLIO_CHAT_ADMIN_USERNAME").unwrap_or_default()
        } else {
            env::var("FOLIO_CHAT_ADMIN_USERNAME")
                .expect("FOLIO_CHAT_ADMIN_USERNAME must be set")
        };
        let admin_password = if disable_auth {
            env::var("FOLIO_CHAT_ADMIN_PASSWORD").unwrap_or_default()
        } else {
            env::var("FOLIO_CHAT_ADMIN_PASSWORD")
                .expect("FOLIO_CHAT_ADMIN_PASSWORD must be set")
        };

        // CORS configuration: "localhost" (default), "*" (allow all), or comma-separated origins
        let cors_mode = match env::var("FOLIO_CHAT_CORS_ORIGINS").as_deref() {
            Ok("*") => CorsMode::AllowAll,
            Ok(origins) if !origins.is_empty() => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
            _ => CorsMode::LocalhostOnly,
        };

        // Daily quotas reset at midnight in this zone, not server-local midnight
        let reference_tz = env::var("FOLIO_CHAT_REFERENCE_TZ")
            .unwrap_or_else(|_| "+00:00".to_string())
            .parse()
            .expect("FOLIO_CHAT_REFERENCE_TZ must be a fixed offset like +02:00");

        let completion_timeout = Duration::from_secs(
            env::var("FOLIO_CHAT_COMPLETION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
        );

        let visitor_rpm = env::var("FOLIO_CHAT_VISITOR_RPM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        let visitor_rpd = env::var("FOLIO_CHAT_VISITOR_RPD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        Self {
            host,
            port,
            data_dir,
            admin_username,
            admin_password,
            cors_mode,
            disable_auth,
            reference_tz,
            completion_timeout,
            visitor_rpm,
            visitor_rpd,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("folio-chat.db")
    }
}
