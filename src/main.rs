mod chat;
mod clock;
mod config;
mod db;
mod error;
mod providers;
mod quota;
mod router;
mod routes;
mod settings;
mod throttle;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::ServiceExt;
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use chat::ChatOrchestrator;
use clap::Parser;
use config::{Config, CorsMode};
use providers::{HttpCompletionBackend, ProviderCatalog};
use quota::{DailyQuotaLedger, MinuteWindowTracker, ProviderErrorLog};
use reqwest::Client;
use settings::SettingsStore;
use subtle::ConstantTimeEq;
use throttle::VisitorThrottle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turso::Database;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::clock::now_secs;

/// Session TTL: 24 hours (matches cookie Max-Age)
const SESSION_TTL_SECS: u64 = 86400;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

pub struct AppState {
    pub catalog: Arc<ProviderCatalog>,
    pub ledger: Arc<DailyQuotaLedger>,
    pub error_log: Arc<ProviderErrorLog>,
    pub settings: Arc<SettingsStore>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub db: Arc<Database>,
    pub admin_credentials: AdminCredentials,
    /// Whether to set Secure flag on cookies (true when not binding to localhost)
    pub secure_cookies: bool,
    /// When true, admin auth middleware is bypassed (for local development)
    pub disable_auth: bool,
}

/// Save a session token to the database
pub async fn save_session(db: &Database, token: &str, expires_at: u64) {
    let Ok(conn) = db::connect(db) else {
        return;
    };
    if let Err(e) = conn
        .execute(
            "INSERT OR REPLACE INTO admin_sessions (token, expires_at) VALUES (?, ?)",
            (token, expires_at as i64),
        )
        .await
    {
        tracing::warn!("Failed to save session: {e}");
    }
}

/// Validate a session token, returns true if valid and not expired
pub async fn validate_session(db: &Database, token: &str) -> bool {
    let Ok(conn) = db::connect(db) else {
        return false;
    };
    let Ok(mut rows) = conn
        .query(
            "SELECT expires_at FROM admin_sessions WHERE token = ?",
            [token],
        )
        .await
    else {
        return false;
    };
    let Some(row) = rows.next().await.ok().flatten() else {
        return false;
    };
    let Ok(expires_at) = row.get::<i64>(0) else {
        return false;
    };
    let now = now_secs() as i64;
    if now < expires_at {
        return true;
    }
    // Expired — clean it up
    let _ = conn
        .execute("DELETE FROM admin_sessions WHERE token = ?", [token])
        .await;
    false
}

/// Remove a session token from the database
pub async fn remove_session(db: &Database, token: &str) {
    if let Ok(conn) = db::connect(db) {
        let _ = conn
            .execute("DELETE FROM admin_sessions WHERE token = ?", [token])
            .await;
    }
}

#[derive(Parser)]
#[command(name = "folio-chat")]
#[command(about = "Quota-governed multi-provider chat backend for a portfolio site")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "FOLIO_CHAT_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "FOLIO_CHAT_PORT")]
    port: Option<u16>,
}

/// Parse a named cookie from the Cookie header
pub fn parse_cookie(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|cookie| {
        let (key, value) = cookie.trim().split_once('=')?;
        if key.trim() == name {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Middleware for admin routes authentication (session cookie or Basic Auth)
async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if state.disable_auth {
        return next.run(request).await;
    }

    let creds = &state.admin_credentials;

    // Check for session cookie first
    if let Some(cookie_header) = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        && let Some(token) = parse_cookie(cookie_header, "admin_session")
        && validate_session(&state.db, &token).await
    {
        return next.run(request).await;
    }

    // Fall through to Basic Auth check
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(auth_value) = auth_header else {
        return unauthorized_response();
    };

    let Some(encoded) = auth_value.strip_prefix("Basic ") else {
        return unauthorized_response();
    };

    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return unauthorized_response();
    };

    let Ok(credentials) = String::from_utf8(decoded) else {
        return unauthorized_response();
    };

    let Some((provided_user, provided_pass)) = credentials.split_once(':') else {
        return unauthorized_response();
    };

    // Constant-time comparison to prevent timing attacks
    let user_match = provided_user.as_bytes().ct_eq(creds.username.as_bytes());
    let pass_match = provided_pass.as_bytes().ct_eq(creds.password.as_bytes());

    if user_match.into() && pass_match.into() {
        next.run(request).await
    } else {
        unauthorized_response()
    }
}

fn unauthorized_response() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let database = db::open(&config.db_path())
        .await
        .expect("Failed to initialize database");

    let host = args.host.unwrap_or(config.host);
    let port = args.port.unwrap_or(config.port);

    let catalog = Arc::new(ProviderCatalog::builtin());
    let available = catalog.available_ids();
    if available.is_empty() {
        tracing::warn!("No provider credentials configured — every chat request will fail");
    } else {
        info!("Available providers: {}", available.join(", "));
    }

    // Shared HTTP client with connection pooling; the per-attempt timeout is
    // enforced by the orchestrator, this is a backstop on the transport.
    let http_client = Client::builder()
        .timeout(config.completion_timeout + Duration::from_secs(5))
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");

    let throttle = Arc::new(VisitorThrottle::new(
        config.visitor_rpm,
        config.visitor_rpd,
        config.reference_tz,
    ));
    let minute = Arc::new(MinuteWindowTracker::new());
    let ledger = Arc::new(DailyQuotaLedger::new(
        Arc::clone(&database),
        config.reference_tz,
    ));
    let error_log = Arc::new(ProviderErrorLog::new(Arc::clone(&database)));
    let settings = Arc::new(SettingsStore::new(Arc::clone(&database)));
    let backend = Arc::new(HttpCompletionBackend::new(http_client));

    let orchestrator = Arc::new(ChatOrchestrator::new(
        Arc::clone(&catalog),
        throttle,
        minute,
        Arc::clone(&ledger),
        Arc::clone(&error_log),
        Arc::clone(&settings),
        backend,
        config.completion_timeout,
    ));

    let admin_credentials = AdminCredentials {
        username: config.admin_username,
        password: config.admin_password,
    };

    let is_localhost = matches!(host.as_str(), "127.0.0.1" | "localhost" | "::1");
    let secure_cookies = !is_localhost;

    let disable_auth = config.disable_auth;
    if disable_auth {
        tracing::warn!("Admin authentication is DISABLED (FOLIO_CHAT_DISABLE_AUTH=1)");
    }

    let state = Arc::new(AppState {
        catalog,
        ledger,
        error_log,
        settings,
        orchestrator,
        db: database,
        admin_credentials,
        secure_cookies,
        disable_auth,
    });

    // CORS configuration based on environment
    let cors_origins = config.cors_mode.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };

            match &cors_origins {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("::1")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    match &config.cors_mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }

    // Admin API routes with OpenAPI spec generation
    let (api_router, openapi) = OpenApiRouter::with_openapi(Default::default())
        .routes(routes!(
            routes::admin::get_routing,
            routes::admin::update_routing
        ))
        .routes(routes!(routes::admin::get_errors))
        .routes(routes!(routes::admin::get_error_summary))
        .routes(routes!(routes::admin::get_usage_history))
        .split_for_parts();

    // Swagger UI + OpenAPI spec (accessible without authentication)
    let swagger_routes = Router::new().merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger").url("/api-docs/openapi.json", openapi),
    );

    // Auth endpoints (accessible without authentication)
    let auth_routes = Router::new()
        .route("/auth/login", post(routes::admin::login))
        .route("/auth/logout", post(routes::admin::logout))
        .route("/auth/check", get(routes::admin::auth_check));

    // Protected admin routes (session cookie or Basic Auth)
    let protected_routes = api_router.layer(middleware::from_fn_with_state(
        state.clone(),
        admin_auth_middleware,
    ));

    let admin_routes = Router::new()
        .merge(swagger_routes)
        .merge(auth_routes)
        .nest("/api", protected_routes);

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .route("/v1/chat", post(routes::chat::chat))
            .nest("/admin", admin_routes)
            .layer(cors)
            .with_state(state),
    );

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!(
        "Starting folio-chat v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);
    info!("Admin API: http://{}/admin/api", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service_with_connect_info::<SocketAddr>(
            app,
        ),
    )
    .await
    .unwrap();
}
