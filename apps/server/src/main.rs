mod auth;
mod clock;
mod db;
mod guarantee;
mod handlers;
mod models;
mod rate_limit;
mod slots;
mod store;
mod stripe;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use auth::StaffDirectory;
use guarantee::GuaranteeManager;
use rate_limit::{rate_limit_admin, rate_limit_booking, rate_limit_public, RateLimiter};
use stripe::StripeGateway;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub guarantees: Arc<GuaranteeManager>,
    pub webhook_secret: String,
    pub staff: StaffDirectory,
    pub started_at: Instant,
}

/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Env ──
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:clipbook.db?mode=rwc".into());
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".into());
    let stripe_secret_key = std::env::var("STRIPE_SECRET_KEY").unwrap_or_default();
    let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default();
    let staff_tokens = std::env::var("STAFF_TOKENS").unwrap_or_default();
    let webapp_url =
        std::env::var("WEBAPP_URL").unwrap_or_else(|_| "https://example.com".into());

    if stripe_secret_key.is_empty() {
        tracing::warn!("STRIPE_SECRET_KEY not set — card guarantees and charges will fail");
    }
    if webhook_secret.is_empty() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set — webhooks will be rejected");
    }

    // ── Database ──
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    db::run_migrations(&pool).await?;

    let gateway = Arc::new(StripeGateway::new(stripe_secret_key));
    let state = Arc::new(AppState {
        db: pool.clone(),
        guarantees: Arc::new(GuaranteeManager::new(pool, gateway)),
        webhook_secret,
        staff: StaffDirectory::from_env(&staff_tokens),
        started_at: Instant::now(),
    });

    // ── Rate limiter + cleanup task ──
    let rate_limiter = RateLimiter::new();
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    // ── CORS: whitelist WEBAPP_URL when configured, otherwise allow any ──
    let cors = if webapp_url != "https://example.com" {
        let origins: Vec<axum::http::HeaderValue> = vec![
            webapp_url.parse().expect("WEBAPP_URL must be a valid URL"),
            "http://localhost:5173".parse().unwrap(), // Vite dev server
        ];
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // ── Router (4 groups with per-group rate limits) ──

    // 1. No-limit: health checks + gateway webhooks (signature-gated).
    let no_limit_routes = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route("/api/webhooks/stripe", post(handlers::webhook::stripe_webhook));

    // 2. Public reads (60 req/min).
    let public_routes = Router::new()
        .route("/api/services", get(handlers::availability::list_services))
        .route(
            "/api/availability",
            get(handlers::availability::check_availability),
        )
        .route(
            "/api/availability/validate",
            post(handlers::availability::validate_slot),
        )
        .route(
            "/api/guest-bookings/check-payment-eligibility",
            post(handlers::guest::check_payment_eligibility),
        )
        .route(
            "/api/guest-bookings/by-email-phone",
            post(handlers::guest::bookings_by_email_phone),
        )
        .route("/api/gift-cards/{code}", get(handlers::gift_cards::lookup))
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_public));

    // 3. Booking writes: strictest limit (5 req/5min), they reach the
    //    payment gateway.
    let booking_routes = Router::new()
        .route(
            "/api/guest-bookings/create",
            post(handlers::guest::create_booking),
        )
        .route(
            "/api/guest-bookings/create-setup-intent",
            post(handlers::guest::create_setup_intent),
        )
        .route(
            "/api/guest-bookings/{id}/cancel",
            delete(handlers::guest::cancel_booking),
        )
        .layer(from_fn_with_state(
            rate_limiter.clone(),
            rate_limit_booking,
        ));

    // 4. Staff (120 req/min, bearer-token auth inside the handlers).
    let admin_routes = Router::new()
        .route("/api/admin/bookings", get(handlers::admin::list_bookings))
        .route(
            "/api/admin/bookings/{id}",
            get(handlers::admin::booking_detail),
        )
        .route(
            "/api/admin/bookings/{id}/status",
            put(handlers::admin::update_status),
        )
        .route(
            "/api/admin/bookings/{id}/charge-payment",
            post(handlers::admin::charge_payment),
        )
        .route(
            "/api/admin/bookings/{id}/retry-charge",
            post(handlers::admin::retry_charge),
        )
        .route(
            "/api/admin/bookings/{id}/mark-no-show",
            post(handlers::admin::mark_no_show),
        )
        .route(
            "/api/admin/bookings/guest-customer/{email}/{phone}",
            get(handlers::admin::guest_customer_history),
        )
        .route(
            "/api/admin/guest-customers/{id}/notes",
            put(handlers::admin::update_guest_notes),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_admin));

    let app = Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(booking_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    tracing::info!("Clipbook server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
