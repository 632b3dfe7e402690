//! API Service - Read contract over the star-schema warehouse
//!
//! Endpoints:
//! - GET  /health  - Health check
//! - GET  /summary - Row counts for the six warehouse tables
//! - GET  /orders  - Joined order details with filters
//! - POST /query   - Ad-hoc read-only SQL with an enforced row cap
//!
//! Every session this service opens is read-only with bounded lock and
//! statement waits, so an expensive or stuck ad-hoc query degrades
//! predictably instead of holding the warehouse hostage.

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, Executor, PgPool, Row};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Appended to ad-hoc queries that don't cap themselves.
const QUERY_DEFAULT_LIMIT: i64 = 500;

const WAREHOUSE_TABLES: &[&str] = &[
    "region",
    "country",
    "productcategory",
    "product",
    "customer",
    "orderdetail",
];

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct TableCount {
    table: String,
    rows: i64,
}

#[derive(Serialize)]
struct OrderResponse {
    orderid: i32,
    orderdate: NaiveDate,
    quantityordered: i32,
    firstname: String,
    lastname: String,
    country: String,
    region: String,
    productname: String,
    productunitprice: f32,
    productcategory: String,
}

#[derive(Serialize)]
struct AdhocResponse {
    rows: serde_json::Value,
    limit_applied: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct OrdersQuery {
    customer_id: Option<i32>,
    product_id: Option<i32>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct AdhocQuery {
    sql: String,
}

// ============================================================================
// Ad-hoc SQL guards
// ============================================================================

fn limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\blimit\b").unwrap())
}

fn write_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(insert|update|delete|drop|alter|truncate|create|grant|copy)\b")
            .unwrap()
    })
}

/// Appends the default row cap when the statement carries no LIMIT of its
/// own. Returns the statement to run and whether a cap was added.
fn ensure_limit(sql: &str, default_limit: i64) -> (String, bool) {
    let stripped = sql.trim().trim_end_matches(';').trim_end();
    if limit_re().is_match(stripped) {
        (stripped.to_string(), false)
    } else {
        (format!("{stripped} LIMIT {default_limit}"), true)
    }
}

/// Accepts a single SELECT/WITH statement with no write keywords. The session
/// itself is read-only, so this is a friendly 400 rather than the real guard.
fn check_read_only(sql: &str) -> Result<(), String> {
    let stripped = sql.trim().trim_end_matches(';').trim_end();
    if stripped.is_empty() {
        return Err("empty query".to_string());
    }
    if stripped.contains(';') {
        return Err("multiple statements are not allowed".to_string());
    }
    let lowered = stripped.to_lowercase();
    if !(lowered.starts_with("select") || lowered.starts_with("with")) {
        return Err("only SELECT queries are allowed".to_string());
    }
    if write_re().is_match(stripped) {
        return Err("write statements are not allowed".to_string());
    }
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut tables = Vec::with_capacity(WAREHOUSE_TABLES.len());

    for table in WAREHOUSE_TABLES {
        let count: Result<(i64,), _> = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&state.pool)
            .await;

        match count {
            Ok((rows,)) => tables.push(TableCount {
                table: (*table).to_string(),
                rows,
            }),
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: e.to_string(),
                    }),
                )
                    .into_response();
            }
        }
    }

    Json(serde_json::json!({ "tables": tables })).into_response()
}

async fn orders_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OrdersQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(QUERY_DEFAULT_LIMIT).min(1000);

    // Build dynamic query
    let mut query = String::from(
        r#"
        SELECT o.orderid, o.orderdate, o.quantityordered,
               c.firstname, c.lastname, co.country, r.region,
               p.productname, p.productunitprice, pc.productcategory
        FROM orderdetail o
        JOIN customer c ON o.customerid = c.customerid
        JOIN country co ON c.countryid = co.countryid
        JOIN region r ON co.regionid = r.regionid
        JOIN product p ON o.productid = p.productid
        JOIN productcategory pc ON p.productcategoryid = pc.productcategoryid
        WHERE 1=1
        "#,
    );

    let mut idx = 1;
    if params.customer_id.is_some() {
        query.push_str(&format!(" AND o.customerid = ${idx}"));
        idx += 1;
    }
    if params.product_id.is_some() {
        query.push_str(&format!(" AND o.productid = ${idx}"));
        idx += 1;
    }
    if params.from.is_some() {
        query.push_str(&format!(" AND o.orderdate >= ${idx}"));
        idx += 1;
    }
    if params.to.is_some() {
        query.push_str(&format!(" AND o.orderdate <= ${idx}"));
        idx += 1;
    }
    query.push_str(&format!(
        " ORDER BY o.orderdate DESC, o.orderid DESC LIMIT ${idx}"
    ));

    let mut q = sqlx::query(&query);
    if let Some(cid) = params.customer_id {
        q = q.bind(cid);
    }
    if let Some(pid) = params.product_id {
        q = q.bind(pid);
    }
    if let Some(from) = params.from {
        q = q.bind(from);
    }
    if let Some(to) = params.to {
        q = q.bind(to);
    }
    q = q.bind(limit);

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let orders: Vec<OrderResponse> = rows
                .iter()
                .map(|row| OrderResponse {
                    orderid: row.get("orderid"),
                    orderdate: row.get("orderdate"),
                    quantityordered: row.get("quantityordered"),
                    firstname: row.get("firstname"),
                    lastname: row.get("lastname"),
                    country: row.get("country"),
                    region: row.get("region"),
                    productname: row.get("productname"),
                    productunitprice: row.get("productunitprice"),
                    productcategory: row.get("productcategory"),
                })
                .collect();
            Json(serde_json::json!({ "orders": orders })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AdhocQuery>,
) -> impl IntoResponse {
    if let Err(reason) = check_read_only(&body.sql) {
        return (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: reason })).into_response();
    }

    let (sql, limit_applied) = ensure_limit(&body.sql, QUERY_DEFAULT_LIMIT);

    // json_agg turns an arbitrary result shape into one JSON value, so no
    // column-by-column decoding is needed on this side.
    let wrapped = format!("SELECT COALESCE(json_agg(row_to_json(q)), '[]'::json) FROM ({sql}) q");

    let result: Result<(serde_json::Value,), sqlx::Error> =
        sqlx::query_as(&wrapped).fetch_one(&state.pool).await;

    match result {
        Ok((rows,)) => Json(AdhocResponse {
            rows,
            limit_applied,
        })
        .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Main
// ============================================================================

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    // Read-side sessions keep much tighter waits than the pipeline's: an
    // ad-hoc query that cannot run quickly should fail quickly.
    let lock_timeout_ms = env_u64("API_LOCK_TIMEOUT_MS", 3_000);
    let statement_timeout_ms = env_u64("API_STATEMENT_TIMEOUT_MS", 15_000);
    let connect_timeout_s = env_u64("API_CONNECT_TIMEOUT_S", 5);

    println!("=== Warehouse API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(connect_timeout_s))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute("SET default_transaction_read_only = on").await?;
                conn.execute(format!("SET lock_timeout = {lock_timeout_ms}").as_str())
                    .await?;
                conn.execute(format!("SET statement_timeout = {statement_timeout_ms}").as_str())
                    .await?;
                conn.execute(
                    format!(
                        "SET idle_in_transaction_session_timeout = {}",
                        lock_timeout_ms * 10
                    )
                    .as_str(),
                )
                .await?;
                Ok(())
            })
        })
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");

    let state = Arc::new(AppState { pool });

    // CORS for web frontends issuing ad-hoc reads
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/summary", get(summary_handler))
        .route("/orders", get(orders_handler))
        .route("/query", post(query_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{bind}");
    println!("\nEndpoints:");
    println!("  GET  /health");
    println!("  GET  /summary");
    println!("  GET  /orders?customer_id=&product_id=&from=&to=&limit=");
    println!("  POST /query  {{\"sql\": \"SELECT ...\"}}");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------------
    // ROW CAP
    // ------------------------------------------------------------------------

    #[test]
    fn test_ensure_limit_appends_cap() {
        let (sql, applied) = ensure_limit("SELECT * FROM region", 500);
        assert_eq!(sql, "SELECT * FROM region LIMIT 500");
        assert!(applied);
    }

    #[test]
    fn test_ensure_limit_keeps_existing_cap() {
        let (sql, applied) = ensure_limit("select * from region limit 10", 500);
        assert_eq!(sql, "select * from region limit 10");
        assert!(!applied);
    }

    #[test]
    fn test_ensure_limit_detects_mixed_case() {
        let (_, applied) = ensure_limit("SELECT * FROM region Limit 10", 500);
        assert!(!applied);
    }

    #[test]
    fn test_ensure_limit_strips_trailing_semicolon() {
        let (sql, applied) = ensure_limit("SELECT * FROM region;", 500);
        assert_eq!(sql, "SELECT * FROM region LIMIT 500");
        assert!(applied);
    }

    #[test]
    fn test_ensure_limit_ignores_limit_inside_identifier() {
        // "unlimited" must not count as a LIMIT clause.
        let (sql, applied) = ensure_limit("SELECT unlimited FROM region", 500);
        assert!(applied);
        assert!(sql.ends_with("LIMIT 500"));
    }

    // ------------------------------------------------------------------------
    // READ-ONLY CHECK
    // ------------------------------------------------------------------------

    #[test]
    fn test_check_read_only_accepts_select() {
        assert!(check_read_only("SELECT country FROM country").is_ok());
    }

    #[test]
    fn test_check_read_only_accepts_cte() {
        assert!(check_read_only("WITH r AS (SELECT * FROM region) SELECT * FROM r").is_ok());
    }

    #[test]
    fn test_check_read_only_accepts_trailing_semicolon() {
        assert!(check_read_only("SELECT 1;").is_ok());
    }

    #[test]
    fn test_check_read_only_rejects_empty() {
        assert!(check_read_only("   ").is_err());
    }

    #[test]
    fn test_check_read_only_rejects_update() {
        assert!(check_read_only("UPDATE product SET productunitprice = 0").is_err());
    }

    #[test]
    fn test_check_read_only_rejects_multiple_statements() {
        assert!(check_read_only("SELECT 1; DROP TABLE region").is_err());
    }

    #[test]
    fn test_check_read_only_rejects_writing_cte() {
        let sql = "WITH gone AS (DELETE FROM region RETURNING *) SELECT * FROM gone";
        assert!(check_read_only(sql).is_err());
    }
}
