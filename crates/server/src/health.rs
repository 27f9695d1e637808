use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use kuria_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    dispatcher_configured: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: HealthCheck,
    pub dispatcher: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, dispatcher_configured: bool) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { db_pool, dispatcher_configured })
}

/// Readiness follows the database only. An unconfigured dispatcher is
/// reported but tier A actions then fail at dispatch time.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let dispatcher = if state.dispatcher_configured {
        HealthCheck { status: "ready", detail: "gateway endpoint configured".to_string() }
    } else {
        HealthCheck {
            status: "not_configured",
            detail: "set dispatch.endpoint to execute actions".to_string(),
        }
    };

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database,
        dispatcher,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM companies").fetch_one(pool).await {
        Ok(tenants) => HealthCheck { status: "ready", detail: format!("{tenants} tenants") },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use kuria_db::{connect_with_settings, migrations, DbPool};

    use crate::health::{health, HealthState};

    async fn migrated_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn health_is_ready_while_the_database_answers() {
        let pool = migrated_pool().await;

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), dispatcher_configured: false })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.detail, "0 tenants");
        assert_eq!(payload.dispatcher.status, "not_configured");

        pool.close().await;
    }

    #[tokio::test]
    async fn closed_pool_reports_degraded() {
        let pool = migrated_pool().await;
        pool.close().await;

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool, dispatcher_configured: true })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.dispatcher.status, "ready");
    }
}
