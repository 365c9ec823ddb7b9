//! A small HTTP front end over an in-memory record store.
//!
//! ```text
//! UPGUARD_API_SECRET=dev-secret RUST_LOG=upguard=debug \
//!     cargo run --example gate_server
//!
//! curl localhost:8080/records/jobs?status=open
//! curl -X POST -H 'Authorization: Bearer dev-secret' \
//!     -d '{"status":"open"}' localhost:8080/records/jobs
//! curl localhost:8080/health
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;
use upguard::context::Context;
use upguard::middleware::{LoggerMiddleware, Stack};
use upguard::security::ClientId;
use upguard::upstream::Mutation;
use upguard::{
    Config, Error, Idempotency, Invalidation, Method, Query, RequestGate, Response, Server,
    Shield, StatusCode, SystemClock, Upstream, UpstreamError,
};

/// Records keyed by resource name.
#[derive(Default)]
struct MemoryUpstream {
    tables: Mutex<HashMap<String, Vec<Value>>>,
}

#[async_trait]
impl Upstream for MemoryUpstream {
    async fn fetch(&self, resource: &str, query: &Query) -> Result<Value, UpstreamError> {
        let tables = self.tables.lock().await;
        let rows = tables.get(resource).cloned().unwrap_or_default();
        let matching: Vec<Value> = rows
            .into_iter()
            .filter(|row| {
                query
                    .params()
                    .iter()
                    .all(|(field, wanted)| {
                        row.get(field).and_then(Value::as_str) == Some(wanted.as_str())
                    })
            })
            .collect();
        Ok(Value::Array(matching))
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<Value, UpstreamError> {
        if !mutation.payload.is_object() {
            return Err(UpstreamError::Validation("payload must be a JSON object".into()));
        }
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(mutation.resource.clone()).or_default();
        let mut record = mutation.payload.clone();
        record["id"] = json!(format!("{}-{}", mutation.resource, rows.len() + 1));
        rows.push(record.clone());
        Ok(record)
    }
}

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::PermanentUpstream(_) => err
            .upstream_status()
            .map(StatusCode::from_upstream)
            .unwrap_or(StatusCode::UnprocessableEntity),
        Error::CircuitOpen | Error::TransientUpstream(_) => StatusCode::ServiceUnavailable,
        _ => StatusCode::InternalServerError,
    };
    Response::json(status, &json!({ "error": err.to_string() }))
}

async fn route(shield: Arc<Shield>, ctx: Context) -> Response {
    let request = ctx.request();
    let path = request.path().trim_end_matches('/');

    if path == "/health" {
        return Response::json(StatusCode::Ok, &shield.health());
    }
    let Some(resource) = path.strip_prefix("/records/").filter(|r| !r.is_empty()) else {
        return Response::json(StatusCode::NotFound, &json!({ "error": "not found" }));
    };

    match request.method() {
        Method::Get => {
            let query = request
                .query_params()
                .fold(Query::new(), |query, (k, v)| query.param(k, v));
            match shield.read(resource, &query, None).await {
                Ok(hit) => Response::json(StatusCode::Ok, &hit.data)
                    .header("X-Cache-Stale", hit.is_stale.to_string()),
                Err(err) => error_response(&err),
            }
        }
        Method::Post => {
            let payload: Value = match ctx.json() {
                Ok(payload) => payload,
                Err(err) => {
                    return Response::json(
                        StatusCode::BadRequest,
                        &json!({ "error": err.to_string() }),
                    );
                }
            };
            let actor = ctx
                .extensions()
                .get::<ClientId>()
                .map(ToString::to_string)
                .unwrap_or_default();
            let mutation = Mutation::create(resource, payload);
            let invalidate = [Invalidation::Resource(resource.to_string())];
            match shield
                .write(&actor, &mutation, Idempotency::NonIdempotent, &invalidate)
                .await
            {
                Ok(outcome) => Response::json(StatusCode::Created, &outcome.response),
                Err(err) => error_response(&err),
            }
        }
        _ => Response::json(
            StatusCode::MethodNotAllowed,
            &json!({ "error": "method not allowed" }),
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shield = Arc::new(Shield::from_config(
        &Config::from_env(),
        Arc::new(MemoryUpstream::default()),
        Arc::new(SystemClock),
    )?);
    shield.register_fallback("jobs", json!([]));

    let gate = RequestGate::new(Config::gate_from_env()?.allow_anonymous_reads(true))?;
    let _sweeper = gate.limiter().spawn_sweeper(Duration::from_secs(300));

    let pipeline = Stack::new()
        .layer(LoggerMiddleware)
        .layer(gate)
        .endpoint(move |ctx| route(Arc::clone(&shield), ctx));

    let addr = std::env::var("UPGUARD_LISTEN").unwrap_or_else(|_| "127.0.0.1:8080".into());
    Server::bind(addr)
        .await?
        .serve_with_shutdown(pipeline, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
