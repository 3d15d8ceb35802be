use crate::capture::{CaptureRecord, Subscription};
use crate::state::AppState;
use futures::{stream, Stream, StreamExt};
use prometheus::proto::MetricType;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let requests = requests_routes(state.clone());
    let clear = clear_route(state.clone());
    let stats = stats_route(state.clone());
    let metrics = metrics_route(state);

    warp::path("api").and(requests.or(clear).or(stats).or(metrics))
}

fn requests_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("requests")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(list_requests);

    // Must be tried before the by-id route, which would capture "stream".
    let stream = warp::path!("requests" / "stream")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(stream_requests);

    let by_id = warp::path!("requests" / String)
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_request);

    list.or(stream).or(by_id)
}

fn clear_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("clear")
        .and(warp::post().or(warp::delete()).unify())
        .and(with_state(state))
        .and_then(clear_requests)
}

fn stats_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("stats")
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_stats)
}

fn metrics_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_metrics)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

async fn list_requests(
    query: HashMap<String, String>,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    let requests = match query.get("limit") {
        Some(limit) => match limit.parse::<usize>() {
            Ok(limit) => state.store.recent(limit),
            Err(_) => {
                return Ok(warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({
                        "error": format!("Invalid limit parameter: {}", limit)
                    })),
                    StatusCode::BAD_REQUEST,
                ))
            }
        },
        None => state.store.all(),
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "count": requests.len(),
            "requests": requests,
        })),
        StatusCode::OK,
    ))
}

async fn get_request(id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    match state.store.by_id(&id) {
        Some(record) => Ok(warp::reply::with_status(
            warp::reply::json(&*record),
            StatusCode::OK,
        )),
        None => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "error": format!("Request not found: {}", id)
            })),
            StatusCode::NOT_FOUND,
        )),
    }
}

fn stream_requests(state: Arc<AppState>) -> impl Reply {
    let subscription = state.store.subscribe();
    tracing::debug!(subscriber = subscription.id(), "Event stream client connected");

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let events = request_events(subscription).take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    warp::sse::reply(warp::sse::keep_alive().stream(events))
}

/// A `connected` event, then one `request` event per record appended after
/// subscribing. Dropping the stream unsubscribes.
pub fn request_events(
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let connected = stream::once(async {
        Ok(Event::default()
            .event("connected")
            .data(r#"{"status":"connected"}"#))
    });

    let records = subscription.filter_map(|record| async move {
        match request_event(&record) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!(id = %record.id, error = %e, "Failed to encode captured request");
                None
            }
        }
    });

    connected.chain(records)
}

fn request_event(record: &CaptureRecord) -> Result<Event, serde_json::Error> {
    let data = serde_json::to_string(record)?;
    Ok(Event::default()
        .event("request")
        .id(record.id.clone())
        .data(data))
}

async fn clear_requests(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    state.store.clear();
    tracing::info!("Captured requests cleared");

    Ok(warp::reply::json(&serde_json::json!({
        "status": "cleared"
    })))
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CaptureStats {
    pub total_requests: usize,
    pub http_requests: usize,
    pub https_requests: usize,
    pub average_duration_ms: u64,
}

impl CaptureStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CaptureRecord>) -> Self {
        let mut stats = CaptureStats {
            total_requests: 0,
            http_requests: 0,
            https_requests: 0,
            average_duration_ms: 0,
        };
        let mut total_ms: u128 = 0;

        for record in records {
            stats.total_requests += 1;
            if record.is_https {
                stats.https_requests += 1;
            } else {
                stats.http_requests += 1;
            }
            total_ms += record.duration.as_millis();
        }

        if stats.total_requests > 0 {
            stats.average_duration_ms = (total_ms / stats.total_requests as u128) as u64;
        }
        stats
    }
}

async fn get_stats(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let records = state.store.all();
    let stats = CaptureStats::from_records(records.iter().map(|record| &**record));
    Ok(warp::reply::json(&stats))
}

async fn get_metrics(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let families = state.metrics.gather_metrics();

    let json_metrics: Vec<_> = families
        .iter()
        .map(|family| {
            let values: Vec<_> = family
                .get_metric()
                .iter()
                .map(|metric| match family.get_field_type() {
                    MetricType::COUNTER => serde_json::json!(metric.get_counter().get_value()),
                    MetricType::GAUGE => serde_json::json!(metric.get_gauge().get_value()),
                    MetricType::HISTOGRAM => {
                        let histogram = metric.get_histogram();
                        serde_json::json!({
                            "sample_count": histogram.get_sample_count(),
                            "sample_sum": histogram.get_sample_sum(),
                        })
                    }
                    _ => serde_json::Value::Null,
                })
                .collect();

            serde_json::json!({
                "name": family.get_name(),
                "help": family.get_help(),
                "type": format!("{:?}", family.get_field_type()),
                "values": values,
            })
        })
        .collect();

    Ok(warp::reply::json(&serde_json::json!({
        "metrics": json_metrics
    })))
}
