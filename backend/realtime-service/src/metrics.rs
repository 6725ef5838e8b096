use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, TextEncoder,
};

fn register<C>(collector: C, name: &str) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    if let Err(err) = prometheus::default_registry().register(Box::new(collector.clone())) {
        tracing::warn!(metric = name, error = %err, "failed to register metric");
    }
    collector
}

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_service_http_requests_total",
            "Total HTTP requests handled by realtime-service",
        ),
        &["method", "path", "status"],
    )
    .expect("valid realtime_service_http_requests_total definition");
    register(counter, "realtime_service_http_requests_total")
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "realtime_service_http_request_duration_seconds",
            "HTTP request latency for realtime-service",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("valid realtime_service_http_request_duration_seconds definition");
    register(histogram, "realtime_service_http_request_duration_seconds")
});

static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "realtime_service_sessions_active",
        "WebSocket sessions currently registered",
    )
    .expect("valid realtime_service_sessions_active definition");
    register(gauge, "realtime_service_sessions_active")
});

static SESSIONS_CLOSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_service_sessions_closed_total",
            "WebSocket sessions closed, by reason",
        ),
        &["reason"],
    )
    .expect("valid realtime_service_sessions_closed_total definition");
    register(counter, "realtime_service_sessions_closed_total")
});

static OUTBOUND_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_service_outbound_dropped_total",
            "Outbound messages dropped before reaching a session queue",
        ),
        &["reason"],
    )
    .expect("valid realtime_service_outbound_dropped_total definition");
    register(counter, "realtime_service_outbound_dropped_total")
});

static BRIDGE_ENVELOPES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_service_bridge_envelopes_total",
            "Broker envelopes processed by the bridge, by outcome",
        ),
        &["outcome"],
    )
    .expect("valid realtime_service_bridge_envelopes_total definition");
    register(counter, "realtime_service_bridge_envelopes_total")
});

static DEAD_LETTERS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_service_dead_letters_total",
            "Envelopes dropped after exhausting delivery retries",
        ),
        &["channel_kind"],
    )
    .expect("valid realtime_service_dead_letters_total definition");
    register(counter, "realtime_service_dead_letters_total")
});

static HANDSHAKE_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_service_handshake_rejected_total",
            "Rejected WebSocket upgrade requests, by reason",
        ),
        &["reason"],
    )
    .expect("valid realtime_service_handshake_rejected_total definition");
    register(counter, "realtime_service_handshake_rejected_total")
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub fn set_active_sessions(count: usize) {
    SESSIONS_ACTIVE.set(count as i64);
}

pub fn record_session_closed(reason: &str) {
    SESSIONS_CLOSED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_outbound_dropped(reason: &str) {
    OUTBOUND_DROPPED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_bridge_outcome(outcome: &str) {
    BRIDGE_ENVELOPES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_dead_letter(channel_kind: &str) {
    DEAD_LETTERS_TOTAL.with_label_values(&[channel_kind]).inc();
}

pub fn record_handshake_rejected(reason: &str) {
    HANDSHAKE_REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::time::Instant;

/// Records count and latency for every HTTP request, labelled by route pattern.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        // Route pattern keeps label cardinality bounded for /status/{user_id}
        let path = req
            .match_pattern()
            .unwrap_or_else(|| req.path().to_string());
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let elapsed = start.elapsed();
            match &result {
                Ok(response) => {
                    observe_http_request(&method, &path, response.status().as_u16(), elapsed);
                }
                Err(_) => {
                    observe_http_request(&method, &path, 500, elapsed);
                }
            }
            result
        })
    }
}
