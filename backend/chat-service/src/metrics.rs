use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};

pub static OUTBOX_JOBS_EXECUTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chat_outbox_jobs_executed_total",
        "Outbox jobs handled successfully"
    )
    .expect("metric registration")
});

pub static OUTBOX_JOBS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chat_outbox_jobs_failed_total",
        "Outbox job handler failures (including timeouts)"
    )
    .expect("metric registration")
});

pub static OUTBOX_JOBS_DEAD_LETTERED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chat_outbox_jobs_dead_lettered_total",
        "Outbox jobs routed to failed_jobs"
    )
    .expect("metric registration")
});

pub static AFC_VERDICTS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chat_afc_verdicts_processed_total",
        "AFC verdicts applied to messages"
    )
    .expect("metric registration")
});

pub static AFC_VERDICTS_DLQ: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chat_afc_verdicts_dlq_total",
        "AFC verdict records routed to the DLQ topic"
    )
    .expect("metric registration")
});

pub static WS_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "chat_ws_connections",
        "Currently open websocket sessions"
    )
    .expect("metric registration")
});

pub async fn serve_metrics() -> HttpResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
