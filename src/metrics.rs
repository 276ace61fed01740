use tracing::trace;

// Each helper records through the `metrics` facade (rendered by the
// Prometheus recorder installed in main) and mirrors a trace event.

pub fn inc_requests(route: &'static str) {
    ::metrics::counter!("smartenrich_requests_total", "route" => route).increment(1);
    trace!(
        target = "smartenrich.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    ::metrics::histogram!("smartenrich_stage_duration_ms", "stage" => stage).record(elapsed_ms as f64);
    trace!(
        target = "smartenrich.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn provider_call(family: &'static str, outcome: &'static str) {
    ::metrics::counter!(
        "smartenrich_provider_calls_total",
        "family" => family,
        "outcome" => outcome
    )
    .increment(1);
    trace!(
        target = "smartenrich.metrics",
        family = family,
        outcome = outcome,
        "provider_call"
    );
}

pub fn item_outcome(outcome: &'static str) {
    ::metrics::counter!("smartenrich_items_total", "outcome" => outcome).increment(1);
    trace!(
        target = "smartenrich.metrics",
        outcome = outcome,
        "item_outcome_total_inc"
    );
}
