//! Prometheus text exposition format.
//!
//! Renders request metrics and ad-hoc gauges into the text exposition
//! format scraped from each component's `/metrics` endpoint.

use std::fmt::Write;

use crate::collector::RequestSample;

/// Render request metrics into Prometheus text format.
///
/// Produces counters and gauges labeled by backend address and route.
pub fn render_request_metrics(samples: &[RequestSample]) -> String {
    let mut out = String::new();

    out.push_str("# HELP remesh_requests_total Requests dispatched, by backend and route.\n");
    out.push_str("# TYPE remesh_requests_total counter\n");
    for s in samples {
        let _ = writeln!(
            out,
            "remesh_requests_total{{backend=\"{}\",route=\"{}\"}} {}",
            s.backend, s.route, s.requests
        );
    }

    out.push_str("# HELP remesh_request_errors_total Failed requests, by backend and route.\n");
    out.push_str("# TYPE remesh_request_errors_total counter\n");
    for s in samples {
        let _ = writeln!(
            out,
            "remesh_request_errors_total{{backend=\"{}\",route=\"{}\"}} {}",
            s.backend, s.route, s.errors
        );
    }

    out.push_str("# HELP remesh_request_latency_p50_ms P50 latency over the recent window.\n");
    out.push_str("# TYPE remesh_request_latency_p50_ms gauge\n");
    for s in samples {
        let _ = writeln!(
            out,
            "remesh_request_latency_p50_ms{{backend=\"{}\",route=\"{}\"}} {:.2}",
            s.backend, s.route, s.latency_p50_ms
        );
    }

    out.push_str("# HELP remesh_request_latency_p99_ms P99 latency over the recent window.\n");
    out.push_str("# TYPE remesh_request_latency_p99_ms gauge\n");
    for s in samples {
        let _ = writeln!(
            out,
            "remesh_request_latency_p99_ms{{backend=\"{}\",route=\"{}\"}} {:.2}",
            s.backend, s.route, s.latency_p99_ms
        );
    }

    out
}

/// Append a single gauge family with one labeled series per entry.
///
/// Used by the manager (instance counts by state) and the agent
/// (remediation record counts by phase) for their `/metrics` pages.
pub fn write_gauge(out: &mut String, name: &str, help: &str, series: &[(Vec<(String, String)>, f64)]) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    for (labels, value) in series {
        let rendered: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        if rendered.is_empty() {
            let _ = writeln!(out, "{name} {value}");
        } else {
            let _ = writeln!(out, "{name}{{{}}} {value}", rendered.join(","));
        }
    }
}

/// Append a counter family. Same shape as [`write_gauge`] with an
/// integer value and `counter` type declaration.
pub fn write_counter(out: &mut String, name: &str, help: &str, series: &[(Vec<(String, String)>, u64)]) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    for (labels, value) in series {
        let rendered: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        if rendered.is_empty() {
            let _ = writeln!(out, "{name} {value}");
        } else {
            let _ = writeln!(out, "{name}{{{}}} {value}", rendered.join(","));
        }
    }
}

/// Label helper: `labels(&[("state", "healthy")])`.
pub fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
