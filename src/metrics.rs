//! Prometheus text-format metrics for requests and inference

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

const REQUEST_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];
const INFERENCE_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

const ROUTES: &[&str] = &[
    "/txt2img",
    "/upload",
    "/img2img",
    "/v1/images/generations",
    "/health",
    "/metrics",
];

/// Process-wide counters and histograms, rendered on `GET /metrics`
pub struct Metrics {
    output_prefix: String,
    inner: Mutex<Inner>,
}

struct Inner {
    requests: HashMap<(String, u16), u64>,
    request_duration: HashMap<String, Histogram>,
    gate_wait: Histogram,
    inference: Histogram,
    inference_failures: u64,
}

impl Metrics {
    /// `output_prefix` collapses every served output file into one path label
    pub fn new(output_prefix: impl Into<String>) -> Self {
        Self {
            output_prefix: output_prefix.into(),
            inner: Mutex::new(Inner {
                requests: HashMap::new(),
                request_duration: HashMap::new(),
                gate_wait: Histogram::new(REQUEST_BUCKETS),
                inference: Histogram::new(INFERENCE_BUCKETS),
                inference_failures: 0,
            }),
        }
    }

    /// Bounded label for a request path
    pub fn path_label(&self, path: &str) -> String {
        let path = path.strip_suffix('/').unwrap_or(path);
        if ROUTES.contains(&path) {
            return path.to_string();
        }
        match path.strip_prefix(self.output_prefix.as_str()) {
            Some(rest) if rest.starts_with('/') => format!("{}/*", self.output_prefix),
            _ => "other".to_string(),
        }
    }

    pub fn record_request(&self, path: &str, status: u16, duration: Duration) {
        let path = self.path_label(path);
        let mut inner = self.inner.lock();
        *inner.requests.entry((path.clone(), status)).or_default() += 1;
        inner
            .request_duration
            .entry(path)
            .or_insert_with(|| Histogram::new(REQUEST_BUCKETS))
            .observe(duration);
    }

    /// Time spent waiting for the accelerator
    pub fn observe_gate_wait(&self, duration: Duration) {
        self.inner.lock().gate_wait.observe(duration);
    }

    /// Time spent inside a pipeline invocation
    pub fn observe_inference(&self, duration: Duration) {
        self.inner.lock().inference.observe(duration);
    }

    pub fn record_inference_failure(&self) {
        let mut inner = self.inner.lock();
        inner.inference_failures = inner.inference_failures.saturating_add(1);
    }

    pub fn render(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();

        header(
            &mut out,
            "diffusion_http_requests_total",
            "HTTP requests by path and status.",
            "counter",
        );
        let mut requests: Vec<_> = inner.requests.iter().collect();
        requests.sort();
        for ((path, status), count) in requests {
            let _ = writeln!(
                out,
                "diffusion_http_requests_total{{path=\"{}\",status=\"{}\"}} {}",
                escape_label_value(path),
                status,
                count
            );
        }

        header(
            &mut out,
            "diffusion_http_request_duration_seconds",
            "HTTP request duration in seconds.",
            "histogram",
        );
        let mut durations: Vec<_> = inner.request_duration.iter().collect();
        durations.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (path, histogram) in durations {
            let label = format!("path=\"{}\"", escape_label_value(path));
            histogram.write(&mut out, "diffusion_http_request_duration_seconds", &label);
        }

        header(
            &mut out,
            "diffusion_gate_wait_seconds",
            "Time spent waiting for the accelerator in seconds.",
            "histogram",
        );
        inner.gate_wait.write(&mut out, "diffusion_gate_wait_seconds", "");

        header(
            &mut out,
            "diffusion_inference_duration_seconds",
            "Pipeline invocation duration in seconds.",
            "histogram",
        );
        inner
            .inference
            .write(&mut out, "diffusion_inference_duration_seconds", "");

        header(
            &mut out,
            "diffusion_inference_failures_total",
            "Pipeline invocations that failed or panicked.",
            "counter",
        );
        let _ = writeln!(
            out,
            "diffusion_inference_failures_total {}",
            inner.inference_failures
        );

        out
    }
}

fn header(out: &mut String, metric: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", metric, help);
    let _ = writeln!(out, "# TYPE {} {}", metric, kind);
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// Cumulative histogram over fixed second buckets
struct Histogram {
    bounds: &'static [f64],
    counts: Vec<u64>,
    sum_seconds: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            counts: vec![0; bounds.len()],
            sum_seconds: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.sum_seconds += seconds;
        self.count = self.count.saturating_add(1);
        for (count, bound) in self.counts.iter_mut().zip(self.bounds) {
            if seconds <= *bound {
                *count = count.saturating_add(1);
            }
        }
    }

    fn write(&self, out: &mut String, metric: &str, labels: &str) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (count, bound) in self.counts.iter().zip(self.bounds) {
            let _ = writeln!(
                out,
                "{}_bucket{{{}{}le=\"{}\"}} {}",
                metric, labels, sep, bound, count
            );
        }
        let _ = writeln!(
            out,
            "{}_bucket{{{}{}le=\"+Inf\"}} {}",
            metric, labels, sep, self.count
        );

        let braced = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels)
        };
        let _ = writeln!(out, "{}_sum{} {}", metric, braced, self.sum_seconds);
        let _ = writeln!(out, "{}_count{} {}", metric, braced, self.count);
    }
}
