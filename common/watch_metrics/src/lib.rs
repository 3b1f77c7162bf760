//! A thin wrapper around the `prometheus` crate which allows metrics to be declared as
//! `LazyLock<Result<...>>` statics and updated without handling registration errors at each call
//! site.
//!
//! A metric which fails to register (e.g. due to a duplicate name) is simply never updated. This
//! keeps metrics strictly optional for the rest of the program.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::LazyLock;
//! use watch_metrics::*;
//!
//! pub static SLOTS_INDEXED: LazyLock<Result<IntCounter>> = LazyLock::new(|| {
//!     try_create_int_counter("example_slots_indexed_total", "Count of slots indexed")
//! });
//!
//! fn main() {
//!     inc_counter(&SLOTS_INDEXED);
//!     assert_eq!(SLOTS_INDEXED.as_ref().unwrap().get(), 1);
//! }
//! ```

use prometheus::{HistogramOpts, Opts};
use std::time::Duration;

pub use prometheus::{
    Encoder, Histogram, HistogramTimer, IntCounter, IntCounterVec, IntGauge, Result, TextEncoder,
};

/// Collect all the metrics registered in the default registry.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    prometheus::gather()
}

/// Encode all metrics in the default registry using the Prometheus text format.
pub fn encode_text() -> std::result::Result<String, String> {
    let mut buffer = vec![];
    TextEncoder::new()
        .encode(&gather(), &mut buffer)
        .map_err(|e| format!("Unable to encode metrics: {:?}", e))?;
    String::from_utf8(buffer).map_err(|e| format!("Metrics are not valid UTF-8: {:?}", e))
}

/// Attempts to create an `IntCounter`, returning `Err` if the registry does not accept the counter
/// (potentially due to naming conflict).
pub fn try_create_int_counter(name: &str, help: &str) -> Result<IntCounter> {
    let opts = Opts::new(name, help);
    let counter = IntCounter::with_opts(opts)?;
    prometheus::register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Attempts to create an `IntGauge`, returning `Err` if the registry does not accept the gauge
/// (potentially due to naming conflict).
pub fn try_create_int_gauge(name: &str, help: &str) -> Result<IntGauge> {
    let opts = Opts::new(name, help);
    let gauge = IntGauge::with_opts(opts)?;
    prometheus::register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Attempts to create an `IntCounterVec`, returning `Err` if the registry does not accept the
/// counter (potentially due to naming conflict).
pub fn try_create_int_counter_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntCounterVec> {
    let opts = Opts::new(name, help);
    let counter_vec = IntCounterVec::new(opts, label_names)?;
    prometheus::register(Box::new(counter_vec.clone()))?;
    Ok(counter_vec)
}

/// Attempts to create a `Histogram`, returning `Err` if the registry does not accept the
/// histogram (potentially due to naming conflict).
pub fn try_create_histogram(name: &str, help: &str) -> Result<Histogram> {
    let opts = HistogramOpts::new(name, help);
    let histogram = Histogram::with_opts(opts)?;
    prometheus::register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

pub fn inc_counter(counter: &Result<IntCounter>) {
    if let Ok(counter) = counter {
        counter.inc();
    }
}

pub fn inc_counter_by(counter: &Result<IntCounter>, value: u64) {
    if let Ok(counter) = counter {
        counter.inc_by(value);
    }
}

pub fn inc_counter_vec(counter_vec: &Result<IntCounterVec>, label_values: &[&str]) {
    if let Ok(counter_vec) = counter_vec {
        if let Ok(counter) = counter_vec.get_metric_with_label_values(label_values) {
            counter.inc();
        }
    }
}

pub fn set_gauge(gauge: &Result<IntGauge>, value: i64) {
    if let Ok(gauge) = gauge {
        gauge.set(value);
    }
}

pub fn inc_gauge(gauge: &Result<IntGauge>) {
    if let Ok(gauge) = gauge {
        gauge.inc();
    }
}

pub fn dec_gauge(gauge: &Result<IntGauge>) {
    if let Ok(gauge) = gauge {
        gauge.dec();
    }
}

/// Starts a timer on `histogram`. The duration is observed when the returned timer is dropped.
pub fn start_timer(histogram: &Result<Histogram>) -> Option<HistogramTimer> {
    histogram.as_ref().ok().map(|h| h.start_timer())
}

pub fn observe_duration(histogram: &Result<Histogram>, duration: Duration) {
    if let Ok(histogram) = histogram {
        histogram.observe(duration.as_secs_f64());
    }
}
