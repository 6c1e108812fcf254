//! Prometheus metrics
//!
//! Without an installed recorder every macro below is a no-op, so the call
//! engine records unconditionally and the binary decides whether to export.

use crate::domain::call::value_object::{CallDirection, Reason};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus exporter with its scrape endpoint on `listen`.
///
/// Must run inside a tokio runtime.
pub fn install_exporter(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| DomainError::Config(format!("Invalid metrics address {}: {}", listen, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| DomainError::Config(format!("Cannot install metrics exporter: {}", e)))?;

    describe_metrics();
    Ok(())
}

pub fn describe_metrics() {
    describe_counter!("calls_created_total", "Calls created, by direction");
    describe_counter!("calls_terminated_total", "Calls that ended, by reason");
    describe_counter!(
        "calls_incoming_timeout_total",
        "Incoming calls declined because nobody answered"
    );
    describe_counter!(
        "calls_media_lost_total",
        "Calls terminated by the no-RTP watchdog"
    );
    describe_gauge!("calls_live", "Calls currently in the registry");
    describe_histogram!(
        "call_duration_seconds",
        "Connected duration of terminated calls in seconds"
    );
}

pub fn record_call_created(direction: CallDirection) {
    counter!("calls_created_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_call_terminated(reason: Reason, duration: Duration) {
    counter!("calls_terminated_total", "reason" => format!("{:?}", reason)).increment(1);
    histogram!("call_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_incoming_timeout() {
    counter!("calls_incoming_timeout_total").increment(1);
}

pub fn record_media_lost() {
    counter!("calls_media_lost_total").increment(1);
}

pub fn update_live_calls(count: usize) {
    gauge!("calls_live").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_listen_address() {
        let result = install_exporter("not an address");
        assert!(matches!(result, Err(DomainError::Config(_))));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_call_created(CallDirection::Incoming);
        record_call_terminated(Reason::Busy, Duration::from_secs(3));
        update_live_calls(2);
    }
}
