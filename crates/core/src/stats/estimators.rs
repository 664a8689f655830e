//! Pure numeric helpers used by the statistics engine.
//!
//! Every helper is total: degenerate inputs (zero-length intervals, empty
//! histories) resolve to a defined fallback instead of dividing by zero.

/// Gain of the smoothed RTT and the throughput/goodput moving averages.
pub const ALPHA: f64 = 1.0 / 8.0;

/// Gain of the RTT variance estimator.
pub const BETA: f64 = 1.0 / 4.0;

/// Value every metric holds before its first sample.
///
/// With [`FirstSample::ZeroSentinel`](super::FirstSample::ZeroSentinel) a
/// metric holding exactly this value is treated as uninitialised, which also
/// captures a legitimate zero reading. Deployed telemetry depends on that.
pub const UNINITIALIZED: f64 = 0.0;

/// Exponential moving average, `(1 - alpha) * current + alpha * sample`.
///
/// When `first` is set the sample seeds the average.
pub fn exponential_moving_average(current: f64, sample: f64, alpha: f64, first: bool) -> f64 {
    if first {
        sample
    } else {
        (1.0 - alpha) * current + alpha * sample
    }
}

/// Bytes per timestamp unit over `delta`.
///
/// A zero interval yields the raw byte count.
pub fn throughput(bytes: f64, delta: f64) -> f64 {
    if delta == 0.0 {
        bytes
    } else {
        bytes / delta
    }
}

/// Congestion window minus bytes in flight. May be negative on an
/// inconsistent stream; callers decide how to clamp.
pub fn writable_bytes(cwnd: f64, unacked: f64) -> f64 {
    cwnd - unacked
}

/// Next `(srtt, rttvar)` pair for an RTT sample, RFC 6298 form.
///
/// The variance is updated against the smoothed RTT *before* this sample is
/// folded in.
pub fn smoothed_rtt(srtt: f64, rttvar: f64, sample: f64, first: bool) -> (f64, f64) {
    if first {
        (sample, sample / 2.0)
    } else {
        let rttvar = (1.0 - BETA) * rttvar + BETA * (srtt - sample).abs();
        let srtt = (1.0 - ALPHA) * srtt + ALPHA * sample;
        (srtt, rttvar)
    }
}

/// Minimum ignoring the zero "no floor yet" sentinel on either side.
pub fn min_excluding_zero(current: f64, sample: f64) -> f64 {
    if sample == UNINITIALIZED {
        current
    } else if current == UNINITIALIZED {
        sample
    } else {
        current.min(sample)
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (`n - 1` denominator). Zero below two samples.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
