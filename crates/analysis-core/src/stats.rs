//! Small statistics helpers shared by the indicator engine and strategies.
//!
//! All functions resolve degenerate input (empty slices, zero variance) to
//! neutral values instead of failing.

/// Arithmetic mean; 0.0 for an empty slice.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Sample standard deviation; 0.0 with fewer than two points.
pub fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Z-score of `value` against `data`. Returns 0.0 when `data` has no variance.
pub fn z_score_of(value: f64, data: &[f64]) -> f64 {
    let sd = std_dev(data);
    if sd < f64::EPSILON {
        return 0.0;
    }
    (value - mean(data)) / sd
}

/// Standardized distance of the latest value from its rolling mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollingZ {
    pub z: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Z-score of the last element of `series` over the trailing `lookback` window
/// (window includes the last element). None when the window is not filled.
pub fn rolling_z_score(series: &[f64], lookback: usize) -> Option<RollingZ> {
    if lookback < 2 || series.len() < lookback {
        return None;
    }
    let window = &series[series.len() - lookback..];
    let last = *window.last()?;
    let m = mean(window);
    let sd = std_dev(window);
    let z = if sd < f64::EPSILON { 0.0 } else { (last - m) / sd };
    Some(RollingZ {
        z,
        mean: m,
        std_dev: sd,
    })
}

/// Mean-reversion half-life (in bars) from an AR(1) fit of
/// `dy_t = a + b * y_{t-1}`. None when the series does not revert (b >= 0)
/// or is too short/flat to fit.
pub fn half_life(series: &[f64]) -> Option<f64> {
    if series.len() < 10 {
        return None;
    }
    let lagged = &series[..series.len() - 1];
    let deltas: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();

    let mx = mean(lagged);
    let my = mean(&deltas);
    let (mut cov, mut var) = (0.0, 0.0);
    for (x, y) in lagged.iter().zip(deltas.iter()) {
        cov += (x - mx) * (y - my);
        var += (x - mx).powi(2);
    }
    if var < f64::EPSILON {
        return None;
    }
    let beta = cov / var;
    if beta >= 0.0 {
        return None;
    }
    Some(-std::f64::consts::LN_2 / beta)
}

/// Least-squares slope of `series` against its index, normalised by the mean.
pub fn normalized_slope(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return 0.0;
    }
    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let mx = mean(&xs);
    let my = mean(series);
    if my.abs() < f64::EPSILON {
        return 0.0;
    }
    let (mut cov, mut var) = (0.0, 0.0);
    for (x, y) in xs.iter().zip(series.iter()) {
        cov += (x - mx) * (y - my);
        var += (x - mx).powi(2);
    }
    if var < f64::EPSILON {
        return 0.0;
    }
    (cov / var) / my
}
