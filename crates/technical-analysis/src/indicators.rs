//! Indicator primitives over plain `f64` slices.
//!
//! Series-returning functions produce one value per bar once the warm-up
//! window is filled, so `series[i]` lines up with input index `i + period - 1`
//! unless documented otherwise.

/// Simple moving average of the trailing `period` values.
pub fn sma_last(data: &[f64], period: usize) -> Option<f64> {
    if period == 0 || data.len() < period {
        return None;
    }
    Some(data[data.len() - period..].iter().sum::<f64>() / period as f64)
}

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut value = data[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(data.len() - period + 1);
    out.push(value);
    for x in &data[period..] {
        value += (x - value) * k;
        out.push(value);
    }
    out
}

/// Wilder RSI of the latest close.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }
    let p = period as f64;
    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / p;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / p;
    for c in &changes[period..] {
        avg_gain = (avg_gain * (p - 1.0) + c.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-c).max(0.0)) / p;
    }

    if avg_loss <= f64::EPSILON {
        return Some(if avg_gain <= f64::EPSILON { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD of the latest close. The signal line falls back to the MACD line
/// while there is not enough history to smooth it.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast == 0 || slow <= fast {
        return None;
    }
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);
    if slow_ema.is_empty() {
        return None;
    }

    let offset = slow - fast;
    let line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, s)| fast_ema[i + offset] - s)
        .collect();
    let last = *line.last()?;
    let signal_value = ema(&line, signal).last().copied().unwrap_or(last);

    Some(Macd {
        line: last,
        signal: signal_value,
        histogram: last - signal_value,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Bollinger bands for the window ending at index `end` (inclusive).
pub fn bollinger_at(closes: &[f64], end: usize, period: usize, width: f64) -> Option<Bands> {
    if period == 0 || end >= closes.len() || end + 1 < period {
        return None;
    }
    let window = &closes[end + 1 - period..=end];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();
    Some(Bands {
        upper: middle + width * sd,
        middle,
        lower: middle - width * sd,
    })
}

/// True range per bar starting at index 1 (`out[i]` belongs to bar `i + 1`).
pub fn true_ranges(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
    (1..closes.len())
        .map(|i| {
            let prev_close = closes[i - 1];
            (highs[i] - lows[i])
                .max((highs[i] - prev_close).abs())
                .max((lows[i] - prev_close).abs())
        })
        .collect()
}

/// Wilder-smoothed ATR series. `out[j]` belongs to bar `j + period`.
pub fn atr_series(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let tr = true_ranges(highs, lows, closes);
    if period == 0 || tr.len() < period {
        return Vec::new();
    }
    let p = period as f64;
    let mut value = tr[..period].iter().sum::<f64>() / p;
    let mut out = Vec::with_capacity(tr.len() - period + 1);
    out.push(value);
    for x in &tr[period..] {
        value = (value * (p - 1.0) + x) / p;
        out.push(value);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adx {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Wilder ADX with directional indicators for the latest bar.
pub fn adx(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<Adx> {
    let n = closes.len();
    if period == 0 || n < period * 2 + 1 {
        return None;
    }
    let p = period as f64;
    let tr = true_ranges(highs, lows, closes);
    let (mut plus_dm, mut minus_dm) = (Vec::with_capacity(n - 1), Vec::with_capacity(n - 1));
    for i in 1..n {
        let up = highs[i] - highs[i - 1];
        let down = lows[i - 1] - lows[i];
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let mut s_tr: f64 = tr[..period].iter().sum();
    let mut s_plus: f64 = plus_dm[..period].iter().sum();
    let mut s_minus: f64 = minus_dm[..period].iter().sum();

    let di = |plus: f64, minus: f64, range: f64| {
        if range > 0.0 {
            (100.0 * plus / range, 100.0 * minus / range)
        } else {
            (0.0, 0.0)
        }
    };
    let dx = |pdi: f64, mdi: f64| {
        let sum = pdi + mdi;
        if sum > 0.0 {
            100.0 * (pdi - mdi).abs() / sum
        } else {
            0.0
        }
    };

    let (mut pdi, mut mdi) = di(s_plus, s_minus, s_tr);
    let mut dxs = vec![dx(pdi, mdi)];
    for i in period..tr.len() {
        s_tr = s_tr - s_tr / p + tr[i];
        s_plus = s_plus - s_plus / p + plus_dm[i];
        s_minus = s_minus - s_minus / p + minus_dm[i];
        (pdi, mdi) = di(s_plus, s_minus, s_tr);
        dxs.push(dx(pdi, mdi));
    }
    if dxs.len() < period {
        return None;
    }

    let mut value = dxs[..period].iter().sum::<f64>() / p;
    for x in &dxs[period..] {
        value = (value * (p - 1.0) + x) / p;
    }
    Some(Adx {
        adx: value,
        plus_di: pdi,
        minus_di: mdi,
    })
}
