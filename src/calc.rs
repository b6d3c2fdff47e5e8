//! Rate & history calculator (SPEC_FULL.md §4.5).
//!
//! Direct port of `pv_calculate_transfer_rate` and `pv__update_average_rate_history` from
//! `original_source/src/pv/calc.c`.

use state::{CalcState, HistorySlot};

fn update_average_rate_history(calc: &mut CalcState, interval: u32, elapsed_seconds: f64, total_written: u64, rate: f64) {
    let mut first = calc.history_first;
    let mut last = calc.history_last;
    let last_elapsed = calc.history[last].elapsed_sec;

    if last_elapsed > 0.0 && elapsed_seconds < last_elapsed + interval as f64 {
        return;
    }

    if last_elapsed > 0.0 {
        let len = calc.history.len();
        last = (last + 1) % len;
        calc.history_last = last;
        if last == first {
            first = (first + 1) % len;
            calc.history_first = first;
        }
    }

    calc.history[last] = HistorySlot { elapsed_sec: elapsed_seconds, transferred: total_written };

    if first == last {
        calc.current_avg_rate = rate;
    } else {
        let bytes = calc.history[last].transferred as f64 - calc.history[first].transferred as f64;
        let sec = calc.history[last].elapsed_sec - calc.history[first].elapsed_sec;
        calc.current_avg_rate = bytes / sec;
    }
}

/// Percentage complete, clamped to [0, 100] (`pv_percentage` in the original).
pub fn percentage(so_far: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    let pct = (100.0 * so_far as f64 / total as f64).round();
    if pct < 0.0 {
        0
    } else if pct > 100.0 {
        100
    } else {
        pct as u32
    }
}

/// Updates `calc` for one tick. `bits` selects the x8 adjustment applied to accumulated
/// min/max/sum/sumsq statistics (but not to the returned instantaneous rate itself, which
/// the formatter library applies the same adjustment to independently at render time).
pub fn calculate_transfer_rate(
    calc: &mut CalcState,
    history_interval: u32,
    elapsed_seconds: f64,
    total_written: u64,
    size: u64,
    initial_offset: u64,
    bits: bool,
    final_update: bool,
) {
    let bytes_since_last = total_written.saturating_sub(calc.prev_total_written);
    calc.prev_total_written = total_written;

    let time_since_last = elapsed_seconds - calc.prev_elapsed_sec;
    let mut transfer_rate;

    if time_since_last <= 0.01 {
        transfer_rate = calc.prev_rate;
        calc.prev_trans += bytes_since_last;
    } else {
        transfer_rate = (bytes_since_last + calc.prev_trans) as f64 / time_since_last;
        let mut measured_rate = transfer_rate;

        calc.prev_elapsed_sec = elapsed_seconds;
        calc.prev_trans = 0;

        if bits {
            measured_rate *= 8.0;
        }

        if calc.measurements_taken < 1 || measured_rate < calc.rate_min {
            calc.rate_min = measured_rate;
        }
        if measured_rate > calc.rate_max {
            calc.rate_max = measured_rate;
        }
        calc.rate_sum += measured_rate;
        calc.ratesquared_sum += measured_rate * measured_rate;
        calc.measurements_taken += 1;
    }
    calc.prev_rate = transfer_rate;

    update_average_rate_history(calc, history_interval, elapsed_seconds, total_written, transfer_rate);
    let mut average_rate = calc.current_avg_rate;

    let mut elapsed_seconds = elapsed_seconds;
    if final_update {
        if elapsed_seconds < 0.000001 {
            elapsed_seconds = 0.000001;
        }
        average_rate = (total_written as f64 - initial_offset as f64) / elapsed_seconds;
        transfer_rate = average_rate;
    }

    calc.transfer_rate = transfer_rate;
    calc.average_rate = average_rate;

    if size == 0 {
        if transfer_rate > 0.0 {
            calc.percentage += 2;
        }
        if calc.percentage > 199 {
            calc.percentage = 0;
        }
    } else {
        calc.percentage = percentage(total_written, size);
    }

    if calc.percentage > 100_000 {
        calc.percentage = 100_000;
    }
}

/// Final-exit rate summary (SPEC_FULL.md §4.10 supplement): mean/variance/deviation over
/// the accumulated per-tick rate measurements.
pub fn rate_stats(calc: &CalcState) -> Option<(f64, f64, f64)> {
    if calc.measurements_taken == 0 {
        return None;
    }
    let n = calc.measurements_taken as f64;
    let mean = calc.rate_sum / n;
    let variance = (calc.ratesquared_sum / n - mean * mean).max(0.0);
    let deviation = variance.sqrt();
    Some((mean, deviation, deviation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use state::CalcState;

    #[test]
    fn anti_spike_carries_bytes_forward_on_tiny_interval() {
        let mut calc = CalcState::new(7);
        calculate_transfer_rate(&mut calc, 5, 0.005, 100, 0, 0, false, false);
        assert_eq!(calc.prev_trans, 100);
        assert_eq!(calc.measurements_taken, 0);
    }

    #[test]
    fn rate_is_bytes_over_time_once_interval_is_reasonable() {
        let mut calc = CalcState::new(7);
        calculate_transfer_rate(&mut calc, 5, 1.0, 1000, 0, 0, false, false);
        assert!((calc.transfer_rate - 1000.0).abs() < 1e-6);
        assert_eq!(calc.measurements_taken, 1);
    }

    #[test]
    fn percentage_known_size_is_clamped_to_100() {
        assert_eq!(percentage(50, 100), 50);
        assert_eq!(percentage(200, 100), 100);
    }

    #[test]
    fn percentage_unknown_size_sweeps_and_wraps() {
        let mut calc = CalcState::new(7);
        calc.percentage = 198;
        calculate_transfer_rate(&mut calc, 5, 1.0, 10, 0, 0, false, false);
        assert_eq!(calc.percentage, 0);
    }

    #[test]
    fn final_update_recomputes_whole_transfer_average() {
        let mut calc = CalcState::new(7);
        calc.prev_total_written = 0;
        calculate_transfer_rate(&mut calc, 5, 10.0, 1000, 0, 0, false, true);
        assert!((calc.average_rate - 100.0).abs() < 1e-6);
        assert!((calc.transfer_rate - 100.0).abs() < 1e-6);
    }
}
