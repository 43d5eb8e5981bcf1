//! Individual ensemble members. Each looks at the whole series and answers
//! one question: does the tail of this series look unusual?

use super::ewma::Ewma;
use crate::codec::SeriesPoint;

/// Average of the last three values, or the last value for shorter series.
pub fn tail_avg(series: &[SeriesPoint]) -> f64 {
    match series {
        [.., a, b, c] => (a.value + b.value + c.value) / 3.0,
        [.., last] => last.value,
        [] => 0.0,
    }
}

fn values(series: &[SeriesPoint]) -> Vec<f64> {
    series.iter().map(|p| p.value).collect()
}

fn median(mut xs: Vec<f64>) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.sort_by(|a, b| a.total_cmp(b));
    let mid = xs.len() / 2;
    if xs.len() % 2 == 0 {
        (xs[mid - 1] + xs[mid]) / 2.0
    } else {
        xs[mid]
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample standard deviation (n - 1 denominator).
fn std_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

/// Last value is more than six median absolute deviations from the median.
pub fn median_absolute_deviation(series: &[SeriesPoint]) -> bool {
    let xs = values(series);
    let Some(&last) = xs.last() else {
        return false;
    };

    let med = median(xs.clone());
    let demedianed: Vec<f64> = xs.iter().map(|x| (x - med).abs()).collect();
    let mad = median(demedianed);
    if mad == 0.0 {
        return false;
    }

    (last - med).abs() / mad > 6.0
}

/// Tail average is more than three standard deviations from the series mean.
pub fn stddev_from_average(series: &[SeriesPoint]) -> bool {
    let xs = values(series);
    let m = mean(&xs);
    let sd = std_dev(&xs);

    (tail_avg(series) - m).abs() > 3.0 * sd
}

/// Last value is more than three moving standard deviations from the
/// exponentially weighted moving average.
pub fn stddev_from_moving_average(series: &[SeriesPoint]) -> bool {
    let Some(last) = series.last() else {
        return false;
    };

    let mut ewma = Ewma::with_com(50.0);
    for p in series {
        ewma.update(p.value);
    }

    (last.value - ewma.mean()).abs() > 3.0 * ewma.std_dev()
}

/// Tail average falls in a histogram bin holding 20 or fewer points.
pub fn histogram_bins(series: &[SeriesPoint]) -> bool {
    const BINS: usize = 15;
    const SPARSE: usize = 20;

    if series.is_empty() {
        return false;
    }

    let xs = values(series);
    let t = tail_avg(series);
    let mut lo = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let mut hi = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }

    let width = (hi - lo) / BINS as f64;
    let mut counts = [0usize; BINS];
    for x in &xs {
        let idx = (((x - lo) / width) as usize).min(BINS - 1);
        counts[idx] += 1;
    }

    counts.iter().enumerate().any(|(idx, &count)| {
        if count > SPARSE {
            return false;
        }
        let start = lo + idx as f64 * width;
        let end = start + width;
        if idx == 0 {
            t <= lo
        } else {
            // last bin is closed on the right
            t >= start && (t < end || idx == BINS - 1)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> Vec<SeriesPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| SeriesPoint::new(i as i64 * 60, v))
            .collect()
    }

    fn noisy_with_tail(tail: f64) -> Vec<SeriesPoint> {
        let mut xs: Vec<f64> = (0..200).map(|i| 10.0 + (i % 5) as f64 * 0.1).collect();
        xs.extend([tail, tail, tail]);
        series(&xs)
    }

    #[test]
    fn test_tail_avg() {
        assert_eq!(tail_avg(&series(&[1.0, 2.0, 3.0, 6.0])), 11.0 / 3.0);
        assert_eq!(tail_avg(&series(&[5.0, 7.0])), 7.0);
        assert_eq!(tail_avg(&[]), 0.0);
    }

    #[test]
    fn test_spike_trips_every_vote() {
        let s = noisy_with_tail(500.0);
        assert!(median_absolute_deviation(&s));
        assert!(stddev_from_average(&s));
        assert!(stddev_from_moving_average(&s));
        assert!(histogram_bins(&s));
    }

    #[test]
    fn test_steady_series_trips_nothing() {
        let s = noisy_with_tail(10.2);
        assert!(!median_absolute_deviation(&s));
        assert!(!stddev_from_average(&s));
        assert!(!histogram_bins(&s));
    }

    #[test]
    fn test_mad_zero_deviation_never_votes() {
        let s = series(&[1.0, 1.0, 1.0, 1.0, 9.0]);
        assert!(!median_absolute_deviation(&s));
    }
}
