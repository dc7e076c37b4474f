use tracing::warn;

use crate::error::Error;
use crate::metric::MetricPoint;

/// One configured rollup function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupFn {
    /// Arithmetic sum, skipping absent values.
    Sum,
    /// Sum divided by the total number of readings (absent included).
    Avg,
    /// Base delta: max minus min, for monotonically increasing counters
    /// sampled multiple times within one window.
    BaseDelta,
    /// Nth percentile with linear interpolation, 0..=100.
    Percentile(u8),
}

impl RollupFn {
    /// Parses a configuration token: `sum`, `avg`, `sumb` or `pct(N)`.
    pub fn parse(token: &str) -> Result<Self, Error> {
        match token {
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            "sumb" => Ok(Self::BaseDelta),
            _ => parse_percentile(token).ok_or_else(|| {
                Error::InvalidConfig(format!("unknown rollup function: {token:?}"))
            }),
        }
    }

    /// Metric key suffix for this function's output.
    pub fn suffix(&self) -> String {
        match self {
            Self::Sum => "sum".to_string(),
            Self::Avg => "avg".to_string(),
            Self::BaseDelta => "sumb".to_string(),
            Self::Percentile(n) => format!("p{n}"),
        }
    }

    /// Applies the function to one name group's readings.
    ///
    /// Returns `None` when the group has no usable values for this function;
    /// the corresponding output key is omitted rather than persisted empty.
    pub fn compute(&self, points: &[MetricPoint]) -> Option<f64> {
        match self {
            Self::Sum => Some(sum(points)),
            Self::Avg => {
                if points.is_empty() {
                    return None;
                }
                Some(sum(points) / points.len() as f64)
            }
            Self::BaseDelta => {
                let mut present = points.iter().filter_map(|p| p.value);
                let first = present.next()?;
                let (min, max) = present.fold((first, first), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                });
                Some(max - min)
            }
            Self::Percentile(n) => {
                let mut vals: Vec<f64> = points.iter().filter_map(|p| p.value).collect();
                if vals.is_empty() {
                    return None;
                }
                vals.sort_by(|a, b| a.total_cmp(b));
                Some(percentile(&vals, f64::from(*n)))
            }
        }
    }
}

fn parse_percentile(token: &str) -> Option<RollupFn> {
    let lower = token.to_ascii_lowercase();
    let inner = lower.strip_prefix("pct(")?.strip_suffix(')')?;
    let n: u8 = inner.trim().parse().ok()?;
    if n > 100 {
        return None;
    }
    Some(RollupFn::Percentile(n))
}

fn sum(points: &[MetricPoint]) -> f64 {
    let mut total = 0.0;
    for p in points {
        match p.value {
            Some(v) => total += v,
            None => warn!(metric = %p.name, "skipping absent value in sum"),
        }
    }
    total
}

/// Linear-interpolation percentile over sorted values.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Computes all configured rollups for one metric name group.
///
/// `tokens` is the ordered rollup spec for the group's kind; an unknown token
/// is an `InvalidConfig` error, fatal for this kind's computation only.
/// Output keys are `"<name>.<suffix>"`; functions without a usable result
/// contribute nothing.
pub fn compute_group(
    name: &str,
    points: &[MetricPoint],
    tokens: &[String],
) -> Result<Vec<(String, f64)>, Error> {
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        let func = RollupFn::parse(token)?;
        if let Some(value) = func.compute(points) {
            out.push((format!("{name}.{}", func.suffix()), value));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(values: &[Option<f64>]) -> Vec<MetricPoint> {
        values
            .iter()
            .map(|v| MetricPoint {
                name: "test.metric".to_string(),
                kind: "gauge".to_string(),
                value: *v,
            })
            .collect()
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(RollupFn::parse("sum").expect("valid"), RollupFn::Sum);
        assert_eq!(RollupFn::parse("avg").expect("valid"), RollupFn::Avg);
        assert_eq!(RollupFn::parse("sumb").expect("valid"), RollupFn::BaseDelta);
        assert_eq!(
            RollupFn::parse("pct(95)").expect("valid"),
            RollupFn::Percentile(95)
        );
        assert_eq!(
            RollupFn::parse("PCT(50)").expect("valid"),
            RollupFn::Percentile(50)
        );
    }

    #[test]
    fn test_parse_rejects_unknown_tokens() {
        assert!(RollupFn::parse("median").is_err());
        assert!(RollupFn::parse("pct(101)").is_err());
        assert!(RollupFn::parse("pct(x)").is_err());
        assert!(RollupFn::parse("").is_err());
    }

    #[test]
    fn test_sum() {
        let p = points(&[Some(1.1), Some(3.3), Some(4.2)]);
        let v = RollupFn::Sum.compute(&p).expect("has value");
        assert!((v - 8.6).abs() < 1e-9, "sum={v}");
    }

    #[test]
    fn test_sum_skips_absent() {
        let p = points(&[Some(1.0), None, Some(2.0)]);
        assert_eq!(RollupFn::Sum.compute(&p), Some(3.0));
    }

    #[test]
    fn test_avg() {
        let p = points(&[Some(1.0), Some(3.0), Some(4.0), Some(9.0)]);
        assert_eq!(RollupFn::Avg.compute(&p), Some(4.25));
    }

    #[test]
    fn test_avg_divides_by_total_count() {
        // The divisor counts absent readings too.
        let p = points(&[Some(4.0), None, Some(2.0), None]);
        assert_eq!(RollupFn::Avg.compute(&p), Some(1.5));
    }

    #[test]
    fn test_base_delta() {
        let p = points(&[Some(100.0), Some(160.0), Some(240.0)]);
        assert_eq!(RollupFn::BaseDelta.compute(&p), Some(140.0));
    }

    #[test]
    fn test_base_delta_single_value() {
        let p = points(&[Some(7.0)]);
        assert_eq!(RollupFn::BaseDelta.compute(&p), Some(0.0));
    }

    #[test]
    fn test_base_delta_all_absent() {
        let p = points(&[None, None]);
        assert_eq!(RollupFn::BaseDelta.compute(&p), None);
    }

    #[test]
    fn test_percentiles_linear_interpolation() {
        let p = points(&[Some(1.1), Some(3.3), Some(4.2)]);
        let cases = [(50u8, 3.3), (90, 4.02), (95, 4.11), (99, 4.182)];
        for (pct, expected) in cases {
            let v = RollupFn::Percentile(pct).compute(&p).expect("has value");
            assert!(
                (v - expected).abs() < 1e-9,
                "p{pct}={v}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_percentile_bounds() {
        let p = points(&[Some(5.0), Some(1.0), Some(3.0)]);
        assert_eq!(RollupFn::Percentile(0).compute(&p), Some(1.0));
        assert_eq!(RollupFn::Percentile(100).compute(&p), Some(5.0));
    }

    #[test]
    fn test_percentile_all_absent_omitted() {
        let p = points(&[None, None]);
        assert_eq!(RollupFn::Percentile(95).compute(&p), None);
    }

    #[test]
    fn test_compute_group_keys_and_order() {
        let p = points(&[Some(1.0), Some(3.0)]);
        let tokens = vec!["sum".to_string(), "pct(50)".to_string()];
        let out = compute_group("cpu.0.idle", &p, &tokens).expect("valid tokens");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], ("cpu.0.idle.sum".to_string(), 4.0));
        assert_eq!(out[1], ("cpu.0.idle.p50".to_string(), 2.0));
    }

    #[test]
    fn test_compute_group_unknown_token_is_fatal() {
        let p = points(&[Some(1.0)]);
        let tokens = vec!["sum".to_string(), "bogus".to_string()];
        assert!(compute_group("m", &p, &tokens).is_err());
    }
}
