//! Prometheus text exposition for flattened cost series.

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use super::flatten::SeriesMap;
use crate::core::error::ConvertError;

const LABELS: &[&str] = &["job", "dimension"];

/// `NetAmortizedCost` -> `net_amortized_cost`. Characters outside
/// `[a-zA-Z0-9_]` become `_`.
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }

        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            let boundary = prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_lower);
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }

    out
}

fn gauge_opts(prefix: &str, measure: &str) -> Opts {
    let opts = Opts::new(snake_case(measure), format!("Cost Explorer {measure}"));
    if prefix.is_empty() {
        opts
    } else {
        opts.namespace(prefix)
    }
}

/// Builds a fresh registry with one gauge family per measure and encodes it.
pub fn render(series: &SeriesMap, prefix: &str, job: &str) -> Result<String, ConvertError> {
    let registry = Registry::new();

    for (measure, dimensions) in series {
        let gauge = GaugeVec::new(gauge_opts(prefix, measure), LABELS)?;
        for (dimension, value) in dimensions {
            gauge.with_label_values(&[job, dimension.as_str()]).set(*value);
        }
        registry.register(Box::new(gauge))?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Sample lines of an exposition as `(name, labels, value)` sorted by name
/// and labels, comments skipped.
#[cfg(test)]
pub fn parse_samples(
    text: &str,
) -> Vec<(String, std::collections::BTreeMap<String, String>, f64)> {
    use std::collections::BTreeMap;

    let mut samples = Vec::new();
    for line in text.lines().filter(|l| !l.is_empty() && !l.starts_with('#')) {
        let (series, value) = line.rsplit_once(' ').unwrap();
        let value = match value {
            "+Inf" => f64::INFINITY,
            "-Inf" => f64::NEG_INFINITY,
            v => v.parse().unwrap(),
        };

        let Some((name, rest)) = series.split_once('{') else {
            samples.push((series.to_string(), BTreeMap::new(), value));
            continue;
        };

        let mut labels = BTreeMap::new();
        let mut chars = rest.trim_end_matches('}').chars().peekable();
        while chars.peek().is_some() {
            let key: String = chars.by_ref().take_while(|&c| c != '=').collect();
            assert_eq!(chars.next(), Some('"'));
            let mut label = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some('n') => label.push('\n'),
                        Some(other) => label.push(other),
                        None => break,
                    },
                    '"' => break,
                    c => label.push(c),
                }
            }
            labels.insert(key, label);
            if chars.peek() == Some(&',') {
                chars.next();
            }
        }
        samples.push((name.to_string(), labels, value));
    }
    samples.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    samples
}
