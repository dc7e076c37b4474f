use serde::Deserialize;
use tracing::warn;

use crate::error::Error;

/// One raw monitoring sample as submitted by a collector.
///
/// `dsnames`, `dstypes` and `values` are parallel arrays describing the
/// datasources of the sample; `values` entries may be JSON null when the
/// collector had no reading for that datasource.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub plugin_instance: String,
    #[serde(default, rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub type_instance: String,
    #[serde(default)]
    pub dsnames: Vec<String>,
    #[serde(default)]
    pub dstypes: Vec<String>,
    #[serde(default)]
    pub values: Vec<Option<f64>>,
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub interval: f64,
}

/// One named metric value derived from a sample datasource.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    /// Dotted metric name, e.g. "interface.enp0s3.if_packets.rx".
    pub name: String,
    /// Datasource kind, e.g. "gauge" or "derive". Selects the rollup spec.
    pub kind: String,
    /// Reading for this datasource; `None` when the collector had no value.
    pub value: Option<f64>,
}

/// Derives the metric points of one sample.
///
/// The base name is the dot-joined concatenation of
/// `plugin[.plugin_instance][.type if type != plugin][.type_instance]`,
/// each segment included only when non-empty. One point is emitted per
/// datasource entry: the conventional "value" datasource keeps the base name
/// and is emitted even when its value is absent; any other datasource name is
/// appended as a suffix and absent values are dropped silently.
pub fn metric_points(sample: &Sample) -> Result<Vec<MetricPoint>, Error> {
    if sample.plugin.is_empty() {
        return Err(Error::InvalidData(format!(
            "missing plugin for host {:?}",
            sample.host
        )));
    }

    if sample.dsnames.len() != sample.dstypes.len()
        || sample.dsnames.len() != sample.values.len()
    {
        return Err(Error::InvalidData(format!(
            "mismatched datasource arrays for host {:?}: {} names, {} types, {} values",
            sample.host,
            sample.dsnames.len(),
            sample.dstypes.len(),
            sample.values.len(),
        )));
    }

    let base = base_name(sample);

    let mut points = Vec::with_capacity(sample.dsnames.len());
    for (i, dsn) in sample.dsnames.iter().enumerate() {
        if dsn == "value" {
            points.push(MetricPoint {
                name: base.clone(),
                kind: sample.dstypes[i].clone(),
                value: sample.values[i],
            });
        } else if sample.values[i].is_some() {
            points.push(MetricPoint {
                name: format!("{base}.{dsn}"),
                kind: sample.dstypes[i].clone(),
                value: sample.values[i],
            });
        }
    }

    Ok(points)
}

fn base_name(sample: &Sample) -> String {
    let mut name = sample.plugin.clone();

    if !sample.plugin_instance.is_empty() {
        name.push('.');
        name.push_str(&sample.plugin_instance);
    }

    if !sample.type_.is_empty() && sample.type_ != sample.plugin {
        name.push('.');
        name.push_str(&sample.type_);
    }

    if !sample.type_instance.is_empty() {
        name.push('.');
        name.push_str(&sample.type_instance);
    }

    name
}

/// Parses an ingestion payload: either a JSON array of samples or a single
/// sample object. Malformed payloads are a caller error, not a fault.
pub fn parse_payload(raw: &str) -> Result<Vec<Sample>, Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Many(Vec<Sample>),
        One(Sample),
    }

    match serde_json::from_str::<Payload>(raw) {
        Ok(Payload::Many(samples)) => Ok(samples),
        Ok(Payload::One(sample)) => Ok(vec![sample]),
        Err(e) => {
            warn!(error = %e, "rejecting malformed ingestion payload");
            Err(Error::InvalidData(format!("malformed payload: {e}")))
        }
    }
}
