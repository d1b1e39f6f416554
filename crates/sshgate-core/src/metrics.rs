//! Counters and gauges on a Prometheus registry.
//!
//! Each collector owns its own [`prometheus::Registry`]. Serving the text
//! exposition over HTTP is left to the caller, which can hand
//! [`MetricsCollector::render`] to any listener.

use crate::error::{GateError, GateResult};
use crate::geoip::GeoIpLookup;
use prometheus::proto::{Metric, MetricFamily};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Label name reserved for GeoIP-labelled metrics.
const COUNTRY_LABEL: &str = "country";

/// How a metric's value may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    /// Only ever increases.
    Counter,
    /// May go up or down.
    Gauge,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::Counter => f.write_str("counter"),
            MetricType::Gauge => f.write_str("gauge"),
        }
    }
}

/// A single `name="value"` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabel {
    name: String,
    value: String,
}

impl MetricLabel {
    /// Fails for an empty name or value and for the reserved `country` name.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> GateResult<Self> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() || value.is_empty() {
            return Err(GateError::Metrics(
                "metric label name and value must be non-empty".into(),
            ));
        }
        check_label_name(&name)?;
        Ok(Self { name, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

fn check_label_name(name: &str) -> GateResult<()> {
    if name == COUNTRY_LABEL {
        return Err(GateError::Metrics(
            "the label name 'country' is reserved for GeoIP lookups".into(),
        ));
    }
    Ok(())
}

/// Sorted label set identifying one value of a metric.
pub type LabelSet = BTreeMap<String, String>;

/// What was registered under a name. `gather()` omits metrics that have no
/// values yet, so names, help and type are answered from here.
#[derive(Debug, Clone)]
struct Registered {
    help: String,
    kind: MetricType,
}

struct Inner {
    registry: Registry,
    registered: Mutex<BTreeMap<String, Registered>>,
    geoip: Arc<dyn GeoIpLookup>,
}

/// Registry of named metrics. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Inner>,
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("metrics", &self.metric_names())
            .finish()
    }
}

impl MetricsCollector {
    pub fn new(geoip: Arc<dyn GeoIpLookup>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Registry::new(),
                registered: Mutex::new(BTreeMap::new()),
                geoip,
            }),
        }
    }

    /// The underlying Prometheus registry, for exporters.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    fn registered(&self) -> MutexGuard<'_, BTreeMap<String, Registered>> {
        self.inner
            .registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create<C>(
        &self,
        name: &str,
        help: &str,
        kind: MetricType,
        build: impl FnOnce(Opts) -> prometheus::Result<C>,
    ) -> GateResult<C>
    where
        C: prometheus::core::Collector + Clone + 'static,
    {
        let mut registered = self.registered();
        if registered.contains_key(name) {
            return Err(GateError::MetricAlreadyExists(name.to_string()));
        }
        let collector = build(Opts::new(name, help))?;
        self.inner.registry.register(Box::new(collector.clone()))?;
        registered.insert(
            name.to_string(),
            Registered {
                help: help.to_string(),
                kind,
            },
        );
        Ok(collector)
    }

    /// Create a monotonic counter with the given label names.
    pub fn create_counter(&self, name: &str, help: &str, labels: &[&str]) -> GateResult<Counter> {
        for label in labels {
            check_label_name(label)?;
        }
        let vec = self.create(name, help, MetricType::Counter, |opts| {
            CounterVec::new(opts, labels)
        })?;
        Ok(Counter {
            vec,
            name: name.to_string(),
        })
    }

    /// Create a counter that also carries the `country` of a remote address.
    pub fn create_counter_geo(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> GateResult<GeoCounter> {
        let labels = with_country(labels)?;
        let vec = self.create(name, help, MetricType::Counter, |opts| {
            CounterVec::new(opts, &labels)
        })?;
        Ok(GeoCounter {
            counter: Counter {
                vec,
                name: name.to_string(),
            },
            collector: self.clone(),
        })
    }

    /// Create a gauge with the given label names.
    pub fn create_gauge(&self, name: &str, help: &str, labels: &[&str]) -> GateResult<Gauge> {
        for label in labels {
            check_label_name(label)?;
        }
        let vec = self.create(name, help, MetricType::Gauge, |opts| {
            GaugeVec::new(opts, labels)
        })?;
        Ok(Gauge {
            vec,
            name: name.to_string(),
        })
    }

    /// Create a gauge that also carries the `country` of a remote address.
    pub fn create_gauge_geo(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> GateResult<GeoGauge> {
        let labels = with_country(labels)?;
        let vec = self.create(name, help, MetricType::Gauge, |opts| {
            GaugeVec::new(opts, &labels)
        })?;
        Ok(GeoGauge {
            gauge: Gauge {
                vec,
                name: name.to_string(),
            },
            collector: self.clone(),
        })
    }

    /// Registered metric names, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        self.registered().keys().cloned().collect()
    }

    pub fn help(&self, name: &str) -> Option<String> {
        self.registered().get(name).map(|m| m.help.clone())
    }

    pub fn metric_type(&self, name: &str) -> Option<MetricType> {
        self.registered().get(name).map(|m| m.kind)
    }

    /// All values of a metric, keyed by label set. Empty for an unknown name.
    pub fn values(&self, name: &str) -> BTreeMap<LabelSet, f64> {
        self.inner
            .registry
            .gather()
            .iter()
            .find(|family| family.get_name() == name)
            .map(family_values)
            .unwrap_or_default()
    }

    /// Value for one label set; 0 if never touched.
    pub fn value(&self, name: &str, labels: &[MetricLabel]) -> f64 {
        let key: LabelSet = labels
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect();
        self.values(name).get(&key).copied().unwrap_or(0.0)
    }

    fn country(&self, ip: IpAddr) -> String {
        self.inner.geoip.lookup(ip)
    }

    /// Render every metric with values in the Prometheus text format.
    pub fn render(&self) -> GateResult<String> {
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| GateError::Metrics(e.to_string()))
    }
}

fn with_country<'a>(labels: &[&'a str]) -> GateResult<Vec<&'a str>> {
    let mut names = Vec::with_capacity(labels.len() + 1);
    for label in labels {
        check_label_name(label)?;
        names.push(*label);
    }
    names.push(COUNTRY_LABEL);
    Ok(names)
}

fn family_values(family: &MetricFamily) -> BTreeMap<LabelSet, f64> {
    let counter = family.get_field_type() == prometheus::proto::MetricType::COUNTER;
    family
        .get_metric()
        .iter()
        .map(|metric| (metric_labels(metric), metric_value(metric, counter)))
        .collect()
}

fn metric_labels(metric: &Metric) -> LabelSet {
    metric
        .get_label()
        .iter()
        .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
        .collect()
}

fn metric_value(metric: &Metric, counter: bool) -> f64 {
    if counter {
        metric.get_counter().value()
    } else {
        metric.get_gauge().value()
    }
}

fn label_map<'a>(
    labels: &'a [MetricLabel],
    country: Option<&'a str>,
) -> HashMap<&'a str, &'a str> {
    let mut map: HashMap<&str, &str> = labels
        .iter()
        .map(|l| (l.name.as_str(), l.value.as_str()))
        .collect();
    if let Some(country) = country {
        map.insert(COUNTRY_LABEL, country);
    }
    map
}

/// Handle to a counter. Label values must match the names it was created with.
#[derive(Clone)]
pub struct Counter {
    vec: CounterVec,
    name: String,
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter").field("name", &self.name).finish()
    }
}

impl Counter {
    pub fn increment(&self, labels: &[MetricLabel]) -> GateResult<f64> {
        self.increment_by(1.0, labels)
    }

    pub fn increment_by(&self, by: f64, labels: &[MetricLabel]) -> GateResult<f64> {
        self.add(by, label_map(labels, None))
    }

    fn add(&self, by: f64, labels: HashMap<&str, &str>) -> GateResult<f64> {
        if by < 0.0 {
            return Err(GateError::CounterNegativeIncrement(self.name.clone()));
        }
        let counter = self.vec.get_metric_with(&labels)?;
        counter.inc_by(by);
        Ok(counter.get())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a counter carrying a `country` label.
#[derive(Debug, Clone)]
pub struct GeoCounter {
    counter: Counter,
    collector: MetricsCollector,
}

impl GeoCounter {
    pub fn increment(&self, ip: IpAddr, labels: &[MetricLabel]) -> GateResult<f64> {
        let country = self.collector.country(ip);
        self.counter.add(1.0, label_map(labels, Some(country.as_str())))
    }

    pub fn name(&self) -> &str {
        &self.counter.name
    }
}

/// Handle to a gauge. Label values must match the names it was created with.
#[derive(Clone)]
pub struct Gauge {
    vec: GaugeVec,
    name: String,
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gauge").field("name", &self.name).finish()
    }
}

impl Gauge {
    fn child(&self, labels: HashMap<&str, &str>) -> GateResult<prometheus::Gauge> {
        Ok(self.vec.get_metric_with(&labels)?)
    }

    pub fn increment(&self, labels: &[MetricLabel]) -> GateResult<f64> {
        let gauge = self.child(label_map(labels, None))?;
        gauge.inc();
        Ok(gauge.get())
    }

    pub fn decrement(&self, labels: &[MetricLabel]) -> GateResult<f64> {
        let gauge = self.child(label_map(labels, None))?;
        gauge.dec();
        Ok(gauge.get())
    }

    pub fn set(&self, value: f64, labels: &[MetricLabel]) -> GateResult<()> {
        self.child(label_map(labels, None))?.set(value);
        Ok(())
    }

    pub fn value(&self, labels: &[MetricLabel]) -> GateResult<f64> {
        Ok(self.child(label_map(labels, None))?.get())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a gauge carrying a `country` label.
#[derive(Debug, Clone)]
pub struct GeoGauge {
    gauge: Gauge,
    collector: MetricsCollector,
}

impl GeoGauge {
    pub fn increment(&self, ip: IpAddr, labels: &[MetricLabel]) -> GateResult<f64> {
        let country = self.collector.country(ip);
        let gauge = self.gauge.child(label_map(labels, Some(country.as_str())))?;
        gauge.inc();
        Ok(gauge.get())
    }

    pub fn decrement(&self, ip: IpAddr, labels: &[MetricLabel]) -> GateResult<f64> {
        let country = self.collector.country(ip);
        let gauge = self.gauge.child(label_map(labels, Some(country.as_str())))?;
        gauge.dec();
        Ok(gauge.get())
    }

    pub fn name(&self) -> &str {
        &self.gauge.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::DummyLookup;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(Arc::new(DummyLookup))
    }

    fn backend(name: &str) -> [MetricLabel; 1] {
        [MetricLabel::new("backend", name).unwrap()]
    }

    #[test]
    fn counter_counts_per_label_set() {
        let c = collector();
        let counter = c
            .create_counter("sessions_total", "Sessions opened", &["backend"])
            .unwrap();
        counter.increment(&backend("local")).unwrap();
        counter.increment(&backend("docker")).unwrap();
        assert_eq!(counter.increment(&backend("docker")).unwrap(), 2.0);

        assert_eq!(c.value("sessions_total", &backend("local")), 1.0);
        assert_eq!(c.value("sessions_total", &backend("docker")), 2.0);
        assert_eq!(c.values("sessions_total").len(), 2);
        assert_eq!(c.metric_type("sessions_total"), Some(MetricType::Counter));
        assert_eq!(c.help("sessions_total").as_deref(), Some("Sessions opened"));
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        let c = collector();
        let counter = c
            .create_counter("sessions_total", "Sessions opened", &["backend"])
            .unwrap();
        assert!(matches!(counter.increment(&[]), Err(GateError::Metrics(_))));
        assert!(c.values("sessions_total").is_empty());
    }

    #[test]
    fn duplicate_metric_rejected() {
        let c = collector();
        c.create_gauge("g", "help", &[]).unwrap();
        assert!(matches!(
            c.create_counter("g", "help", &[]),
            Err(GateError::MetricAlreadyExists(_))
        ));
    }

    #[test]
    fn counter_rejects_negative_increment() {
        let c = collector();
        let counter = c.create_counter("bytes_total", "Bytes", &[]).unwrap();
        assert_eq!(counter.increment_by(10.0, &[]).unwrap(), 10.0);
        assert!(matches!(
            counter.increment_by(-1.0, &[]),
            Err(GateError::CounterNegativeIncrement(_))
        ));
        assert_eq!(c.value("bytes_total", &[]), 10.0);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let c = collector();
        let gauge = c.create_gauge("current", "Current", &[]).unwrap();
        gauge.increment(&[]).unwrap();
        gauge.increment(&[]).unwrap();
        assert_eq!(gauge.decrement(&[]).unwrap(), 1.0);
        gauge.set(5.0, &[]).unwrap();
        assert_eq!(gauge.value(&[]).unwrap(), 5.0);
        assert_eq!(c.metric_type("current"), Some(MetricType::Gauge));
    }

    #[test]
    fn geo_metrics_label_country() {
        let c = collector();
        let counter = c
            .create_counter_geo("connections_total", "Connections", &["backend"])
            .unwrap();
        counter
            .increment("10.0.0.1".parse().unwrap(), &backend("local"))
            .unwrap();
        let values = c.values("connections_total");
        let (labels, value) = values.iter().next().unwrap();
        assert_eq!(labels.get("country").map(String::as_str), Some("XX"));
        assert_eq!(labels.get("backend").map(String::as_str), Some("local"));
        assert_eq!(*value, 1.0);

        let gauge = c.create_gauge_geo("connected", "Connected", &[]).unwrap();
        let ip = "::1".parse().unwrap();
        gauge.increment(ip, &[]).unwrap();
        assert_eq!(gauge.decrement(ip, &[]).unwrap(), 0.0);
    }

    #[test]
    fn reserved_and_empty_labels_rejected() {
        assert!(MetricLabel::new("country", "DE").is_err());
        assert!(MetricLabel::new("", "x").is_err());
        assert!(MetricLabel::new("x", "").is_err());
        let c = collector();
        assert!(c.create_counter("c_total", "C", &["country"]).is_err());
        assert!(c.create_gauge_geo("g", "G", &["country"]).is_err());
        assert!(c.metric_names().is_empty());
    }

    #[test]
    fn render_exposition() {
        let c = collector();
        let counter = c.create_counter("b_total", "B help", &["z", "a"]).unwrap();
        let gauge = c.create_gauge("a_current", "A help", &[]).unwrap();
        gauge.set(2.0, &[]).unwrap();
        counter
            .increment(&[
                MetricLabel::new("z", "q\"uote").unwrap(),
                MetricLabel::new("a", "1").unwrap(),
            ])
            .unwrap();

        let text = c.render().unwrap();
        let expected = "# HELP a_current A help\n\
                        # TYPE a_current gauge\n\
                        a_current 2\n\
                        # HELP b_total B help\n\
                        # TYPE b_total counter\n\
                        b_total{a=\"1\",z=\"q\\\"uote\"} 1\n";
        assert_eq!(text, expected);
        assert_eq!(c.metric_names(), vec!["a_current", "b_total"]);
    }

    #[test]
    fn unknown_metric_is_empty() {
        let c = collector();
        assert!(c.values("nope").is_empty());
        assert_eq!(c.help("nope"), None);
        assert_eq!(c.value("nope", &[]), 0.0);
    }
}
