//! Per-connection session driver.
//!
//! Takes an authenticated connection record, applies the configured metadata
//! overrides, picks the configured backend and opens a [`Session`] on it with
//! the connection's environment staged. The returned [`GatewaySession`] owns
//! the session until [`GatewaySession::finish`].

use crate::config::ServerConfig;
use sshgate_core::metrics::{Counter, Gauge, GeoCounter};
use sshgate_core::{
    ConnectionAuthenticatedMetadata, GateError, GateResult, MetricLabel, MetricsCollector,
    Registry, Session, ShellOrSubsystem, EXIT_CODE_UNAVAILABLE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Metrics the gateway reports per connection and session.
#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    pub connections: GeoCounter,
    pub sessions: Counter,
    pub current_sessions: Gauge,
    pub backend_errors: Counter,
}

impl GatewayMetrics {
    pub fn register(collector: &MetricsCollector) -> GateResult<Self> {
        Ok(Self {
            connections: collector.create_counter_geo(
                "sshgate_connections_total",
                "Authenticated connections handed to a backend",
                &["backend"],
            )?,
            sessions: collector.create_counter(
                "sshgate_sessions_total",
                "Backend sessions created",
                &["backend"],
            )?,
            current_sessions: collector.create_gauge(
                "sshgate_sessions_current",
                "Backend sessions currently open",
                &["backend"],
            )?,
            backend_errors: collector.create_counter(
                "sshgate_backend_errors_total",
                "Backend failures while creating or preparing sessions",
                &["backend"],
            )?,
        })
    }
}

/// Metric updates never fail a session.
fn record<T>(metric: &str, result: GateResult<T>) {
    if let Err(e) = result {
        warn!(metric, error = %e, "metric update failed");
    }
}

/// Opens sessions for authenticated connections.
pub struct ConnectionHandler {
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    metrics: GatewayMetrics,
    active_sessions: Arc<AtomicUsize>,
}

impl ConnectionHandler {
    pub fn new(
        registry: Arc<Registry>,
        config: Arc<ServerConfig>,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            registry,
            config,
            metrics,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Create and prepare a backend session for `meta`.
    ///
    /// Fails with `InvalidState` for a record whose authentication failed and
    /// with `SessionCreationFailed` once `max_sessions` sessions are open. Any
    /// error here should close the connection with an explanation.
    pub fn open_session(
        &self,
        mut meta: ConnectionAuthenticatedMetadata,
    ) -> GateResult<GatewaySession> {
        if !meta.is_authenticated() {
            return Err(GateError::InvalidState(format!(
                "connection {} is not authenticated",
                meta.connection().connection_id
            )));
        }
        meta.merge(self.config.overrides());

        let backend_name = self.config.backend.as_str();
        let backend = self.registry.get_backend(backend_name).map_err(|e| {
            error!(backend = %backend_name, "configured backend is not registered");
            e
        })?;
        let label = MetricLabel::new("backend", backend_name)?;

        let guard = SessionGuard::try_acquire(
            self.active_sessions.clone(),
            self.config.max_sessions,
            self.metrics.current_sessions.clone(),
            label.clone(),
        )
        .ok_or_else(|| {
            GateError::SessionCreationFailed(format!(
                "max sessions ({}) reached",
                self.config.max_sessions
            ))
        })?;

        let connection_id = meta.connection().connection_id.clone();
        let labels = std::slice::from_ref(&label);
        record(
            self.metrics.connections.name(),
            self.metrics
                .connections
                .increment(meta.connection().remote_address.ip, labels),
        );

        let mut session = backend
            .create_session(&connection_id, &meta.authenticated_username)
            .map_err(|e| {
                self.record_backend_error(labels);
                warn!(
                    connection_id = %connection_id,
                    backend = %backend_name,
                    error = %e,
                    "session creation failed"
                );
                e
            })?;

        if let Some(environment) = &meta.connection().environment {
            let mut names: Vec<&String> = environment.keys().collect();
            names.sort();
            for name in names {
                if let Err(e) = session.set_env(name, &environment[name].value) {
                    self.record_backend_error(labels);
                    session.close();
                    return Err(e);
                }
            }
        }

        record(
            self.metrics.sessions.name(),
            self.metrics.sessions.increment(labels),
        );
        info!(
            connection_id = %connection_id,
            backend = %backend_name,
            username = %meta.authenticated_username,
            "session opened"
        );

        Ok(GatewaySession {
            session,
            meta,
            closed: false,
            _guard: guard,
        })
    }
}

impl ConnectionHandler {
    fn record_backend_error(&self, labels: &[MetricLabel]) {
        let counter = &self.metrics.backend_errors;
        record(counter.name(), counter.increment(labels));
    }
}

/// Keeps a session counted until dropped.
struct SessionGuard {
    counter: Arc<AtomicUsize>,
    gauge: Gauge,
    label: MetricLabel,
}

impl SessionGuard {
    /// Reserve a slot, or `None` when `max` sessions are already open.
    fn try_acquire(
        counter: Arc<AtomicUsize>,
        max: usize,
        gauge: Gauge,
        label: MetricLabel,
    ) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()?;
        record(gauge.name(), gauge.increment(std::slice::from_ref(&label)));
        Some(Self {
            counter,
            gauge,
            label,
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        let result = self.gauge.decrement(std::slice::from_ref(&self.label));
        record(self.gauge.name(), result);
    }
}

/// A backend session owned by one connection handler.
pub struct GatewaySession {
    session: Box<dyn Session>,
    meta: ConnectionAuthenticatedMetadata,
    closed: bool,
    _guard: SessionGuard,
}

impl GatewaySession {
    /// The connection record after overrides were merged.
    pub fn metadata(&self) -> &ConnectionAuthenticatedMetadata {
        &self.meta
    }

    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    pub fn request_pty(&mut self) -> GateResult<()> {
        self.session.set_pty()
    }

    /// Launch the shell, or the named subsystem.
    pub fn launch(&mut self, subsystem: Option<&str>) -> GateResult<ShellOrSubsystem> {
        match subsystem {
            Some(name) => self.session.request_subsystem(name),
            None => self.session.request_shell(),
        }
    }

    /// Forward a client signal. A backend refusing it is logged, not fatal.
    pub fn handle_signal(&self, signal: &str) -> GateResult<()> {
        match self.session.send_signal(signal) {
            Err(GateError::BackendFailure(reason)) => {
                warn!(
                    connection_id = %self.meta.connection().connection_id,
                    signal,
                    reason = %reason,
                    "signal not delivered"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Close the session and return its exit code (negative if none is known).
    pub fn finish(mut self) -> i32 {
        self.close()
    }

    fn close(&mut self) -> i32 {
        if !self.closed {
            self.closed = true;
            let code = self.session.exit_code();
            self.session.close();
            if code != EXIT_CODE_UNAVAILABLE {
                return code;
            }
        }
        self.session.exit_code()
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Random connection identifier (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_connection_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::build_registry;
    use sshgate_core::{Backend, ConnectionAuthPendingMetadata, DummyLookup, Value};
    use std::io::{Read, Write};

    fn handler(toml: &str) -> (ConnectionHandler, MetricsCollector) {
        let config = ServerConfig::from_toml_str(toml).unwrap();
        let registry = Arc::new(build_registry(&config));
        let collector = MetricsCollector::new(Arc::new(DummyLookup));
        let metrics = GatewayMetrics::register(&collector).unwrap();
        (
            ConnectionHandler::new(registry, Arc::new(config), metrics),
            collector,
        )
    }

    fn alice() -> ConnectionAuthenticatedMetadata {
        let mut meta = ConnectionAuthPendingMetadata::for_test("alice").authenticated("alice");
        meta.connection_mut()
            .environment_mut()
            .insert("FROM_AUTH".into(), Value::new("1"));
        meta
    }

    fn backend_label() -> Vec<MetricLabel> {
        vec![MetricLabel::new("backend", "echo").unwrap()]
    }

    #[test]
    fn rejects_failed_authentication() {
        let (handler, _) = handler("[gateway]\nbackend = \"echo\"\n");
        let meta = ConnectionAuthPendingMetadata::for_test("alice").auth_failed();
        assert!(matches!(
            handler.open_session(meta),
            Err(GateError::InvalidState(_))
        ));
    }

    #[test]
    fn unknown_backend_is_configuration_error() {
        let (handler, _) = handler("[gateway]\nbackend = \"kuberun\"\n");
        assert!(matches!(
            handler.open_session(alice()),
            Err(GateError::BackendNotFound(name)) if name == "kuberun"
        ));
    }

    #[test]
    fn stages_environment_from_metadata() {
        let (handler, collector) = handler("[gateway]\nbackend = \"echo\"\n");
        let mut session = handler.open_session(alice()).unwrap();
        let mut streams = session.launch(Some("env")).unwrap();
        let mut out = String::new();
        streams.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "FROM_AUTH=1\n");
        assert_eq!(session.finish(), 0);

        assert_eq!(collector.value("sshgate_sessions_total", &backend_label()), 1.0);
        assert_eq!(collector.value("sshgate_sessions_current", &backend_label()), 0.0);
    }

    #[test]
    fn configured_environment_replaces_connection_environment() {
        let (handler, _) = handler(
            "[gateway]\nbackend = \"echo\"\n\
             [environment]\nLANG = \"C\"\n\
             [metadata]\nteam = \"ops\"\n",
        );
        let mut session = handler.open_session(alice()).unwrap();
        assert_eq!(
            session.metadata().connection().metadata.as_ref().unwrap()["team"],
            Value::new("ops")
        );
        let mut streams = session.launch(Some("env")).unwrap();
        let mut out = String::new();
        streams.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "LANG=C\n");
        session.finish();
    }

    #[test]
    fn enforces_max_sessions() {
        let (handler, collector) = handler("[gateway]\nbackend = \"echo\"\nmax_sessions = 1\n");
        let first = handler.open_session(alice()).unwrap();
        assert_eq!(handler.active_sessions(), 1);
        assert_eq!(collector.value("sshgate_sessions_current", &backend_label()), 1.0);
        assert!(matches!(
            handler.open_session(alice()),
            Err(GateError::SessionCreationFailed(_))
        ));
        drop(first);
        assert_eq!(handler.active_sessions(), 0);
        assert!(handler.open_session(alice()).is_ok());
    }

    #[test]
    fn backend_errors_are_counted() {
        let config = ServerConfig::from_toml_str("[gateway]\nbackend = \"broken\"\n").unwrap();
        let mut registry = Registry::new();
        registry.register(Backend::new("broken", |_, _| {
            Err(GateError::SessionCreationFailed("no capacity".into()))
        }));
        let collector = MetricsCollector::new(Arc::new(DummyLookup));
        let metrics = GatewayMetrics::register(&collector).unwrap();
        let handler = ConnectionHandler::new(Arc::new(registry), Arc::new(config), metrics);

        assert!(matches!(
            handler.open_session(alice()),
            Err(GateError::SessionCreationFailed(_))
        ));
        let label = vec![MetricLabel::new("backend", "broken").unwrap()];
        assert_eq!(collector.value("sshgate_backend_errors_total", &label), 1.0);
        assert_eq!(collector.value("sshgate_sessions_current", &label), 0.0);
        assert_eq!(handler.active_sessions(), 0);
    }

    #[test]
    fn signal_failures_are_not_fatal() {
        let (handler, _) = handler("[gateway]\nbackend = \"echo\"\n");
        let mut session = handler.open_session(alice()).unwrap();
        assert!(session.handle_signal("TERM").unwrap_err().is_lifecycle_violation());

        let mut streams = session.launch(None).unwrap();
        session.handle_signal("NOT_A_SIGNAL").unwrap();
        streams.stdin.write_all(b"hi").unwrap();
        session.handle_signal("INT").unwrap();
        assert_eq!(session.session().exit_code(), 128 + 2);
        assert_eq!(session.finish(), 130);
    }

    #[test]
    fn connection_ids_are_unique_hex() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
