//! Built-in backends and the startup registry.

pub mod local;
pub mod pty;

use crate::config::ServerConfig;
use sshgate_core::backend::echo;
use sshgate_core::Registry;

/// Register every built-in backend. Called once at startup, before any lookup.
pub fn build_registry(config: &ServerConfig) -> Registry {
    let mut registry = Registry::new();
    registry.register(local::backend(config.local.clone()));
    registry.register(echo::backend());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_builtins_in_order() {
        let registry = build_registry(&ServerConfig::default());
        assert_eq!(registry.backends(), [local::BACKEND_NAME, echo::BACKEND_NAME]);
        assert!(registry.get_backend("local").is_ok());
        assert!(registry.get_backend("docker").is_err());
    }
}
