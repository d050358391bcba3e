use crate::middleware::Middleware;
use std::collections::HashMap;
use std::sync::Arc;

/// Middleware factory registry. Built once at startup, immutable after.
pub struct MiddlewareRegistry {
    factories: HashMap<&'static str, Arc<dyn Middleware>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn Middleware>) {
        let name = factory.name();
        tracing::info!(middleware = %name, "Registered middleware");
        self.factories.insert(name, factory);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Middleware>> {
        self.factories.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MiddlewareInstance;

    struct Noop;
    struct NoopInstance;

    impl Middleware for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn configure(
            &self,
            _config: &serde_json::Value,
        ) -> anyhow::Result<Arc<dyn MiddlewareInstance>> {
            Ok(Arc::new(NoopInstance))
        }
    }

    impl MiddlewareInstance for NoopInstance {
        fn name(&self) -> &'static str {
            "noop"
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = MiddlewareRegistry::new();
        assert!(reg.is_empty());
        reg.register(Arc::new(Noop));
        assert_eq!(reg.len(), 1);
        assert!(reg.get("noop").is_some());
        assert!(reg.get("ghost").is_none());
    }

    #[test]
    fn reregistration_overwrites() {
        let mut reg = MiddlewareRegistry::new();
        reg.register(Arc::new(Noop));
        reg.register(Arc::new(Noop));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn configure_via_registry() {
        let mut reg = MiddlewareRegistry::new();
        reg.register(Arc::new(Noop));
        let inst = reg
            .get("noop")
            .unwrap()
            .configure(&serde_json::json!({}))
            .unwrap();
        assert_eq!(inst.name(), "noop");
    }
}
