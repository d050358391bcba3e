use crate::context::RequestContext;
use crate::middleware::{Flow, MiddlewareInstance};
use crate::registry::MiddlewareRegistry;
use std::sync::Arc;
use torii_core::config::MiddlewareEntry;
use torii_http::{Request, Response};
use tracing::debug;

/// One chain position: `(middleware, enabled, priority)`.
#[derive(Clone)]
pub struct ChainEntry {
    pub instance: Arc<dyn MiddlewareInstance>,
    pub priority: i32,
    pub enabled: bool,
}

/// The ordered middleware pipeline. Request phase runs in ascending
/// priority and may short-circuit; the response phase always runs every
/// enabled middleware, in the same order.
pub struct MiddlewareChain {
    entries: Vec<ChainEntry>,
}

impl MiddlewareChain {
    /// Sort is stable: equal priorities keep their configured order.
    pub fn build(mut entries: Vec<ChainEntry>) -> Self {
        entries.sort_by_key(|e| e.priority);
        Self { entries }
    }

    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Assemble a chain from config entries against the factory registry.
    pub fn from_config(
        registry: &MiddlewareRegistry,
        configured: &[MiddlewareEntry],
    ) -> anyhow::Result<Self> {
        let mut entries = Vec::with_capacity(configured.len());
        for entry in configured {
            let factory = registry
                .get(&entry.name)
                .ok_or_else(|| anyhow::anyhow!("unknown middleware {:?}", entry.name))?;
            let instance = factory.configure(&entry.config)?;
            entries.push(ChainEntry {
                priority: entry.priority.unwrap_or_else(|| factory.default_priority()),
                enabled: entry.enabled,
                instance,
            });
        }
        Ok(Self::build(entries))
    }

    pub fn run_request(&self, ctx: &mut RequestContext, req: &mut Request) -> Flow {
        for entry in &self.entries {
            if !entry.enabled {
                continue;
            }
            match entry.instance.on_request(ctx, req) {
                Flow::Continue => {}
                Flow::Respond(resp) => {
                    debug!(middleware = %entry.instance.name(), status = resp.status,
                           "Request phase short-circuited");
                    return Flow::Respond(resp);
                }
                Flow::Fail(err) => {
                    debug!(middleware = %entry.instance.name(), error = %err,
                           "Request phase failed");
                    return Flow::Fail(err);
                }
            }
        }
        Flow::Continue
    }

    pub fn run_response(&self, ctx: &mut RequestContext, resp: &mut Response) {
        for entry in &self.entries {
            if entry.enabled {
                entry.instance.on_response(ctx, resp);
            }
        }
    }

    /// Periodic housekeeping across all instances.
    pub fn sweep(&self) {
        for entry in &self.entries {
            entry.instance.sweep();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
