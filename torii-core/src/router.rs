use crate::route::{Route, RouteConfig};
use matchit::Router as MatchitRouter;
use std::collections::HashMap;
use std::sync::Arc;
use torii_http::Method;
use tracing::warn;

/// Radix-tree request router. Built once at startup from the route table;
/// matching never allocates beyond extracted params.
///
/// Priority-then-insertion: routes are inserted in descending priority
/// (stable for ties), and a pattern conflict keeps the earlier route, so
/// when two routes claim the same shape the higher-priority one wins.
pub struct Router {
    method_routers: HashMap<Method, MatchitRouter<usize>>,
    any_method_router: MatchitRouter<usize>,
    routes: Vec<Arc<Route>>,
}

/// Result of a route match.
#[derive(Debug)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    /// Extracted path parameters, e.g. `("id", "42")` for `/users/:id`.
    pub params: Vec<(String, String)>,
}

impl Router {
    pub fn build(configs: &[RouteConfig]) -> anyhow::Result<Router> {
        let mut compiled: Vec<Arc<Route>> = Vec::with_capacity(configs.len());
        for cfg in configs {
            compiled.push(Arc::new(Route::compile(cfg)?));
        }

        // Descending priority, stable for equal priorities.
        let mut order: Vec<usize> = (0..compiled.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(compiled[i].priority));

        let mut method_routers: HashMap<Method, MatchitRouter<usize>> = HashMap::new();
        let mut any_method_router = MatchitRouter::new();

        for &idx in &order {
            let route = &compiled[idx];
            for pattern in translate_pattern(&route.pattern) {
                if route.methods.is_empty() {
                    if let Err(e) = any_method_router.insert(&pattern, idx) {
                        warn!(route = %route.id, pattern = %pattern, error = %e,
                              "Route pattern conflict, keeping earlier route");
                    }
                } else {
                    for method in &route.methods {
                        let router = method_routers.entry(*method).or_default();
                        if let Err(e) = router.insert(&pattern, idx) {
                            warn!(route = %route.id, pattern = %pattern, method = %method,
                                  error = %e, "Route pattern conflict, keeping earlier route");
                        }
                    }
                }
            }
        }

        Ok(Router {
            method_routers,
            any_method_router,
            routes: compiled,
        })
    }

    /// Best matching route for the request, or `None` (the server turns
    /// that into the canonical 404).
    ///
    /// The method predicate is AND-ed with the path match, not a separate
    /// tier: when both the method-specific and the any-method tree match,
    /// the route with the higher priority wins, ties by config order.
    pub fn match_route(&self, method: Method, path: &str, host: Option<&str>) -> Option<RouteMatch> {
        let specific = self
            .method_routers
            .get(&method)
            .and_then(|router| self.try_match(router, path, host));
        let any = self.try_match(&self.any_method_router, path, host);

        let (idx, params) = match (specific, any) {
            (Some(s), Some(a)) => {
                let (sp, ap) = (self.routes[s.0].priority, self.routes[a.0].priority);
                if sp > ap || (sp == ap && s.0 < a.0) {
                    s
                } else {
                    a
                }
            }
            (Some(s), None) => s,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some(RouteMatch {
            route: Arc::clone(&self.routes[idx]),
            params,
        })
    }

    fn try_match(
        &self,
        router: &MatchitRouter<usize>,
        path: &str,
        host: Option<&str>,
    ) -> Option<(usize, Vec<(String, String)>)> {
        let matched = router.at(path).ok()?;
        let idx = *matched.value;
        if !self.routes[idx].host.matches(host) {
            return None;
        }
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some((idx, params))
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Translate a config pattern into matchit syntax.
///
/// `:name` segments become `{name}`, a trailing `*` or `*rest` becomes a
/// catch-all. The root prefix `/*` additionally matches `/` itself.
fn translate_pattern(pattern: &str) -> Vec<String> {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut extra = Vec::new();
    let segments: Vec<&str> = pattern.split('/').collect();
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        let last = i == segments.len() - 1;
        if let Some(name) = seg.strip_prefix(':') {
            out.push('{');
            out.push_str(name);
            out.push('}');
        } else if last && *seg == "*" {
            out.push_str("{*rest}");
        } else if last && seg.starts_with('*') {
            out.push('{');
            out.push_str(seg);
            out.push('}');
        } else {
            out.push_str(seg);
        }
    }
    if pattern == "/*" {
        extra.push("/".to_string());
    }
    extra.push(out);
    extra
}
