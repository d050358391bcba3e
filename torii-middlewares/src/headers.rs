//! Header transform middleware: an ordered rule list applied to the
//! request or response side, each rule optionally predicated.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use torii_http::{HeaderMap, Request, Response};
use torii_middleware::{Flow, Middleware, MiddlewareInstance, RequestContext};

pub struct HeaderTransformMiddleware;

#[derive(Debug, Deserialize, Default)]
struct HeaderTransformConfig {
    #[serde(default)]
    request: Vec<Rule>,

    #[serde(default)]
    response: Vec<Rule>,
}

#[derive(Debug, Deserialize, Clone)]
struct Rule {
    name: String,

    op: Op,

    /// Required for set/append.
    #[serde(default)]
    value: Option<String>,

    #[serde(default)]
    when: Option<Predicate>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Op {
    Set,
    Append,
    Remove,
}

/// All present conditions must hold for the rule to fire.
#[derive(Debug, Deserialize, Clone, Default)]
struct Predicate {
    /// A header that must be present on the same message side.
    #[serde(default)]
    header: Option<String>,

    /// Its required value (only checked when `header` is set).
    #[serde(default)]
    equals: Option<String>,

    /// Response status must be one of these (response side only).
    #[serde(default)]
    status: Option<Vec<u16>>,
}

impl Middleware for HeaderTransformMiddleware {
    fn name(&self) -> &'static str {
        "header_transform"
    }

    fn default_priority(&self) -> i32 {
        40
    }

    fn configure(&self, config: &Value) -> anyhow::Result<Arc<dyn MiddlewareInstance>> {
        let cfg: HeaderTransformConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("header_transform config: {e}"))?;
        for rule in cfg.request.iter().chain(cfg.response.iter()) {
            if matches!(rule.op, Op::Set | Op::Append) && rule.value.is_none() {
                anyhow::bail!(
                    "header_transform: rule for {:?} needs a value for {:?}",
                    rule.name,
                    rule.op
                );
            }
        }
        Ok(Arc::new(HeaderTransformInstance { cfg }))
    }
}

struct HeaderTransformInstance {
    cfg: HeaderTransformConfig,
}

fn predicate_holds(pred: &Option<Predicate>, headers: &HeaderMap, status: Option<u16>) -> bool {
    let Some(pred) = pred else {
        return true;
    };
    if let Some(name) = &pred.header {
        match headers.get(name) {
            None => return false,
            Some(value) => {
                if let Some(expected) = &pred.equals {
                    if value != expected {
                        return false;
                    }
                }
            }
        }
    }
    if let Some(statuses) = &pred.status {
        match status {
            Some(s) if statuses.contains(&s) => {}
            _ => return false,
        }
    }
    true
}

fn apply(rules: &[Rule], headers: &mut HeaderMap, status: Option<u16>) {
    for rule in rules {
        if !predicate_holds(&rule.when, headers, status) {
            continue;
        }
        match rule.op {
            Op::Set => headers.set(&rule.name, rule.value.clone().unwrap_or_default()),
            Op::Append => headers.append(&rule.name, rule.value.clone().unwrap_or_default()),
            Op::Remove => headers.remove(&rule.name),
        }
    }
}

impl MiddlewareInstance for HeaderTransformInstance {
    fn name(&self) -> &'static str {
        "header_transform"
    }

    fn on_request(&self, _ctx: &mut RequestContext, req: &mut Request) -> Flow {
        apply(&self.cfg.request, &mut req.headers, None);
        Flow::Continue
    }

    fn on_response(&self, _ctx: &mut RequestContext, resp: &mut Response) {
        let status = resp.status;
        apply(&self.cfg.response, &mut resp.headers, Some(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torii_http::Method;
    use torii_middleware::Protocol;

    fn instance(config: Value) -> Arc<dyn MiddlewareInstance> {
        HeaderTransformMiddleware.configure(&config).unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::new("id".into(), "127.0.0.1:1".parse().unwrap(), Protocol::Plain)
    }

    #[test]
    fn set_append_remove_in_order() {
        let inst = instance(serde_json::json!({
            "request": [
                { "name": "x-one", "op": "set", "value": "a" },
                { "name": "x-one", "op": "append", "value": "b" },
                { "name": "x-two", "op": "set", "value": "gone" },
                { "name": "x-two", "op": "remove" }
            ]
        }));
        let mut req = Request::new(Method::Get, "/");
        inst.on_request(&mut ctx(), &mut req);
        let values: Vec<&str> = req.headers.get_all("x-one").collect();
        assert_eq!(values, vec!["a", "b"]);
        assert!(!req.headers.contains("x-two"));
    }

    #[test]
    fn header_predicate_gates_rule() {
        let inst = instance(serde_json::json!({
            "request": [
                { "name": "x-flag", "op": "set", "value": "on",
                  "when": { "header": "x-trigger", "equals": "yes" } }
            ]
        }));
        let mut req = Request::new(Method::Get, "/");
        inst.on_request(&mut ctx(), &mut req);
        assert!(!req.headers.contains("x-flag"));

        req.headers.set("x-trigger", "yes");
        inst.on_request(&mut ctx(), &mut req);
        assert_eq!(req.headers.get("x-flag"), Some("on"));
    }

    #[test]
    fn status_predicate_on_response_side() {
        let inst = instance(serde_json::json!({
            "response": [
                { "name": "x-error", "op": "set", "value": "1",
                  "when": { "status": [500, 502] } }
            ]
        }));
        let mut resp = Response::new(200);
        inst.on_response(&mut ctx(), &mut resp);
        assert!(!resp.headers.contains("x-error"));

        let mut resp = Response::new(502);
        inst.on_response(&mut ctx(), &mut resp);
        assert_eq!(resp.headers.get("x-error"), Some("1"));
    }

    #[test]
    fn set_without_value_rejected() {
        assert!(HeaderTransformMiddleware
            .configure(&serde_json::json!({
                "request": [{ "name": "x", "op": "set" }]
            }))
            .is_err());
    }

    #[test]
    fn remove_without_value_is_fine() {
        assert!(HeaderTransformMiddleware
            .configure(&serde_json::json!({
                "response": [{ "name": "server", "op": "remove" }]
            }))
            .is_ok());
    }
}
