//! Authentication middleware. Extracts Basic or Bearer credentials and
//! validates them through an injected validator; the authenticated
//! principal lands in the request context for later middlewares.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use torii_core::config::ConsumerConfig;
use torii_core::GatewayError;
use torii_middleware::{Flow, Middleware, MiddlewareInstance, Principal, RequestContext};
use torii_http::Request;

/// Credentials extracted off the wire, scheme-tagged.
#[derive(Debug, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// Pluggable credential validation. The gateway never interprets
/// credentials itself; it hands them to this seam.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, credentials: &Credentials) -> Option<Principal>;
}

/// Validator backed by the startup consumer table.
pub struct ConsumerValidator {
    consumers: Vec<ConsumerConfig>,
}

impl ConsumerValidator {
    pub fn new(consumers: Vec<ConsumerConfig>) -> Self {
        Self { consumers }
    }
}

impl CredentialValidator for ConsumerValidator {
    fn validate(&self, credentials: &Credentials) -> Option<Principal> {
        for consumer in &self.consumers {
            let matched = match credentials {
                Credentials::Basic { username, password } => {
                    consumer.username.as_deref() == Some(username.as_str())
                        && consumer.password.as_deref() == Some(password.as_str())
                }
                Credentials::Bearer { token } => {
                    consumer.token.as_deref() == Some(token.as_str())
                }
            };
            if matched {
                return Some(Principal {
                    id: consumer.id.clone(),
                    roles: consumer.roles.clone(),
                });
            }
        }
        None
    }
}

pub struct AuthMiddleware {
    validator: Arc<dyn CredentialValidator>,
}

impl AuthMiddleware {
    pub fn new(validator: Arc<dyn CredentialValidator>) -> Self {
        Self { validator }
    }
}

#[derive(Debug, Deserialize)]
struct AuthConfig {
    /// Accepted schemes; both by default.
    #[serde(default = "default_schemes")]
    schemes: Vec<String>,

    /// Paths that skip authentication: exact, or prefix with trailing `*`.
    #[serde(default)]
    public_paths: Vec<String>,

    /// When non-empty, the principal must hold at least one of these.
    #[serde(default)]
    required_roles: Vec<String>,
}

fn default_schemes() -> Vec<String> {
    vec!["basic".to_string(), "bearer".to_string()]
}

impl Middleware for AuthMiddleware {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn default_priority(&self) -> i32 {
        20
    }

    fn configure(
        &self,
        config: &serde_json::Value,
    ) -> anyhow::Result<Arc<dyn MiddlewareInstance>> {
        let cfg: AuthConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("auth config: {e}"))?;
        Ok(Arc::new(AuthInstance {
            validator: Arc::clone(&self.validator),
            cfg,
        }))
    }
}

struct AuthInstance {
    validator: Arc<dyn CredentialValidator>,
    cfg: AuthConfig,
}

impl AuthInstance {
    fn is_public(&self, path: &str) -> bool {
        self.cfg.public_paths.iter().any(|p| {
            match p.strip_suffix('*') {
                Some(prefix) => path.starts_with(prefix),
                None => path == p,
            }
        })
    }

    fn scheme_enabled(&self, scheme: &str) -> bool {
        self.cfg.schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme))
    }
}

impl MiddlewareInstance for AuthInstance {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn on_request(&self, ctx: &mut RequestContext, req: &mut Request) -> Flow {
        if self.is_public(req.path()) {
            return Flow::Continue;
        }

        let header = match req.headers.get("authorization") {
            Some(h) => h,
            None => return Flow::Fail(GatewayError::Unauthenticated("missing credentials".into())),
        };

        let credentials = match extract_credentials(header) {
            Some((scheme, creds)) if self.scheme_enabled(scheme) => creds,
            Some((scheme, _)) => {
                return Flow::Fail(GatewayError::Unauthenticated(format!(
                    "scheme {scheme} not accepted"
                )))
            }
            None => {
                return Flow::Fail(GatewayError::Unauthenticated(
                    "unsupported authorization scheme".into(),
                ))
            }
        };

        let principal = match self.validator.validate(&credentials) {
            Some(p) => p,
            None => return Flow::Fail(GatewayError::Unauthenticated("invalid credentials".into())),
        };

        if !self.cfg.required_roles.is_empty()
            && !self
                .cfg
                .required_roles
                .iter()
                .any(|r| principal.roles.contains(r))
        {
            return Flow::Fail(GatewayError::Forbidden(format!(
                "principal {} lacks required role",
                principal.id
            )));
        }

        ctx.principal = Some(principal);
        Flow::Continue
    }
}

/// Split an `authorization` header into its scheme and credentials.
fn extract_credentials(header: &str) -> Option<(&'static str, Credentials)> {
    if let Some(encoded) = strip_scheme(header, "Basic") {
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (username, password) = text.split_once(':')?;
        return Some((
            "basic",
            Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            },
        ));
    }
    if let Some(token) = strip_scheme(header, "Bearer") {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        return Some((
            "bearer",
            Credentials::Bearer {
                token: token.to_string(),
            },
        ));
    }
    None
}

fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let (head, rest) = header.split_once(' ')?;
    if head.eq_ignore_ascii_case(scheme) {
        Some(rest)
    } else {
        None
    }
}
