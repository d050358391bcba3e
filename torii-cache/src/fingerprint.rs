use sha2::{Digest, Sha256};
use torii_http::Method;

/// Cache key: the first 16 bytes of a SHA-256 over the canonical request
/// identity. Wide enough that collisions are not a practical concern.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Compute the fingerprint for a request identity plus the `(vary-name,
/// vary-value)` pairs taken from the originating request.
///
/// Canonicalisation: scheme and host lower-cased, path case preserved,
/// query parameters sorted lexicographically. Fields are length-prefixed
/// into the hash so adjacent fields cannot alias.
pub fn fingerprint(
    method: Method,
    scheme: &str,
    host: &str,
    path: &str,
    query: Option<&str>,
    vary: &[(String, String)],
) -> Fingerprint {
    let mut hasher = Sha256::new();
    feed(&mut hasher, method.as_str().as_bytes());
    feed(&mut hasher, scheme.to_ascii_lowercase().as_bytes());
    feed(&mut hasher, host.to_ascii_lowercase().as_bytes());
    feed(&mut hasher, path.as_bytes());
    feed(&mut hasher, canonical_query(query).as_bytes());
    for (name, value) in vary {
        feed(&mut hasher, name.to_ascii_lowercase().as_bytes());
        feed(&mut hasher, value.as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    Fingerprint(out)
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Sort query parameters lexicographically so equivalent URLs share a key.
fn canonical_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    if query.is_empty() {
        return String::new();
    }
    let mut params: Vec<&str> = query.split('&').collect();
    params.sort_unstable();
    params.join("&")
}
