//! Deterministic naming for gateway records.
//!
//! A gateway API is identified by `{host}~{namespace}~{hash}` where the hash
//! is Adler-32 of the normalized ingress path rendered as decimal. The name
//! is a pure function of `(host, namespace, path)` so replays and restarts
//! converge on the same records.

/// Adler-32 modulus (RFC 1950)
const ADLER_MOD: u32 = 65521;

/// Normalize an ingress path for hashing: the empty path and `/` are the
/// same route on the gateway and must land in the same hash bucket.
pub fn normalize_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// Adler-32 checksum of the input, rendered as decimal.
pub fn adler32_hash(input: &str) -> String {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for byte in input.as_bytes() {
        a = (a + u32::from(*byte)) % ADLER_MOD;
        b = (b + a) % ADLER_MOD;
    }
    ((b << 16) | a).to_string()
}

/// Gateway API name for one `(host, namespace, path)` route.
pub fn api_name(host: &str, namespace: &str, path: &str) -> String {
    format!(
        "{}~{}~{}",
        host,
        namespace,
        adler32_hash(normalize_path(path))
    )
}

/// Upstream URL for a service backend. Port 443 selects `https`, everything
/// else `http`.
pub fn upstream_url(cluster_dns: &str, namespace: &str, service: &str, port: i32) -> String {
    let proto = if port == 443 { "https" } else { "http" };
    format!("{proto}://{service}.{namespace}.{cluster_dns}:{port}")
}
