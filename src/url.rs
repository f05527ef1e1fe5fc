//! URL parsing for ferry:// remote destinations

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDest {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Parse `ferry://host[:port][/path]`. Returns None for anything else, so
/// callers can fall back to treating the string as a bare remote path.
pub fn parse_remote_url(s: &str) -> Option<RemoteDest> {
    let s = s.trim();
    let rest = s
        .strip_prefix("ferry://")
        .or_else(|| s.strip_prefix("FERRY://"))?;
    let (hp, p) = rest.split_once('/').unwrap_or((rest, ""));
    if hp.is_empty() {
        return None;
    }
    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
        None => (hp.to_string(), DEFAULT_PORT),
    };
    Some(RemoteDest {
        host,
        port,
        path: if p.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", p)
        },
    })
}
