use anyhow::Result;

use crate::errors::UtcpError;

/// HTTP-family providers must talk TLS unless the peer is loopback. This is
/// policy, not configuration: it runs before any network I/O on both the
/// register and call paths.
pub fn enforce_secure_url(url: &str) -> Result<()> {
    let lower = url.trim().to_ascii_lowercase();
    if lower.starts_with("https://") {
        return Ok(());
    }
    if let Some(rest) = lower.strip_prefix("http://") {
        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        let host = authority
            .rsplit_once('@')
            .map(|(_, h)| h)
            .unwrap_or(authority);
        let host = if let Some(h) = host.strip_prefix('[') {
            h.split(']').next().unwrap_or(h)
        } else {
            host.split(':').next().unwrap_or(host)
        };
        if host == "localhost" || host == "127.0.0.1" || host == "::1" {
            return Ok(());
        }
    }
    Err(UtcpError::Security(format!(
        "URL must use HTTPS or point at loopback: '{url}'"
    ))
    .into())
}
