//! Public address lookup used to print reachable URLs

use crate::config::NetworkSettings;
use async_trait::async_trait;
use tracing::{debug, warn};

#[async_trait]
pub trait PublicHostResolver: Send + Sync {
    /// Best-effort public host; never fails
    async fn resolve(&self) -> String;
}

/// Plain-text "what is my IP" endpoint with a literal fallback
pub struct HttpResolver {
    client: Option<reqwest::Client>,
    url: String,
    fallback: String,
}

impl HttpResolver {
    pub fn new(settings: &NetworkSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.ip_lookup_timeout())
            .build()
            .map_err(|e| warn!(error = %e, "Failed to build HTTP client"))
            .ok();

        Self {
            client,
            url: settings.ip_lookup_url.clone(),
            fallback: settings.fallback_host.clone(),
        }
    }

    async fn lookup(&self) -> Option<String> {
        let client = self.client.as_ref()?;
        let response = client.get(&self.url).send().await.ok()?;
        if !response.status().is_success() {
            debug!(status = %response.status(), "Public address lookup failed");
            return None;
        }
        let body = response.text().await.ok()?;
        sanitize_host(&body)
    }
}

#[async_trait]
impl PublicHostResolver for HttpResolver {
    async fn resolve(&self) -> String {
        match self.lookup().await {
            Some(host) => {
                debug!(host = %host, "Resolved public address");
                host
            }
            None => {
                warn!(url = %self.url, fallback = %self.fallback, "Public address lookup failed, using fallback");
                self.fallback.clone()
            }
        }
    }
}

/// Accept a single host token: letters, digits, `.`, `:` and `-`
fn sanitize_host(body: &str) -> Option<String> {
    let host = body.trim();
    let valid = !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-'));
    valid.then(|| host.to_string())
}

/// Resolver returning a fixed host, for hosts without outbound access
pub struct StaticResolver(pub String);

#[async_trait]
impl PublicHostResolver for StaticResolver {
    async fn resolve(&self) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_host() {
        assert_eq!(sanitize_host("203.0.113.7\n"), Some("203.0.113.7".to_string()));
        assert_eq!(sanitize_host("2001:db8::1"), Some("2001:db8::1".to_string()));
        assert_eq!(sanitize_host("   "), None);
        assert_eq!(sanitize_host("<html>error</html>"), None);
        assert_eq!(sanitize_host("1.2.3.4; rm -rf /"), None);
    }

    #[tokio::test]
    async fn test_falls_back_when_unreachable() {
        let settings = NetworkSettings {
            ip_lookup_url: "http://127.0.0.1:9/".to_string(),
            ip_lookup_timeout_secs: 1,
            fallback_host: "YOUR_SERVER_IP".to_string(),
        };
        let resolver = HttpResolver::new(&settings);
        assert_eq!(resolver.resolve().await, "YOUR_SERVER_IP");
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver("router.example.com".to_string());
        assert_eq!(resolver.resolve().await, "router.example.com");
    }
}
