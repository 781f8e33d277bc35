use url::{Host, Url};

/// The origin the kiosk screen is served from. Camera and location access
/// are only granted to secure origins.
#[derive(Debug, Clone)]
pub struct MediaContext {
    origin: Url,
}

impl MediaContext {
    pub fn new(origin: Url) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn is_secure(&self) -> bool {
        if matches!(self.origin.scheme(), "https" | "wss") {
            return true;
        }
        match self.origin.host() {
            Some(Host::Domain(name)) => name == "localhost" || name.ends_with(".localhost"),
            Some(Host::Ipv4(addr)) => addr.is_loopback(),
            Some(Host::Ipv6(addr)) => addr.is_loopback(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::MediaContext;

    fn context(origin: &str) -> MediaContext {
        MediaContext::new(Url::parse(origin).expect("origin should parse"))
    }

    #[test]
    fn https_and_loopback_origins_are_secure() {
        assert!(context("https://kiosk.example.org").is_secure());
        assert!(context("http://localhost:8080").is_secure());
        assert!(context("http://127.0.0.1:8080").is_secure());
        assert!(context("http://[::1]:8080").is_secure());
    }

    #[test]
    fn plain_http_on_a_lan_address_is_not_secure() {
        assert!(!context("http://192.168.0.20:8080").is_secure());
        assert!(!context("http://kiosk.local").is_secure());
    }
}
