//! Request authentication policies.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::http::message::RequestView;

/// Which event is being authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Request,
    Connect,
    Upgrade,
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPhase::Request => f.write_str("request"),
            AuthPhase::Connect => f.write_str("connect"),
            AuthPhase::Upgrade => f.write_str("upgrade"),
        }
    }
}

/// Decides whether a client may use the proxy. Runs before any context exists.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, request: &RequestView, phase: AuthPhase) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _request: &RequestView, _phase: AuthPhase) -> bool {
        true
    }
}

/// Accepts `Proxy-Authorization: Basic base64(user:pass)` for one account.
pub struct BasicCredentials {
    username: String,
    password: String,
}

impl BasicCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn matches(&self, header: &str) -> bool {
        let Some((scheme, encoded)) = header.trim().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Authenticator for BasicCredentials {
    fn authenticate(&self, request: &RequestView, phase: AuthPhase) -> bool {
        let allowed = request
            .headers()
            .get("proxy-authorization")
            .is_some_and(|header| self.matches(header));
        if !allowed {
            tracing::debug!(%phase, user = %self.username, "Proxy credentials rejected");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::HeaderList;
    use hyper::{Method, Version};

    fn request(authorization: Option<&str>) -> RequestView {
        let mut headers = HeaderList::new();
        headers.append("Host", "example.test");
        if let Some(value) = authorization {
            headers.append("Proxy-Authorization", value);
        }
        RequestView::new(Method::GET, "http://example.test/", Version::HTTP_11, headers)
    }

    #[test]
    fn basic_credentials() {
        let auth = BasicCredentials::new("user", "p:ss");
        let good = format!("Basic {}", STANDARD.encode("user:p:ss"));
        assert!(auth.authenticate(&request(Some(&good)), AuthPhase::Request));
        assert!(auth.authenticate(&request(Some(&good.replace("Basic", "basic"))), AuthPhase::Upgrade));

        let wrong = format!("Basic {}", STANDARD.encode("user:nope"));
        assert!(!auth.authenticate(&request(Some(&wrong)), AuthPhase::Connect));
        assert!(!auth.authenticate(&request(Some("Bearer abc")), AuthPhase::Request));
        assert!(!auth.authenticate(&request(Some("Basic !!!")), AuthPhase::Request));
        assert!(!auth.authenticate(&request(None), AuthPhase::Request));
    }

    #[test]
    fn allow_all_allows() {
        assert!(AllowAll.authenticate(&request(None), AuthPhase::Connect));
    }
}
