//! Cookie policy shared by the authentication and session cookies
//!
//! Both cookies are `SameSite=None; Secure` with a `Max-Age` equal to the
//! configured idle timeout. Expiration slides because the cookie is re-issued
//! whenever the underlying ticket or session is renewed.

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CookiePolicy {
    pub name: String,
    pub path: String,
    pub http_only: bool,
    pub max_age: Duration,
}

impl CookiePolicy {
    pub fn new(name: impl Into<String>, max_age: Duration) -> Self {
        Self {
            name: name.into(),
            path: "/".to_string(),
            http_only: true,
            max_age,
        }
    }

    /// Value of this cookie in the request's `Cookie` headers
    pub fn read(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| name.trim() == self.name)
            .map(|(_, value)| value.trim().to_string())
    }

    /// `Set-Cookie` value issuing the cookie
    pub fn issue(&self, value: &str) -> String {
        self.render(value, self.max_age.as_secs())
    }

    /// `Set-Cookie` value deleting the cookie
    pub fn expire(&self) -> String {
        self.render("", 0)
    }

    fn render(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!(
            "{}={}; Path={}; Max-Age={}; SameSite=None; Secure",
            self.name, value, self.path, max_age
        );
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        cookie
    }

    /// Append a rendered cookie to response headers
    pub fn append(headers: &mut HeaderMap, cookie: String) {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(e) => tracing::warn!("Dropping unrepresentable cookie: {}", e),
        }
    }
}
