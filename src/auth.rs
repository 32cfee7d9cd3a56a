//! Request admission.
//!
//! Two ways in: a session cookie that maps to an owner, or the shared API
//! key (header, bearer, or query param) paired with the configured owner.
//! Downstream code only ever sees an owner id; cross-owner misses read as
//! 404 everywhere else, so admission is the single 401 surface.

use axum::http::HeaderMap;

use crate::config::Config;
use crate::db::Store;

pub const API_KEY_HEADER: &str = "x-mission-control-key";

/// Resolve the owner for a request, or `None` when nothing admits it.
pub fn admit(
    store: &Store,
    config: &Config,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Option<String> {
    if let Some(token) = session_cookie(headers) {
        match store.owner_for_session(&token) {
            Ok(Some(owner)) => return Some(owner),
            Ok(None) => {}
            Err(e) => tracing::warn!("session lookup failed: {e}"),
        }
    }

    let presented = presented_api_key(headers, query)?;
    let expected = config.api_key.as_deref()?;
    let owner = config.api_owner.as_deref()?;
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return Some(owner.to_string());
    }
    None
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get("cookie")?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "session" && !value.is_empty()).then(|| value.to_string())
    })
}

fn presented_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(bearer) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer "))
        {
            if !bearer.trim().is_empty() {
                return Some(bearer.trim().to_string());
            }
        }
    }

    query?.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == "key" && !value.is_empty()).then(|| value.to_string())
    })
}

/// Length-leaking comparisons are fine; content-leaking ones are not.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config() -> Config {
        Config::for_tests()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn session_cookie_admits_owner() {
        let store = Store::open_in_memory().unwrap();
        store.create_session("tok-1", "owner-42").unwrap();

        let h = headers(&[("cookie", "theme=dark; session=tok-1")]);
        assert_eq!(
            admit(&store, &config(), &h, None).as_deref(),
            Some("owner-42")
        );
    }

    #[test]
    fn unknown_session_falls_through_to_api_key() {
        let store = Store::open_in_memory().unwrap();
        let h = headers(&[
            ("cookie", "session=ghost"),
            ("x-mission-control-key", "test-key"),
        ]);
        assert_eq!(
            admit(&store, &config(), &h, None).as_deref(),
            Some("owner-1")
        );
    }

    #[test]
    fn api_key_variants_admit_configured_owner() {
        let store = Store::open_in_memory().unwrap();
        let cfg = config();

        let h = headers(&[("x-mission-control-key", "test-key")]);
        assert_eq!(admit(&store, &cfg, &h, None).as_deref(), Some("owner-1"));

        let h = headers(&[("authorization", "Bearer test-key")]);
        assert_eq!(admit(&store, &cfg, &h, None).as_deref(), Some("owner-1"));

        let h = headers(&[]);
        assert_eq!(
            admit(&store, &cfg, &h, Some("foo=1&key=test-key")).as_deref(),
            Some("owner-1")
        );
    }

    #[test]
    fn wrong_or_missing_key_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let cfg = config();

        let h = headers(&[("x-mission-control-key", "wrong")]);
        assert_eq!(admit(&store, &cfg, &h, None), None);

        let h = headers(&[]);
        assert_eq!(admit(&store, &cfg, &h, None), None);
    }

    #[test]
    fn api_key_mode_requires_configuration() {
        let store = Store::open_in_memory().unwrap();
        let mut cfg = config();
        cfg.api_key = None;

        let h = headers(&[("x-mission-control-key", "test-key")]);
        assert_eq!(admit(&store, &cfg, &h, None), None);
    }
}
