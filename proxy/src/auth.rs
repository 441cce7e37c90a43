use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::Engine as _;
use subtle::ConstantTimeEq as _;
use types::AuthConfig;

/// Validates HTTP Basic credentials against the configured password.
///
/// Returns the authenticated identity (the username) and whether the
/// request may proceed. Without `auth.required` an unauthenticated request
/// passes through anonymously.
pub(crate) fn check_authorization(
    auth: Option<&AuthConfig>,
    headers: &HeaderMap,
) -> (Option<String>, bool) {
    let required = auth.map(|auth| auth.required).unwrap_or(false);

    let Some(header) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return (None, !required);
    };

    let Some(encoded) = header.strip_prefix("Basic ") else {
        return (None, !required);
    };

    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return (None, !required);
    };

    let decoded = String::from_utf8_lossy(&decoded);

    let Some((username, password)) = decoded.split_once(':') else {
        return (None, !required);
    };

    let expected = auth.map(|auth| auth.password.as_str()).unwrap_or_default();

    if expected.is_empty() || !bool::from(password.as_bytes().ct_eq(expected.as_bytes())) {
        return (None, !required);
    }

    (Some(username.to_owned()), true)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn basic_header(credentials: &str) -> HeaderMap {
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        let mut headers = HeaderMap::new();

        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).expect("header value is valid"),
        );

        headers
    }

    fn auth_config(required: bool) -> AuthConfig {
        AuthConfig {
            required,
            password: "hunter2".to_owned(),
        }
    }

    #[test]
    fn valid_credentials_yield_the_identity() {
        let (identity, allowed) =
            check_authorization(Some(&auth_config(true)), &basic_header("alice:hunter2"));

        assert_eq!(identity.as_deref(), Some("alice"));
        assert!(allowed);
    }

    #[test]
    fn wrong_password_is_rejected_when_required() {
        let (identity, allowed) =
            check_authorization(Some(&auth_config(true)), &basic_header("alice:wrong"));

        assert_eq!(identity, None);
        assert!(!allowed);
    }

    #[test]
    fn missing_header_is_rejected_only_when_required() {
        let headers = HeaderMap::new();

        let (_, allowed) = check_authorization(Some(&auth_config(true)), &headers);
        assert!(!allowed);

        let (_, allowed) = check_authorization(Some(&auth_config(false)), &headers);
        assert!(allowed);

        let (_, allowed) = check_authorization(None, &headers);
        assert!(allowed);
    }

    #[test]
    fn empty_configured_password_never_authenticates() {
        let auth = AuthConfig {
            required: false,
            password: String::new(),
        };

        let (identity, allowed) = check_authorization(Some(&auth), &basic_header("alice:"));

        assert_eq!(identity, None);
        assert!(allowed);
    }
}
