//! Default denylists and name-matching rules.

/// Headers redacted by default. Matched case-insensitively, exact.
pub const DEFAULT_HEADER_DENYLIST: &[&str] = &[
    "cookie",
    "set-cookie",
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "x-auth-token",
    "x-csrf-token",
    "x-xsrf-token",
];

/// JSON body field names redacted by default. Matched case-insensitively,
/// substring: `user_password` and `passwordHash` both hit `password`.
pub const DEFAULT_BODY_FIELD_DENYLIST: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "api_key",
    "accesstoken",
    "access_token",
    "refreshtoken",
    "refresh_token",
    "private_key",
    "privatekey",
    "client_secret",
    "clientsecret",
    "credential",
    "credentials",
    "auth",
    "ssn",
    "social_security",
    "credit_card",
    "creditcard",
    "card_number",
    "cardnumber",
    "cvv",
    "pin",
];

pub(crate) fn header_matches(actual: &str, pattern: &str) -> bool {
    actual.eq_ignore_ascii_case(pattern)
}

pub(crate) fn body_field_matches(actual: &str, pattern: &str) -> bool {
    let actual = actual.to_lowercase();
    let pattern = pattern.to_lowercase();
    actual == pattern || actual.contains(&pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_match_is_case_insensitive_exact() {
        assert!(header_matches("Set-Cookie", "set-cookie"));
        assert!(header_matches("AUTHORIZATION", "authorization"));
        assert!(!header_matches("x-authorization-hint", "authorization"));
    }

    #[test]
    fn body_field_match_is_substring() {
        assert!(body_field_matches("password", "password"));
        assert!(body_field_matches("user_password", "password"));
        assert!(body_field_matches("passwordHash", "password"));
        assert!(!body_field_matches("username", "password"));
    }
}
