//! Token + IP policy gate for WebSocket upgrades.
//!
//! Runs once per upgrade request, before the handshake response is written.
//! The decision order is blacklist, then whitelist, then token — matching
//! the HTTP connection filter's own blacklist-before-whitelist convention.

use crate::{errors::ErrorKind, limits::IpPattern};
use std::net::IpAddr;

/// Why an upgrade attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Client IP matched a blacklist entry.
    IpBlocked,
    /// Client IP failed to match any whitelist entry.
    IpNotAllowed,
    /// Token auth is enabled but the token query parameter was missing or empty.
    NoToken,
    /// The validator callback rejected the supplied token.
    InvalidToken,
    /// Token auth is enabled but no validator was configured.
    InternalError,
}

impl Rejection {
    /// Maps this rejection to the HTTP status the connection layer sends
    /// instead of completing the upgrade: IP-level rejections are `403`,
    /// token-level ones `401`.
    pub(crate) fn as_error_kind(self) -> ErrorKind {
        match self {
            Rejection::IpBlocked | Rejection::IpNotAllowed => ErrorKind::Forbidden,
            Rejection::NoToken | Rejection::InvalidToken | Rejection::InternalError => {
                ErrorKind::Unauthorized
            }
        }
    }
}

/// A token validator callback: given the token string, returns whether it's
/// accepted.
pub trait TokenValidator {
    fn validate(&self, token: &str) -> bool;
}

impl<F: Fn(&str) -> bool> TokenValidator for F {
    fn validate(&self, token: &str) -> bool {
        self(token)
    }
}

impl TokenValidator for Box<dyn TokenValidator> {
    fn validate(&self, token: &str) -> bool {
        (**self).validate(token)
    }
}

/// Policy governing which clients may open a WebSocket connection.
pub struct WsAuthPolicy<V> {
    pub whitelist: Vec<IpPattern>,
    pub blacklist: Vec<IpPattern>,
    pub token_param_name: &'static str,
    /// Gates the token check independently of `validator` being set, so
    /// "token auth on, but nobody configured a validator" is a distinct,
    /// rejectable state instead of silently falling back to "no auth".
    pub enable_token_auth: bool,
    pub validator: Option<V>,
}

impl<V> Default for WsAuthPolicy<V> {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            token_param_name: "token",
            enable_token_auth: false,
            validator: None,
        }
    }
}

impl<V: TokenValidator> WsAuthPolicy<V> {
    /// Evaluates the policy against a client IP and the upgrade request's
    /// query string.
    pub fn evaluate(&self, ip: IpAddr, query_token: Option<&str>) -> Result<(), Rejection> {
        if self.blacklist.iter().any(|p| p.contains(ip)) {
            return Err(Rejection::IpBlocked);
        }

        if !self.whitelist.is_empty() && !self.whitelist.iter().any(|p| p.contains(ip)) {
            return Err(Rejection::IpNotAllowed);
        }

        if !self.enable_token_auth {
            return Ok(());
        }

        match &self.validator {
            Some(validator) => match query_token {
                Some(token) if !token.is_empty() => {
                    if validator.validate(token) {
                        Ok(())
                    } else {
                        Err(Rejection::InvalidToken)
                    }
                }
                _ => Err(Rejection::NoToken),
            },
            None => Err(Rejection::InternalError),
        }
    }
}

impl<V: TokenValidator + 'static> WsAuthPolicy<V> {
    /// Erases `V`, so policies built with different validator types (a
    /// closure here, a custom struct there) can all be stored as the
    /// single `WsAuthPolicy<Box<dyn TokenValidator>>` the server holds.
    pub fn boxed(self) -> WsAuthPolicy<Box<dyn TokenValidator>> {
        WsAuthPolicy {
            whitelist: self.whitelist,
            blacklist: self.blacklist,
            token_param_name: self.token_param_name,
            enable_token_auth: self.enable_token_auth,
            validator: self.validator.map(|v| Box::new(v) as Box<dyn TokenValidator>),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::IpPattern;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn no_policy_allows_everyone() {
        let policy: WsAuthPolicy<fn(&str) -> bool> = WsAuthPolicy::default();
        assert_eq!(policy.evaluate(ip(1, 2, 3, 4), None), Ok(()));
    }

    #[test]
    fn blacklist_beats_everything() {
        let policy: WsAuthPolicy<fn(&str) -> bool> = WsAuthPolicy {
            blacklist: vec![IpPattern::parse("1.2.3.4").unwrap()],
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate(ip(1, 2, 3, 4), Some("whatever")),
            Err(Rejection::IpBlocked)
        );
    }

    #[test]
    fn whitelist_excludes_non_members() {
        let policy: WsAuthPolicy<fn(&str) -> bool> = WsAuthPolicy {
            whitelist: vec![IpPattern::parse("10.0.0.0/8").unwrap()],
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate(ip(192, 168, 1, 1), None),
            Err(Rejection::IpNotAllowed)
        );
        assert_eq!(policy.evaluate(ip(10, 1, 2, 3), None), Ok(()));
    }

    #[test]
    fn missing_token_rejected_when_validator_present() {
        let validator: fn(&str) -> bool = |t| t == "secret";
        let policy = WsAuthPolicy {
            enable_token_auth: true,
            validator: Some(validator),
            ..Default::default()
        };
        assert_eq!(policy.evaluate(ip(1, 1, 1, 1), None), Err(Rejection::NoToken));
        assert_eq!(
            policy.evaluate(ip(1, 1, 1, 1), Some("")),
            Err(Rejection::NoToken)
        );
    }

    #[test]
    fn valid_token_accepted() {
        let validator: fn(&str) -> bool = |t| t == "secret";
        let policy = WsAuthPolicy {
            enable_token_auth: true,
            validator: Some(validator),
            ..Default::default()
        };
        assert_eq!(policy.evaluate(ip(1, 1, 1, 1), Some("secret")), Ok(()));
        assert_eq!(
            policy.evaluate(ip(1, 1, 1, 1), Some("wrong")),
            Err(Rejection::InvalidToken)
        );
    }

    #[test]
    fn token_auth_enabled_without_validator_is_internal_error() {
        let policy: WsAuthPolicy<fn(&str) -> bool> = WsAuthPolicy {
            enable_token_auth: true,
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate(ip(1, 1, 1, 1), Some("anything")),
            Err(Rejection::InternalError)
        );
    }

    #[test]
    fn token_auth_disabled_ignores_validator() {
        let validator: fn(&str) -> bool = |t| t == "secret";
        let policy = WsAuthPolicy {
            validator: Some(validator),
            ..Default::default()
        };
        assert_eq!(policy.evaluate(ip(1, 1, 1, 1), None), Ok(()));
    }
}
