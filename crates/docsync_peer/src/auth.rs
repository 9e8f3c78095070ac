//! Authentication support for the peer.
//!
//! Clients authenticate in their `Hello` either with an
//! `Authorization: Basic <base64(user:password)>` header or with a session
//! cookie issued by an earlier basic login.
//!
//! ## Session token format
//!
//! `<hex(payload)>.<hex(signature)>` where the payload is
//! `<expiry unix millis>:<username>` and the signature is HMAC-SHA256 of the
//! payload under the peer's session secret.

use crate::error::{PeerError, PeerResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Parses a basic `Authorization` header value into username and password.
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Finds a cookie by name in a `Cookie` header value.
pub fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Issues and verifies signed session tokens.
#[derive(Clone)]
pub struct SessionIssuer {
    secret: Vec<u8>,
    expiry: Duration,
}

impl SessionIssuer {
    /// Creates an issuer.
    pub fn new(secret: Vec<u8>, expiry: Duration) -> Self {
        Self { secret, expiry }
    }

    /// Issues a session token for a user.
    pub fn issue(&self, username: &str) -> PeerResult<String> {
        let expires = now_millis().saturating_add(self.expiry.as_millis() as u64);
        let payload = format!("{expires}:{username}");
        let signature = self.mac(payload.as_bytes())?.finalize().into_bytes();
        Ok(format!("{}.{}", hex::encode(payload), hex::encode(signature)))
    }

    /// Verifies a token and returns the user it was issued to.
    pub fn verify(&self, token: &str) -> PeerResult<String> {
        let invalid = || PeerError::AuthenticationFailed("invalid session".into());
        let (payload_hex, signature_hex) = token.split_once('.').ok_or_else(invalid)?;
        let payload = hex::decode(payload_hex).map_err(|_| invalid())?;
        let signature = hex::decode(signature_hex).map_err(|_| invalid())?;
        self.mac(&payload)?
            .verify_slice(&signature)
            .map_err(|_| invalid())?;

        let payload = String::from_utf8(payload).map_err(|_| invalid())?;
        let (expires, username) = payload.split_once(':').ok_or_else(invalid)?;
        let expires: u64 = expires.parse().map_err(|_| invalid())?;
        if now_millis() >= expires {
            return Err(PeerError::AuthenticationFailed("session expired".into()));
        }
        Ok(username.to_string())
    }

    fn mac(&self, data: &[u8]) -> PeerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| PeerError::InvalidConfig(e.to_string()))?;
        mac.update(data);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> SessionIssuer {
        SessionIssuer::new(b"test-secret".to_vec(), Duration::from_secs(60))
    }

    #[test]
    fn basic_header_parses() {
        let header = format!("Basic {}", STANDARD.encode("pupshaw:frank"));
        assert_eq!(
            parse_basic_auth(&header),
            Some(("pupshaw".to_string(), "frank".to_string()))
        );
        assert_eq!(parse_basic_auth("Bearer abc"), None);
        assert_eq!(parse_basic_auth("Basic !!!"), None);
    }

    #[test]
    fn cookie_lookup() {
        let header = "theme=dark; SyncGatewaySession=abc.def; other=1";
        assert_eq!(find_cookie(header, "SyncGatewaySession"), Some("abc.def"));
        assert_eq!(find_cookie(header, "missing"), None);
    }

    #[test]
    fn issue_and_verify() {
        let token = issuer().issue("pupshaw").unwrap();
        assert_eq!(issuer().verify(&token).unwrap(), "pupshaw");
    }

    #[test]
    fn reject_tampered_token() {
        let token = issuer().issue("pupshaw").unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged = format!("{}.{}", hex::encode(format!("{}:admin", u64::MAX)), signature);
        assert!(issuer().verify(&forged).is_err());
        assert!(issuer().verify("not-a-token").is_err());
    }

    #[test]
    fn reject_other_secret() {
        let token = issuer().issue("pupshaw").unwrap();
        let other = SessionIssuer::new(b"other".to_vec(), Duration::from_secs(60));
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let issuer = SessionIssuer::new(b"test-secret".to_vec(), Duration::from_secs(0));
        let token = issuer.issue("pupshaw").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            issuer.verify(&token),
            Err(PeerError::AuthenticationFailed(_))
        ));
    }
}
