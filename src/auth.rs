//! RTSP authentication: Basic and Digest challenge-response.
//!
//! DESCRIBE triggers realm discovery; a non-empty realm activates this
//! sub-protocol. The server challenges with Digest by default (the
//! password never crosses the wire) and falls back to Basic only when
//! configured to. Verification compares against a secret produced by the
//! embedder's credential hook: either a cleartext password or a
//! pre-hashed `HA1 = md5(user:realm:pass)`.
//!
//! Digest formula (RFC 2069 as profiled by RTSP):
//!
//! ```text
//! response = md5( HA1 : nonce : md5("DESCRIBE:" + uri) )
//! ```
//!
//! compared case-insensitively against the client's `response=` value.

use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::events::Credential;

/// Lowercase hex MD5 of a string.
pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Server-computed Digest response for the given parameters.
pub fn digest_response(ha1: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
}

/// `WWW-Authenticate` challenge value.
pub fn challenge(realm: &str, nonce: &str, basic: bool) -> String {
    if basic {
        format!("Basic realm=\"{}\"", realm)
    } else {
        format!("Digest realm=\"{}\",nonce=\"{}\"", realm, nonce)
    }
}

/// An `Authorization:` header split into its scheme and payload.
#[derive(Debug)]
pub enum Authorization {
    /// Decoded (user, password) from `Basic base64(user:pass)`.
    Basic { user: String, password: String },
    /// Digest key=value fields, quotes stripped.
    Digest(HashMap<String, String>),
}

impl Authorization {
    /// Parse the header value. Returns `None` for unknown schemes or
    /// undecodable payloads.
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, rest) = header.trim().split_once(' ')?;
        match scheme {
            "Basic" => {
                use base64::Engine as _;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(rest.trim())
                    .ok()?;
                let text = String::from_utf8(decoded).ok()?;
                let (user, password) = text.split_once(':')?;
                Some(Authorization::Basic {
                    user: user.to_string(),
                    password: password.to_string(),
                })
            }
            "Digest" => {
                let mut fields = HashMap::new();
                for part in rest.split(',') {
                    if let Some((k, v)) = part.split_once('=') {
                        fields.insert(
                            k.trim().to_string(),
                            v.trim().trim_matches('"').to_string(),
                        );
                    }
                }
                Some(Authorization::Digest(fields))
            }
            _ => None,
        }
    }
}

/// Outcome of a verification attempt. `Err` carries the log-facing
/// reason; the caller re-challenges on any failure.
pub type AuthResult = Result<(), String>;

/// Verify a Basic attempt against the credential-hook answer. Basic
/// requires the cleartext password; an HA1 answer cannot satisfy it.
pub fn verify_basic(password: &str, secret: Option<Credential>) -> AuthResult {
    match secret {
        Some(Credential::Plain(good)) if good == password => Ok(()),
        Some(Credential::Plain(_)) => Err("password mismatch on basic auth".to_string()),
        Some(Credential::Ha1(_)) => Err("basic auth needs a cleartext password".to_string()),
        None => Err("no credential for user".to_string()),
    }
}

/// Verify a Digest attempt.
///
/// Checks the echoed realm and nonce, requires non-empty
/// username/uri/response, computes the expected response from the hook's
/// secret and compares case-insensitively.
pub fn verify_digest(
    realm: &str,
    nonce: &str,
    fields: &HashMap<String, String>,
    secret: Option<Credential>,
) -> AuthResult {
    let field = |k: &str| fields.get(k).map(String::as_str).unwrap_or("");

    if field("realm") != realm {
        return Err(format!("realm not matched: {} != {}", realm, field("realm")));
    }
    if field("nonce") != nonce {
        return Err("nonce not matched".to_string());
    }
    let username = field("username");
    let uri = field("uri");
    let response = field("response");
    if username.is_empty() || uri.is_empty() || response.is_empty() {
        return Err("username/uri/response empty".to_string());
    }

    let ha1 = match secret {
        Some(Credential::Ha1(ha1)) => ha1,
        Some(Credential::Plain(password)) => {
            md5_hex(&format!("{}:{}:{}", username, realm, password))
        }
        None => return Err("no credential for user".to_string()),
    };

    let expected = digest_response(&ha1, nonce, "DESCRIBE", uri);
    if expected.eq_ignore_ascii_case(response) {
        Ok(())
    } else {
        Err("password mismatch on digest auth".to_string())
    }
}
