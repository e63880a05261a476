//! Client-side Basic and Digest (RFC 2617) authentication.

use std::collections::HashMap;

use base64::Engine as _;
use log::debug;
use md5::{Digest, Md5};

use super::message::{Headers, Method};
use crate::{Result, RtspError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthMethod {
    /// Basic authentication (username:password)
    Basic,
    /// Digest authentication (RFC 2617)
    Digest {
        realm: String,
        nonce: String,
        opaque: Option<String>,
    },
}

/// Produces `Authorization` headers once the server issued a challenge.
#[derive(Debug, Clone)]
pub struct Authenticator {
    credentials: Credentials,
    method: AuthMethod,
}

impl Authenticator {
    /// Picks a scheme from the `WWW-Authenticate` headers of a 401 response.
    /// Digest is preferred over Basic when both are offered.
    pub fn from_challenge(credentials: Credentials, headers: &Headers) -> Result<Self> {
        let mut basic = false;

        for (name, value) in headers.iter() {
            if !name.eq_ignore_ascii_case("WWW-Authenticate") {
                continue;
            }
            debug!("Auth header: {}", value);

            if let Some(params) = value.strip_prefix("Digest ") {
                let parts = parse_params(params);
                let realm = parts
                    .get("realm")
                    .ok_or_else(|| RtspError::Protocol("No realm in auth challenge".into()))?;
                let nonce = parts
                    .get("nonce")
                    .ok_or_else(|| RtspError::Protocol("No nonce in auth challenge".into()))?;
                debug!("Parsed Digest auth - realm: {}, nonce: {}", realm, nonce);

                return Ok(Self {
                    credentials,
                    method: AuthMethod::Digest {
                        realm: realm.to_string(),
                        nonce: nonce.to_string(),
                        opaque: parts.get("opaque").map(|s| s.to_string()),
                    },
                });
            } else if value.starts_with("Basic") {
                basic = true;
            }
        }

        if basic {
            return Ok(Self {
                credentials,
                method: AuthMethod::Basic,
            });
        }

        Err(RtspError::Protocol("No authentication challenge found".into()))
    }

    /// Value of the `Authorization` header for a request.
    pub fn authorization(&self, method: &Method, uri: &str) -> String {
        let Credentials { username, password } = &self.credentials;
        match &self.method {
            AuthMethod::Basic => {
                let auth = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password).as_bytes());
                format!("Basic {}", auth)
            }
            AuthMethod::Digest {
                realm,
                nonce,
                opaque,
            } => {
                let ha1 = md5_hash(&format!("{}:{}:{}", username, realm, password));
                let ha2 = md5_hash(&format!("{}:{}", method, uri));
                let response = md5_hash(&format!("{}:{}:{}", ha1, nonce, ha2));

                let mut header = format!(
                    r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}""#,
                    username, realm, nonce, uri, response
                );
                if let Some(opaque) = opaque {
                    header.push_str(&format!(r#", opaque="{}""#, opaque));
                }
                header
            }
        }
    }
}

fn parse_params(params: &str) -> HashMap<&str, &str> {
    params
        .split(',')
        .filter_map(|part| {
            let mut parts = part.trim().splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim().trim_matches('"');
            Some((key, value))
        })
        .collect()
}

fn md5_hash(s: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}
