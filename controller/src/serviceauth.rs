//! # Service-auth token keyset
//!
//! Validates (and, for tests/tooling, mints) the HS256 JWTs that the
//! `x-tunnel-auth` header carries. The keyset is a directory of named key
//! files loaded once at startup; `kid` in the token header selects which
//! key verifies a given token, so keys can be rotated without invalidating
//! tokens signed under the previous one.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::ServiceAuthConfig;
use crate::error::Error;

/// Claims carried by a service-auth token (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceClaims {
    pub t: String,
    pub a: String,
    pub n: String,
    pub y: String,
    pub exp: u64,
}

impl ServiceClaims {
    pub fn new(agent: impl Into<String>, name: impl Into<String>, endpoint_type: impl Into<String>, exp: u64) -> Self {
        Self {
            t: "svc".into(),
            a: agent.into(),
            n: name.into(),
            y: endpoint_type.into(),
            exp,
        }
    }
}

struct Key {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// A loaded set of named HMAC keys plus which one is current for signing.
pub struct KeySet {
    keys: HashMap<String, Key>,
    current_key_name: String,
}

impl KeySet {
    /// Loads every file in `dir` as a raw key secret, named after the file.
    pub fn load(cfg: &ServiceAuthConfig) -> Result<Self, Error> {
        let mut keys = HashMap::new();
        let entries = fs::read_dir(&cfg.secrets_path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", cfg.secrets_path.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::Config(e.to_string()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::Config(format!("non-utf8 key filename: {}", path.display())))?
                .to_string();
            let secret = fs::read(&path).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
            keys.insert(
                name,
                Key {
                    encoding: EncodingKey::from_secret(&secret),
                    decoding: DecodingKey::from_secret(&secret),
                },
            );
        }
        if !keys.contains_key(&cfg.current_key_name) {
            return Err(Error::Config(format!(
                "current key '{}' not found under {}",
                cfg.current_key_name,
                cfg.secrets_path.display()
            )));
        }
        Ok(Self {
            keys,
            current_key_name: cfg.current_key_name.clone(),
        })
    }

    /// Signs `claims` under the configured current key, stamping `kid`.
    pub fn sign(&self, claims: &ServiceClaims) -> Result<String, Error> {
        let key = self
            .keys
            .get(&self.current_key_name)
            .expect("current key validated at load time");
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.current_key_name.clone());
        encode(&header, claims, &key.encoding).map_err(|e| Error::Unauthenticated(e.to_string()))
    }

    /// Verifies a token, selecting the key named by its `kid` header.
    pub fn verify(&self, token: &str) -> Result<ServiceClaims, Error> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::Unauthenticated(format!("bad token header: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::Unauthenticated("token header has no kid".into()))?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| Error::Unauthenticated(format!("unknown key id '{kid}'")))?;
        let validation = Validation::new(Algorithm::HS256);
        decode::<ServiceClaims>(token, &key.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Unauthenticated(format!("token verification failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn keyset_with_one_key(dir: &Path, key_name: &str) -> KeySet {
        let key_path = dir.join(key_name);
        let mut f = fs::File::create(&key_path).unwrap();
        f.write_all(b"test-secret-at-least-this-long").unwrap();
        KeySet::load(&ServiceAuthConfig {
            current_key_name: key_name.into(),
            header_mutation_key_name: key_name.into(),
            secrets_path: dir.to_path_buf(),
        })
        .unwrap()
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let dir = tempfile_dir();
        let keyset = keyset_with_one_key(dir.path(), "k1");
        let claims = ServiceClaims::new("a1", "prod", "kubernetes", u64::MAX);
        let token = keyset.sign(&claims).unwrap();
        let verified = keyset.verify(&token).unwrap();
        assert_eq!(verified.a, "a1");
        assert_eq!(verified.n, "prod");
    }

    #[test]
    fn verify_rejects_unknown_kid() {
        let dir = tempfile_dir();
        let keyset = keyset_with_one_key(dir.path(), "k1");
        let claims = ServiceClaims::new("a1", "prod", "kubernetes", u64::MAX);
        let mut token = keyset.sign(&claims).unwrap();
        token.push('x'); // corrupt the signature, not the header
        assert!(keyset.verify(&token).is_err());
    }

    #[test]
    fn load_fails_when_current_key_missing() {
        let dir = tempfile_dir();
        let err = KeySet::load(&ServiceAuthConfig {
            current_key_name: "missing".into(),
            header_mutation_key_name: "missing".into(),
            secrets_path: dir.path().to_path_buf(),
        });
        assert!(err.is_err());
    }

    fn tempfile_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }
}
