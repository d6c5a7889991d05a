use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header;
use soilrepo_contracts::Principal;
use ulid::Ulid;

use crate::{Authenticator, Credentials, sha256};

#[derive(Debug, Clone)]
struct SessionEntry {
    subject: String,
    expires_at: Instant,
}

/// Sessions established by the web login. Tokens are stored by digest only.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn issue(&self, subject: &str) -> String {
        let token = format!("{}{}", Ulid::new(), Ulid::new());
        let entry = SessionEntry {
            subject: subject.to_string(),
            expires_at: Instant::now() + self.ttl,
        };

        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.retain(|_, e| e.expires_at > Instant::now());
        sessions.insert(token_key(&token), entry);
        token
    }

    pub fn revoke(&self, token: &str) -> bool {
        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.remove(&token_key(token)).is_some()
    }

    pub fn lookup(&self, token: &str) -> Option<String> {
        let sessions = match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions
            .get(&token_key(token))
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.subject.clone())
    }
}

fn token_key(token: &str) -> String {
    hex::encode(sha256(token.as_bytes()))
}

pub struct SessionAuthenticator {
    cookie_name: String,
    registry: SessionRegistry,
}

impl SessionAuthenticator {
    pub fn new(cookie_name: impl Into<String>, registry: SessionRegistry) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            registry,
        }
    }
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    fn mechanism(&self) -> &'static str {
        "session"
    }

    async fn authenticate(&self, creds: &Credentials<'_>) -> Option<Principal> {
        let token = session_cookie(creds.headers, &self.cookie_name)?;
        self.registry.lookup(token).map(Principal::session)
    }
}

fn session_cookie<'h>(headers: &'h http::HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}
