use common::video::Principal;
use hyper::header::{HeaderMap, AUTHORIZATION};
use std::collections::HashMap;

/// Maps bearer tokens to user ids
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    tokens: HashMap<String, String>,
}

impl Authenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = bearer_token(headers)?;
        self.tokens.get(token).map(|user_id| Principal {
            id: user_id.clone(),
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
