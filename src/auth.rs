use std::sync::{PoisonError, RwLock};

use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::ReelError;
use crate::fetch::{FetchLayer, HttpRequest};

#[derive(Debug, Default)]
pub struct BearerToken {
    token: RwLock<Option<String>>,
}

impl BearerToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|token| !token.trim().is_empty())),
        }
    }

    pub fn set(&self, token: &str) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_set(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn auth_headers(&self) -> Vec<(String, String)> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|token| vec![("Authorization".to_string(), format!("Bearer {token}"))])
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

pub fn password_login(
    fetch: &FetchLayer,
    login_url: &str,
    email: &str,
    password: &str,
    carrier: &BearerToken,
) -> Result<String, ReelError> {
    let request = HttpRequest::post_json(login_url, json!({ "email": email, "password": password }));
    let response = fetch.send_direct(&request).map_err(|err| match err {
        ReelError::Status { status: 401, .. } => {
            ReelError::Auth("wrong email or password".to_string())
        }
        ReelError::Status { status: 429, .. } => {
            ReelError::Auth("too many login attempts, try again later".to_string())
        }
        ReelError::Status { status, .. } if status >= 500 => {
            ReelError::Auth(format!("server error {status}"))
        }
        other => other,
    })?;
    let body: LoginResponse = response
        .json()
        .map_err(|err| ReelError::Auth(err.to_string()))?;
    let token = body
        .token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ReelError::Auth("response carried no token".to_string()))?;
    carrier.set(&token);
    info!("login succeeded");
    Ok(token)
}
