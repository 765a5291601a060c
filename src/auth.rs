//! Per-connection authentication.
//!
//! Credentials are checked through an [`Authenticator`]. A gate is built the
//! first time a connection needs a challenge. HTTP and WebSocket success is
//! remembered for the rest of the connection; binary RPC headers are checked
//! on every packet.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::request::Request;
use crate::rpc::codec::RpcHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Session,
}

/// Credential store lookups.
pub trait Authenticator: Send + Sync + 'static {
    fn verify_password(&self, user: &str, password: &str) -> bool;

    /// The user a session token belongs to, if the session is valid.
    fn verify_session(&self, token: &str) -> Option<String>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no authenticator configured")]
    NoAuthenticator,

    #[error("no {0} provided")]
    MissingCredentials(&'static str),

    #[error("malformed credentials: {0}")]
    Malformed(String),

    #[error("wrong user name or password for {0:?}")]
    InvalidCredentials(String),

    #[error("invalid session")]
    InvalidSession,
}

pub struct AuthGate {
    auth_type: AuthType,
    authenticator: Option<Arc<dyn Authenticator>>,
    user: Option<String>,
}

impl AuthGate {
    pub fn new(auth_type: AuthType, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        Self {
            auth_type,
            authenticator,
            user: None,
        }
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    pub fn is_authorized(&self) -> bool {
        self.auth_type == AuthType::None || self.user.is_some()
    }

    /// The user the connection authenticated as.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn authenticator(&self) -> Result<&Arc<dyn Authenticator>, AuthError> {
        self.authenticator.as_ref().ok_or(AuthError::NoAuthenticator)
    }

    pub fn check_http(&mut self, request: &Request) -> Result<(), AuthError> {
        if self.is_authorized() {
            return Ok(());
        }
        let user = match self.auth_type {
            AuthType::None => return Ok(()),
            AuthType::Basic => {
                let value = request
                    .header("Authorization")
                    .ok_or(AuthError::MissingCredentials("authorization header"))?;
                self.basic(value)?
            }
            AuthType::Session => {
                let token = request
                    .cookie("session")
                    .ok_or(AuthError::MissingCredentials("session cookie"))?;
                self.session(token)?
            }
        };
        self.user = Some(user);
        Ok(())
    }

    /// Binary RPC carries credentials per packet, nothing is remembered.
    pub fn check_binary(&self, header: Option<&RpcHeader>) -> Result<(), AuthError> {
        match self.auth_type {
            AuthType::None => Ok(()),
            AuthType::Basic | AuthType::Session => {
                let value = header
                    .and_then(|h| h.authorization.as_deref())
                    .ok_or(AuthError::MissingCredentials("authorization header"))?;
                self.basic(value).map(|_| ())
            }
        }
    }

    /// Authenticate with the first frame after the upgrade:
    /// `{"user", "password"}` for basic, `{"user", "token"}` for session.
    pub fn check_websocket(&mut self, payload: &[u8]) -> Result<(), AuthError> {
        if self.is_authorized() {
            return Ok(());
        }
        let packet: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let field = |name: &'static str| {
            packet
                .get(name)
                .and_then(serde_json::Value::as_str)
                .ok_or(AuthError::MissingCredentials(name))
        };

        let user = field("user")?;
        match self.auth_type {
            AuthType::None => return Ok(()),
            AuthType::Basic => {
                let password = field("password")?;
                if !self.authenticator()?.verify_password(user, password) {
                    return Err(AuthError::InvalidCredentials(user.to_string()));
                }
            }
            AuthType::Session => {
                let token = field("token")?;
                match self.session(token) {
                    Ok(owner) if owner == user => {}
                    _ => return Err(AuthError::InvalidSession),
                }
            }
        }
        self.user = Some(user.to_string());
        Ok(())
    }

    fn basic(&self, value: &str) -> Result<String, AuthError> {
        let encoded = value
            .trim()
            .strip_prefix("Basic ")
            .ok_or_else(|| AuthError::Malformed("expected basic authorization".into()))?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let decoded = String::from_utf8(decoded).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| AuthError::Malformed("missing ':' in credentials".into()))?;

        if self.authenticator()?.verify_password(user, password) {
            Ok(user.to_string())
        } else {
            Err(AuthError::InvalidCredentials(user.to_string()))
        }
    }

    fn session(&self, token: &str) -> Result<String, AuthError> {
        self.authenticator()?
            .verify_session(token)
            .ok_or(AuthError::InvalidSession)
    }
}
