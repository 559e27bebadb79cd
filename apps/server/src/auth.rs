//! Staff authentication.
//!
//! Static bearer tokens from the `STAFF_TOKENS` env var, formatted as
//! comma-separated `token:email:role` entries. Roles are `admin` and
//! `receptionist`; tokens are opaque and never logged.

use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use std::collections::HashMap;

use crate::models::ApiResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffRole {
    Admin,
    Receptionist,
}

impl StaffRole {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(StaffRole::Admin),
            "receptionist" => Some(StaffRole::Receptionist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StaffUser {
    pub email: String,
    pub role: StaffRole,
}

impl StaffUser {
    /// Actor string used in audit entries.
    pub fn actor(&self) -> String {
        format!("Staff: {}", self.email)
    }
}

#[derive(Debug, Default)]
pub struct StaffDirectory {
    by_token: HashMap<String, StaffUser>,
}

impl StaffDirectory {
    /// Parse `token:email:role` entries. Malformed entries are skipped
    /// with a warning rather than failing startup.
    pub fn from_env(raw: &str) -> Self {
        let mut by_token = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let (Some(token), Some(email), Some(role)) =
                (parts.next(), parts.next(), parts.next())
            else {
                tracing::warn!("Skipping malformed STAFF_TOKENS entry");
                continue;
            };
            let Some(role) = StaffRole::parse(role) else {
                tracing::warn!("Skipping STAFF_TOKENS entry with unknown role: {}", role);
                continue;
            };
            by_token.insert(
                token.to_string(),
                StaffUser {
                    email: email.to_string(),
                    role,
                },
            );
        }
        tracing::info!("Loaded {} staff token(s)", by_token.len());
        Self { by_token }
    }

    pub fn resolve(&self, token: &str) -> Option<&StaffUser> {
        self.by_token.get(token)
    }
}

type AuthError = (StatusCode, Json<ApiResponse<()>>);

fn unauthorized() -> AuthError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse::error("Unauthorized")),
    )
}

fn forbidden() -> AuthError {
    (
        StatusCode::FORBIDDEN,
        Json(ApiResponse::error("Admin access required")),
    )
}

/// Resolve the `Authorization: Bearer <token>` header to a staff user.
pub fn extract_staff(directory: &StaffDirectory, headers: &HeaderMap) -> Result<StaffUser, AuthError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(unauthorized)?;
    directory.resolve(token).cloned().ok_or_else(unauthorized)
}

/// Like [`extract_staff`] but rejects everything below admin.
pub fn require_admin(directory: &StaffDirectory, headers: &HeaderMap) -> Result<StaffUser, AuthError> {
    let user = extract_staff(directory, headers)?;
    if user.role != StaffRole::Admin {
        return Err(forbidden());
    }
    Ok(user)
}

// ── Tests ──
