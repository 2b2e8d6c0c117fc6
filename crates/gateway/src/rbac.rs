//! Role extraction and checks over the trusted front-door header.

use axum::http::HeaderMap;
use sentinel_types::rbac::{Role, RoleSet, ROLES_HEADER};

use crate::AppError;

/// Parses the role header. Absent header means unauthenticated.
pub fn roles_from_headers(headers: &HeaderMap) -> Result<RoleSet, AppError> {
    let value = headers
        .get(ROLES_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    Ok(RoleSet::from_header(value))
}

/// Requires one specific role.
pub fn require(roles: &RoleSet, role: Role) -> Result<(), AppError> {
    if roles.contains(&role) {
        Ok(())
    } else {
        Err(AppError::Forbidden(role.to_string()))
    }
}

/// Requires any of the listed roles.
pub fn require_any(roles: &RoleSet, any_of: &[Role]) -> Result<(), AppError> {
    if any_of.iter().any(|r| roles.contains(r)) {
        Ok(())
    } else {
        let wanted = any_of
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("|");
        Err(AppError::Forbidden(wanted))
    }
}

/// The acting identity recorded in history rows and audit payloads.
pub fn actor_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-sentinel-actor")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}
