//! Bearer-token auth for the HTTP surface.
//!
//! Tokens are HS256 JWTs issued by the account system; this service only
//! verifies them. The role claim is mapped to a capability set checked by
//! the handlers, so authorization reads as "can this caller list everything"
//! rather than "is this caller an admin".

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::web::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    /// Role name as issued ("student", "admin", "superadmin").
    pub role: String,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// What a caller may do. Students only see their own rows; admin roles see
/// and mutate everything.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub list_own: bool,
    pub list_all: bool,
    pub mutate_any: bool,
}

impl Capabilities {
    pub fn for_role(role: &str) -> Self {
        match role {
            "admin" | "superadmin" => Self {
                list_own: true,
                list_all: true,
                mutate_any: true,
            },
            _ => Self {
                list_own: true,
                list_all: false,
                mutate_any: false,
            },
        }
    }
}

/// Authenticated caller, extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub capabilities: Capabilities,
}

/// Issue a token. The panel's account system normally does this; the
/// helper exists for operational tooling and tests.
pub fn issue_token(
    secret: &str,
    user_id: i64,
    role: &str,
    expiry_hours: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(expiry_hours)).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

fn auth_user_from_parts(parts: &Parts, secret: &str) -> Option<AuthUser> {
    let header = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    let claims = verify_token(secret, token).ok()?;
    Some(AuthUser {
        user_id: claims.sub,
        capabilities: Capabilities::for_role(&claims.role),
    })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "Authentication required"})),
    )
        .into_response()
}

/// Extractor requiring any authenticated caller.
pub struct RequireAuth(pub AuthUser);

impl FromRequestParts<AppState> for RequireAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        auth_user_from_parts(parts, &state.config.jwt_secret)
            .map(RequireAuth)
            .ok_or_else(unauthorized)
    }
}

/// Extractor requiring an administrative caller.
pub struct RequireAdmin(pub AuthUser);

impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = auth_user_from_parts(parts, &state.config.jwt_secret).ok_or_else(unauthorized)?;
        if !user.capabilities.mutate_any {
            return Err((
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({"error": "Admin access required"})),
            )
                .into_response());
        }
        Ok(RequireAdmin(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        let token = issue_token("secret", 42, "student", 1).unwrap();
        let claims = verify_token("secret", &token).unwrap();
        assert_eq!(claims.sub, 42);
        assert_eq!(claims.role, "student");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_token("secret", 42, "student", 1).unwrap();
        assert!(verify_token("other", &token).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let token = issue_token("secret", 42, "student", -1).unwrap();
        assert!(verify_token("secret", &token).is_err());
    }

    #[test]
    fn students_only_list_their_own() {
        let caps = Capabilities::for_role("student");
        assert!(caps.list_own);
        assert!(!caps.list_all);
        assert!(!caps.mutate_any);
    }

    #[test]
    fn admin_roles_get_full_capabilities() {
        for role in ["admin", "superadmin"] {
            let caps = Capabilities::for_role(role);
            assert!(caps.list_own && caps.list_all && caps.mutate_any);
        }
    }

    #[test]
    fn unknown_roles_degrade_to_student() {
        let caps = Capabilities::for_role("janitor");
        assert!(!caps.list_all && !caps.mutate_any);
    }
}
