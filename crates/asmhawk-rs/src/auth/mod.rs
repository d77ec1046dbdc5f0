use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{api::AppError, AppState};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Analyst,
    Viewer,
}

/// Claims carried by access tokens. Tokens are issued elsewhere; this
/// service only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub role: Role,
    pub exp: i64,
}

/// HS256 verification keys derived from the configured secret.
pub struct JwtKeys {
    decoding: DecodingKey,
    validation: Validation,
    #[cfg(test)]
    encoding: jsonwebtoken::EncodingKey,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            #[cfg(test)]
            encoding: jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding, &self.validation).map(|data| data.claims)
    }

    #[cfg(test)]
    pub fn issue(&self, role: Role, ttl: chrono::Duration) -> String {
        let claims = Claims {
            sub: Uuid::new_v4(),
            email: Some("tester@example.com".to_string()),
            role,
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &claims,
            &self.encoding,
        )
        .unwrap()
    }
}

/// Authenticated caller, inserted into request extensions by
/// [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: Uuid,
    pub email: Option<String>,
    pub role: Role,
}

impl CurrentUser {
    /// Name recorded in the audit log.
    pub fn actor(&self) -> String {
        match &self.email {
            Some(email) => email.clone(),
            None => self.id.to_string(),
        }
    }

    pub fn require(&self, allowed: &[Role]) -> Result<(), AppError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::forbidden("insufficient role for this operation"))
        }
    }
}

impl From<Claims> for CurrentUser {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email,
            role: claims.role,
        }
    }
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer(&req) else {
        return AppError::unauthorized("missing bearer token").into_response();
    };
    match state.jwt.verify(&token) {
        Ok(claims) => {
            req.extensions_mut().insert(CurrentUser::from(claims));
            next.run(req).await
        }
        Err(e) => {
            debug!(error = %e, "rejected access token");
            AppError::unauthorized("invalid or expired token").into_response()
        }
    }
}

fn bearer(req: &Request) -> Option<String> {
    let value = req.headers().get("Authorization")?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(ToString::to_string)
}
