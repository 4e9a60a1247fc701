use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub role: Option<String>,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role
            .as_deref()
            .map_or(false, |r| r.eq_ignore_ascii_case(ADMIN_ROLE))
    }
}

/// Secret material for bearer token verification.
#[derive(Clone)]
pub struct AuthKeys {
    decoding: Arc<DecodingKey>,
}

impl AuthKeys {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            decoding: Arc::new(DecodingKey::from_secret(jwt_secret.as_bytes())),
        }
    }

    pub fn verify(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        decode::<Claims>(token, &self.decoding, &validation)
            .ok()
            .map(|data| data.claims)
    }
}

fn reject(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

pub async fn require_bearer_auth(
    State(keys): State<AuthKeys>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(auth_header) = req.headers().get(axum::http::header::AUTHORIZATION) else {
        return reject(StatusCode::UNAUTHORIZED, "missing_authorization");
    };
    let Ok(auth_str) = auth_header.to_str() else {
        return reject(StatusCode::UNAUTHORIZED, "bad_authorization");
    };
    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        return reject(StatusCode::UNAUTHORIZED, "unsupported_scheme");
    };

    match keys.verify(token.trim()) {
        Some(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        None => reject(StatusCode::UNAUTHORIZED, "invalid_token"),
    }
}

/// Layered inside [`require_bearer_auth`]; relies on the claims it inserted.
pub async fn require_admin(req: Request, next: Next) -> Response {
    match req.extensions().get::<Claims>() {
        Some(claims) if claims.is_admin() => next.run(req).await,
        Some(_) => reject(StatusCode::FORBIDDEN, "forbidden"),
        None => reject(StatusCode::UNAUTHORIZED, "missing_authorization"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, role: Option<&str>, exp: usize) -> String {
        let claims = Claims {
            sub: "ops".into(),
            exp,
            role: role.map(str::to_string),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> usize {
        (chrono::Utc::now().timestamp() + 3600) as usize
    }

    #[test]
    fn verifies_signature_and_expiry() {
        let keys = AuthKeys::new("s3cret");
        let claims = keys.verify(&token("s3cret", Some("Admin"), far_future())).unwrap();
        assert!(claims.is_admin());

        assert!(keys.verify(&token("other", None, far_future())).is_none());
        assert!(keys.verify(&token("s3cret", None, 1_000)).is_none());
        assert!(keys.verify("garbage").is_none());
    }
}
