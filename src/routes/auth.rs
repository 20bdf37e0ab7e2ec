use crate::state::AppState;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct RegistrationRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
    pub attributes: Option<Value>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub id: Uuid,
    pub email: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
    iat: usize,
}

#[derive(sqlx::FromRow)]
struct CredentialsRow {
    id: Uuid,
    password_hash: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegistrationRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if payload.email.trim().is_empty() || !payload.email.contains('@') {
        return Err((StatusCode::BAD_REQUEST, "invalid email".to_string()));
    }
    if payload.password.len() < 8 {
        return Err((
            StatusCode::BAD_REQUEST,
            "password must be at least 8 characters".to_string(),
        ));
    }

    let salt = SaltString::generate(&mut OsRng);
    let argon = Argon2::default();

    let password_hash = argon
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|e| {
            tracing::error!("password hash error: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "could not create user".to_string(),
            )
        })?
        .to_string();
    let user_id = Uuid::new_v4();

    let res = sqlx::query(
        r#"
        INSERT INTO users (id, email, password_hash, name, attributes)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(user_id)
    .bind(&payload.email)
    .bind(&password_hash)
    .bind(&payload.name)
    .bind(payload.attributes.unwrap_or_else(|| Value::Object(Default::default())))
    .execute(&state.db)
    .await;

    match res {
        Ok(_) => Ok((
            StatusCode::CREATED,
            Json(RegisterResponse {
                id: user_id,
                email: payload.email,
            }),
        )),
        Err(e) => {
            if let Some(db_error) = e.as_database_error() {
                if db_error.code() == Some(std::borrow::Cow::Borrowed("23505")) {
                    return Err((
                        StatusCode::CONFLICT,
                        "User with this email already exists".to_string(),
                    ));
                }
            }
            tracing::error!("DB insert error: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "could not create user".to_string(),
            ))
        }
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let row: Option<CredentialsRow> = sqlx::query_as(
        r#"
        SELECT id, password_hash FROM users WHERE email = $1
        "#,
    )
    .bind(&payload.email)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("DB error: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, "db error".to_string())
    })?;

    let row = match row {
        Some(r) => r,
        None => {
            return Err((
                StatusCode::UNAUTHORIZED,
                "Invalid credentials".to_string(),
            ))
        }
    };

    let parsed_hash = PasswordHash::new(&row.password_hash).map_err(|e| {
        tracing::error!("stored password hash is malformed: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "auth error".to_string(),
        )
    })?;
    let argon = Argon2::default();
    let verified = argon
        .verify_password(payload.password.as_bytes(), &parsed_hash)
        .is_ok();

    if !verified {
        return Err((
            StatusCode::UNAUTHORIZED,
            "Invalid credentials".to_string(),
        ));
    }

    let secret = env::var("JWT_SECRET").map_err(|_| {
        tracing::error!("JWT_SECRET not set");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "token error".to_string(),
        )
    })?;
    let now = Utc::now();
    let exp = now + Duration::hours(24);
    let claims = Claims {
        sub: row.id.to_string(),
        exp: exp.timestamp() as usize,
        iat: now.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!("jwt encode error: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "token error".to_string(),
        )
    })?;

    Ok(Json(LoginResponse { token }))
}
