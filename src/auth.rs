use anyhow::anyhow;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{TimeDelta, Utc};
use log::{info, warn};
use password_hash::SaltString;
use rand::Rng;
use rocket::form::Form;
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::response::Redirect;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::db::DbPool;
use crate::util::{PageError, sqlx_to_custom_error};
use crate::{BearerToken, HqSession, HqSessionId, SharedHqState, impl_sqlx_text_type_encode_decode};

pub const HQ_SESSION_ID: &str = "hq_session_id";
const SESSION_TTL_HOURS: i64 = 24;

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Coach,
    Parent,
}
impl_sqlx_text_type_encode_decode!(UserRole);

impl Display for UserRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::Coach => f.write_str("coach"),
            UserRole::Parent => f.write_str("parent"),
        }
    }
}
impl FromStr for UserRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coach" => Ok(UserRole::Coach),
            "parent" => Ok(UserRole::Parent),
            _ => Err(format!("Unknown role: {s}")),
        }
    }
}

#[derive(FromRow, Clone, Debug)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: UserRole,
    pub player_id: Option<i64>,
}

/// Session copy of a user row, without the password hash.
#[derive(Serialize, Clone, Debug)]
pub struct SessionUser {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: UserRole,
    pub player_id: Option<i64>,
}
impl From<UserRecord> for SessionUser {
    fn from(rec: UserRecord) -> Self {
        Self {
            id: rec.id,
            name: rec.name,
            email: rec.email,
            role: rec.role,
            player_id: rec.player_id,
        }
    }
}

pub fn generate_random_string(len: usize) -> String {
    const WOWELS: &str = "aeiouy";
    const CONSONANTS: &str = "bcdfghjklmnopqrstvwxz";
    let mut rng = rand::rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS } else { WOWELS };
            let idx = rng.random_range(0..charset.len());
            charset.chars().nth(idx).unwrap()
        })
        .collect()
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash error: {e}"))?;
    Ok(hash.to_string())
}
fn verify_password(password: &str, password_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::try_from(password_hash) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

async fn find_user(email: &str, db: &State<DbPool>) -> Result<Option<UserRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM users WHERE email=?")
        .bind(email)
        .fetch_optional(&db.0)
        .await
}

async fn open_session(user: SessionUser, state: &State<SharedHqState>) -> String {
    let session_id = generate_random_string(32);
    let session = HqSession {
        user,
        expires: Utc::now() + TimeDelta::hours(SESSION_TTL_HOURS),
        drafts: Default::default(),
    };
    state
        .write()
        .await
        .sessions
        .insert(HqSessionId(session_id.clone()), session);
    session_id
}

/// Looks up a live session, dropping it when expired.
pub(crate) async fn session_user(
    session_id: &HqSessionId,
    state: &State<SharedHqState>,
) -> Option<SessionUser> {
    let mut hq = state.write().await;
    let session = hq.sessions.get(session_id)?;
    if session.expires < Utc::now() {
        hq.sessions.remove(session_id);
        return None;
    }
    Some(session.user.clone())
}

/// Page-route gate. The role always comes from the server-side session, and
/// both failure kinds land on the login page with a reason notice. Returns
/// the session id too for handlers that keep per-session state.
pub(crate) async fn require_session(
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    role: UserRole,
) -> Result<(HqSessionId, SessionUser), PageError> {
    let login = |reason: &str| PageError::Redirect(Redirect::to(format!("/login?reason={reason}")));
    let Some(session_id) = session_id else {
        return Err(login("auth"));
    };
    let Some(user) = session_user(&session_id, state).await else {
        return Err(login("auth"));
    };
    if user.role != role {
        return Err(login("denied"));
    }
    Ok((session_id, user))
}

pub(crate) async fn require_role(
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    role: UserRole,
) -> Result<SessionUser, PageError> {
    Ok(require_session(session_id, state, role).await?.1)
}

/// API-route gate for coach-only endpoints, fed by the bearer token.
pub(crate) async fn api_coach(
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
) -> Result<SessionUser, Custom<String>> {
    let Some(token) = token else {
        return Err(Custom(Status::Unauthorized, "Missing bearer token".to_string()));
    };
    let Some(user) = session_user(&HqSessionId(token.0), state).await else {
        return Err(Custom(Status::Unauthorized, "Invalid or expired token".to_string()));
    };
    if user.role != UserRole::Coach {
        return Err(Custom(Status::Forbidden, "Coach role required".to_string()));
    }
    Ok(user)
}

fn login_notice(reason: Option<&str>) -> Option<&'static str> {
    match reason {
        Some("auth") => Some("Please log in to continue."),
        Some("denied") => Some("Access denied for your role."),
        Some("failed") => Some("Invalid email or password."),
        _ => None,
    }
}

#[get("/login?<reason>")]
fn get_login(reason: Option<&str>) -> Template {
    Template::render("login", context! {
        notice: login_notice(reason),
    })
}

#[derive(Debug, FromForm)]
struct LoginForm<'v> {
    email: &'v str,
    password: &'v str,
}

#[post("/login", data = "<form>")]
async fn post_login(
    form: Form<LoginForm<'_>>,
    cookies: &CookieJar<'_>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Redirect, Custom<String>> {
    let user = find_user(form.email, db).await.map_err(sqlx_to_custom_error)?;
    let Some(user) = user.filter(|u| verify_password(form.password, &u.password_hash)) else {
        warn!("Login failed for {}", form.email);
        return Ok(Redirect::to("/login?reason=failed"));
    };
    let user = SessionUser::from(user);
    info!("User log in, name: {}, email: {}, role: {}", user.name, user.email, user.role);
    let target = match user.role {
        UserRole::Coach => "/dashboard",
        UserRole::Parent => "/dashboard/progress",
    };
    let session_id = open_session(user, state).await;
    cookies.add_private(
        Cookie::build((HQ_SESSION_ID, session_id))
            .same_site(SameSite::Lax)
            .build(),
    );
    Ok(Redirect::to(target))
}

#[get("/logout")]
async fn get_logout(
    session_id: Option<HqSessionId>,
    cookies: &CookieJar<'_>,
    state: &State<SharedHqState>,
) -> Redirect {
    if let Some(session_id) = session_id {
        state.write().await.sessions.remove(&session_id);
    }
    cookies.remove_private(HQ_SESSION_ID);
    Redirect::to("/")
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub role: UserRole,
}
impl TokenResponse {
    fn bearer(access_token: String, role: UserRole) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
            expires_in: SESSION_TTL_HOURS * 3600,
            role,
        }
    }
}

// OAuth2 password grant, form encoded
#[derive(Debug, FromForm)]
struct TokenGrantForm<'v> {
    grant_type: &'v str,
    username: &'v str,
    password: &'v str,
}

#[post("/api/auth/login", data = "<form>")]
async fn api_login(
    form: Form<TokenGrantForm<'_>>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Json<TokenResponse>, Custom<String>> {
    if form.grant_type != "password" {
        return Err(Custom(
            Status::BadRequest,
            format!("Unsupported grant_type: {}", form.grant_type),
        ));
    }
    let user = find_user(form.username, db).await.map_err(sqlx_to_custom_error)?;
    let Some(user) = user.filter(|u| verify_password(form.password, &u.password_hash)) else {
        warn!("Token grant failed for {}", form.username);
        return Err(Custom(Status::Unauthorized, "Invalid credentials".to_string()));
    };
    let user = SessionUser::from(user);
    let role = user.role;
    let token = open_session(user, state).await;
    Ok(Json(TokenResponse::bearer(token, role)))
}

#[post("/api/auth/refresh")]
async fn api_refresh(
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
) -> Result<Json<TokenResponse>, Custom<String>> {
    let Some(token) = token else {
        return Err(Custom(Status::Unauthorized, "Missing bearer token".to_string()));
    };
    let mut hq = state.write().await;
    let Some(mut session) = hq.sessions.remove(&HqSessionId(token.0)) else {
        return Err(Custom(Status::Unauthorized, "Invalid or expired token".to_string()));
    };
    session.expires = Utc::now() + TimeDelta::hours(SESSION_TTL_HOURS);
    let role = session.user.role;
    let new_token = generate_random_string(32);
    hq.sessions.insert(HqSessionId(new_token.clone()), session);
    Ok(Json(TokenResponse::bearer(new_token, role)))
}

#[post("/api/auth/logout")]
async fn api_logout(
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
) -> Result<(), Custom<String>> {
    let Some(token) = token else {
        return Err(Custom(Status::Unauthorized, "Missing bearer token".to_string()));
    };
    state.write().await.sessions.remove(&HqSessionId(token.0));
    Ok(())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_login,
            post_login,
            get_logout,
            api_login,
            api_refresh,
            api_logout,
        ])
}
