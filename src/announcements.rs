use chrono::{DateTime, TimeDelta, Utc};
use log::info;
use rocket::form::{Contextual, Form};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::response::Redirect;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::auth::{self, UserRole};
use crate::db::DbPool;
use crate::util::{sqlx_to_custom_error, string_to_custom_error, PageError};
use crate::{impl_sqlx_text_type_encode_decode, BearerToken, HqSessionId, SharedHqState};

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, FromFormField)]
pub enum ExpiryPolicy {
    #[field(value = "24h")]
    #[serde(rename = "24h")]
    Hours24,
    #[field(value = "48h")]
    #[serde(rename = "48h")]
    Hours48,
    #[field(value = "manual")]
    #[serde(rename = "manual")]
    Manual,
}
impl_sqlx_text_type_encode_decode!(ExpiryPolicy);

impl Display for ExpiryPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpiryPolicy::Hours24 => f.write_str("24h"),
            ExpiryPolicy::Hours48 => f.write_str("48h"),
            ExpiryPolicy::Manual => f.write_str("manual"),
        }
    }
}
impl FromStr for ExpiryPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "24h" => Ok(ExpiryPolicy::Hours24),
            "48h" => Ok(ExpiryPolicy::Hours48),
            "manual" => Ok(ExpiryPolicy::Manual),
            _ => Err(format!("Unknown expiry policy: {s}")),
        }
    }
}

impl ExpiryPolicy {
    fn expires_from(&self, published: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ExpiryPolicy::Hours24 => Some(published + TimeDelta::hours(24)),
            ExpiryPolicy::Hours48 => Some(published + TimeDelta::hours(48)),
            ExpiryPolicy::Manual => None,
        }
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct AnnouncementRecord {
    pub id: i64,
    pub message: String,
    pub expiry: ExpiryPolicy,
    pub published: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
}

/// The single current announcement, or None when there is none or it has
/// already expired.
pub async fn active_announcement(pool: &SqlitePool) -> Result<Option<AnnouncementRecord>, sqlx::Error> {
    let announcement: Option<AnnouncementRecord> =
        sqlx::query_as("SELECT * FROM announcements ORDER BY id DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;
    let now = Utc::now();
    Ok(announcement.filter(|a| a.expires.map_or(true, |e| e > now)))
}

/// Publishing replaces whatever was there; the site carries one slot.
pub(crate) async fn publish_announcement(
    message: &str,
    expiry: ExpiryPolicy,
    pool: &SqlitePool,
) -> Result<AnnouncementRecord, Custom<String>> {
    if message.trim().is_empty() {
        return Err(string_to_custom_error("Announcement message is required"));
    }
    let published = Utc::now();
    let expires = expiry.expires_from(published);
    let mut txn = pool.begin().await.map_err(sqlx_to_custom_error)?;
    sqlx::query("DELETE FROM announcements")
        .execute(&mut *txn)
        .await
        .map_err(sqlx_to_custom_error)?;
    let id: (i64,) = sqlx::query_as(
        "INSERT INTO announcements(message, expiry, published, expires) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(message.trim())
    .bind(expiry)
    .bind(published)
    .bind(expires)
    .fetch_one(&mut *txn)
    .await
    .map_err(sqlx_to_custom_error)?;
    txn.commit().await.map_err(sqlx_to_custom_error)?;
    info!("Announcement published, id: {}, expiry: {expiry}", id.0);
    Ok(AnnouncementRecord {
        id: id.0,
        message: message.trim().to_string(),
        expiry,
        published,
        expires,
    })
}

async fn clear_announcement(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM announcements").execute(pool).await?;
    info!("Announcement cleared");
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedAnnouncement {
    pub message: String,
    pub expiry: ExpiryPolicy,
}

#[get("/api/announcements")]
async fn get_api_announcements(db: &State<DbPool>) -> Result<Json<Option<AnnouncementRecord>>, Custom<String>> {
    let announcement = active_announcement(&db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Json(announcement))
}

#[post("/api/announcements", data = "<posted>")]
async fn post_api_announcements(
    posted: Json<PostedAnnouncement>,
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Json<AnnouncementRecord>, Custom<String>> {
    auth::api_coach(token, state).await?;
    let announcement = publish_announcement(&posted.message, posted.expiry, &db.0).await?;
    Ok(Json(announcement))
}

#[delete("/api/announcements")]
async fn delete_api_announcements(
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<(), Custom<String>> {
    auth::api_coach(token, state).await?;
    clear_announcement(&db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(())
}

#[get("/dashboard/announcement")]
async fn get_announcement_admin(
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Template, PageError> {
    let user = auth::require_role(session_id, state, UserRole::Coach).await?;
    let announcement = active_announcement(&db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Template::render("announcement", context! {
        user,
        announcement,
    }))
}

#[derive(Debug, FromForm)]
struct AnnouncementFormValues<'v> {
    #[field(validate = len(1..))]
    message: &'v str,
    expiry: ExpiryPolicy,
}

#[post("/dashboard/announcement", data = "<form>")]
async fn post_announcement_admin<'r>(
    form: Form<Contextual<'r, AnnouncementFormValues<'r>>>,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Redirect, PageError> {
    auth::require_role(session_id, state, UserRole::Coach).await?;
    let vals = form
        .value
        .as_ref()
        .ok_or(Custom(Status::BadRequest, "Form data invalid".to_string()))?;
    publish_announcement(vals.message, vals.expiry, &db.0).await?;
    Ok(Redirect::to("/dashboard/announcement"))
}

#[post("/dashboard/announcement/clear")]
async fn post_announcement_clear(
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Redirect, PageError> {
    auth::require_role(session_id, state, UserRole::Coach).await?;
    clear_announcement(&db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Redirect::to("/dashboard/announcement"))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_api_announcements,
            post_api_announcements,
            delete_api_announcements,
            get_announcement_admin,
            post_announcement_admin,
            post_announcement_clear,
        ])
}
