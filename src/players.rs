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

pub type PlayerId = i64;

/// The two fixed training tracks.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, FromFormField)]
pub enum Program {
    #[field(value = "3-day")]
    #[serde(rename = "3-day")]
    ThreeDay,
    #[field(value = "5-day")]
    #[serde(rename = "5-day")]
    FiveDay,
}
impl_sqlx_text_type_encode_decode!(Program);

impl Display for Program {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Program::ThreeDay => f.write_str("3-day"),
            Program::FiveDay => f.write_str("5-day"),
        }
    }
}
impl FromStr for Program {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "3-day" => Ok(Program::ThreeDay),
            "5-day" => Ok(Program::FiveDay),
            _ => Err(format!("Unknown program: {s}")),
        }
    }
}

/// Roster row. `attended` is recomputed from the attendance table on every
/// read, it is never stored on the player.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub name: String,
    pub program: Program,
    pub phone: Option<String>,
    pub age: Option<i64>,
    pub avatar: Option<String>,
    pub attended: i64,
}

const ROSTER_SELECT: &str = "SELECT p.*, \
    (SELECT COUNT(*) FROM attendance a WHERE a.player_id = p.id AND a.present = 1) AS attended \
    FROM players p";

pub async fn load_roster(pool: &SqlitePool) -> Result<Vec<PlayerRecord>, sqlx::Error> {
    sqlx::query_as(&format!("{ROSTER_SELECT} ORDER BY p.name"))
        .fetch_all(pool)
        .await
}
pub async fn load_player(player_id: PlayerId, pool: &SqlitePool) -> Result<Option<PlayerRecord>, sqlx::Error> {
    sqlx::query_as(&format!("{ROSTER_SELECT} WHERE p.id=?"))
        .bind(player_id)
        .fetch_optional(pool)
        .await
}

pub async fn add_player(player: &PostedPlayer, pool: &SqlitePool) -> Result<PlayerId, sqlx::Error> {
    let id: (i64,) = sqlx::query_as(
        "INSERT INTO players(name, program, phone, age, avatar) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&player.name)
    .bind(player.program)
    .bind(&player.phone)
    .bind(player.age)
    .bind(&player.avatar)
    .fetch_one(pool)
    .await?;
    info!("Player created, id: {}, name: {}", id.0, player.name);
    Ok(id.0)
}

/// Removes the player together with every attendance row that points at
/// them. Parent accounts linked to the player are unlinked, not deleted;
/// their progress page falls back to the no-player empty state.
async fn drop_player(player_id: PlayerId, pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut txn = pool.begin().await?;
    sqlx::query("DELETE FROM attendance WHERE player_id=?")
        .bind(player_id)
        .execute(&mut *txn)
        .await?;
    sqlx::query("UPDATE users SET player_id=NULL WHERE player_id=?")
        .bind(player_id)
        .execute(&mut *txn)
        .await?;
    sqlx::query("DELETE FROM players WHERE id=?")
        .bind(player_id)
        .execute(&mut *txn)
        .await?;
    txn.commit().await?;
    info!("Player dropped, id: {player_id}");
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedPlayer {
    pub name: String,
    pub program: Program,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub age: Option<i64>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[get("/api/players")]
async fn get_api_players(
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Json<Vec<PlayerRecord>>, Custom<String>> {
    auth::api_coach(token, state).await?;
    let roster = load_roster(&db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Json(roster))
}

#[post("/api/players", data = "<posted>")]
async fn post_api_players(
    posted: Json<PostedPlayer>,
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Json<PlayerRecord>, Custom<String>> {
    auth::api_coach(token, state).await?;
    if posted.name.trim().is_empty() {
        return Err(string_to_custom_error("Player name is required"));
    }
    let player_id = add_player(&posted, &db.0).await.map_err(sqlx_to_custom_error)?;
    let player = load_player(player_id, &db.0)
        .await
        .map_err(sqlx_to_custom_error)?
        .ok_or(Custom(Status::InternalServerError, "Player vanished after insert".to_string()))?;
    Ok(Json(player))
}

#[delete("/api/players/<player_id>")]
async fn delete_api_player(
    player_id: PlayerId,
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<(), Custom<String>> {
    auth::api_coach(token, state).await?;
    if load_player(player_id, &db.0).await.map_err(sqlx_to_custom_error)?.is_none() {
        return Err(Custom(Status::NotFound, format!("Player {player_id} not found")));
    }
    drop_player(player_id, &db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(())
}

#[get("/dashboard/roster")]
async fn get_roster(
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Template, PageError> {
    let user = auth::require_role(session_id, state, UserRole::Coach).await?;
    let players = load_roster(&db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Template::render("roster", context! {
        user,
        players,
    }))
}

#[derive(Debug, FromForm)]
struct PlayerFormValues<'v> {
    #[field(validate = len(1..))]
    name: &'v str,
    program: Program,
    phone: &'v str,
    age: Option<i64>,
}

#[post("/dashboard/roster", data = "<form>")]
async fn post_roster<'r>(
    form: Form<Contextual<'r, PlayerFormValues<'r>>>,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Redirect, PageError> {
    auth::require_role(session_id, state, UserRole::Coach).await?;
    let vals = form
        .value
        .as_ref()
        .ok_or(Custom(Status::BadRequest, "Form data invalid".to_string()))?;
    let posted = PostedPlayer {
        name: vals.name.to_string(),
        program: vals.program,
        phone: Some(vals.phone.to_string()).filter(|s| !s.trim().is_empty()),
        age: vals.age,
        avatar: None,
    };
    add_player(&posted, &db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Redirect::to("/dashboard/roster"))
}

#[get("/dashboard/roster/<player_id>/delete")]
async fn get_roster_delete(
    player_id: PlayerId,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Redirect, PageError> {
    auth::require_role(session_id, state, UserRole::Coach).await?;
    drop_player(player_id, &db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Redirect::to("/dashboard/roster"))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_api_players,
            post_api_players,
            delete_api_player,
            get_roster,
            post_roster,
            get_roster_delete,
        ])
}
