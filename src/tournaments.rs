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
use crate::hqdate::HqDate;
use crate::util::{sqlx_to_custom_error, string_to_custom_error, PageError};
use crate::{
    impl_sqlx_json_text_type_encode_decode, impl_sqlx_text_type_encode_decode, BearerToken,
    HqSessionId, SharedHqState,
};

pub type TournamentId = i64;

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum TournamentStatus {
    Upcoming,
    Cancelled,
    /// Derived at read time, never written to the table.
    Completed,
}
impl_sqlx_text_type_encode_decode!(TournamentStatus);

impl Display for TournamentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TournamentStatus::Upcoming => f.write_str("upcoming"),
            TournamentStatus::Cancelled => f.write_str("cancelled"),
            TournamentStatus::Completed => f.write_str("completed"),
        }
    }
}
impl FromStr for TournamentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upcoming" => Ok(TournamentStatus::Upcoming),
            "cancelled" => Ok(TournamentStatus::Cancelled),
            "completed" => Ok(TournamentStatus::Completed),
            _ => Err(format!("Unknown tournament status: {s}")),
        }
    }
}

/// Age group tags, stored as a JSON array in a TEXT column.
#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
pub struct AgeGroups(pub Vec<String>);
impl_sqlx_json_text_type_encode_decode!(AgeGroups);

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct TournamentRecord {
    pub id: TournamentId,
    pub title: String,
    pub date: HqDate,
    pub location: String,
    pub description: Option<String>,
    pub match_type: String,
    pub age_groups: AgeGroups,
    pub registration_open: HqDate,
    pub registration_close: HqDate,
    pub status: TournamentStatus,
}

impl TournamentRecord {
    /// A stored `upcoming` whose date has passed presents as `completed`.
    pub fn effective_status(&self, today: HqDate) -> TournamentStatus {
        if self.status == TournamentStatus::Upcoming && self.date.is_past(today) {
            TournamentStatus::Completed
        } else {
            self.status
        }
    }
    pub fn registration_open_now(&self, today: HqDate) -> bool {
        self.effective_status(today) == TournamentStatus::Upcoming
            && self.registration_open.0 <= today.0
            && today.0 <= self.registration_close.0
    }
    fn presented(mut self, today: HqDate) -> Self {
        self.status = self.effective_status(today);
        self
    }
}

pub async fn load_tournament(
    tournament_id: TournamentId,
    pool: &SqlitePool,
) -> Result<TournamentRecord, Custom<String>> {
    let tournament: Option<TournamentRecord> = sqlx::query_as("SELECT * FROM tournaments WHERE id=?")
        .bind(tournament_id)
        .fetch_optional(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    tournament.ok_or(Custom(Status::NotFound, format!("Tournament {tournament_id} not found")))
}

pub async fn load_tournaments(pool: &SqlitePool) -> Result<Vec<TournamentRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM tournaments ORDER BY date")
        .fetch_all(pool)
        .await
}

/// Tournaments still ahead of `today` and not cancelled, soonest first.
pub async fn load_upcoming(today: HqDate, pool: &SqlitePool) -> Result<Vec<TournamentRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM tournaments WHERE status='upcoming' AND date >= ? ORDER BY date")
        .bind(today)
        .fetch_all(pool)
        .await
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedTournament {
    pub title: String,
    pub date: HqDate,
    pub location: String,
    #[serde(default)]
    pub description: Option<String>,
    pub match_type: String,
    pub age_groups: AgeGroups,
    pub registration_open: HqDate,
    pub registration_close: HqDate,
}

impl PostedTournament {
    /// Creation rules: future date, close strictly after open, at least one
    /// age group, non-blank title and location.
    fn validate(&self, today: HqDate) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Title is required".to_string());
        }
        if self.location.trim().is_empty() {
            return Err("Location is required".to_string());
        }
        if self.date.0 <= today.0 {
            return Err("Tournament date must be in the future".to_string());
        }
        if self.registration_close.0 <= self.registration_open.0 {
            return Err("Registration must close after it opens".to_string());
        }
        if self.age_groups.0.iter().all(|g| g.trim().is_empty()) {
            return Err("At least one age group is required".to_string());
        }
        Ok(())
    }
}

pub(crate) async fn create_tournament(
    posted: &PostedTournament,
    pool: &SqlitePool,
) -> Result<TournamentId, Custom<String>> {
    posted.validate(HqDate::today()).map_err(|e| string_to_custom_error(&e))?;
    let age_groups = AgeGroups(
        posted
            .age_groups
            .0
            .iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect(),
    );
    let id: (i64,) = sqlx::query_as(
        "INSERT INTO tournaments(title, date, location, description, match_type, age_groups, \
         registration_open, registration_close, status) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&posted.title)
    .bind(posted.date)
    .bind(&posted.location)
    .bind(&posted.description)
    .bind(&posted.match_type)
    .bind(age_groups)
    .bind(posted.registration_open)
    .bind(posted.registration_close)
    .bind(TournamentStatus::Upcoming)
    .fetch_one(pool)
    .await
    .map_err(sqlx_to_custom_error)?;
    info!("Tournament created, id: {}, title: {}", id.0, posted.title);
    Ok(id.0)
}

/// The only lifecycle transition: upcoming to cancelled. Registrations are
/// kept, the row is never deleted.
async fn cancel_tournament(
    tournament_id: TournamentId,
    pool: &SqlitePool,
) -> Result<TournamentRecord, Custom<String>> {
    let tournament = load_tournament(tournament_id, pool).await?;
    let today = HqDate::today();
    let status = tournament.effective_status(today);
    if status != TournamentStatus::Upcoming {
        return Err(Custom(
            Status::BadRequest,
            format!("Only upcoming tournaments can be cancelled, this one is {status}"),
        ));
    }
    sqlx::query("UPDATE tournaments SET status=? WHERE id=?")
        .bind(TournamentStatus::Cancelled)
        .bind(tournament_id)
        .execute(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    info!("Tournament cancelled, id: {tournament_id}");
    load_tournament(tournament_id, pool).await
}

#[get("/api/tournaments")]
async fn get_api_tournaments(db: &State<DbPool>) -> Result<Json<Vec<TournamentRecord>>, Custom<String>> {
    let today = HqDate::today();
    let tournaments = load_tournaments(&db.0)
        .await
        .map_err(sqlx_to_custom_error)?
        .into_iter()
        .map(|t| t.presented(today))
        .collect::<Vec<_>>();
    Ok(Json(tournaments))
}

#[get("/api/tournaments/<tournament_id>")]
async fn get_api_tournament(
    tournament_id: TournamentId,
    db: &State<DbPool>,
) -> Result<Json<TournamentRecord>, Custom<String>> {
    let tournament = load_tournament(tournament_id, &db.0).await?;
    Ok(Json(tournament.presented(HqDate::today())))
}

#[post("/api/tournaments", data = "<posted>")]
async fn post_api_tournaments(
    posted: Json<PostedTournament>,
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Json<TournamentRecord>, Custom<String>> {
    auth::api_coach(token, state).await?;
    let tournament_id = create_tournament(&posted, &db.0).await?;
    let tournament = load_tournament(tournament_id, &db.0).await?;
    Ok(Json(tournament.presented(HqDate::today())))
}

#[put("/api/tournaments/<tournament_id>/cancel")]
async fn put_api_tournament_cancel(
    tournament_id: TournamentId,
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Json<TournamentRecord>, Custom<String>> {
    auth::api_coach(token, state).await?;
    let tournament = cancel_tournament(tournament_id, &db.0).await?;
    Ok(Json(tournament.presented(HqDate::today())))
}

#[get("/tournaments")]
async fn get_tournaments(db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let today = HqDate::today();
    let tournaments = load_tournaments(&db.0)
        .await
        .map_err(sqlx_to_custom_error)?
        .into_iter()
        .map(|t| t.presented(today))
        .collect::<Vec<_>>();
    Ok(Template::render("tournaments", context! {
        tournaments,
    }))
}

#[get("/tournaments/<tournament_id>?<registered>")]
async fn get_tournament(
    tournament_id: TournamentId,
    registered: Option<bool>,
    db: &State<DbPool>,
) -> Result<Template, Custom<String>> {
    let today = HqDate::today();
    let tournament = load_tournament(tournament_id, &db.0).await?;
    let registration_open = tournament.registration_open_now(today);
    Ok(Template::render("tournament", context! {
        tournament: tournament.presented(today),
        registration_open,
        registered: registered.unwrap_or(false),
    }))
}

#[get("/dashboard/tournaments")]
async fn get_tournaments_admin(
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Template, PageError> {
    let user = auth::require_role(session_id, state, UserRole::Coach).await?;
    let today = HqDate::today();
    let tournaments = load_tournaments(&db.0)
        .await
        .map_err(sqlx_to_custom_error)?
        .into_iter()
        .map(|t| t.presented(today))
        .collect::<Vec<_>>();
    Ok(Template::render("tournaments-admin", context! {
        user,
        tournaments,
    }))
}

#[get("/dashboard/tournaments/new")]
async fn get_tournament_new(
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
) -> Result<Template, PageError> {
    let user = auth::require_role(session_id, state, UserRole::Coach).await?;
    Ok(Template::render("tournament-new", context! {
        user,
    }))
}

#[derive(Debug, FromForm)]
struct TournamentFormValues<'v> {
    #[field(validate = len(1..))]
    title: &'v str,
    date: HqDate,
    #[field(validate = len(1..))]
    location: &'v str,
    description: &'v str,
    match_type: &'v str,
    /// Comma separated tags, e.g. "U10, U12".
    age_groups: &'v str,
    registration_open: HqDate,
    registration_close: HqDate,
}

#[post("/dashboard/tournaments/new", data = "<form>")]
async fn post_tournament_new<'r>(
    form: Form<Contextual<'r, TournamentFormValues<'r>>>,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Redirect, PageError> {
    auth::require_role(session_id, state, UserRole::Coach).await?;
    let vals = form
        .value
        .as_ref()
        .ok_or(Custom(Status::BadRequest, "Form data invalid".to_string()))?;
    let posted = PostedTournament {
        title: vals.title.to_string(),
        date: vals.date,
        location: vals.location.to_string(),
        description: Some(vals.description.to_string()).filter(|s| !s.trim().is_empty()),
        match_type: vals.match_type.to_string(),
        age_groups: AgeGroups(vals.age_groups.split(',').map(|g| g.trim().to_string()).collect()),
        registration_open: vals.registration_open,
        registration_close: vals.registration_close,
    };
    create_tournament(&posted, &db.0).await?;
    Ok(Redirect::to("/dashboard/tournaments"))
}

#[get("/dashboard/tournaments/<tournament_id>/cancel")]
async fn get_tournament_cancel(
    tournament_id: TournamentId,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Template, PageError> {
    let user = auth::require_role(session_id, state, UserRole::Coach).await?;
    let tournament = load_tournament(tournament_id, &db.0).await?;
    Ok(Template::render("tournament-cancel", context! {
        user,
        tournament: tournament.presented(HqDate::today()),
    }))
}

#[post("/dashboard/tournaments/<tournament_id>/cancel")]
async fn post_tournament_cancel(
    tournament_id: TournamentId,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Redirect, PageError> {
    auth::require_role(session_id, state, UserRole::Coach).await?;
    cancel_tournament(tournament_id, &db.0).await?;
    Ok(Redirect::to("/dashboard/tournaments"))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_api_tournaments,
            get_api_tournament,
            post_api_tournaments,
            put_api_tournament_cancel,
            get_tournaments,
            get_tournament,
            get_tournaments_admin,
            get_tournament_new,
            post_tournament_new,
            get_tournament_cancel,
            post_tournament_cancel,
        ])
}
