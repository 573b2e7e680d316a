use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::{error, info};
use rocket::form::{Contextual, Form};
use rocket::http::{Header, Status};
use rocket::response::status::Custom;
use rocket::response::Redirect;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::auth::{self, UserRole};
use crate::coalesce::CoalescingCache;
use crate::db::DbPool;
use crate::hqdate::HqDate;
use crate::tournaments::{self, TournamentId};
use crate::util::{anyhow_to_custom_error, slugify, sqlx_to_custom_error, string_to_custom_error, PageError};
use crate::{impl_sqlx_json_text_type_encode_decode, BearerToken, HqSessionId, SharedHqState};

const TEAM_SIZE: RangeInclusive<usize> = 3..=12;

/// Team roster names, stored as a JSON array in a TEXT column.
#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
pub struct PlayerNames(pub Vec<String>);
impl_sqlx_json_text_type_encode_decode!(PlayerNames);

/// A team signup. Read-only once created.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct RegistrationRecord {
    pub id: i64,
    pub tournament_id: TournamentId,
    pub team_name: String,
    pub captain_name: String,
    pub phone: String,
    pub email: String,
    pub player_names: PlayerNames,
    pub created: DateTime<Utc>,
}

/// Registration lists are memoized per tournament; concurrent readers of the
/// same tournament share one database fetch.
pub struct RegistrationCache(pub CoalescingCache<TournamentId, Vec<RegistrationRecord>>);

impl Default for RegistrationCache {
    fn default() -> Self {
        Self(CoalescingCache::new())
    }
}

async fn load_registrations(
    tournament_id: TournamentId,
    pool: &SqlitePool,
) -> Result<Vec<RegistrationRecord>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM registrations WHERE tournament_id=? ORDER BY created, id")
        .bind(tournament_id)
        .fetch_all(pool)
        .await
}

/// Cached list for one tournament. A failed fetch logs and settles on an
/// empty list; the next invalidation lets it retry.
async fn cached_registrations(
    tournament_id: TournamentId,
    cache: &State<RegistrationCache>,
    db: &State<DbPool>,
) -> Arc<Vec<RegistrationRecord>> {
    let pool = db.0.clone();
    cache
        .0
        .get_or_fetch(tournament_id, move || {
            let pool = pool.clone();
            async move {
                match load_registrations(tournament_id, &pool).await {
                    Ok(registrations) => registrations,
                    Err(err) => {
                        error!("Registration fetch failed for tournament {tournament_id}: {err}");
                        Vec::new()
                    }
                }
            }
        })
        .await
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedRegistration {
    pub team_name: String,
    pub captain_name: String,
    pub phone: String,
    pub email: String,
    pub player_names: PlayerNames,
}

fn cleaned_player_names(names: &PlayerNames) -> Result<Vec<String>, String> {
    let names = names
        .0
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>();
    if !TEAM_SIZE.contains(&names.len()) {
        return Err(format!(
            "A team needs {} to {} players, got {}",
            TEAM_SIZE.start(),
            TEAM_SIZE.end(),
            names.len()
        ));
    }
    Ok(names)
}

/// Accepts a signup when the tournament's registration window is open.
pub(crate) async fn add_registration(
    tournament_id: TournamentId,
    posted: &PostedRegistration,
    pool: &SqlitePool,
) -> Result<i64, Custom<String>> {
    let tournament = tournaments::load_tournament(tournament_id, pool).await?;
    if !tournament.registration_open_now(HqDate::today()) {
        return Err(string_to_custom_error("Registration is closed for this tournament"));
    }
    for (value, label) in [
        (&posted.team_name, "Team name"),
        (&posted.captain_name, "Captain name"),
        (&posted.phone, "Phone"),
        (&posted.email, "Email"),
    ] {
        if value.trim().is_empty() {
            return Err(string_to_custom_error(&format!("{label} is required")));
        }
    }
    let names = cleaned_player_names(&posted.player_names).map_err(|e| string_to_custom_error(&e))?;
    let id: (i64,) = sqlx::query_as(
        "INSERT INTO registrations(tournament_id, team_name, captain_name, phone, email, player_names, created) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(tournament_id)
    .bind(posted.team_name.trim())
    .bind(posted.captain_name.trim())
    .bind(posted.phone.trim())
    .bind(posted.email.trim())
    .bind(PlayerNames(names))
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(sqlx_to_custom_error)?;
    info!("Registration created, id: {}, tournament: {tournament_id}, team: {}", id.0, posted.team_name);
    Ok(id.0)
}

async fn load_registration(id: i64, pool: &SqlitePool) -> Result<RegistrationRecord, Custom<String>> {
    let registration: Option<RegistrationRecord> = sqlx::query_as("SELECT * FROM registrations WHERE id=?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    registration.ok_or(Custom(Status::NotFound, format!("Registration {id} not found")))
}

#[get("/api/registrations/<tournament_id>")]
async fn get_api_registrations(
    tournament_id: TournamentId,
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    cache: &State<RegistrationCache>,
    db: &State<DbPool>,
) -> Result<Json<Vec<RegistrationRecord>>, Custom<String>> {
    auth::api_coach(token, state).await?;
    let registrations = cached_registrations(tournament_id, cache, db).await;
    Ok(Json(registrations.as_ref().clone()))
}

#[post("/api/registrations/<tournament_id>", data = "<posted>")]
async fn post_api_registrations(
    tournament_id: TournamentId,
    posted: Json<PostedRegistration>,
    cache: &State<RegistrationCache>,
    db: &State<DbPool>,
) -> Result<Json<RegistrationRecord>, Custom<String>> {
    let id = add_registration(tournament_id, &posted, &db.0).await?;
    cache.0.invalidate(&tournament_id).await;
    let registration = load_registration(id, &db.0).await?;
    Ok(Json(registration))
}

#[derive(Debug, FromForm)]
struct RegistrationFormValues<'v> {
    #[field(validate = len(1..))]
    team_name: &'v str,
    #[field(validate = len(1..))]
    captain_name: &'v str,
    phone: &'v str,
    email: &'v str,
    /// One player per line.
    player_names: &'v str,
}

#[post("/tournaments/<tournament_id>/register", data = "<form>")]
async fn post_tournament_register<'r>(
    tournament_id: TournamentId,
    form: Form<Contextual<'r, RegistrationFormValues<'r>>>,
    cache: &State<RegistrationCache>,
    db: &State<DbPool>,
) -> Result<Redirect, Custom<String>> {
    let vals = form
        .value
        .as_ref()
        .ok_or(Custom(Status::BadRequest, "Form data invalid".to_string()))?;
    let posted = PostedRegistration {
        team_name: vals.team_name.to_string(),
        captain_name: vals.captain_name.to_string(),
        phone: vals.phone.to_string(),
        email: vals.email.to_string(),
        player_names: PlayerNames(vals.player_names.lines().map(str::to_string).collect()),
    };
    add_registration(tournament_id, &posted, &db.0).await?;
    cache.0.invalidate(&tournament_id).await;
    Ok(Redirect::to(format!("/tournaments/{tournament_id}?registered=true")))
}

#[get("/dashboard/tournaments/<tournament_id>/registrations?<notice>")]
async fn get_registrations_admin(
    tournament_id: TournamentId,
    notice: Option<&str>,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    cache: &State<RegistrationCache>,
    db: &State<DbPool>,
) -> Result<Template, PageError> {
    let user = auth::require_role(session_id, state, UserRole::Coach).await?;
    let tournament = tournaments::load_tournament(tournament_id, &db.0).await?;
    let registrations = cached_registrations(tournament_id, cache, db).await;
    let notice = match notice {
        Some("empty") => Some("Nothing to export, no registrations yet."),
        _ => None,
    };
    Ok(Template::render("registrations", context! {
        user,
        tournament,
        registrations: registrations.as_ref(),
        notice,
    }))
}

#[post("/dashboard/tournaments/<tournament_id>/registrations/refresh")]
async fn post_registrations_refresh(
    tournament_id: TournamentId,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    cache: &State<RegistrationCache>,
) -> Result<Redirect, PageError> {
    auth::require_role(session_id, state, UserRole::Coach).await?;
    cache.0.invalidate(&tournament_id).await;
    Ok(Redirect::to(format!("/dashboard/tournaments/{tournament_id}/registrations")))
}

/// Spreadsheet-friendly export: UTF-8 BOM so Excel detects the encoding,
/// then a header row and one row per team.
fn registrations_csv(registrations: &[RegistrationRecord]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["Team", "Captain", "Phone", "Email", "Players", "Registered"])?;
    for registration in registrations {
        let players = registration.player_names.0.iter().join("|");
        let created = registration.created.format("%Y-%m-%d %H:%M").to_string();
        writer.write_record([
            registration.team_name.as_str(),
            registration.captain_name.as_str(),
            registration.phone.as_str(),
            registration.email.as_str(),
            players.as_str(),
            created.as_str(),
        ])?;
    }
    let data = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("CSV flush error: {e}"))?;
    let mut body = b"\xef\xbb\xbf".to_vec();
    body.extend_from_slice(&data);
    Ok(body)
}

#[derive(Responder)]
#[response(content_type = "text/csv; charset=utf-8")]
struct CsvDownload {
    body: Vec<u8>,
    disposition: Header<'static>,
}

#[get("/dashboard/tournaments/<tournament_id>/registrations.csv")]
async fn get_registrations_csv(
    tournament_id: TournamentId,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    cache: &State<RegistrationCache>,
    db: &State<DbPool>,
) -> Result<CsvDownload, PageError> {
    auth::require_role(session_id, state, UserRole::Coach).await?;
    let tournament = tournaments::load_tournament(tournament_id, &db.0).await?;
    let registrations = cached_registrations(tournament_id, cache, db).await;
    if registrations.is_empty() {
        return Err(PageError::Redirect(Redirect::to(format!(
            "/dashboard/tournaments/{tournament_id}/registrations?notice=empty"
        ))));
    }
    let body = registrations_csv(&registrations).map_err(anyhow_to_custom_error)?;
    let filename = format!("{}-registrations-{}.csv", slugify(&tournament.title), HqDate::today());
    Ok(CsvDownload {
        body,
        disposition: Header::new("Content-Disposition", format!("attachment; filename=\"{filename}\"")),
    })
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_api_registrations,
            post_api_registrations,
            post_tournament_register,
            get_registrations_admin,
            post_registrations_refresh,
            get_registrations_csv,
        ])
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn registration(id: i64, team_name: &str, captain_name: &str, players: &[&str]) -> RegistrationRecord {
        RegistrationRecord {
            id,
            tournament_id: 1,
            team_name: team_name.to_string(),
            captain_name: captain_name.to_string(),
            phone: "555 0101".to_string(),
            email: "captain@example.com".to_string(),
            player_names: PlayerNames(players.iter().map(|s| s.to_string()).collect()),
            created: Utc.with_ymd_and_hms(2025, 5, 1, 10, 30, 0).unwrap(),
        }
    }

    #[test]
    fn csv_quoting_round_trip() {
        let registrations = vec![
            registration(1, "Ball, Hogs", "Joe \"Big J\" Malone", &["Ann", "Bob", "Cid"]),
            registration(2, "Line\nBreakers", "Mia", &["Dan", "Eve", "Fay"]),
        ];
        let body = registrations_csv(&registrations).unwrap();
        assert!(body.starts_with(b"\xef\xbb\xbf"));

        let mut reader = csv::Reader::from_reader(&body[3..]);
        let rows = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "Ball, Hogs");
        assert_eq!(&rows[0][1], "Joe \"Big J\" Malone");
        assert_eq!(&rows[0][4], "Ann|Bob|Cid");
        assert_eq!(&rows[1][0], "Line\nBreakers");
        assert_eq!(&rows[1][5], "2025-05-01 10:30");
    }

    #[test]
    fn team_size_boundaries() {
        let names = |n: usize| PlayerNames((0..n).map(|i| format!("Player {i}")).collect());
        assert!(cleaned_player_names(&names(2)).is_err());
        assert!(cleaned_player_names(&names(3)).is_ok());
        assert!(cleaned_player_names(&names(12)).is_ok());
        assert!(cleaned_player_names(&names(13)).is_err());
        // blank lines do not count
        let padded = PlayerNames(vec!["Ann".into(), " ".into(), "Bob".into(), "".into(), "Cid".into()]);
        assert_eq!(cleaned_player_names(&padded).unwrap(), vec!["Ann", "Bob", "Cid"]);
    }
}
