use chrono::Utc;
use log::info;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::response::Redirect;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::collections::HashMap;

use crate::auth::{self, UserRole};
use crate::db::DbPool;
use crate::hqdate::HqDate;
use crate::players::{self, PlayerId, PlayerRecord};
use crate::util::{sqlx_to_custom_error, PageError};
use crate::{BearerToken, HqSessionId, SharedHqState};

/// Per-date working copy of the attendance sheet, held in the coach's
/// session until an explicit save. Survives switching dates back and forth.
#[derive(Serialize, Clone, Debug)]
pub struct AttendanceDraft {
    pub marks: HashMap<PlayerId, bool>,
    /// Revision of the stored sheet this draft started from.
    pub revision: i64,
    pub dirty: bool,
}

impl AttendanceDraft {
    /// Flips one player's mark. Players without a stored row count as absent,
    /// so the first toggle marks them present.
    fn toggle(&mut self, player_id: PlayerId) {
        let mark = self.marks.entry(player_id).or_insert(false);
        *mark = !*mark;
        self.dirty = true;
    }
}

/// One date's stored sheet as served by the JSON API. Player ids become
/// string keys in the JSON rendition.
#[derive(Serialize, Deserialize, Debug)]
pub struct AttendanceSheet {
    pub date: HqDate,
    pub revision: i64,
    pub attendance: HashMap<PlayerId, bool>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PostedAttendance {
    pub attendance: HashMap<PlayerId, bool>,
    /// Revision the caller last observed. When present and stale the save
    /// is rejected with 409 instead of silently clobbering a newer sheet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SavedAttendance {
    pub date: HqDate,
    pub revision: i64,
    pub updated: usize,
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct AttendanceMark {
    pub date: HqDate,
    pub present: bool,
}

pub async fn load_sheet(date: HqDate, pool: &SqlitePool) -> Result<AttendanceSheet, sqlx::Error> {
    let rows: Vec<(PlayerId, bool)> = sqlx::query_as("SELECT player_id, present FROM attendance WHERE date=?")
        .bind(date)
        .fetch_all(pool)
        .await?;
    let revision: Option<(i64,)> = sqlx::query_as("SELECT revision FROM attendance_days WHERE date=?")
        .bind(date)
        .fetch_optional(pool)
        .await?;
    Ok(AttendanceSheet {
        date,
        revision: revision.map_or(0, |r| r.0),
        attendance: rows.into_iter().collect(),
    })
}

/// Recent attendance history of one player, newest first.
pub async fn player_history(player_id: PlayerId, pool: &SqlitePool) -> Result<Vec<AttendanceMark>, sqlx::Error> {
    sqlx::query_as("SELECT date, present FROM attendance WHERE player_id=? ORDER BY date DESC LIMIT 30")
        .bind(player_id)
        .fetch_all(pool)
        .await
}

/// Replaces the date's rows wholesale and bumps the per-date revision, all in
/// one transaction. `expected_revision` carries the caller's last observed
/// revision; a mismatch means somebody saved in between.
pub async fn store_sheet(
    date: HqDate,
    marks: &HashMap<PlayerId, bool>,
    expected_revision: Option<i64>,
    pool: &SqlitePool,
) -> Result<(i64, usize), Custom<String>> {
    if date.locked(HqDate::today()) {
        return Err(Custom(Status::BadRequest, format!("Attendance for {date} is locked")));
    }
    let mut txn = pool.begin().await.map_err(sqlx_to_custom_error)?;
    let current: Option<(i64,)> = sqlx::query_as("SELECT revision FROM attendance_days WHERE date=?")
        .bind(date)
        .fetch_optional(&mut *txn)
        .await
        .map_err(sqlx_to_custom_error)?;
    let current = current.map_or(0, |r| r.0);
    if let Some(expected) = expected_revision {
        if expected != current {
            return Err(Custom(
                Status::Conflict,
                format!("Attendance for {date} was saved elsewhere, revision {current}, expected {expected}"),
            ));
        }
    }
    if !marks.is_empty() {
        let placeholders = marks.keys().map(|_| "?").collect::<Vec<_>>().join(",");
        let known_sql = format!("SELECT COUNT(*) FROM players WHERE id IN ({placeholders})");
        let mut known_query = sqlx::query_as::<_, (i64,)>(&known_sql);
        for player_id in marks.keys() {
            known_query = known_query.bind(player_id);
        }
        let known = known_query.fetch_one(&mut *txn).await.map_err(sqlx_to_custom_error)?;
        if known.0 as usize != marks.len() {
            return Err(Custom(Status::BadRequest, "Unknown player id in attendance".to_string()));
        }
    }
    sqlx::query("DELETE FROM attendance WHERE date=?")
        .bind(date)
        .execute(&mut *txn)
        .await
        .map_err(sqlx_to_custom_error)?;
    for (player_id, present) in marks {
        sqlx::query("INSERT INTO attendance(date, player_id, present) VALUES (?, ?, ?)")
            .bind(date)
            .bind(player_id)
            .bind(present)
            .execute(&mut *txn)
            .await
            .map_err(sqlx_to_custom_error)?;
    }
    let revision = current + 1;
    sqlx::query(
        "INSERT INTO attendance_days(date, revision, saved_at) VALUES (?, ?, ?) \
         ON CONFLICT(date) DO UPDATE SET revision=excluded.revision, saved_at=excluded.saved_at",
    )
    .bind(date)
    .bind(revision)
    .bind(Utc::now())
    .execute(&mut *txn)
    .await
    .map_err(sqlx_to_custom_error)?;
    txn.commit().await.map_err(sqlx_to_custom_error)?;
    Ok((revision, marks.len()))
}

async fn session_draft(
    session_id: &HqSessionId,
    date: HqDate,
    state: &State<SharedHqState>,
) -> Option<AttendanceDraft> {
    state
        .read()
        .await
        .sessions
        .get(session_id)
        .and_then(|s| s.drafts.get(&date))
        .cloned()
}

async fn put_session_draft(
    session_id: &HqSessionId,
    date: HqDate,
    draft: AttendanceDraft,
    state: &State<SharedHqState>,
) {
    let mut hq = state.write().await;
    if let Some(session) = hq.sessions.get_mut(session_id) {
        session.drafts.insert(date, draft);
    }
}

/// Draft for the page: a dirty draft kept in the session wins over the
/// stored sheet, so unsaved edits survive date switches.
async fn draft_for_date(
    session_id: &HqSessionId,
    date: HqDate,
    state: &State<SharedHqState>,
    pool: &SqlitePool,
) -> Result<AttendanceDraft, Custom<String>> {
    if let Some(draft) = session_draft(session_id, date, state).await {
        if draft.dirty {
            return Ok(draft);
        }
    }
    let sheet = load_sheet(date, pool).await.map_err(sqlx_to_custom_error)?;
    let draft = AttendanceDraft {
        marks: sheet.attendance,
        revision: sheet.revision,
        dirty: false,
    };
    put_session_draft(session_id, date, draft.clone(), state).await;
    Ok(draft)
}

#[derive(Serialize, Debug)]
struct AttendanceRow {
    player: PlayerRecord,
    present: bool,
}

#[get("/dashboard/attendance?<date>")]
async fn get_attendance(
    date: Option<HqDate>,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Template, PageError> {
    let (session_id, user) = auth::require_session(session_id, state, UserRole::Coach).await?;
    let date = date.unwrap_or_else(HqDate::today);
    let today = HqDate::today();
    let draft = draft_for_date(&session_id, date, state, &db.0).await?;
    let players = players::load_roster(&db.0).await.map_err(sqlx_to_custom_error)?;
    let rows = players
        .into_iter()
        .map(|player| {
            let present = draft.marks.get(&player.id).copied().unwrap_or(false);
            AttendanceRow { player, present }
        })
        .collect::<Vec<_>>();
    Ok(Template::render("attendance", context! {
        user,
        date: date.to_string(),
        prev_date: date.prev_day().to_string(),
        next_date: date.next_day().to_string(),
        locked: date.locked(today),
        dirty: draft.dirty,
        rows,
    }))
}

#[post("/dashboard/attendance/<date>/toggle/<player_id>")]
async fn post_attendance_toggle(
    date: HqDate,
    player_id: PlayerId,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Redirect, PageError> {
    let (session_id, _user) = auth::require_session(session_id, state, UserRole::Coach).await?;
    if date.locked(HqDate::today()) {
        return Err(Custom(Status::BadRequest, format!("Attendance for {date} is locked")).into());
    }
    let mut draft = draft_for_date(&session_id, date, state, &db.0).await?;
    draft.toggle(player_id);
    put_session_draft(&session_id, date, draft, state).await;
    Ok(Redirect::to(format!("/dashboard/attendance?date={date}")))
}

#[post("/dashboard/attendance/<date>/save")]
async fn post_attendance_save(
    date: HqDate,
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Redirect, PageError> {
    let (session_id, _user) = auth::require_session(session_id, state, UserRole::Coach).await?;
    let Some(draft) = session_draft(&session_id, date, state).await else {
        return Ok(Redirect::to(format!("/dashboard/attendance?date={date}")));
    };
    // on failure the draft stays in the session, dirty flag and all
    let (revision, _updated) = store_sheet(date, &draft.marks, Some(draft.revision), &db.0).await?;
    let mut hq = state.write().await;
    if let Some(session) = hq.sessions.get_mut(&session_id) {
        session.drafts.remove(&date);
    }
    info!("Attendance for {date} saved, revision {revision}");
    Ok(Redirect::to(format!("/dashboard/attendance?date={date}")))
}

#[get("/api/attendance/<date>")]
async fn get_api_attendance(
    date: HqDate,
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Json<AttendanceSheet>, Custom<String>> {
    auth::api_coach(token, state).await?;
    let sheet = load_sheet(date, &db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Json(sheet))
}

#[put("/api/attendance/<date>", data = "<posted>")]
async fn put_api_attendance(
    date: HqDate,
    posted: Json<PostedAttendance>,
    token: Option<BearerToken>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Json<SavedAttendance>, Custom<String>> {
    auth::api_coach(token, state).await?;
    let (revision, updated) = store_sheet(date, &posted.attendance, posted.revision, &db.0).await?;
    Ok(Json(SavedAttendance { date, revision, updated }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_attendance,
            post_attendance_toggle,
            post_attendance_save,
            get_api_attendance,
            put_api_attendance,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn toggle_flips_and_double_toggle_restores() {
        let mut draft = AttendanceDraft {
            marks: HashMap::from([(1, true)]),
            revision: 3,
            dirty: false,
        };
        draft.toggle(1);
        assert_eq!(draft.marks[&1], false);
        assert!(draft.dirty);
        draft.toggle(1);
        assert_eq!(draft.marks[&1], true);

        // an unmarked player starts absent
        draft.toggle(2);
        assert_eq!(draft.marks[&2], true);
        draft.toggle(2);
        assert_eq!(draft.marks[&2], false);
        assert_eq!(draft.revision, 3);
    }
}
