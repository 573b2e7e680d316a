use itertools::Itertools;
use log::warn;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use std::path::Path;

use crate::announcements::active_announcement;
use crate::attendance::{self, load_sheet};
use crate::auth::{self, UserRole};
use crate::db::DbPool;
use crate::hqdate::HqDate;
use crate::players;
use crate::tournaments::load_upcoming;
use crate::util::{sqlx_to_custom_error, PageError};
use crate::{HqSessionId, SharedHqState};

const GALLERY_DIR: &str = "static/gallery";
const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "svg"];

#[derive(Serialize, Debug)]
struct ProgramInfo {
    name: &'static str,
    days: &'static str,
    blurb: &'static str,
}

const PROGRAMS: [ProgramInfo; 2] = [
    ProgramInfo {
        name: "3-day track",
        days: "Monday, Wednesday, Friday",
        blurb: "Fundamentals and game play three afternoons a week.",
    },
    ProgramInfo {
        name: "5-day track",
        days: "Monday through Friday",
        blurb: "Daily practice with conditioning and scrimmages.",
    },
];

#[derive(Serialize, Debug)]
struct ScheduleDay {
    day: &'static str,
    three_day: Option<&'static str>,
    five_day: Option<&'static str>,
}

fn weekly_schedule() -> Vec<ScheduleDay> {
    const PRACTICE: &str = "4:00 PM to 6:00 PM";
    [
        ("Monday", true),
        ("Tuesday", false),
        ("Wednesday", true),
        ("Thursday", false),
        ("Friday", true),
    ]
    .into_iter()
    .map(|(day, three_day)| ScheduleDay {
        day,
        three_day: three_day.then_some(PRACTICE),
        five_day: Some(PRACTICE),
    })
    .collect()
}

#[get("/")]
async fn get_index(db: &State<DbPool>) -> Result<Template, PageError> {
    let announcement = active_announcement(&db.0).await.map_err(sqlx_to_custom_error)?;
    let upcoming = load_upcoming(HqDate::today(), &db.0)
        .await
        .map_err(sqlx_to_custom_error)?;
    Ok(Template::render("index", context! {
        announcement,
        upcoming,
    }))
}

#[get("/about")]
fn get_about() -> Template {
    Template::render("about", context! {})
}

#[get("/programs")]
fn get_programs() -> Template {
    Template::render("programs", context! {
        programs: PROGRAMS,
    })
}

#[get("/schedule")]
fn get_schedule() -> Template {
    Template::render("schedule", context! {
        days: weekly_schedule(),
    })
}

/// Whatever image files sit under `static/gallery`, alphabetically. A
/// missing directory just renders an empty gallery.
fn gallery_images(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        warn!("Gallery directory not readable: {}", dir.display());
        return vec![];
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            Path::new(name)
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .sorted()
        .collect()
}

#[get("/gallery")]
fn get_gallery() -> Template {
    Template::render("gallery", context! {
        images: gallery_images(Path::new(GALLERY_DIR)),
    })
}

#[get("/contact")]
fn get_contact() -> Template {
    Template::render("contact", context! {})
}

#[get("/dashboard")]
async fn get_dashboard(
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Template, PageError> {
    let user = auth::require_role(session_id, state, UserRole::Coach).await?;
    let today = HqDate::today();
    let roster = players::load_roster(&db.0).await.map_err(sqlx_to_custom_error)?;
    let sheet = load_sheet(today, &db.0).await.map_err(sqlx_to_custom_error)?;
    let present_today = sheet.attendance.values().filter(|present| **present).count();
    let upcoming = load_upcoming(today, &db.0).await.map_err(sqlx_to_custom_error)?;
    let announcement = active_announcement(&db.0).await.map_err(sqlx_to_custom_error)?;
    Ok(Template::render("dashboard", context! {
        user,
        today: today.to_string(),
        roster_size: roster.len(),
        present_today,
        upcoming,
        announcement,
    }))
}

#[get("/dashboard/progress")]
async fn get_progress(
    session_id: Option<HqSessionId>,
    state: &State<SharedHqState>,
    db: &State<DbPool>,
) -> Result<Template, PageError> {
    let user = auth::require_role(session_id, state, UserRole::Parent).await?;
    let player = match user.player_id {
        Some(player_id) => players::load_player(player_id, &db.0)
            .await
            .map_err(sqlx_to_custom_error)?,
        None => None,
    };
    let history = match &player {
        Some(player) => attendance::player_history(player.id, &db.0)
            .await
            .map_err(sqlx_to_custom_error)?,
        None => vec![],
    };
    Ok(Template::render("progress", context! {
        user,
        player,
        history,
    }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_index,
            get_about,
            get_programs,
            get_schedule,
            get_gallery,
            get_contact,
            get_dashboard,
            get_progress,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schedule_covers_the_week() {
        let days = weekly_schedule();
        assert_eq!(days.len(), 5);
        assert!(days.iter().all(|d| d.five_day.is_some()));
        assert_eq!(days.iter().filter(|d| d.three_day.is_some()).count(), 3);
    }

    #[test]
    fn gallery_of_missing_dir_is_empty() {
        assert!(gallery_images(Path::new("no/such/dir")).is_empty());
    }
}
