use anyhow::anyhow;
use chrono::TimeDelta;
use log::info;
use rocket::response::status::Custom;
use rocket::response::Redirect;
use rocket::{Build, Rocket, State};
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;

use crate::announcements::{publish_announcement, ExpiryPolicy};
use crate::attendance::store_sheet;
use crate::auth::{self, UserRole};
use crate::db::DbPool;
use crate::hqdate::HqDate;
use crate::players::{add_player, PlayerId, PostedPlayer, Program};
use crate::registrations::{add_registration, PlayerNames, PostedRegistration};
use crate::tournaments::{create_tournament, AgeGroups, PostedTournament};
use crate::util::{anyhow_to_custom_error, sqlx_to_anyhow, sqlx_to_custom_error};

pub const DEMO_COACH_EMAIL: &str = "coach@hoophq.test";
pub const DEMO_COACH_PASSWORD: &str = "demo-coach-pass";
pub const DEMO_PARENT_EMAIL: &str = "parent@hoophq.test";
pub const DEMO_PARENT_PASSWORD: &str = "demo-parent-pass";

fn custom_to_anyhow(err: Custom<String>) -> anyhow::Error {
    anyhow!("{} {}", err.0, err.1)
}

async fn add_user(
    name: &str,
    email: &str,
    password: &str,
    role: UserRole,
    player_id: Option<PlayerId>,
    pool: &SqlitePool,
) -> anyhow::Result<()> {
    let password_hash = auth::hash_password(password)?;
    sqlx::query("INSERT INTO users(name, email, password_hash, role, player_id) VALUES (?, ?, ?, ?, ?)")
        .bind(name)
        .bind(email)
        .bind(password_hash)
        .bind(role)
        .bind(player_id)
        .execute(pool)
        .await
        .map_err(sqlx_to_anyhow)?;
    Ok(())
}

async fn seed(pool: &SqlitePool) -> anyhow::Result<()> {
    let today = HqDate::today();

    let mut player_ids = vec![];
    for (name, program, phone, age) in [
        ("Ava Brooks", Program::FiveDay, "555 0101", 10),
        ("Jordan Reed", Program::ThreeDay, "555 0102", 11),
        ("Malik Price", Program::FiveDay, "555 0103", 9),
        ("Sofia Cruz", Program::ThreeDay, "555 0104", 12),
    ] {
        let posted = PostedPlayer {
            name: name.to_string(),
            program,
            phone: Some(phone.to_string()),
            age: Some(age),
            avatar: None,
        };
        player_ids.push(add_player(&posted, pool).await.map_err(sqlx_to_anyhow)?);
    }

    add_user("Demo Coach", DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD, UserRole::Coach, None, pool).await?;
    add_user(
        "Demo Parent",
        DEMO_PARENT_EMAIL,
        DEMO_PARENT_PASSWORD,
        UserRole::Parent,
        player_ids.first().copied(),
        pool,
    )
    .await?;

    let yesterday = HqDate(today.0 - TimeDelta::days(1));
    let marks = HashMap::from([
        (player_ids[0], true),
        (player_ids[1], true),
        (player_ids[2], false),
    ]);
    store_sheet(yesterday, &marks, None, pool).await.map_err(custom_to_anyhow)?;

    let tournament = PostedTournament {
        title: "Spring Shootout".to_string(),
        date: HqDate(today.0 + TimeDelta::days(30)),
        location: "HoopHQ Main Court".to_string(),
        description: Some("Annual season opener, open to all local teams.".to_string()),
        match_type: "5v5".to_string(),
        age_groups: AgeGroups(vec!["U10".to_string(), "U12".to_string()]),
        registration_open: HqDate(today.0 - TimeDelta::days(1)),
        registration_close: HqDate(today.0 + TimeDelta::days(14)),
    };
    let tournament_id = create_tournament(&tournament, pool).await.map_err(custom_to_anyhow)?;

    for (team_name, captain_name, players) in [
        ("Downtown Dribblers", "Chris Mayer", vec!["Ava B", "Ben K", "Carl O"]),
        ("Hoop, There It Is", "Dana Fox", vec!["Dan R", "Eve S", "Fay T", "Gus W"]),
    ] {
        let posted = PostedRegistration {
            team_name: team_name.to_string(),
            captain_name: captain_name.to_string(),
            phone: "555 0199".to_string(),
            email: "teams@example.com".to_string(),
            player_names: PlayerNames(players.into_iter().map(str::to_string).collect()),
        };
        add_registration(tournament_id, &posted, pool).await.map_err(custom_to_anyhow)?;
    }

    publish_announcement("Open tryouts this Saturday at the main gym.", ExpiryPolicy::Hours48, pool)
        .await
        .map_err(custom_to_anyhow)?;

    info!("Demo data seeded, tournament id: {tournament_id}");
    Ok(())
}

/// Populates a fresh database with a coach, a parent, players, a tournament
/// with registrations and an announcement. No-op when the demo coach already
/// exists.
#[get("/demo/seed")]
async fn get_demo_seed(db: &State<DbPool>) -> Result<Redirect, Custom<String>> {
    let pool = &db.0;
    let existing: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE email=?")
        .bind(DEMO_COACH_EMAIL)
        .fetch_one(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    if existing.0 == 0 {
        seed(pool).await.map_err(anyhow_to_custom_error)?;
    }
    Ok(Redirect::to("/"))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![get_demo_seed])
}
