use chrono::TimeDelta;
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;
use std::collections::HashMap;

use crate::announcements::{AnnouncementRecord, PostedAnnouncement, ExpiryPolicy};
use crate::attendance::{AttendanceSheet, PostedAttendance, SavedAttendance};
use crate::auth::{TokenResponse, UserRole};
use crate::demo::{DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD, DEMO_PARENT_EMAIL, DEMO_PARENT_PASSWORD};
use crate::hqdate::HqDate;
use crate::players::{PlayerRecord, PostedPlayer, Program};
use crate::registrations::{PlayerNames, PostedRegistration, RegistrationRecord};
use crate::tournaments::{AgeGroups, PostedTournament, TournamentRecord, TournamentStatus};

fn create_test_server() -> Client {
    let client = Client::tracked(super::rocket()).unwrap();
    {
        let resp = client.get("/demo/seed").dispatch();
        assert_eq!(resp.status(), Status::SeeOther);
    }
    client
}

fn api_token(client: &Client, username: &str, password: &str) -> String {
    let resp = client.post("/api/auth/login")
        .header(ContentType::Form)
        .body(format!("grant_type=password&username={username}&password={password}"))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let token = resp.into_json::<TokenResponse>().unwrap();
    assert_eq!(token.token_type, "bearer");
    token.access_token
}

fn bearer(token: &str) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {token}"))
}

fn login(client: &Client, email: &str, password: &str) {
    let resp = client.post("/login")
        .header(ContentType::Form)
        .body(format!("email={email}&password={password}"))
        .dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
}

fn days_from_today(days: i64) -> HqDate {
    HqDate(HqDate::today().0 + TimeDelta::days(days))
}

fn posted_tournament() -> PostedTournament {
    PostedTournament {
        title: "Summer Cup".to_string(),
        date: days_from_today(20),
        location: "Arena".to_string(),
        description: None,
        match_type: "3v3".to_string(),
        age_groups: AgeGroups(vec!["U12".to_string()]),
        registration_open: days_from_today(0),
        registration_close: days_from_today(10),
    }
}

#[test]
fn token_grant_and_refresh() {
    let client = create_test_server();

    let resp = client.post("/api/auth/login")
        .header(ContentType::Form)
        .body(format!("grant_type=client_credentials&username={DEMO_COACH_EMAIL}&password={DEMO_COACH_PASSWORD}"))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.post("/api/auth/login")
        .header(ContentType::Form)
        .body(format!("grant_type=password&username={DEMO_COACH_EMAIL}&password=wrong"))
        .dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);

    let resp = client.post("/api/auth/login")
        .header(ContentType::Form)
        .body(format!("grant_type=password&username={DEMO_COACH_EMAIL}&password={DEMO_COACH_PASSWORD}"))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::JSON));
    let token = resp.into_json::<TokenResponse>().unwrap();
    assert_eq!(token.role, UserRole::Coach);

    // the refresh rotates the token, the old one stops working
    let resp = client.post("/api/auth/refresh")
        .header(bearer(&token.access_token))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let rotated = resp.into_json::<TokenResponse>().unwrap();
    assert_ne!(rotated.access_token, token.access_token);

    let resp = client.get("/api/players").header(bearer(&token.access_token)).dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
    let resp = client.get("/api/players").header(bearer(&rotated.access_token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.post("/api/auth/logout").header(bearer(&rotated.access_token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/api/players").header(bearer(&rotated.access_token)).dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
}

#[test]
fn page_guards_redirect_to_login() {
    let client = create_test_server();

    let resp = client.get("/dashboard").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/login?reason=auth"));

    login(&client, DEMO_PARENT_EMAIL, DEMO_PARENT_PASSWORD);
    let resp = client.get("/dashboard").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/login?reason=denied"));

    let resp = client.get("/dashboard/progress").dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.get("/logout").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    let resp = client.get("/dashboard/progress").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/login?reason=auth"));
}

#[test]
fn attendance_api_save_and_revision() {
    let client = create_test_server();
    let token = api_token(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);
    let date = days_from_today(-2);

    let resp = client.get(format!("/api/attendance/{date}")).header(bearer(&token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let sheet = resp.into_json::<AttendanceSheet>().unwrap();
    assert_eq!(sheet.revision, 0);
    assert!(sheet.attendance.is_empty());

    let posted = PostedAttendance {
        attendance: HashMap::from([(1, true), (2, false)]),
        revision: Some(0),
    };
    let resp = client.put(format!("/api/attendance/{date}"))
        .header(bearer(&token))
        .json(&posted)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let saved = resp.into_json::<SavedAttendance>().unwrap();
    assert_eq!(saved.revision, 1);
    assert_eq!(saved.updated, 2);

    let resp = client.get(format!("/api/attendance/{date}")).header(bearer(&token)).dispatch();
    let sheet = resp.into_json::<AttendanceSheet>().unwrap();
    assert_eq!(sheet.revision, 1);
    assert_eq!(sheet.attendance.get(&1), Some(&true));
    assert_eq!(sheet.attendance.get(&2), Some(&false));

    // a save against a stale revision is turned away
    let resp = client.put(format!("/api/attendance/{date}"))
        .header(bearer(&token))
        .json(&posted)
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);

    // without an observed revision the save goes through
    let no_revision = PostedAttendance {
        attendance: HashMap::from([(1, false)]),
        revision: None,
    };
    let resp = client.put(format!("/api/attendance/{date}"))
        .header(bearer(&token))
        .json(&no_revision)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.into_json::<SavedAttendance>().unwrap().revision, 2);

    // more than 3 days ahead is locked
    let locked_date = days_from_today(5);
    let resp = client.put(format!("/api/attendance/{locked_date}"))
        .header(bearer(&token))
        .json(&no_revision)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let unknown_player = PostedAttendance {
        attendance: HashMap::from([(999, true)]),
        revision: None,
    };
    let resp = client.put(format!("/api/attendance/{date}"))
        .header(bearer(&token))
        .json(&unknown_player)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn attendance_dashboard_drafts() {
    let client = create_test_server();
    login(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);
    let token = api_token(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);
    let today = HqDate::today();

    // toggling twice lands back on the stored value
    let resp = client.post(format!("/dashboard/attendance/{today}/toggle/1")).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    let resp = client.post(format!("/dashboard/attendance/{today}/toggle/1")).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    let resp = client.post(format!("/dashboard/attendance/{today}/save")).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);

    let resp = client.get(format!("/api/attendance/{today}")).header(bearer(&token)).dispatch();
    let sheet = resp.into_json::<AttendanceSheet>().unwrap();
    assert_eq!(sheet.revision, 1);
    assert_eq!(sheet.attendance.get(&1), Some(&false));

    // a dirty draft survives switching to another date and back
    let resp = client.post(format!("/dashboard/attendance/{today}/toggle/1")).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    let other = days_from_today(1);
    let resp = client.get(format!("/dashboard/attendance?date={other}")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/dashboard/attendance?date={today}")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.post(format!("/dashboard/attendance/{today}/save")).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);

    let resp = client.get(format!("/api/attendance/{today}")).header(bearer(&token)).dispatch();
    let sheet = resp.into_json::<AttendanceSheet>().unwrap();
    assert_eq!(sheet.revision, 2);
    assert_eq!(sheet.attendance.get(&1), Some(&true));

    // locked dates cannot be toggled
    let locked_date = days_from_today(10);
    let resp = client.post(format!("/dashboard/attendance/{locked_date}/toggle/1")).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn attendance_dashboard_conflict_keeps_draft() {
    let client = create_test_server();
    login(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);
    let token = api_token(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);
    let today = HqDate::today();

    let resp = client.post(format!("/dashboard/attendance/{today}/toggle/1")).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);

    // someone else saves through the API in the meantime
    let posted = PostedAttendance {
        attendance: HashMap::from([(2, true)]),
        revision: None,
    };
    let resp = client.put(format!("/api/attendance/{today}"))
        .header(bearer(&token))
        .json(&posted)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    // the dashboard save sees the stale revision, the draft stays put
    let resp = client.post(format!("/dashboard/attendance/{today}/save")).dispatch();
    assert_eq!(resp.status(), Status::Conflict);
    let resp = client.post(format!("/dashboard/attendance/{today}/save")).dispatch();
    assert_eq!(resp.status(), Status::Conflict);
}

#[test]
fn tournament_lifecycle() {
    let client = create_test_server();
    let token = api_token(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);

    // close == open is rejected
    let mut invalid = posted_tournament();
    invalid.registration_close = invalid.registration_open;
    let resp = client.post("/api/tournaments").header(bearer(&token)).json(&invalid).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // date must be in the future
    let mut invalid = posted_tournament();
    invalid.date = days_from_today(0);
    let resp = client.post("/api/tournaments").header(bearer(&token)).json(&invalid).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let mut invalid = posted_tournament();
    invalid.age_groups = AgeGroups(vec![]);
    let resp = client.post("/api/tournaments").header(bearer(&token)).json(&invalid).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.post("/api/tournaments").header(bearer(&token)).json(&posted_tournament()).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let created = resp.into_json::<TournamentRecord>().unwrap();
    assert_eq!(created.status, TournamentStatus::Upcoming);

    let resp = client.get("/api/tournaments").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let tournaments = resp.into_json::<Vec<TournamentRecord>>().unwrap();
    assert_eq!(tournaments.len(), 2);

    // anyone can sign a team up while the window is open
    let resp = client.get(format!("/api/registrations/{}", created.id)).header(bearer(&token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp.into_json::<Vec<RegistrationRecord>>().unwrap().is_empty());

    let signup = PostedRegistration {
        team_name: "Fast Breakers".to_string(),
        captain_name: "Lena Ortiz".to_string(),
        phone: "555 0123".to_string(),
        email: "lena@example.com".to_string(),
        player_names: PlayerNames(vec!["Ana".into(), "Bea".into(), "Cal".into()]),
    };
    let resp = client.post(format!("/api/registrations/{}", created.id)).json(&signup).dispatch();
    assert_eq!(resp.status(), Status::Ok);

    // the write invalidated the cached list
    let resp = client.get(format!("/api/registrations/{}", created.id)).header(bearer(&token)).dispatch();
    assert_eq!(resp.into_json::<Vec<RegistrationRecord>>().unwrap().len(), 1);

    // too small a team is turned away
    let mut small = signup.clone();
    small.player_names = PlayerNames(vec!["Ana".into(), "Bea".into()]);
    let resp = client.post(format!("/api/registrations/{}", created.id)).json(&small).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // cancel is a status transition, the registrations stay readable
    let resp = client.put(format!("/api/tournaments/{}/cancel", created.id)).header(bearer(&token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let cancelled = resp.into_json::<TournamentRecord>().unwrap();
    assert_eq!(cancelled.status, TournamentStatus::Cancelled);

    let resp = client.put(format!("/api/tournaments/{}/cancel", created.id)).header(bearer(&token)).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.get(format!("/api/registrations/{}", created.id)).header(bearer(&token)).dispatch();
    assert_eq!(resp.into_json::<Vec<RegistrationRecord>>().unwrap().len(), 1);

    let resp = client.post(format!("/api/registrations/{}", created.id)).json(&signup).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn registrations_export() {
    let client = create_test_server();
    login(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);

    // seeded tournament has two teams, one with a comma in its name
    let resp = client.get("/dashboard/tournaments/1/registrations.csv").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body = resp.into_bytes().unwrap();
    assert!(body.starts_with(b"\xef\xbb\xbf"));
    let text = String::from_utf8(body[3..].to_vec()).unwrap();
    assert!(text.starts_with("Team,Captain,Phone,Email,Players,Registered"));
    assert!(text.contains("\"Hoop, There It Is\""));
    assert!(text.contains("Ava B|Ben K|Carl O"));

    // an empty list bounces back with a notice instead of a file
    let token = api_token(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);
    let resp = client.post("/api/tournaments").header(bearer(&token)).json(&posted_tournament()).dispatch();
    let created = resp.into_json::<TournamentRecord>().unwrap();
    let resp = client.get(format!("/dashboard/tournaments/{}/registrations.csv", created.id)).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(
        resp.headers().get_one("Location").unwrap(),
        format!("/dashboard/tournaments/{}/registrations?notice=empty", created.id)
    );

    // cancelling does not break the export
    let resp = client.put("/api/tournaments/1/cancel").header(bearer(&token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/dashboard/tournaments/1/registrations.csv").dispatch();
    assert_eq!(resp.status(), Status::Ok);
}

#[test]
fn players_roster() {
    let client = create_test_server();
    let token = api_token(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);

    let resp = client.get("/api/players").dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
    let parent_token = api_token(&client, DEMO_PARENT_EMAIL, DEMO_PARENT_PASSWORD);
    let resp = client.get("/api/players").header(bearer(&parent_token)).dispatch();
    assert_eq!(resp.status(), Status::Forbidden);

    let resp = client.get("/api/players").header(bearer(&token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let roster = resp.into_json::<Vec<PlayerRecord>>().unwrap();
    assert_eq!(roster.len(), 4);
    let ava = roster.iter().find(|p| p.name == "Ava Brooks").unwrap();
    assert_eq!(ava.program, Program::FiveDay);
    assert_eq!(ava.attended, 1);
    let malik = roster.iter().find(|p| p.name == "Malik Price").unwrap();
    assert_eq!(malik.attended, 0);

    let posted = PostedPlayer {
        name: "Theo Lane".to_string(),
        program: Program::ThreeDay,
        phone: None,
        age: Some(10),
        avatar: None,
    };
    let resp = client.post("/api/players").header(bearer(&token)).json(&posted).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let theo = resp.into_json::<PlayerRecord>().unwrap();
    assert_eq!(theo.attended, 0);

    let mut unnamed = posted.clone();
    unnamed.name = "  ".to_string();
    let resp = client.post("/api/players").header(bearer(&token)).json(&unnamed).dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // deleting a player takes their attendance rows along and unlinks the
    // demo parent, whose progress page falls back to the empty state
    let resp = client.delete(format!("/api/players/{}", ava.id)).header(bearer(&token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let yesterday = days_from_today(-1);
    let resp = client.get(format!("/api/attendance/{yesterday}")).header(bearer(&token)).dispatch();
    let sheet = resp.into_json::<AttendanceSheet>().unwrap();
    assert_eq!(sheet.attendance.get(&ava.id), None);
    login(&client, DEMO_PARENT_EMAIL, DEMO_PARENT_PASSWORD);
    let resp = client.get("/dashboard/progress").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp.into_string().unwrap().contains("No player is linked"));

    let resp = client.delete("/api/players/999").header(bearer(&token)).dispatch();
    assert_eq!(resp.status(), Status::NotFound);

    let resp = client.get("/api/players").header(bearer(&token)).dispatch();
    assert_eq!(resp.into_json::<Vec<PlayerRecord>>().unwrap().len(), 4);
}

#[test]
fn announcement_slot() {
    let client = create_test_server();

    let resp = client.get("/api/announcements").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let seeded = resp.into_json::<Option<AnnouncementRecord>>().unwrap().unwrap();
    assert!(seeded.message.contains("tryouts"));
    assert!(seeded.expires.is_some());

    let token = api_token(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);
    let posted = PostedAnnouncement {
        message: "Gym closed Friday".to_string(),
        expiry: ExpiryPolicy::Manual,
    };
    let resp = client.post("/api/announcements").header(bearer(&token)).json(&posted).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let current = resp.into_json::<AnnouncementRecord>().unwrap();
    assert_eq!(current.message, "Gym closed Friday");
    assert_eq!(current.expires, None);

    // a single slot: publishing replaced the seeded one
    let resp = client.get("/api/announcements").dispatch();
    let active = resp.into_json::<Option<AnnouncementRecord>>().unwrap().unwrap();
    assert_eq!(active.id, current.id);

    let resp = client.delete("/api/announcements").header(bearer(&token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/api/announcements").dispatch();
    assert!(resp.into_json::<Option<AnnouncementRecord>>().unwrap().is_none());
}

#[test]
fn public_pages_render() {
    let client = create_test_server();

    for path in ["/", "/about", "/programs", "/schedule", "/gallery", "/contact", "/tournaments", "/tournaments/1", "/login"] {
        let resp = client.get(path).dispatch();
        assert_eq!(resp.status(), Status::Ok, "page {path}");
    }
    let resp = client.get("/tournaments/999").dispatch();
    assert_eq!(resp.status(), Status::NotFound);

    login(&client, DEMO_COACH_EMAIL, DEMO_COACH_PASSWORD);
    for path in ["/dashboard", "/dashboard/roster", "/dashboard/attendance", "/dashboard/tournaments",
                 "/dashboard/tournaments/new", "/dashboard/tournaments/1/registrations", "/dashboard/announcement"] {
        let resp = client.get(path).dispatch();
        assert_eq!(resp.status(), Status::Ok, "page {path}");
    }
}
