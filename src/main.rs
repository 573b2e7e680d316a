#[macro_use] extern crate rocket;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use rocket::fs::FileServer;
use rocket::http::{CookieJar, Status};
use rocket::request;
use rocket::tokio::sync::RwLock;
use rocket_dyn_templates::handlebars::{Handlebars, Helper};
use rocket_dyn_templates::{handlebars, Template};
use std::collections::HashMap;

use crate::attendance::AttendanceDraft;
use crate::auth::{SessionUser, HQ_SESSION_ID};
use crate::db::DbPoolFairing;
use crate::hqdate::{datefmt, dtfmt, HqDate};
use crate::registrations::RegistrationCache;

#[cfg(test)]
mod tests;
mod announcements;
mod attendance;
mod auth;
mod coalesce;
mod db;
mod demo;
mod hqdate;
mod pages;
mod players;
mod registrations;
mod tournaments;
mod util;

/// Server-side session. Carries the authenticated user (the role is never
/// taken from the client) and the coach's unsaved attendance drafts. The
/// session id doubles as the API bearer token.
struct HqSession {
    user: SessionUser,
    expires: DateTime<Utc>,
    drafts: HashMap<HqDate, AttendanceDraft>,
}

#[derive(Eq, Hash, PartialEq)]
struct HqSessionId(String);

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for HqSessionId {
    type Error = ();
    async fn from_request(request: &'r request::Request<'_>) -> request::Outcome<HqSessionId, ()> {
        let cookies = request
            .guard::<&CookieJar<'_>>()
            .await
            .expect("request cookies");
        if let Some(cookie) = cookies.get_private(HQ_SESSION_ID) {
            return request::Outcome::Success(HqSessionId(cookie.value().to_string()));
        }
        request::Outcome::Forward(Status::Unauthorized)
    }
}

struct BearerToken(String);

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for BearerToken {
    type Error = ();
    async fn from_request(request: &'r request::Request<'_>) -> request::Outcome<BearerToken, ()> {
        if let Some(value) = request.headers().get_one("Authorization") {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return request::Outcome::Success(BearerToken(token.to_string()));
            }
        }
        request::Outcome::Forward(Status::Unauthorized)
    }
}

struct HqState {
    sessions: HashMap<HqSessionId, HqSession>,
}
impl HqState {
    fn new() -> Self {
        Self { sessions: Default::default() }
    }
}
type SharedHqState = RwLock<HqState>;

#[launch]
fn rocket() -> _ {
    let rocket = rocket::build()
        .attach(Template::custom(|engines| {
            let handlebars = &mut engines.handlebars;

            handlebars.register_helper("datefmt",
                                       Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                           let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("datefmt", 0))?.value();
                                           let s = val.as_str().map(datefmt).unwrap_or_default();
                                           out.write(&s)?;
                                           Ok(())
                                       }));
            handlebars.register_helper("dtfmt",
                                       Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                           let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("dtfmt", 0))?.value();
                                           let s = val.as_str().map(dtfmt).unwrap_or_default();
                                           out.write(&s)?;
                                           Ok(())
                                       }));
            handlebars.register_helper("join",
                                       Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                           let list = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("join", 0))?.value();
                                           let sep = h.param(1).and_then(|p| p.value().as_str()).unwrap_or(", ").to_string();
                                           let joined = list.as_array().map(|items| {
                                               items.iter()
                                                   .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                                                   .join(&sep)
                                           }).unwrap_or_default();
                                           out.write(&joined)?;
                                           Ok(())
                                       }));
        }))
        .attach(DbPoolFairing())
        .mount("/", FileServer::from("./static"));
    let rocket = pages::extend(rocket);
    let rocket = auth::extend(rocket);
    let rocket = players::extend(rocket);
    let rocket = attendance::extend(rocket);
    let rocket = tournaments::extend(rocket);
    let rocket = registrations::extend(rocket);
    let rocket = announcements::extend(rocket);
    let rocket = demo::extend(rocket);

    rocket
        .manage(SharedHqState::new(HqState::new()))
        .manage(RegistrationCache::default())
}
