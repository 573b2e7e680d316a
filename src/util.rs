use log::error;
use rocket::http::Status;
use rocket::response::Redirect;
use rocket::response::status::Custom;
use std::backtrace::Backtrace;

/// Error responder for HTML page routes: either bounce the visitor to the
/// login page or fail with a status + message like the API routes do.
#[derive(Responder)]
pub enum PageError {
    Redirect(Redirect),
    Failure(Custom<String>),
}

impl From<Custom<String>> for PageError {
    fn from(err: Custom<String>) -> Self {
        PageError::Failure(err)
    }
}

pub(crate) fn sqlx_to_custom_error(err: sqlx::Error) -> Custom<String> {
    error!("SQL Error: {err}\nbacktrace: {}", Backtrace::capture());
    Custom(Status::InternalServerError, format!("SQLx error: {}", err))
}
pub(crate) fn anyhow_to_custom_error(err: anyhow::Error) -> Custom<String> {
    error!("Error: {err}\nbacktrace: {}", Backtrace::capture());
    Custom(Status::InternalServerError, format!("Error: {}", err))
}
pub(crate) fn string_to_custom_error(err: &str) -> Custom<String> {
    Custom(Status::BadRequest, err.to_string())
}
pub(crate) fn sqlx_to_anyhow(err: sqlx::Error) -> anyhow::Error {
    error!("SQL Error: {err}\nbacktrace: {}", Backtrace::capture());
    anyhow::anyhow!("SQL error: {}", err)
}

/// Lowercase alphanumeric slug for download file names.
pub(crate) fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_dash = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("untitled");
    }
    out
}
