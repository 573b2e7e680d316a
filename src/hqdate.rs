use chrono::{DateTime, NaiveDate, TimeDelta};
use rocket::form::{self, FromFormField, ValueField};
use rocket::request::FromParam;
use rocket::serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// How far into the future an attendance day may be edited.
pub const EDIT_WINDOW_DAYS: i64 = 3;

/// Calendar date as used for attendance days and tournament dates,
/// stored as `YYYY-MM-DD` TEXT.
#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
pub struct HqDate(pub NaiveDate);

impl HqDate {
    pub fn today() -> Self {
        Self(chrono::Local::now().date_naive())
    }
    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self(NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?))
    }
    /// Attendance for a date more than [`EDIT_WINDOW_DAYS`] days ahead
    /// of `today` cannot be edited or saved.
    pub fn locked(&self, today: HqDate) -> bool {
        self.0 > today.0 + TimeDelta::days(EDIT_WINDOW_DAYS)
    }
    /// Day-by-day navigation, clamped at the ends of the calendar so a
    /// hand-crafted boundary date cannot overflow the arithmetic.
    pub fn prev_day(&self) -> Self {
        Self(self.0.checked_sub_signed(TimeDelta::days(1)).unwrap_or(self.0))
    }
    pub fn next_day(&self) -> Self {
        Self(self.0.checked_add_signed(TimeDelta::days(1)).unwrap_or(self.0))
    }
    pub fn is_past(&self, today: HqDate) -> bool {
        self.0 < today.0
    }
}

impl Display for HqDate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl<'a> FromParam<'a> for HqDate {
    type Error = chrono::ParseError;
    fn from_param(param: &'a str) -> Result<Self, Self::Error> {
        HqDate::parse(param)
    }
}

impl<'v> FromFormField<'v> for HqDate {
    fn from_value(field: ValueField<'v>) -> form::Result<'v, Self> {
        HqDate::parse(field.value)
            .map_err(|_| form::Error::validation("expected a YYYY-MM-DD date").into())
    }
}

impl<DB: sqlx::Database> sqlx::Type<DB> for HqDate
where
    str: sqlx::Type<DB>,
{
    fn type_info() -> <DB as sqlx::Database>::TypeInfo {
        // TEXT columns only
        <&str as sqlx::Type<DB>>::type_info()
    }
}
impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for HqDate
where
    &'r str: sqlx::Decode<'r, DB>,
{
    fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let value = <&str as sqlx::Decode<DB>>::decode(value)?;
        Ok(HqDate::parse(value)?)
    }
}
impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for HqDate {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        buf.push(sqlx::sqlite::SqliteArgumentValue::Text(std::borrow::Cow::Owned(
            self.to_string(),
        )));
        Ok(sqlx::encode::IsNull::No)
    }
}

pub(crate) fn datefmt(iso_date: &str) -> String {
    if let Ok(d) = HqDate::parse(iso_date) {
        d.0.format("%a %d %b %Y").to_string()
    } else {
        iso_date.to_string()
    }
}
pub(crate) fn dtfmt(iso_datetime: &str) -> String {
    if let Ok(dt) = DateTime::parse_from_rfc3339(iso_datetime) {
        dt.format("%d %b %Y %H:%M").to_string()
    } else {
        iso_datetime.to_string()
    }
}
