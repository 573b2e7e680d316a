use log::{error, info};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Rocket};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::auth::{self, UserRole};

// macro to encode/decode a Display + FromStr type as SQL text
#[macro_export]
macro_rules! impl_sqlx_text_type_encode_decode {
    ($type:ident) => {
        impl<DB: sqlx::Database> sqlx::Type<DB> for $type
        where str: sqlx::Type<DB>
        {
            fn type_info() -> <DB as sqlx::Database>::TypeInfo {
                // TEXT columns only
                <&str as sqlx::Type<DB>>::type_info()
            }
        }

        impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for $type
        where &'r str: sqlx::Decode<'r, DB>
        {
            fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let value = <&str as sqlx::Decode<DB>>::decode(value)?;
                Ok(value.parse::<$type>()?)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $type {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                buf.push(sqlx::sqlite::SqliteArgumentValue::Text(
                    std::borrow::Cow::Owned(self.to_string()),
                ));
                Ok(sqlx::encode::IsNull::No)
            }
        }
    };
}

// macro to encode/decode a serde type as SQL JSON text
#[macro_export]
macro_rules! impl_sqlx_json_text_type_encode_decode {
    ($type:ident) => {
        impl<DB: sqlx::Database> sqlx::Type<DB> for $type
        where str: sqlx::Type<DB>
        {
            fn type_info() -> <DB as sqlx::Database>::TypeInfo {
                // TEXT columns only
                <&str as sqlx::Type<DB>>::type_info()
            }
        }

        impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for $type
        where &'r str: sqlx::Decode<'r, DB>
        {
            fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let value = <&str as sqlx::Decode<DB>>::decode(value)?;
                Ok(serde_json::from_str::<$type>(value)?)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $type {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                let json = serde_json::to_string(self)?;
                buf.push(sqlx::sqlite::SqliteArgumentValue::Text(
                    std::borrow::Cow::Owned(json),
                ));
                Ok(sqlx::encode::IsNull::No)
            }
        }
    };
}

static MIGRATOR: Migrator = sqlx::migrate!("db/migrations");

pub struct DbPool(pub SqlitePool);

pub struct DbPoolFairing();
#[rocket::async_trait]
impl Fairing for DbPoolFairing {
    fn info(&self) -> Info {
        Info {
            name: "SQLite Database Pool with Migrations",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let database_url = if cfg!(test) {
            "sqlite::memory:".to_string()
        } else {
            let figment = rocket.figment();
            let database_url = figment.extract_inner::<String>("database_url").expect("database_url");
            if database_url.starts_with("sqlite://") {
                let db_path = database_url.trim_start_matches("sqlite://");
                if !Path::new(db_path).exists() {
                    std::fs::File::create(db_path).expect("Failed to create SQLite database file");
                }
            }
            database_url
        };

        info!("Opening database: {database_url}");
        let opts = SqliteConnectOptions::from_str(&database_url).expect("valid sqlite url")
            .journal_mode(SqliteJournalMode::Wal); // use WAL for better concurrency
        let pool_opts = if cfg!(test) {
            // a second connection to :memory: would see an empty database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = match pool_opts.connect_with(opts).await {
            Ok(pool) => pool,
            Err(err) => {
                error!("Database connection error: {:?}", err);
                return Err(rocket);
            }
        };

        match MIGRATOR.run(&pool).await {
            Ok(_) => info!("Migrations applied successfully!"),
            Err(err) => {
                error!("Migration error: {:?}", err);
                return Err(rocket);
            }
        };

        if let Err(err) = bootstrap_coach(&rocket, &pool).await {
            error!("Coach bootstrap error: {:?}", err);
            return Err(rocket);
        }

        Ok(rocket.manage(DbPool(pool)))
    }
}

/// Creates the initial coach account when `bootstrap_coach_email` and
/// `bootstrap_coach_password` are configured and that account does not exist
/// yet, so a fresh deployment has someone able to log in.
async fn bootstrap_coach(rocket: &Rocket<Build>, pool: &SqlitePool) -> anyhow::Result<()> {
    let figment = rocket.figment();
    let (Ok(email), Ok(password)) = (
        figment.extract_inner::<String>("bootstrap_coach_email"),
        figment.extract_inner::<String>("bootstrap_coach_password"),
    ) else {
        return Ok(());
    };
    let name = figment
        .extract_inner::<String>("bootstrap_coach_name")
        .unwrap_or_else(|_| "Head Coach".to_string());
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE email=?")
        .bind(&email)
        .fetch_one(pool)
        .await?;
    if count.0 > 0 {
        return Ok(());
    }
    let password_hash = auth::hash_password(&password)?;
    sqlx::query("INSERT INTO users(name, email, password_hash, role) VALUES (?, ?, ?, ?)")
        .bind(&name)
        .bind(&email)
        .bind(&password_hash)
        .bind(UserRole::Coach)
        .execute(pool)
        .await?;
    info!("Bootstrap coach account created: {email}");
    Ok(())
}
