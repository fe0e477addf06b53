use std::sync::Arc;

use anyhow::Context;
use time::format_description::{self, OwnedFormatItem};
use time::macros::format_description;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Bounds and timestamp formats every [`UserDto`](crate::users::dto::UserDto) validates against.
#[derive(Debug, Clone)]
pub struct UserRules {
    pub username_max_chars: usize,
    pub password_hash_max_chars: usize,
    pub email_max_chars: usize,
    /// Textual timestamp format of store rows.
    pub store_datetime: OwnedFormatItem,
    /// HTML-compatible timestamp format used when serializing.
    pub display_datetime: OwnedFormatItem,
}

impl Default for UserRules {
    fn default() -> Self {
        Self {
            username_max_chars: 64,
            password_hash_max_chars: 72,
            email_max_chars: 256,
            store_datetime: OwnedFormatItem::from(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            )),
            display_datetime: OwnedFormatItem::from(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second]"
            )),
        }
    }
}

impl UserRules {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let store_datetime = match std::env::var("STORE_DATETIME_FORMAT") {
            Ok(raw) => format_description::parse_owned::<2>(&raw)
                .with_context(|| format!("parse STORE_DATETIME_FORMAT {raw:?}"))?,
            Err(_) => defaults.store_datetime,
        };
        let display_datetime = match std::env::var("DISPLAY_DATETIME_FORMAT") {
            Ok(raw) => format_description::parse_owned::<2>(&raw)
                .with_context(|| format!("parse DISPLAY_DATETIME_FORMAT {raw:?}"))?,
            Err(_) => defaults.display_datetime,
        };
        Ok(Self {
            username_max_chars: env_parse("USERNAME_MAX_CHARS", defaults.username_max_chars)?,
            password_hash_max_chars: env_parse(
                "PASSWORD_HASH_MAX_CHARS",
                defaults.password_hash_max_chars,
            )?,
            email_max_chars: env_parse("EMAIL_MAX_CHARS", defaults.email_max_chars)?,
            store_datetime,
            display_datetime,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    /// Include exception chains and backtraces in error bodies.
    pub dev_mode: bool,
    /// `navigateTo` target after a successful login.
    pub home_path: String,
    /// `navigateTo` target after creating, updating or deleting a user.
    pub users_path: String,
    pub user_rules: Arc<UserRules>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET is not set")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "userdesk".into()),
            audience: std::env::var("JWT_AUDIENCE")
                .unwrap_or_else(|_| "userdesk-clients".into()),
            ttl_minutes: env_parse("JWT_TTL_MINUTES", 60)?,
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES", 60 * 24 * 14)?,
        };
        let dev_mode = std::env::var("APP_DEV_MODE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Ok(Self {
            database_url,
            jwt,
            dev_mode,
            home_path: std::env::var("HOME_PATH").unwrap_or_else(|_| "/users".into()),
            users_path: std::env::var("USERS_PATH").unwrap_or_else(|_| "/users".into()),
            user_rules: Arc::new(UserRules::from_env()?),
        })
    }
}

/// `default` when `key` is unset; a value that does not parse fails startup.
fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("parse {key} {raw:?}")),
        Err(_) => Ok(default),
    }
}
