mod alias;
mod attachment;
mod certificate;
mod domain;
mod email;
mod session;
mod user;

pub use alias::*;
pub use attachment::*;
pub use certificate::*;
pub use domain::*;
pub use email::*;
pub use session::*;
pub use user::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Email(#[from] email_address::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
    #[error("access denied")]
    AccessDenied,
    #[error("too many requests, try again later")]
    TooManyRequests,
    #[error("{0}")]
    Quota(&'static str),
    #[error("invalid utf8")]
    FromUtf8(#[from] std::string::FromUtf8Error),
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("not found");
        }
        Error::Database(sql)
    }
}
