//! Account model and queries: users, roles, and profiles.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Row, postgres::PgRow};
use tracing::Instrument;
use uuid::Uuid;

/// The primary role of an account. Staff is administrative and cannot issue
/// barcodes; School accounts manage and share dynamic barcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    School,
    Staff,
}

impl Role {
    /// Resolves the primary role from the stored group memberships.
    #[must_use]
    pub fn from_groups(groups: &[String]) -> Option<Self> {
        if groups.iter().any(|group| group == "staff") {
            Some(Self::Staff)
        } else if groups.iter().any(|group| group == "school") {
            Some(Self::School)
        } else if groups.iter().any(|group| group == "user") {
            Some(Self::User)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::School => "school",
            Self::Staff => "staff",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub is_active: bool,
    pub groups: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    #[must_use]
    pub fn primary_role(&self) -> Option<Role> {
        Role::from_groups(&self.groups)
    }
}

impl<'r> FromRow<'r, PgRow> for UserRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            is_active: row.try_get("is_active")?,
            groups: row.try_get("groups")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub name: String,
    pub information_id: String,
    pub avatar: Option<Vec<u8>>,
    pub profile_uuid: Uuid,
}

impl<'r> FromRow<'r, PgRow> for UserProfile {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            information_id: row.try_get("information_id")?,
            avatar: row.try_get("avatar")?,
            profile_uuid: row.try_get("profile_uuid")?,
        })
    }
}

/// Outcome of a registration attempt; conflicts map to a client error
/// without leaking which usernames exist beyond the registration surface.
#[derive(Debug)]
pub enum SignupOutcome {
    Created(UserRecord),
    Conflict,
}

pub async fn get_by_username(pool: &PgPool, username: &str) -> Result<Option<UserRecord>> {
    let query = "SELECT * FROM users WHERE username = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, UserRecord>(query)
        .bind(username)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up user by username")
}

pub async fn get_by_id(pool: &PgPool, user_id: Uuid) -> Result<Option<UserRecord>> {
    let query = "SELECT * FROM users WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, UserRecord>(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up user by id")
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Creates the user and its profile in one transaction.
///
/// # Errors
/// Returns error if the database queries fail; username conflicts surface
/// as `SignupOutcome::Conflict`.
pub async fn create_with_profile(
    pool: &PgPool,
    username: &str,
    password_hash: &str,
    name: &str,
    information_id: &str,
) -> Result<SignupOutcome> {
    let mut tx = pool.begin().await.context("begin registration")?;

    let query = r"
        INSERT INTO users (username, password_hash)
        VALUES ($1, $2)
        RETURNING *
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let user = match sqlx::query_as::<_, UserRecord>(query)
        .bind(username)
        .bind(password_hash)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
    {
        Ok(user) => user,
        Err(err) if is_unique_violation(&err) => {
            let _ = tx.rollback().await;
            return Ok(SignupOutcome::Conflict);
        }
        Err(err) => return Err(err).context("failed to insert user"),
    };

    let query = r"
        INSERT INTO user_profiles (user_id, name, information_id)
        VALUES ($1, $2, $3)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user.id)
        .bind(name)
        .bind(information_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert user profile")?;

    tx.commit().await.context("commit registration")?;
    Ok(SignupOutcome::Created(user))
}

pub async fn get_profile(pool: &PgPool, user_id: Uuid) -> Result<Option<UserProfile>> {
    let query = "SELECT * FROM user_profiles WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, UserProfile>(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch user profile")
}

pub async fn update_profile(
    pool: &PgPool,
    user_id: Uuid,
    name: Option<&str>,
    information_id: Option<&str>,
    avatar: Option<&[u8]>,
) -> Result<()> {
    let query = r"
        UPDATE user_profiles
        SET name = COALESCE($1, name),
            information_id = COALESCE($2, information_id),
            avatar = COALESCE($3, avatar)
        WHERE user_id = $4
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(name)
        .bind(information_id)
        .bind(avatar)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update user profile")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn staff_wins_over_other_groups() {
        assert_eq!(
            Role::from_groups(&groups(&["user", "staff", "school"])),
            Some(Role::Staff)
        );
    }

    #[test]
    fn school_wins_over_user() {
        assert_eq!(
            Role::from_groups(&groups(&["user", "school"])),
            Some(Role::School)
        );
    }

    #[test]
    fn plain_user_resolves() {
        assert_eq!(Role::from_groups(&groups(&["user"])), Some(Role::User));
    }

    #[test]
    fn no_known_group_is_roleless() {
        assert_eq!(Role::from_groups(&groups(&["visitor"])), None);
        assert_eq!(Role::from_groups(&[]), None);
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Role::School).expect("json"),
            "\"school\""
        );
    }
}
