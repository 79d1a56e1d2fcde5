//! `profiles` table access.
//!
//! DESIGN
//! ======
//! The primary key on `id` is the uniqueness constraint provisioning depends
//! on. A unique violation on insert is reported as
//! [`StoreError::DuplicateKey`] and never as a generic database error.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::profile::{NewProfile, Profile, ProfilePatch, ProfileStore, Role, StoreError};

/// [`ProfileStore`] backed by Postgres.
#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn profile_from_row(row: &PgRow) -> Result<Profile, StoreError> {
    let role: String = row.try_get("role")?;
    Ok(Profile {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        avatar_url: row.try_get("avatar_url")?,
        role: role.parse::<Role>()?,
        created_at: row.try_get::<Option<OffsetDateTime>, _>("created_at")?,
        updated_at: row.try_get::<Option<OffsetDateTime>, _>("updated_at")?,
    })
}

pub(crate) fn classify_insert_error(id: Uuid, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateKey(id),
        other => StoreError::Database(other),
    }
}

#[async_trait::async_trait]
impl ProfileStore for PgProfileStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Profile>, StoreError> {
        let row = sqlx::query(
            r"SELECT id, email, first_name, last_name, avatar_url, role, created_at, updated_at
              FROM profiles
              WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    async fn insert(&self, profile: &NewProfile) -> Result<Profile, StoreError> {
        let row = sqlx::query(
            r"INSERT INTO profiles (id, email, first_name, last_name, role)
              VALUES ($1, $2, $3, $4, $5)
              RETURNING id, email, first_name, last_name, avatar_url, role, created_at, updated_at",
        )
        .bind(profile.id)
        .bind(&profile.email)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(profile.role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_insert_error(profile.id, e))?;

        profile_from_row(&row)
    }

    async fn update(&self, id: Uuid, patch: &ProfilePatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"UPDATE profiles
              SET first_name = COALESCE($2, first_name),
                  last_name  = COALESCE($3, last_name),
                  avatar_url = COALESCE($4, avatar_url),
                  role       = COALESCE($5, role),
                  updated_at = now()
              WHERE id = $1",
        )
        .bind(id)
        .bind(&patch.first_name)
        .bind(&patch.last_name)
        .bind(&patch.avatar_url)
        .bind(patch.role.map(Role::as_str))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "profiles_test.rs"]
mod tests;
