use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::{crypto, models, spotify, Error, Result, LOG};

/// Stored expiries are shaved by a margin so a token is never presented
/// right as it lapses mid-request.
const EXPIRY_MARGIN_SECONDS: u64 = 60;

pub fn expiry_timestamp(now: DateTime<Utc>, expires_in: u64) -> DateTime<Utc> {
    now + Duration::seconds(expires_in.saturating_sub(EXPIRY_MARGIN_SECONDS) as i64)
}

/// Look up the user's stored oauth grant and return an api client holding
/// a usable access token, refreshing (and persisting the refreshed grant)
/// first if the stored one has lapsed.
///
/// Fails with `NotAuthenticated` when the user has no credential at all
/// and `RefreshFailed` when spotify rejects the stored refresh token --
/// both mean the caller should send the user back through login.
pub async fn authorized_client(pool: &PgPool, user: &models::User) -> Result<spotify::Client> {
    let cred =
        sqlx::query_as::<_, models::Credential>("select * from credentials where user_id = $1")
            .bind(user.id)
            .fetch_optional(pool)
            .await?
            .ok_or(Error::NotAuthenticated)?;

    if !cred.is_expired(Utc::now()) {
        let access = crypto::open(&crypto::Sealed {
            value: cred.access_token.clone(),
            nonce: cred.access_nonce.clone(),
        })?;
        return Ok(spotify::Client::new(access));
    }

    slog::info!(LOG, "refreshing access token for user {}", user.id);
    let refresh = crypto::open(&crypto::Sealed {
        value: cred.refresh_token.clone(),
        nonce: cred.refresh_nonce.clone(),
    })?;
    let grant = spotify::refresh_access_token(&refresh)
        .await
        .map_err(|e| match e {
            Error::Upstream(msg) => Error::RefreshFailed(msg),
            other => other,
        })?;

    let sealed_access = crypto::seal(&grant.access_token)?;
    let expires_at = expiry_timestamp(Utc::now(), grant.expires_in);
    match grant.refresh_token.as_ref() {
        // spotify occasionally rotates the refresh token on refresh
        Some(rotated) => {
            let sealed_refresh = crypto::seal(rotated)?;
            sqlx::query(
                "update credentials set
                    access_token = $1, access_nonce = $2,
                    refresh_token = $3, refresh_nonce = $4,
                    expires_at = $5, modified = now()
                 where user_id = $6",
            )
            .bind(&sealed_access.value)
            .bind(&sealed_access.nonce)
            .bind(&sealed_refresh.value)
            .bind(&sealed_refresh.nonce)
            .bind(expires_at)
            .bind(user.id)
            .execute(pool)
            .await?;
        }
        None => {
            sqlx::query(
                "update credentials set
                    access_token = $1, access_nonce = $2,
                    expires_at = $3, modified = now()
                 where user_id = $4",
            )
            .bind(&sealed_access.value)
            .bind(&sealed_access.nonce)
            .bind(expires_at)
            .bind(user.id)
            .execute(pool)
            .await?;
        }
    }

    Ok(spotify::Client::new(grant.access_token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_timestamp_keeps_a_margin() {
        let now = Utc::now();
        let at = expiry_timestamp(now, 3600);
        assert_eq!(at, now + Duration::seconds(3540));
    }

    #[test]
    fn expiry_timestamp_saturates_short_grants() {
        let now = Utc::now();
        // grants shorter than the margin expire immediately rather than
        // underflowing into the far future
        let at = expiry_timestamp(now, 30);
        assert_eq!(at, now);
    }
}
