#[derive(sqlx::FromRow, Debug, serde::Serialize)]
pub struct User {
    pub id: i64,
    // spotify user id, assumed unique since it's the account
    // identity reported by spotify itself
    pub spotify_id: String,
    pub email: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub modified: chrono::DateTime<chrono::Utc>,
}

#[derive(sqlx::FromRow, Debug)]
pub struct Credential {
    pub id: i64,
    pub user_id: i64,
    // a spotify access token that can be used to access the spotify
    // user's info. This value is AES_256_GCM encrypted using the
    // application secret set in the current environment and the
    // `access_nonce` generated when the value was originally encrypted.
    pub access_token: String,
    pub access_nonce: String,
    // a spotify token that can be used to refresh the spotify user's
    // access_token. Encrypted and stored the same way as the access_token.
    pub refresh_token: String,
    pub refresh_nonce: String,
    pub token_type: String,
    // when the current access_token lapses, stored with a safety
    // margin already subtracted
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub created: chrono::DateTime<chrono::Utc>,
    pub modified: chrono::DateTime<chrono::Utc>,
}

impl Credential {
    /// An expired credential must be refreshed before its access token
    /// is presented to the external service.
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(sqlx::FromRow, Debug, serde::Serialize)]
pub struct Profile {
    pub id: i64,
    pub user_id: i64,
    pub spotify_id: String,
    pub display_name: String,
    pub email: String,
    pub country: String,
    pub image_url: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub modified: chrono::DateTime<chrono::Utc>,
}

#[derive(sqlx::FromRow, Debug, serde::Serialize)]
pub struct Track {
    pub id: i64,
    pub spotify_id: String,
    pub name: String,
    pub artist_names: Vec<String>,
    pub album_name: String,
    pub album_image_url: String,
    pub preview_url: String,
    pub external_url: String,
    pub duration_ms: i64,
    pub created: chrono::DateTime<chrono::Utc>,
}

/// A play joined with its track, the shape returned by the history listing.
#[derive(sqlx::FromRow, Debug, serde::Serialize)]
pub struct PlayedTrack {
    pub played_at: chrono::DateTime<chrono::Utc>,
    pub spotify_id: String,
    pub name: String,
    pub artist_names: Vec<String>,
    pub album_name: String,
    pub album_image_url: String,
    pub external_url: String,
}

/// A recommendation joined with its track.
#[derive(sqlx::FromRow, Debug, serde::Serialize)]
pub struct RecommendedTrack {
    pub score: f64,
    pub reason: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub spotify_id: String,
    pub name: String,
    pub artist_names: Vec<String>,
    pub album_name: String,
    pub album_image_url: String,
    pub preview_url: String,
    pub external_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn credential_expiring_at(expires_at: chrono::DateTime<chrono::Utc>) -> Credential {
        Credential {
            id: 1,
            user_id: 1,
            access_token: String::new(),
            access_nonce: String::new(),
            refresh_token: String::new(),
            refresh_nonce: String::new(),
            token_type: "Bearer".to_string(),
            expires_at,
            created: Utc::now(),
            modified: Utc::now(),
        }
    }

    #[test]
    fn credential_expiry_is_inclusive() {
        let now = Utc::now();
        let cred = credential_expiring_at(now);
        assert!(cred.is_expired(now));
        assert!(cred.is_expired(now + Duration::seconds(1)));
        assert!(!cred.is_expired(now - Duration::seconds(1)));
    }
}
