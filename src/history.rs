use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{models, spotify, tokens, Error, Result, LOG};

/// Spotify caps the recently-played endpoint at 50 events per request.
const RECENT_LIMIT: u32 = 50;

#[derive(Debug, serde::Serialize)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped: usize,
}

/// Pull the user's most recent playback events and persist the ones we
/// haven't seen. A play already recorded at the same (user, track,
/// played_at) is counted as skipped, never treated as an error, so
/// re-importing the same window is idempotent.
pub async fn import_recent(pool: &PgPool, user: &models::User) -> Result<ImportOutcome> {
    let client = tokens::authorized_client(pool, user).await?;
    let items = client.recently_played(RECENT_LIMIT).await?;

    let mut outcome = ImportOutcome {
        imported: 0,
        skipped: 0,
    };
    for item in &items {
        let spotify_id = match item.track.id.as_deref() {
            Some(id) => id,
            None => {
                // local files come back without an id, nothing to key the track on
                slog::debug!(LOG, "skipping recently played item without a track id");
                continue;
            }
        };
        let played_at = normalize_played_at(&item.played_at)?;
        let track = resolve_track(pool, spotify_id, &item.track).await?;
        let res = sqlx::query(
            "insert into plays (user_id, track_id, played_at)
             values ($1, $2, $3)
             on conflict (user_id, track_id, played_at) do nothing",
        )
        .bind(user.id)
        .bind(track.id)
        .bind(played_at)
        .execute(pool)
        .await?;
        if res.rows_affected() == 1 {
            outcome.imported += 1;
        } else {
            outcome.skipped += 1;
        }
    }
    slog::info!(
        LOG, "imported recently played for user {}", user.id;
        "imported" => outcome.imported,
        "skipped" => outcome.skipped,
    );
    Ok(outcome)
}

/// Spotify reports played_at as an rfc3339 string; normalize it to a
/// timezone-aware utc instant before it goes anywhere near the store.
pub fn normalize_played_at(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Upstream(format!("invalid played_at timestamp {:?}: {}", raw, e)))
}

/// Resolve or create the track row for a spotify id. First write wins:
/// conflicts leave the existing metadata untouched.
async fn resolve_track(
    pool: &PgPool,
    spotify_id: &str,
    track: &spotify::TrackObject,
) -> Result<models::Track> {
    sqlx::query(
        "insert into tracks
         (spotify_id, name, artist_names, album_name, album_image_url, preview_url, external_url, duration_ms)
         values ($1, $2, $3, $4, $5, $6, $7, $8)
         on conflict (spotify_id) do nothing",
    )
    .bind(spotify_id)
    .bind(&track.name)
    .bind(track.artist_names())
    .bind(&track.album.name)
    .bind(track.album_image_url())
    .bind(track.preview_url.clone().unwrap_or_default())
    .bind(track.open_url())
    .bind(track.duration_ms)
    .execute(pool)
    .await?;
    let track = sqlx::query_as::<_, models::Track>("select * from tracks where spotify_id = $1")
        .bind(spotify_id)
        .fetch_one(pool)
        .await?;
    Ok(track)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn normalizes_utc_timestamps() {
        let at = normalize_played_at("2024-03-01T12:34:56.789Z").expect("parse error");
        assert_eq!(
            at,
            Utc.ymd(2024, 3, 1).and_hms_milli(12, 34, 56, 789)
        );
    }

    #[test]
    fn normalizes_offset_timestamps_to_utc() {
        let at = normalize_played_at("2024-03-01T14:00:00+02:00").expect("parse error");
        assert_eq!(at, Utc.ymd(2024, 3, 1).and_hms(12, 0, 0));
    }

    #[test]
    fn rejects_garbage_timestamps() {
        let err = normalize_played_at("yesterday-ish").unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }
}
