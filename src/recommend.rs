use sqlx::PgPool;

use crate::{models, spotify, tokens, Error, Result, LOG};

/// Seeds are the user's top tracks over roughly the last six months.
const TOP_TRACKS_LIMIT: u32 = 20;
/// Spotify accepts at most five seed tracks per recommendation query.
const SEED_TRACK_LIMIT: usize = 5;
const RESULT_LIMIT: u32 = 20;

/// The stored score is a placeholder confidence, not a ranking signal.
const FIXED_SCORE: f64 = 0.8;
const FIXED_REASON: &str = "Based on your listening history and top tracks";

/// Build a fresh recommendation set for the user: average the audio
/// features of their top tracks into a target vector, ask spotify for
/// tracks near it, and atomically replace whatever set was stored before.
///
/// Returns the number of rows inserted. Any upstream failure aborts the
/// run before the old set is touched.
pub async fn generate(pool: &PgPool, user: &models::User) -> Result<usize> {
    let client = tokens::authorized_client(pool, user).await?;

    let top = client
        .top_tracks(spotify::TimeRange::MediumTerm, TOP_TRACKS_LIMIT)
        .await?;
    let seeds: Vec<String> = top
        .iter()
        .filter_map(|t| t.id.clone())
        .take(SEED_TRACK_LIMIT)
        .collect();
    if seeds.is_empty() {
        return Err(Error::InsufficientHistory);
    }

    let features = client.audio_features(&seeds).await?;
    let targets = average_features(&features).ok_or(Error::InsufficientHistory)?;

    let recommended = client
        .recommendations(&seeds, &targets, RESULT_LIMIT)
        .await?;
    let inserted = replace_recommendations(pool, user.id, &recommended).await?;
    slog::info!(
        LOG, "generated recommendations for user {}", user.id;
        "seeds" => seeds.len(),
        "inserted" => inserted,
    );
    Ok(inserted)
}

/// Arithmetic mean of each feature across the vectors spotify could
/// analyze. Ids with no analysis come back as null and are excluded;
/// none surviving means there's nothing to aim the query at.
pub fn average_features(
    features: &[Option<spotify::AudioFeatures>],
) -> Option<spotify::FeatureTargets> {
    let usable: Vec<&spotify::AudioFeatures> = features.iter().flatten().collect();
    if usable.is_empty() {
        return None;
    }
    let n = usable.len() as f64;
    Some(spotify::FeatureTargets {
        danceability: usable.iter().map(|f| f.danceability).sum::<f64>() / n,
        energy: usable.iter().map(|f| f.energy).sum::<f64>() / n,
        valence: usable.iter().map(|f| f.valence).sum::<f64>() / n,
        tempo: usable.iter().map(|f| f.tempo).sum::<f64>() / n,
    })
}

/// Delete-then-insert inside one transaction so readers never observe a
/// half-replaced set. Duplicate tracks within a single response collapse
/// through the (user, track) uniqueness constraint.
async fn replace_recommendations(
    pool: &PgPool,
    user_id: i64,
    tracks: &[spotify::TrackObject],
) -> Result<usize> {
    let mut tx = pool.begin().await?;
    sqlx::query("delete from recommendations where user_id = $1")
        .bind(user_id)
        .execute(&mut tx)
        .await?;

    let mut inserted = 0;
    for track in tracks {
        let spotify_id = match track.id.as_deref() {
            Some(id) => id,
            None => continue,
        };
        // resolve or create the track row, first write wins for metadata
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
        .execute(&mut tx)
        .await?;
        let track_row =
            sqlx::query_as::<_, models::Track>("select * from tracks where spotify_id = $1")
                .bind(spotify_id)
                .fetch_one(&mut tx)
                .await?;

        let res = sqlx::query(
            "insert into recommendations (user_id, track_id, score, reason)
             values ($1, $2, $3, $4)
             on conflict (user_id, track_id) do nothing",
        )
        .bind(user_id)
        .bind(track_row.id)
        .bind(FIXED_SCORE)
        .bind(FIXED_REASON)
        .execute(&mut tx)
        .await?;
        if res.rows_affected() == 1 {
            inserted += 1;
        }
    }
    tx.commit().await?;
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(danceability: f64, energy: f64, valence: f64, tempo: f64) -> spotify::AudioFeatures {
        spotify::AudioFeatures {
            id: "t".to_string(),
            danceability,
            energy,
            valence,
            tempo,
        }
    }

    #[test]
    fn averages_each_feature_independently() {
        let input = vec![
            Some(features(0.2, 0.4, 0.6, 100.0)),
            Some(features(0.4, 0.8, 0.2, 140.0)),
        ];
        let targets = average_features(&input).expect("no targets");
        assert!((targets.danceability - 0.3).abs() < 1e-9);
        assert!((targets.energy - 0.6).abs() < 1e-9);
        assert!((targets.valence - 0.4).abs() < 1e-9);
        assert!((targets.tempo - 120.0).abs() < 1e-9);
    }

    #[test]
    fn null_feature_vectors_are_excluded_from_the_mean() {
        let input = vec![
            Some(features(0.5, 0.5, 0.5, 100.0)),
            None,
            Some(features(1.0, 1.0, 1.0, 200.0)),
            None,
        ];
        let targets = average_features(&input).expect("no targets");
        assert!((targets.danceability - 0.75).abs() < 1e-9);
        assert!((targets.tempo - 150.0).abs() < 1e-9);
    }

    #[test]
    fn all_null_features_yield_no_targets() {
        let input: Vec<Option<spotify::AudioFeatures>> = vec![None, None];
        assert!(average_features(&input).is_none());
        assert!(average_features(&[]).is_none());
    }

    #[test]
    fn single_vector_average_is_identity() {
        let input = vec![Some(features(0.31, 0.62, 0.93, 87.5))];
        let targets = average_features(&input).expect("no targets");
        assert_eq!(
            targets,
            spotify::FeatureTargets {
                danceability: 0.31,
                energy: 0.62,
                valence: 0.93,
                tempo: 87.5,
            }
        );
    }
}
