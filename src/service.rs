use cached::Cached;
use chrono::{Duration, Utc};
use sqlx::PgPool;

use crate::{crypto, history, models, recommend, spotify, tokens, Error, Result, CONFIG, LOG};

/// What we ask spotify for: listening history, top tracks, and enough
/// profile to greet the user.
const OAUTH_SCOPES: &str =
    "user-read-recently-played user-top-read user-read-email user-read-private";

macro_rules! resp {
    (json => $body:expr) => {{
        let mut r = tide::Response::new(200);
        r.set_body(tide::Body::from_json(&$body)?);
        r
    }};
    (status => $status:expr, message => $msg:expr) => {{
        tide::Response::builder($status)
            .body(serde_json::json!({ "error": $msg }))
            .build()
    }};
}

macro_rules! user_or_redirect {
    ($req:expr) => {{
        let user = get_auth_user(&$req).await;
        if user.is_none() {
            let path = $req.url().path();
            return Ok(tide::Redirect::new(format!(
                "{}/login?redirect={}",
                CONFIG.redirect_host(),
                path
            ))
            .into());
        }
        user.unwrap()
    }};
}

#[derive(Clone)]
struct Context {
    pool: sqlx::PgPool,
}

pub async fn start(pool: sqlx::PgPool) -> crate::Result<()> {
    let ctx = Context { pool };
    let mut app = tide::with_state(ctx);
    app.at("/").get(index);
    app.at("/status").get(status);
    app.at("/login").get(login);
    app.at("/callback").get(auth_callback);
    app.at("/dashboard").get(dashboard);
    app.at("/fetch-history").post(fetch_history);
    app.at("/generate-recommendations").post(generate_recommendations);
    app.at("/recommendations").get(recommendations);
    app.at("/history").get(listening_history);
    app.with(crate::logging::LogMiddleware::new());

    slog::info!(LOG, "running at {}", CONFIG.host());
    app.listen(CONFIG.host()).await?;
    Ok(())
}

/// Map a core failure onto its boundary response. Authentication
/// problems send the user back through login; everything else renders
/// as json with a status that matches the failure class.
fn error_response(err: Error) -> tide::Response {
    match &err {
        Error::NotAuthenticated | Error::RefreshFailed(_) => {
            slog::info!(LOG, "forcing re-login: {}", err);
            tide::Redirect::new(format!("{}/login", CONFIG.redirect_host())).into()
        }
        Error::InsufficientHistory => resp!(status => 422, message => err.to_string()),
        Error::Upstream(_) => {
            slog::error!(LOG, "upstream failure: {}", err);
            resp!(status => 502, message => "the music service returned an error, try again")
        }
        _ => {
            slog::error!(LOG, "internal failure: {:?}", err);
            resp!(status => 500, message => "internal error")
        }
    }
}

async fn index(_req: tide::Request<Context>) -> tide::Result {
    Ok(tide::Redirect::new(format!("{}/dashboard", CONFIG.redirect_host())).into())
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(_req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &CONFIG.version
    }))
}

#[derive(serde::Deserialize)]
struct MaybeRedirect {
    redirect: Option<String>,
}

/// The login process uses spotify to authenticate the current user,
/// which then redirects back to our callback url with a code we can
/// trade for reusable access and refresh tokens.
async fn login(req: tide::Request<Context>) -> tide::Result {
    let maybe_redirect: MaybeRedirect = req.query()?;
    let token = match new_one_time_login_token(maybe_redirect.redirect.clone()).await {
        Ok(token) => token,
        Err(e) => return Ok(error_response(e)),
    };
    slog::info!(
        LOG,
        "redirecting to spotify-auth with state token {}, post-redirect-redirect {:?}",
        token,
        maybe_redirect.redirect,
    );
    Ok(tide::Redirect::new(
        format!("https://accounts.spotify.com/authorize?client_id={id}&response_type=code&redirect_uri={redirect}&scope={scope}&state={state}",
                id = CONFIG.spotify_client_id,
                redirect = CONFIG.spotify_redirect_url(),
                scope = OAUTH_SCOPES,
                state = token)
    ).into())
}

#[derive(Debug, serde::Deserialize)]
struct SpotifyAuthCallback {
    code: Option<String>,
    state: String,
    error: Option<String>,
}

/// After we redirect users to spotify to login, spotify sends them back
/// to this endpoint. `code` is a single-use token that can be used to
/// retrieve a new pair of spotify api access and refresh tokens. `state`
/// is the one-time token we minted on the way out, asserting that this
/// login attempt happens exactly once.
async fn auth_callback(req: tide::Request<Context>) -> tide::Result {
    slog::info!(LOG, "got login redirect");
    let ctx = req.state();
    let callback: SpotifyAuthCallback = req.query()?;
    if !is_valid_one_time_login_token(&callback.state).await {
        return Ok(resp!(
            status => 400,
            message => format!("invalid one-time login token {}", callback.state)
        ));
    }
    if let Some(denied) = &callback.error {
        // the user bailed out of (or spotify rejected) the consent screen
        return Ok(resp!(status => 400, message => format!("spotify login denied: {}", denied)));
    }
    let code = match &callback.code {
        Some(code) => code,
        None => return Ok(resp!(status => 400, message => "no authorization code provided")),
    };
    let login_token = match decode_login_token(&callback.state) {
        Ok(token) => token,
        Err(e) => return Ok(error_response(e)),
    };

    let grant = match spotify::exchange_code(code).await {
        Ok(grant) => grant,
        Err(e) => return Ok(error_response(e)),
    };
    let api = spotify::Client::new(grant.access_token.clone());
    let me = match api.me().await {
        Ok(me) => me,
        Err(e) => return Ok(error_response(e)),
    };

    let new_auth_token = new_session_token(&me.id);
    let user = match upsert_login(&ctx.pool, &grant, &me, &new_auth_token).await {
        Ok(user) => user,
        Err(e) => return Ok(error_response(e)),
    };
    let is_new = user.created == user.modified;
    slog::info!(LOG, "completing user login: {}", user.spotify_id; "user_id" => user.id, "is_new" => is_new);

    let cookie_str = format!(
        "auth_token={token}; Domain={domain}; HttpOnly; Max-Age={max_age}; SameSite=Lax{secure}",
        token = &new_auth_token,
        domain = &CONFIG.domain(),
        max_age = CONFIG.auth_expiration_seconds,
        secure = if CONFIG.ssl { "; Secure" } else { "" },
    );

    // the one-time login token may carry the url the user was originally
    // trying to reach when we noticed they weren't logged in
    let destination = match login_token.redirect {
        Some(ref redirect) if !redirect.contains("login") => {
            format!("{}{}", CONFIG.redirect_host(), redirect)
        }
        _ => format!("{}/dashboard", CONFIG.redirect_host()),
    };
    let mut resp: tide::Response = tide::Redirect::new(destination).into();
    resp.insert_header("set-cookie", cookie_str);
    Ok(resp)
}

async fn dashboard(req: tide::Request<Context>) -> tide::Result {
    let user = user_or_redirect!(req);
    let ctx = req.state();
    let profile =
        match sqlx::query_as::<_, models::Profile>("select * from profiles where user_id = $1")
            .bind(user.id)
            .fetch_optional(&ctx.pool)
            .await
        {
            Ok(profile) => profile,
            Err(e) => return Ok(error_response(e.into())),
        };
    Ok(resp!(json => serde_json::json!({
        "user": user,
        "profile": profile,
    })))
}

async fn fetch_history(req: tide::Request<Context>) -> tide::Result {
    let user = user_or_redirect!(req);
    let ctx = req.state();
    match history::import_recent(&ctx.pool, &user).await {
        Ok(outcome) => Ok(resp!(json => outcome)),
        Err(e) => Ok(error_response(e)),
    }
}

async fn generate_recommendations(req: tide::Request<Context>) -> tide::Result {
    let user = user_or_redirect!(req);
    let ctx = req.state();
    match recommend::generate(&ctx.pool, &user).await {
        Ok(_count) => Ok(tide::Redirect::new(format!(
            "{}/recommendations",
            CONFIG.redirect_host()
        ))
        .into()),
        Err(e) => Ok(error_response(e)),
    }
}

#[derive(serde::Serialize)]
struct RecommendationsResponse {
    count: usize,
    recommendations: Vec<models::RecommendedTrack>,
}

async fn recommendations(req: tide::Request<Context>) -> tide::Result {
    let user = user_or_redirect!(req);
    let ctx = req.state();
    let rows = match sqlx::query_as::<_, models::RecommendedTrack>(
        "select r.score, r.reason, r.created,
                t.spotify_id, t.name, t.artist_names, t.album_name,
                t.album_image_url, t.preview_url, t.external_url
         from recommendations r
            inner join tracks t on t.id = r.track_id
         where r.user_id = $1
         order by r.score desc, r.created desc",
    )
    .bind(user.id)
    .fetch_all(&ctx.pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => return Ok(error_response(e.into())),
    };
    Ok(resp!(json => RecommendationsResponse {
        count: rows.len(),
        recommendations: rows,
    }))
}

#[derive(serde::Serialize)]
struct HistoryResponse {
    count: usize,
    history: Vec<models::PlayedTrack>,
}

async fn listening_history(req: tide::Request<Context>) -> tide::Result {
    let user = user_or_redirect!(req);
    let ctx = req.state();
    let rows = match sqlx::query_as::<_, models::PlayedTrack>(
        "select p.played_at,
                t.spotify_id, t.name, t.artist_names, t.album_name,
                t.album_image_url, t.external_url
         from plays p
            inner join tracks t on t.id = p.track_id
         where p.user_id = $1
         order by p.played_at desc
         limit 100",
    )
    .bind(user.id)
    .fetch_all(&ctx.pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => return Ok(error_response(e.into())),
    };
    Ok(resp!(json => HistoryResponse {
        count: rows.len(),
        history: rows,
    }))
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OneTimeLoginToken {
    token: String,
    redirect: Option<String>,
}

async fn new_one_time_login_token(redirect: Option<String>) -> Result<String> {
    let s = uuid::Uuid::new_v4().simple().to_string();
    let s = serde_json::to_string(&OneTimeLoginToken { token: s, redirect })
        .map_err(|e| Error::Internal(format!("token json error {}", e)))?;
    let s = base64::encode_config(&s, base64::URL_SAFE);
    let mut lock = crate::ONE_TIME_TOKENS.lock().await;
    lock.cache_set(s.clone(), ());
    Ok(s)
}

async fn is_valid_one_time_login_token(state: &str) -> bool {
    let mut lock = crate::ONE_TIME_TOKENS.lock().await;
    lock.cache_remove(&state.to_string()).is_some()
}

fn decode_login_token(state: &str) -> Result<OneTimeLoginToken> {
    let bytes = base64::decode_config(state, base64::URL_SAFE)
        .map_err(|e| Error::Internal(format!("state token decode error {}", e)))?;
    let s = String::from_utf8(bytes)
        .map_err(|e| Error::Internal(format!("state token utf8 error {}", e)))?;
    serde_json::from_str(&s).map_err(|e| Error::Internal(format!("state token json error {}", e)))
}

fn new_session_token(spotify_id: &str) -> String {
    let s = uuid::Uuid::new_v4().simple().to_string();
    let s = format!("{}:{}", spotify_id, s);
    let b = crypto::hash(s.as_bytes());
    hex::encode(&b)
}

/// Upsert everything a completed login gives us in one transaction:
/// the user row keyed on spotify_id, the (encrypted) oauth credential,
/// the cached profile, and a fresh session token.
async fn upsert_login(
    pool: &PgPool,
    grant: &spotify::TokenGrant,
    me: &spotify::PrivateUser,
    new_auth_token: &str,
) -> Result<models::User> {
    let refresh_token = grant
        .refresh_token
        .as_ref()
        .ok_or_else(|| Error::Upstream("token response missing refresh_token".to_string()))?;
    let sealed_access = crypto::seal(&grant.access_token)?;
    let sealed_refresh = crypto::seal(refresh_token)?;
    let expires_at = tokens::expiry_timestamp(Utc::now(), grant.expires_in);
    let auth_token_hash = crypto::hmac_sign(new_auth_token);
    let session_expires = Utc::now() + Duration::seconds(CONFIG.auth_expiration_seconds as i64);

    let mut tx = pool.begin().await?;
    let user = sqlx::query_as::<_, models::User>(
        "insert into users (spotify_id, email)
         values ($1, $2)
         on conflict (spotify_id) do update set email = excluded.email, modified = now()
         returning *",
    )
    .bind(&me.id)
    .bind(me.email.clone().unwrap_or_default())
    .fetch_one(&mut tx)
    .await?;

    sqlx::query(
        "insert into credentials
         (user_id, access_token, access_nonce, refresh_token, refresh_nonce, token_type, expires_at)
         values ($1, $2, $3, $4, $5, $6, $7)
         on conflict (user_id) do update set
         access_token = excluded.access_token, access_nonce = excluded.access_nonce,
         refresh_token = excluded.refresh_token, refresh_nonce = excluded.refresh_nonce,
         token_type = excluded.token_type, expires_at = excluded.expires_at,
         modified = now()",
    )
    .bind(user.id)
    .bind(&sealed_access.value)
    .bind(&sealed_access.nonce)
    .bind(&sealed_refresh.value)
    .bind(&sealed_refresh.nonce)
    .bind(&grant.token_type)
    .bind(expires_at)
    .execute(&mut tx)
    .await?;

    sqlx::query(
        "insert into profiles
         (user_id, spotify_id, display_name, email, country, image_url)
         values ($1, $2, $3, $4, $5, $6)
         on conflict (user_id) do update set
         spotify_id = excluded.spotify_id, display_name = excluded.display_name,
         email = excluded.email, country = excluded.country,
         image_url = excluded.image_url, modified = now()",
    )
    .bind(user.id)
    .bind(&me.id)
    .bind(me.display_name.clone().unwrap_or_default())
    .bind(me.email.clone().unwrap_or_default())
    .bind(me.country.clone().unwrap_or_default())
    .bind(me.image_url())
    .execute(&mut tx)
    .await?;

    sqlx::query("insert into auth_tokens (hash, user_id, expires) values ($1, $2, $3)")
        .bind(&auth_token_hash)
        .bind(user.id)
        .bind(session_expires)
        .execute(&mut tx)
        .await?;
    tx.commit().await?;

    Ok(user)
}

async fn get_auth_user(req: &tide::Request<Context>) -> Option<models::User> {
    let ctx = req.state();
    match req.cookie("auth_token") {
        None => {
            slog::debug!(LOG, "no auth token cookie found");
            None
        }
        Some(cookie) => {
            let token = cookie.value();
            let hash = crypto::hmac_sign(token);
            let user = sqlx::query_as::<_, models::User>(
                "select u.*
                 from users u
                    inner join auth_tokens at
                    on u.id = at.user_id
                 where at.hash = $1 and at.expires > now()",
            )
            .bind(&hash)
            .fetch_one(&ctx.pool)
            .await
            .ok();
            if let Some(ref user) = user {
                sqlx::query("delete from auth_tokens where user_id = $1 and expires <= now()")
                    .bind(user.id)
                    .execute(&ctx.pool)
                    .await
                    .ok();
            }
            user
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn one_time_login_tokens_are_single_use() {
        let token = new_one_time_login_token(Some("/history".to_string()))
            .await
            .expect("token error");
        assert!(is_valid_one_time_login_token(&token).await);
        // a second presentation of the same state must be rejected
        assert!(!is_valid_one_time_login_token(&token).await);
    }

    #[async_std::test]
    async fn one_time_login_tokens_round_trip_the_redirect() {
        let token = new_one_time_login_token(Some("/recommendations".to_string()))
            .await
            .expect("token error");
        let decoded = decode_login_token(&token).expect("decode error");
        assert_eq!(decoded.redirect.as_deref(), Some("/recommendations"));

        let token = new_one_time_login_token(None).await.expect("token error");
        let decoded = decode_login_token(&token).expect("decode error");
        assert!(decoded.redirect.is_none());
    }

    #[test]
    fn session_tokens_are_unique_per_mint() {
        let a = new_session_token("abc123");
        let b = new_session_token("abc123");
        assert_ne!(a, b);
        // hex encoded sha256
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
