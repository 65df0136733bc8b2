use cached::Cached;
use sqlx::SqlitePool;

use crate::{
    crypto, db, logging, models, resp, se, spotify, sync, Error, Result, CONFIG, LOG,
    ONE_TIME_TOKENS,
};

#[derive(Clone)]
pub struct Context {
    pub pool: SqlitePool,
}

async fn new_one_time_token() -> String {
    let token = uuid::Uuid::new_v4()
        .simple()
        .encode_lower(&mut uuid::Uuid::encode_buffer())
        .to_string();
    let mut lock = ONE_TIME_TOKENS.lock().await;
    lock.cache_set(token.clone(), ());
    token
}

// valid states are single-use, gone after the first check
async fn consume_one_time_token(token: &str) -> bool {
    let mut lock = ONE_TIME_TOKENS.lock().await;
    lock.cache_remove(&token.to_string()).is_some()
}

/// 302 back to the configured frontend results page with the given
/// query params appended.
fn results_redirect(params: &[(&str, &str)]) -> tide::Result {
    let url = tide::http::Url::parse_with_params(&CONFIG.frontend_results_url, params)
        .map_err(|e| se!("invalid results url {}: {}", CONFIG.frontend_results_url, e))?;
    Ok(tide::Redirect::new(url).into())
}

// store errors can carry connection details in their display text,
// everything else in the taxonomy is safe to show
fn public_detail(e: &Error) -> String {
    match e {
        Error::Store(_) | Error::Migrate(_) => "storage failure".to_string(),
        other => other.to_string(),
    }
}

fn storage_error(e: &Error) -> tide::Result {
    slog::error!(LOG, "storage failure"; "error" => %e);
    resp!(status => 500, json => serde_json::json!({ "error": "storage failure" }))
}

fn provider_error(what: &str, e: &Error) -> tide::Result {
    slog::error!(LOG, "provider request failed"; "endpoint" => what, "error" => %e);
    resp!(status => 500, json => serde_json::json!({
        "error": format!("{} unavailable", what),
        "details": public_detail(e),
    }))
}

async fn index(_req: tide::Request<Context>) -> tide::Result {
    Ok(tide::Redirect::new("/tracks").into())
}

async fn health(_req: tide::Request<Context>) -> tide::Result {
    resp!(json => serde_json::json!({
        "ok": "ok",
        "version": &CONFIG.version,
    }))
}

/// Kick off the authorization-code flow: mint a one-time state token
/// and send the browser to the provider's consent page.
async fn login(_req: tide::Request<Context>) -> tide::Result {
    let token = new_one_time_token().await;
    let url = match spotify::authorize_url(&token) {
        Ok(url) => url,
        Err(e) => {
            slog::error!(LOG, "login unavailable"; "error" => %e);
            return resp!(status => 500, json => serde_json::json!({
                "error": public_detail(&e),
            }));
        }
    };
    slog::info!(LOG, "redirecting to spotify auth"; "state" => &token);
    Ok(tide::Redirect::new(url).into())
}

#[derive(serde::Deserialize)]
struct AuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn store_user(
    pool: &SqlitePool,
    access: &spotify::Access,
    profile: &spotify::Profile,
) -> Result<models::User> {
    let access_token = crypto::encrypt(&access.access_token)?;
    let refresh_token = match &access.refresh_token {
        Some(token) => Some(crypto::encrypt(token)?),
        None => None,
    };
    db::upsert_user(
        pool,
        &db::UserUpsert {
            spotify_id: profile.id.as_str(),
            display_name: profile.display_name.as_deref(),
            email: profile.email.as_deref(),
            access_token: &access_token,
            refresh_token: refresh_token.as_ref(),
            access_expires: spotify::expiry_seconds_to_epoch(access.expires_in)?,
        },
    )
    .await
}

/// Handle the redirect back from the provider's consent page. Every
/// failure ends in a 302 to the frontend results page carrying an
/// `error` code so the browser never dead-ends on a json body.
async fn callback(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let params: AuthCallback = req.query()?;

    if let Some(denied) = params.error {
        slog::info!(LOG, "{}", Error::AuthorizationDenied(denied.clone()));
        return results_redirect(&[("error", denied.as_str())]);
    }
    let code = match params.code {
        Some(code) if !code.is_empty() => code,
        _ => return results_redirect(&[("error", "no_code")]),
    };
    match params.state {
        Some(state) if consume_one_time_token(&state).await => (),
        _ => return results_redirect(&[("error", "invalid_state")]),
    }
    if CONFIG.spotify_credentials().is_err() {
        return results_redirect(&[("error", "not_configured")]);
    }

    let access = match spotify::exchange_code(&code).await {
        Ok(access) => access,
        Err(e) => {
            slog::error!(LOG, "token exchange failed"; "error" => %e);
            return results_redirect(&[("error", "token_exchange_failed")]);
        }
    };
    let profile = match spotify::get_profile(&access.access_token).await {
        Ok(profile) => profile,
        Err(e) => {
            slog::error!(LOG, "profile fetch failed"; "error" => %e);
            return results_redirect(&[("error", "profile_fetch_failed")]);
        }
    };
    let user = match store_user(&ctx.pool, &access, &profile).await {
        Ok(user) => user,
        Err(e) => {
            slog::error!(LOG, "credential store failed"; "error" => %e);
            return results_redirect(&[("error", "store_error")]);
        }
    };

    slog::info!(LOG, "completing login"; "spotify_id" => &user.spotify_id);
    match sync::sync_saved_tracks(&ctx.pool, &access.access_token, Some(&user.spotify_id)).await {
        Ok(report) => {
            let saved = report.saved.to_string();
            results_redirect(&[("synced", saved.as_str())])
        }
        Err(failure) => {
            slog::error!(
                LOG, "sync failed during login";
                "saved" => failure.saved, "error" => %failure.error,
            );
            let saved = failure.saved.to_string();
            results_redirect(&[("error", "sync_failed"), ("synced", saved.as_str())])
        }
    }
}

async fn tracks(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    match db::list_tracks(&ctx.pool).await {
        Ok(tracks) => resp!(json => tracks),
        Err(e) => storage_error(&e),
    }
}

#[derive(serde::Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

async fn search(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let query: SearchQuery = req.query()?;
    let found = match query.q.as_deref() {
        Some(q) if !q.is_empty() => db::search_tracks(&ctx.pool, q).await,
        _ => db::list_tracks(&ctx.pool).await,
    };
    match found {
        Ok(tracks) => resp!(json => tracks),
        Err(e) => storage_error(&e),
    }
}

#[derive(serde::Deserialize)]
struct SongOfDayQuery {
    date: Option<String>,
}

// best effort when the mirror is empty: one live saved track,
// returned without persisting it
async fn live_song_of_day(pool: &SqlitePool) -> Option<spotify::TrackOut> {
    let token = match spotify::resolve_active_access_token(pool).await {
        Ok(token) => token,
        Err(e) => {
            slog::info!(LOG, "no usable token for live song of day"; "error" => %e);
            return None;
        }
    };
    match spotify::saved_tracks_page(&token, None).await {
        Ok(page) => page.tracks.into_iter().next(),
        Err(e) => {
            slog::info!(LOG, "live song of day fetch failed"; "error" => %e);
            None
        }
    }
}

/// One deterministic pick per calendar date over the whole mirror.
/// An empty mirror is not an error, the body is `null` when there is
/// nothing to pick and nothing could be fetched live.
async fn song_of_day(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let query: SongOfDayQuery = req.query()?;
    let date = match query.date {
        Some(raw) => match chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => {
                return resp!(status => 400, json => serde_json::json!({
                    "error": format!("invalid date {:?}, expected YYYY-MM-DD", raw),
                }))
            }
        },
        None => chrono::Utc::now().date_naive(),
    };

    let tracks = match db::list_tracks(&ctx.pool).await {
        Ok(tracks) => tracks,
        Err(e) => return storage_error(&e),
    };
    if let Some(track) = db::pick_for_date(&tracks, date, |t| t.id.as_str()) {
        return resp!(json => track);
    }
    match live_song_of_day(&ctx.pool).await {
        Some(track) => resp!(json => track),
        None => resp!(json => serde_json::Value::Null),
    }
}

async fn run_sync(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let user = match db::latest_user(&ctx.pool).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return resp!(status => 400, json => serde_json::json!({
                "error": "no authenticated user to sync",
            }))
        }
        Err(e) => return storage_error(&e),
    };
    let token = match spotify::user_access_token(&ctx.pool, &user).await {
        Ok(token) => token,
        Err(e) => {
            // nothing synced yet, but it is still a sync failure, not
            // a client error like the missing-user case above
            slog::error!(LOG, "token refresh failed"; "error" => %e);
            return resp!(status => 500, json => serde_json::json!({
                "error": "sync failed",
                "details": public_detail(&e),
                "saved": 0,
            }));
        }
    };

    match sync::sync_saved_tracks(&ctx.pool, &token, Some(&user.spotify_id)).await {
        Ok(report) => resp!(json => serde_json::json!({
            "ok": "ok",
            "saved": report.saved,
            "pages": report.pages,
        })),
        Err(failure) => {
            slog::error!(LOG, "sync failed"; "saved" => failure.saved, "error" => %failure.error);
            resp!(status => 500, json => serde_json::json!({
                "error": "sync failed",
                "details": public_detail(&failure.error),
                "saved": failure.saved,
            }))
        }
    }
}

/// Top tracks with a fallback chain: the top-items endpoint needs a
/// scope older grants may be missing, then recently-played, then the
/// saved-tracks collection which always exists for a logged-in user.
async fn top_tracks(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let token = match spotify::resolve_active_access_token(&ctx.pool).await {
        Ok(token) => token,
        Err(e) => return provider_error("top tracks", &e),
    };
    let found = match spotify::top_tracks(&token).await {
        Ok(tracks) => Ok(tracks),
        Err(first) => {
            slog::info!(LOG, "top tracks falling back to recently played"; "error" => %first);
            match spotify::recently_played(&token).await {
                Ok(tracks) => Ok(tracks),
                Err(second) => {
                    slog::info!(LOG, "recently played falling back to saved tracks"; "error" => %second);
                    spotify::saved_tracks_page(&token, None)
                        .await
                        .map(|page| page.tracks)
                }
            }
        }
    };
    match found {
        Ok(tracks) => resp!(json => tracks),
        Err(e) => provider_error("top tracks", &e),
    }
}

async fn top_artists(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let token = match spotify::resolve_active_access_token(&ctx.pool).await {
        Ok(token) => token,
        Err(e) => return provider_error("top artists", &e),
    };
    let found = match spotify::top_artists(&token).await {
        Ok(artists) => Ok(artists),
        Err(first) => {
            slog::info!(LOG, "top artists falling back to followed"; "error" => %first);
            spotify::followed_artists(&token).await
        }
    };
    match found {
        Ok(artists) => resp!(json => artists),
        Err(e) => provider_error("top artists", &e),
    }
}

async fn top_albums(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let token = match spotify::resolve_active_access_token(&ctx.pool).await {
        Ok(token) => token,
        Err(e) => return provider_error("top albums", &e),
    };
    let found = match spotify::top_track_albums(&token).await {
        Ok(albums) => Ok(albums),
        Err(first) => {
            slog::info!(LOG, "top albums falling back to saved"; "error" => %first);
            spotify::saved_albums(&token).await
        }
    };
    match found {
        Ok(albums) => resp!(json => albums),
        Err(e) => provider_error("top albums", &e),
    }
}

// featured playlists are public, an app token is enough
async fn featured_under_app_token() -> Result<Vec<spotify::PlaylistOut>> {
    let access = spotify::client_credentials().await?;
    spotify::featured_playlists(&access.access_token).await
}

async fn my_playlists(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    // a failed user-token resolve must not block the public fallback
    let found = match spotify::resolve_active_access_token(&ctx.pool).await {
        Ok(token) => match spotify::my_playlists(&token).await {
            Ok(playlists) => Ok(playlists),
            Err(first) => {
                slog::info!(LOG, "playlists falling back to featured"; "error" => %first);
                featured_under_app_token().await
            }
        },
        Err(e) => {
            slog::info!(LOG, "playlists falling back to featured"; "error" => %e);
            featured_under_app_token().await
        }
    };
    match found {
        Ok(playlists) => resp!(json => playlists),
        Err(e) => provider_error("playlists", &e),
    }
}

// public playlists are still readable with an app token
async fn playlist_detail_under_app_token(id: &str) -> Result<spotify::PlaylistDetailOut> {
    let access = spotify::client_credentials().await?;
    spotify::playlist_detail(&access.access_token, id).await
}

async fn playlist_detail(req: tide::Request<Context>) -> tide::Result {
    let id = req.param("id")?.to_string();
    let ctx = req.state();
    let found = match spotify::resolve_active_access_token(&ctx.pool).await {
        Ok(token) => match spotify::playlist_detail(&token, &id).await {
            Ok(detail) => Ok(detail),
            Err(first) => {
                slog::info!(LOG, "playlist detail retrying with app token"; "playlist" => &id, "error" => %first);
                playlist_detail_under_app_token(&id).await
            }
        },
        Err(e) => {
            slog::info!(LOG, "playlist detail retrying with app token"; "playlist" => &id, "error" => %e);
            playlist_detail_under_app_token(&id).await
        }
    };
    match found {
        Ok(detail) => resp!(json => detail),
        Err(e) => provider_error("playlist detail", &e),
    }
}

fn add_routes(app: &mut tide::Server<Context>) {
    app.at("/").get(index);
    app.at("/health").get(health);
    app.at("/login").get(login);
    app.at("/callback").get(callback);
    app.at("/tracks").get(tracks);
    app.at("/search").get(search);
    app.at("/song-of-day").get(song_of_day);
    app.at("/sync").post(run_sync);
    app.at("/my-playlists").get(my_playlists);
    app.at("/top-tracks").get(top_tracks);
    app.at("/top-artists").get(top_artists);
    app.at("/top-albums").get(top_albums);
    app.at("/playlist/:id").get(playlist_detail);
}

// everything is mounted twice, the frontend historically called some
// routes under an /auth prefix
fn build_app(pool: SqlitePool) -> tide::Server<Context> {
    let ctx = Context { pool };
    let mut app = tide::with_state(ctx.clone());
    app.with(logging::LogMiddleware::new());
    add_routes(&mut app);

    let mut prefixed = tide::with_state(ctx);
    add_routes(&mut prefixed);
    app.at("/auth").nest(prefixed);
    app
}

pub async fn start(pool: SqlitePool) -> Result<()> {
    let app = build_app(pool);
    slog::info!(LOG, "running at {}", CONFIG.host());
    app.listen(CONFIG.host()).await?;
    Ok(())
}
