use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{crypto, models, Result};

pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

pub struct UserUpsert<'a> {
    pub spotify_id: &'a str,
    pub display_name: Option<&'a str>,
    pub email: Option<&'a str>,
    pub access_token: &'a crypto::Enc,
    // spotify may omit the refresh token on re-auth; `None` keeps
    // whatever is already stored for this user
    pub refresh_token: Option<&'a crypto::Enc>,
    pub access_expires: i64,
}

pub async fn upsert_user(pool: &SqlitePool, user: &UserUpsert<'_>) -> Result<models::User> {
    let now = Utc::now();
    let user = sqlx::query_as::<_, models::User>(
        "
        insert into
        users (
            spotify_id, display_name, email,
            access_token, access_nonce,
            refresh_token, refresh_nonce,
            access_expires,
            created_at, updated_at
        )
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
        on conflict (spotify_id) do update set display_name = excluded.display_name,
        email = excluded.email,
        access_token = excluded.access_token, access_nonce = excluded.access_nonce,
        refresh_token = coalesce(excluded.refresh_token, users.refresh_token),
        refresh_nonce = coalesce(excluded.refresh_nonce, users.refresh_nonce),
        access_expires = excluded.access_expires,
        updated_at = excluded.updated_at
        returning *
        ",
    )
    .bind(user.spotify_id)
    .bind(user.display_name)
    .bind(user.email)
    .bind(&user.access_token.value)
    .bind(&user.access_token.nonce)
    .bind(user.refresh_token.map(|enc| enc.value.as_str()))
    .bind(user.refresh_token.map(|enc| enc.nonce.as_str()))
    .bind(user.access_expires)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(user)
}

/// The most recently authenticated user, if anyone has ever logged in.
pub async fn latest_user(pool: &SqlitePool) -> Result<Option<models::User>> {
    let user =
        sqlx::query_as::<_, models::User>("select * from users order by updated_at desc limit 1")
            .fetch_optional(pool)
            .await?;
    Ok(user)
}

/// Store a freshly refreshed access token for `spotify_id`.
pub async fn update_user_access(
    pool: &SqlitePool,
    spotify_id: &str,
    access_token: &crypto::Enc,
    access_expires: i64,
) -> Result<models::User> {
    let user = sqlx::query_as::<_, models::User>(
        "
        update users set access_token = ?1, access_nonce = ?2, access_expires = ?3, updated_at = ?4
        where spotify_id = ?5
        returning *
        ",
    )
    .bind(&access_token.value)
    .bind(&access_token.nonce)
    .bind(access_expires)
    .bind(Utc::now())
    .bind(spotify_id)
    .fetch_one(pool)
    .await?;
    Ok(user)
}

pub struct TrackUpsert<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub artist: &'a str,
    pub album: &'a str,
    pub owner_spotify_id: Option<&'a str>,
}

pub async fn upsert_track(pool: &SqlitePool, track: &TrackUpsert<'_>) -> Result<()> {
    // created_at is deliberately left out of the update set so it
    // keeps recording when the track was first mirrored
    sqlx::query(
        "
        insert into tracks (id, name, artist, album, owner_spotify_id, created_at)
        values (?1, ?2, ?3, ?4, ?5, ?6)
        on conflict (id) do update set name = excluded.name, artist = excluded.artist,
        album = excluded.album, owner_spotify_id = excluded.owner_spotify_id
        ",
    )
    .bind(track.id)
    .bind(track.name)
    .bind(track.artist)
    .bind(track.album)
    .bind(track.owner_spotify_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_tracks(pool: &SqlitePool) -> Result<Vec<models::Track>> {
    let tracks =
        sqlx::query_as::<_, models::Track>("select * from tracks order by created_at desc, id")
            .fetch_all(pool)
            .await?;
    Ok(tracks)
}

/// Case-insensitive substring search over name, artist and album.
pub async fn search_tracks(pool: &SqlitePool, q: &str) -> Result<Vec<models::Track>> {
    let pattern = format!("%{}%", like_escape(q));
    let tracks = sqlx::query_as::<_, models::Track>(
        "
        select * from tracks
        where name like ?1 escape '\\'
           or artist like ?1 escape '\\'
           or album like ?1 escape '\\'
        order by created_at desc, id
        ",
    )
    .bind(&pattern)
    .fetch_all(pool)
    .await?;
    Ok(tracks)
}

// escape like wildcards so queries match them literally
fn like_escape(q: &str) -> String {
    q.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Deterministic pick for a calendar date: hash each id together with
/// the date and take the item with the smallest digest. The same date
/// always selects the same item until the list itself changes.
pub fn pick_for_date<'a, T>(items: &'a [T], date: NaiveDate, id_of: fn(&T) -> &str) -> Option<&'a T> {
    let date = date.format("%Y-%m-%d").to_string();
    items
        .iter()
        .min_by_key(|item| crypto::hash(format!("{}{}", id_of(item), date).as_bytes()))
}
