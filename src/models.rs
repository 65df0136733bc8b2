#[derive(sqlx::FromRow, Debug)]
pub struct User {
    // stable account id reported by spotify, unique per account
    pub spotify_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    // a spotify access token that can be used to access
    // the spotify user's info. This value is AES_256_GCM
    // encrypted using the application secret set in the
    // current environment and the `access_nonce` generated
    // when the value was originally encrypted.
    pub access_token: String,
    pub access_nonce: String,
    // a spotify token that can be used to refresh the spotify
    // user's access_token. This is encrypted and stored the
    // same way as the actual access_token. Spotify may omit it
    // on re-authentication, in which case the previously stored
    // token is kept.
    pub refresh_token: Option<String>,
    pub refresh_nonce: Option<String>,
    // timestamp in seconds from epoch when the current
    // spotify access_token expires
    pub access_expires: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    // the row with the greatest updated_at is treated as the
    // active user when resolving tokens
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct Track {
    // spotify's track id
    pub id: String,
    pub name: String,
    // all contributing artists, joined with ", "
    pub artist: String,
    pub album: String,
    pub owner_spotify_id: Option<String>,
    // when this row was first mirrored, never reset by upserts
    pub created_at: chrono::DateTime<chrono::Utc>,
}
