pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while brokering tokens, talking to
/// spotify, or touching the store. Handlers catch these at the edge
/// and turn them into redirects or structured json errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // spotify sent the user back with an `error` param or no code
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    // the token endpoint said no, or said yes without a token
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("provider request to {endpoint} failed: {detail}")]
    ProviderRequest { endpoint: String, detail: String },

    #[error("track fetch failed: {0}")]
    TrackFetch(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn provider(endpoint: &str, detail: impl std::fmt::Display) -> Self {
        Error::ProviderRequest {
            endpoint: endpoint.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn token_exchange(detail: impl std::fmt::Display) -> Self {
        Error::TokenExchange(detail.to_string())
    }
}
