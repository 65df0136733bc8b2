use sqlx::SqlitePool;

use crate::{db, spotify, Error, LOG, Result};

/// Outcome of a completed sync run.
#[derive(Debug, serde::Serialize)]
pub struct SyncReport {
    pub saved: u64,
    pub pages: u32,
}

/// A sync run that died partway through. `saved` counts the rows
/// written before the failure.
#[derive(Debug)]
pub struct SyncFailure {
    pub saved: u64,
    pub error: Error,
}

// bumps `saved` per row so callers keep an accurate partial tally
// when a write fails mid-page
async fn store_page(
    pool: &SqlitePool,
    tracks: &[spotify::TrackOut],
    owner: Option<&str>,
    saved: &mut u64,
) -> Result<()> {
    for track in tracks {
        db::upsert_track(
            pool,
            &db::TrackUpsert {
                id: &track.id,
                name: &track.name,
                artist: &track.artist,
                album: &track.album,
                owner_spotify_id: owner,
            },
        )
        .await?;
        *saved += 1;
    }
    Ok(())
}

/// Walk the provider's saved-tracks pages and mirror every track,
/// following each page's `next` url until there are none left.
/// Any failure aborts the walk and reports how many rows made it in.
pub async fn sync_saved_tracks(
    pool: &SqlitePool,
    access_token: &str,
    owner: Option<&str>,
) -> std::result::Result<SyncReport, SyncFailure> {
    let mut saved = 0;
    let mut pages = 0;
    let mut next: Option<String> = None;

    loop {
        let page = match spotify::saved_tracks_page(access_token, next.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                return Err(SyncFailure {
                    saved,
                    error: Error::TrackFetch(e.to_string()),
                })
            }
        };
        pages += 1;
        if let Err(error) = store_page(pool, &page.tracks, owner, &mut saved).await {
            return Err(SyncFailure { saved, error });
        }
        match page.next {
            Some(url) => next = Some(url),
            None => break,
        }
    }

    slog::info!(LOG, "synced saved tracks"; "saved" => saved, "pages" => pages);
    Ok(SyncReport { saved, pages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    async fn test_pool() -> SqlitePool {
        let pool = db::connect("sqlite::memory:", 1).await.expect("pool error");
        db::migrate(&pool).await.expect("migrate error");
        pool
    }

    // `tracks.owner_spotify_id` references `users`, so an owner row
    // has to exist before a track can be stamped with it
    async fn seed_owner(pool: &SqlitePool, spotify_id: &str) {
        let access = crypto::encrypt("owner-token").expect("encrypt error");
        db::upsert_user(
            pool,
            &db::UserUpsert {
                spotify_id,
                display_name: None,
                email: None,
                access_token: &access,
                refresh_token: None,
                access_expires: 0,
            },
        )
        .await
        .expect("upsert error");
    }

    fn track(id: &str, name: &str) -> spotify::TrackOut {
        spotify::TrackOut {
            id: id.to_string(),
            name: name.to_string(),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            image: None,
            duration: None,
            preview_url: None,
        }
    }

    async fn stored_ids(pool: &SqlitePool) -> Vec<String> {
        let rows: Vec<(String,)> = sqlx::query_as("select id from tracks order by id")
            .fetch_all(pool)
            .await
            .expect("select error");
        rows.into_iter().map(|(id,)| id).collect()
    }

    #[async_std::test]
    async fn store_page_counts_rows_and_stamps_owner() {
        let pool = test_pool().await;
        seed_owner(&pool, "user-1").await;
        let tracks = vec![track("a", "One"), track("b", "Two")];

        let mut saved = 0;
        store_page(&pool, &tracks, Some("user-1"), &mut saved)
            .await
            .expect("store error");
        assert_eq!(saved, 2);
        assert_eq!(stored_ids(&pool).await, vec!["a", "b"]);

        let (owner,): (Option<String>,) =
            sqlx::query_as("select owner_spotify_id from tracks where id = ?1")
                .bind("a")
                .fetch_one(&pool)
                .await
                .expect("select error");
        assert_eq!(owner.as_deref(), Some("user-1"));
    }

    #[async_std::test]
    async fn store_page_is_idempotent() {
        let pool = test_pool().await;
        let tracks = vec![track("a", "One")];

        let mut saved = 0;
        store_page(&pool, &tracks, None, &mut saved)
            .await
            .expect("store error");
        store_page(&pool, &tracks, None, &mut saved)
            .await
            .expect("store error");

        // both runs count as writes but the mirror still has one row
        assert_eq!(saved, 2);
        assert_eq!(stored_ids(&pool).await.len(), 1);
    }

    #[async_std::test]
    async fn store_page_keeps_partial_tally_on_write_failure() {
        let pool = test_pool().await;

        let mut saved = 0;
        store_page(&pool, &[track("a", "One")], None, &mut saved)
            .await
            .expect("store error");
        assert_eq!(saved, 1);

        pool.close().await;
        let result = store_page(&pool, &[track("b", "Two")], None, &mut saved).await;
        assert!(result.is_err());
        assert_eq!(saved, 1);
    }
}
