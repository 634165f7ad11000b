use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::now_ms;

const REAP_INTERVAL: Duration = Duration::from_secs(30);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Drop expired, unredeemed confirmation tokens once per pass.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = now_ms();
    let mut reaped = 0;
    for token in engine.collect_expired_confirmations(now) {
        match engine.expire_confirmation(&token, now).await {
            Ok(()) => reaped += 1,
            // Redeemed or already gone since the scan.
            Err(e) => debug!("reaper skip {token}: {e}"),
        }
    }
    reaped
}

/// Background task that periodically expires stale confirmations.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        let reaped = reap_once(&engine).await;
        if reaped > 0 {
            info!("expired {reaped} confirmation tokens");
        }
    }
}

/// Background task that rewrites the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!("WAL compaction after {appends} appends failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    use super::*;
    use crate::engine::EngineError;
    use crate::model::TimeRange;
    use crate::notify::NotifyHub;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("caresched_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_expires_stale_tokens_only() {
        // A negative TTL issues tokens that are already expired.
        let engine = Engine::new(test_wal_path("reap.wal"), Arc::new(NotifyHub::new()), -1).unwrap();
        let doctor = Ulid::new();
        engine.register_doctor(doctor, None).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 2, 5).unwrap();
        let range = TimeRange::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
        );
        let confirmation = engine
            .book_appointment(Ulid::new(), doctor, Ulid::new(), date, range, None)
            .await
            .unwrap();

        assert_eq!(reap_once(&engine).await, 1);
        assert!(engine.confirmation(&confirmation.token).is_none());
        assert!(matches!(
            engine.confirm_by_token(&confirmation.token, now_ms()).await,
            Err(EngineError::TokenExpired)
        ));
        assert_eq!(reap_once(&engine).await, 0);
        // The appointment itself stays booked.
        assert_eq!(engine.get_appointments(doctor, Some(date)).await.len(), 1);
    }
}
