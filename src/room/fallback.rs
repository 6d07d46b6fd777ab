use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::room::{Room, RoomConfig, Strategy};

pub struct Joined {
    pub room: Room,
    pub strategy: String,
}

/// Tries each strategy in order until one joins.
///
/// Every attempt runs as its own task bounded by `timeout`. A timed-out attempt
/// is aborted, and a room it managed to produce before the abort landed is left
/// straight away, so nothing from a losing attempt stays alive.
pub async fn join_with_fallback<F>(
    strategies: &[Arc<dyn Strategy>],
    config: &RoomConfig,
    room_name: &str,
    timeout: Duration,
    mut on_failure: F,
) -> Result<Joined>
where
    F: FnMut(&str, &AppError),
{
    for strategy in strategies {
        let name = strategy.name().to_string();
        tracing::info!("Attempting connection with {} strategy...", name);

        let mut attempt = {
            let strategy = strategy.clone();
            let config = config.clone();
            let room_name = room_name.to_string();
            tokio::spawn(async move { strategy.join_room(&config, &room_name).await })
        };

        let error = match tokio::time::timeout(timeout, &mut attempt).await {
            Ok(Ok(Ok(room))) => {
                tracing::info!("{} connection successfully established", name);
                return Ok(Joined { room, strategy: name });
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(join_error)) => AppError::Join {
                strategy: name.clone(),
                reason: join_error.to_string(),
            },
            Err(_) => {
                attempt.abort();
                if let Ok(Ok(late)) = attempt.await {
                    tracing::debug!("{} joined after its deadline, leaving", name);
                    if let Err(e) = late.handle.leave().await {
                        tracing::warn!("failed to leave late {} room: {}", name, e);
                    }
                }
                AppError::Timeout { strategy: name.clone() }
            }
        };

        tracing::warn!("{} connection failed: {}", name, error);
        on_failure(&name, &error);
    }

    Err(AppError::AllStrategiesFailed)
}
