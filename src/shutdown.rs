// src/shutdown.rs
//! Cooperative stop signal shared by every long-running component.

use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// Sleep for `dur` unless cancelled first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(cancel: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}

/// Cancel `token` on ctrl-c. Best effort; nothing is flushed.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, stopping components");
            token.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancel() {
        let t = CancellationToken::new();
        assert!(sleep_or_cancel(&t, Duration::from_secs(30)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_sleep() {
        let t = CancellationToken::new();
        t.cancel();
        assert!(!sleep_or_cancel(&t, Duration::from_secs(3600)).await);
    }
}
