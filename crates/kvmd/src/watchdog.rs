//! Hardware watchdog heartbeat: pets `/dev/watchdog` on a fixed interval so
//! the kernel driver doesn't force a reboot, and disarms it with the magic
//! close byte on graceful shutdown.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const WATCHDOG_PATH: &str = "/dev/watchdog";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Writing this byte before close tells the driver to disarm rather than
/// leave the timer running (the kernel's "magic close" convention).
const MAGIC_CLOSE_BYTE: u8 = b'V';

/// Opens `/dev/watchdog` and writes a heartbeat byte every
/// [`HEARTBEAT_INTERVAL`] until `token` is cancelled, then writes the magic
/// close byte so the watchdog doesn't fire after this process exits.
///
/// If the device is missing (no hardware watchdog, or not running as root),
/// logs a warning once and returns without looping — this daemon still
/// needs to run on development hosts that lack one.
pub async fn run(token: CancellationToken) {
    let file = match open_watchdog(Path::new(WATCHDOG_PATH)).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(error = %e, "Watchdog device unavailable, heartbeat disabled");
            return;
        }
    };

    tracing::info!(path = WATCHDOG_PATH, interval_secs = HEARTBEAT_INTERVAL.as_secs(), "Watchdog heartbeat started");
    heartbeat_loop(file, token).await;
}

async fn heartbeat_loop(mut file: File, token: CancellationToken) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = file.write_all(&[0u8]).await {
                    tracing::error!(error = %e, "Failed to pet watchdog");
                }
            }
            _ = token.cancelled() => {
                if let Err(e) = file.write_all(&[MAGIC_CLOSE_BYTE]).await {
                    tracing::warn!(error = %e, "Failed to disarm watchdog on shutdown");
                }
                tracing::info!("Watchdog disarmed for graceful shutdown");
                return;
            }
        }
    }
}

async fn open_watchdog(path: &Path) -> Result<File> {
    File::options().write(true).open(path).await.with_context(|| format!("failed to open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disarms_with_magic_byte_on_cancel() {
        let path = std::env::temp_dir().join(format!("kvmd-watchdog-test-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, []).unwrap();

        let file = open_watchdog(&path).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        heartbeat_loop(file, token).await;

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.last(), Some(&MAGIC_CLOSE_BYTE));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn pets_on_each_tick_before_cancel() {
        let path = std::env::temp_dir().join(format!("kvmd-watchdog-test-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, []).unwrap();

        let file = open_watchdog(&path).await.unwrap();
        let token = CancellationToken::new();
        let token_clone = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            token_clone.cancel();
        });
        heartbeat_loop(file, token).await;

        let contents = std::fs::read(&path).unwrap();
        assert!(!contents.is_empty());

        std::fs::remove_file(&path).ok();
    }
}
