//! Remote shell (§4.x "terminal"): bridges the "terminal" data channel to a
//! PTY-backed shell process. Binary frames are raw PTY input/output; a text
//! frame carrying `{"rows":.., "cols":..}` resizes the PTY without being fed
//! to the shell. Closing the channel kills the process.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;
const SHELL: &str = "/bin/sh";

#[derive(Debug, Deserialize)]
struct ResizeMessage {
    rows: u16,
    cols: u16,
}

/// Owns one PTY-backed shell for the lifetime of one "terminal" data channel.
pub struct TerminalSession {
    master: StdMutex<Box<dyn MasterPty + Send>>,
    writer: StdMutex<Box<dyn std::io::Write + Send>>,
    child: StdMutex<Box<dyn Child + Send + Sync>>,
}

impl TerminalSession {
    /// Spawns a shell PTY and wires it to `dc`: PTY output is forwarded to
    /// the channel on a blocking reader thread, channel messages are
    /// dispatched to `handle_message`, and channel close kills the shell.
    pub async fn spawn(dc: Arc<RTCDataChannel>) -> Result<Arc<Self>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows: DEFAULT_ROWS, cols: DEFAULT_COLS, pixel_width: 0, pixel_height: 0 })
            .context("failed to allocate PTY")?;

        let mut cmd = CommandBuilder::new(SHELL);
        cmd.env("TERM", "xterm-256color");
        let child = pair.slave.spawn_command(cmd).context("failed to spawn shell")?;
        // The slave side only needs to stay open long enough to spawn the
        // child; the master side is what this session reads/writes/resizes.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().context("failed to clone PTY reader")?;
        let writer = pair.master.take_writer().context("failed to take PTY writer")?;

        let session = Arc::new(Self {
            master: StdMutex::new(pair.master),
            writer: StdMutex::new(writer),
            child: StdMutex::new(child),
        });

        spawn_output_pump(reader, Arc::clone(&dc));

        let session_for_message = Arc::clone(&session);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let session = Arc::clone(&session_for_message);
            Box::pin(async move {
                if let Err(e) = session.handle_message(msg) {
                    tracing::warn!(error = %e, "Failed to handle terminal channel message");
                }
            })
        }))
        .await;

        let session_for_close = Arc::clone(&session);
        dc.on_close(Box::new(move || {
            let session = Arc::clone(&session_for_close);
            Box::pin(async move { session.kill() })
        }))
        .await;

        Ok(session)
    }

    fn handle_message(&self, msg: DataChannelMessage) -> Result<()> {
        if msg.is_string {
            let text = std::str::from_utf8(&msg.data).context("terminal text frame was not valid UTF-8")?;
            let resize: ResizeMessage = serde_json::from_str(text).context("terminal text frame was not a resize message")?;
            self.resize(resize.rows, resize.cols)?;
            return Ok(());
        }

        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&msg.data).context("failed to write to PTY")?;
        Ok(())
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let master = self.master.lock().unwrap();
        master
            .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .context("failed to resize PTY")
    }

    fn kill(&self) {
        let mut child = self.child.lock().unwrap();
        if let Err(e) = child.kill() {
            tracing::debug!(error = %e, "Terminal shell process already exited");
        }
    }
}

use std::io::Write as _;

fn spawn_output_pump(mut reader: Box<dyn std::io::Read + Send>, dc: Arc<RTCDataChannel>) {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(32);

    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Terminal PTY read ended");
                    return;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = dc.send(&chunk).await {
                tracing::debug!(error = %e, "Terminal channel closed, stopping output pump");
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_message_parses_from_json() {
        let parsed: ResizeMessage = serde_json::from_str(r#"{"rows":40,"cols":120}"#).unwrap();
        assert_eq!(parsed.rows, 40);
        assert_eq!(parsed.cols, 120);
    }

    #[test]
    fn handle_message_rejects_non_json_text_frame() {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows: DEFAULT_ROWS, cols: DEFAULT_COLS, pixel_width: 0, pixel_height: 0 })
            .unwrap();
        let mut cmd = CommandBuilder::new(SHELL);
        cmd.env("TERM", "xterm-256color");
        let child = pair.slave.spawn_command(cmd).unwrap();
        drop(pair.slave);
        let writer = pair.master.take_writer().unwrap();

        let session = TerminalSession {
            master: StdMutex::new(pair.master),
            writer: StdMutex::new(writer),
            child: StdMutex::new(child),
        };

        let msg = DataChannelMessage { is_string: true, data: Bytes::from_static(b"not json") };
        assert!(session.handle_message(msg).is_err());
    }
}
