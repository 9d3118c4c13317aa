//! Input fan-out (C6): writes fixed-layout HID reports to the USB gadget's
//! HID function endpoints. One endpoint per report type, each behind its own
//! mutex so a stuck write on one never blocks another.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::jiggler::ActivityTracker;

const KEYBOARD_HID_PATH: &str = "/dev/hidg0";
const MOUSE_HID_PATH: &str = "/dev/hidg1";
const WHEEL_HID_PATH: &str = "/dev/hidg2";

/// Tag byte for the binary report protocol carried on the "hid" data
/// channel: lets a low-latency client send reports as raw bytes instead of
/// a JSON-RPC call.
const REPORT_TAG_KEYBOARD: u8 = 1;
const REPORT_TAG_MOUSE: u8 = 2;
const REPORT_TAG_WHEEL: u8 = 3;

/// 8-byte boot-protocol-style keyboard report: modifier byte, reserved byte,
/// up to six simultaneous key codes.
fn keyboard_report(modifier: u8, keys: &[u8]) -> [u8; 8] {
    let mut report = [0u8; 8];
    report[0] = modifier;
    for (slot, code) in report[2..8].iter_mut().zip(keys.iter()) {
        *slot = *code;
    }
    report
}

/// 5-byte absolute mouse report: buttons, then 16-bit little-endian x and y.
fn abs_mouse_report(x: u16, y: u16, buttons: u8) -> [u8; 5] {
    let [x_lo, x_hi] = x.to_le_bytes();
    let [y_lo, y_hi] = y.to_le_bytes();
    [buttons, x_lo, x_hi, y_lo, y_hi]
}

/// Single signed byte: relative wheel notches, positive is scroll up.
fn wheel_report(wheel_y: i8) -> [u8; 1] {
    [wheel_y as u8]
}

/// One HID gadget endpoint. Reopens and retries once on a failed write,
/// since the gadget function can be torn down and recreated by the kernel
/// underneath a long-lived daemon.
struct HidEndpoint {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl HidEndpoint {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: Mutex::new(None) }
    }

    async fn open(&self) -> Result<File> {
        File::options()
            .write(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open HID endpoint {}", self.path.display()))
    }

    async fn write_report(&self, report: &[u8]) -> Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }

        let first_attempt = {
            let file = guard.as_mut().unwrap();
            file.write_all(report).await
        };

        if let Err(e) = first_attempt {
            tracing::warn!(path = %self.path.display(), error = %e, "HID write failed, reopening endpoint");
            let mut file = self.open().await?;
            file.write_all(report).await.with_context(|| format!("retry write to {} failed", self.path.display()))?;
            *guard = Some(file);
        }

        Ok(())
    }
}

/// Fans out keyboard/mouse/wheel reports to the three gadget HID endpoints.
pub struct HidFanOut {
    keyboard: HidEndpoint,
    mouse: HidEndpoint,
    wheel: HidEndpoint,
}

impl HidFanOut {
    pub fn new() -> Self {
        Self {
            keyboard: HidEndpoint::new(KEYBOARD_HID_PATH),
            mouse: HidEndpoint::new(MOUSE_HID_PATH),
            wheel: HidEndpoint::new(WHEEL_HID_PATH),
        }
    }

    #[cfg(test)]
    fn at_paths(keyboard: impl AsRef<Path>, mouse: impl AsRef<Path>, wheel: impl AsRef<Path>) -> Self {
        Self {
            keyboard: HidEndpoint::new(keyboard.as_ref().to_path_buf()),
            mouse: HidEndpoint::new(mouse.as_ref().to_path_buf()),
            wheel: HidEndpoint::new(wheel.as_ref().to_path_buf()),
        }
    }

    pub async fn keyboard_report(&self, modifier: u8, keys: &[u8]) -> Result<()> {
        self.keyboard.write_report(&keyboard_report(modifier, keys)).await
    }

    pub async fn abs_mouse_report(&self, x: u16, y: u16, buttons: u8) -> Result<()> {
        self.mouse.write_report(&abs_mouse_report(x, y, buttons)).await
    }

    pub async fn wheel_report(&self, wheel_y: i8) -> Result<()> {
        self.wheel.write_report(&wheel_report(wheel_y)).await
    }

    /// Wires the "hid" data channel (§4.4): incoming binary messages are a
    /// one-byte report tag followed by that report's payload, decoded and
    /// written the same way the `keyboardReport`/`absMouseReport`/
    /// `wheelReport` RPC methods do. Also starts the LED-state reader, which
    /// pushes `ledState` events back over this same channel whenever the
    /// host's keyboard indicator byte changes.
    pub async fn bind_data_channel(self: &Arc<Self>, activity: ActivityTracker, dc: Arc<RTCDataChannel>) {
        let fanout = Arc::clone(self);
        let activity_for_message = activity.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let fanout = Arc::clone(&fanout);
            let activity = activity_for_message.clone();
            Box::pin(async move {
                if msg.is_string {
                    tracing::debug!("Ignoring text frame on hid channel");
                    return;
                }
                activity.touch();
                if let Err(e) = fanout.handle_binary_report(&msg.data).await {
                    tracing::warn!(error = %e, "Failed to apply hid channel report");
                }
            })
        }))
        .await;

        self.spawn_led_state_reader(dc);
    }

    async fn handle_binary_report(&self, data: &[u8]) -> Result<()> {
        let (tag, payload) = data.split_first().context("empty hid report frame")?;
        match *tag {
            REPORT_TAG_KEYBOARD => {
                let modifier = *payload.first().context("keyboard report missing modifier byte")?;
                self.keyboard_report(modifier, &payload[1..]).await
            }
            REPORT_TAG_MOUSE => {
                anyhow::ensure!(payload.len() >= 5, "mouse report too short");
                let x = u16::from_le_bytes([payload[0], payload[1]]);
                let y = u16::from_le_bytes([payload[2], payload[3]]);
                self.abs_mouse_report(x, y, payload[4]).await
            }
            REPORT_TAG_WHEEL => {
                let wheel_y = *payload.first().context("wheel report missing delta byte")? as i8;
                self.wheel_report(wheel_y).await
            }
            other => anyhow::bail!("unknown hid report tag: {other}"),
        }
    }

    /// Best-effort: the keyboard gadget endpoint also carries the host's LED
    /// indicator byte (caps/num/scroll lock) on reads. Forwards each change
    /// as a `{"type":"ledState","value":..}` text frame until the channel or
    /// device goes away.
    fn spawn_led_state_reader(&self, dc: Arc<RTCDataChannel>) {
        let path = self.keyboard.path.clone();
        tokio::spawn(async move {
            let mut file = match File::options().read(true).open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    tracing::debug!(error = %e, path = %path.display(), "LED state reader unavailable");
                    return;
                }
            };

            let mut last = None;
            loop {
                let mut byte = [0u8; 1];
                if file.read_exact(&mut byte).await.is_err() {
                    return;
                }
                if last == Some(byte[0]) {
                    continue;
                }
                last = Some(byte[0]);
                let event = serde_json::json!({"type": "ledState", "value": byte[0]}).to_string();
                if dc.send_text(event).await.is_err() {
                    return;
                }
            }
        });
    }
}

impl Default for HidFanOut {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_report_places_modifier_and_keys() {
        let report = keyboard_report(0x02, &[0x04, 0x05]);
        assert_eq!(report, [0x02, 0x00, 0x04, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn keyboard_report_truncates_extra_keys() {
        let report = keyboard_report(0x00, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&report[2..8], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn abs_mouse_report_encodes_little_endian_axes() {
        let report = abs_mouse_report(0x0102, 0x0304, 0b101);
        assert_eq!(report, [0b101, 0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn wheel_report_preserves_sign() {
        assert_eq!(wheel_report(-5), [(-5i8) as u8]);
        assert_eq!(wheel_report(5), [5]);
    }

    #[tokio::test]
    async fn write_report_reopens_when_initial_file_removed() {
        let dir = std::env::temp_dir().join(format!("kvmd-hid-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let keyboard_path = dir.join("keyboard");
        let mouse_path = dir.join("mouse");
        let wheel_path = dir.join("wheel");
        std::fs::write(&keyboard_path, []).unwrap();
        std::fs::write(&mouse_path, []).unwrap();
        std::fs::write(&wheel_path, []).unwrap();

        let fanout = HidFanOut::at_paths(&keyboard_path, &mouse_path, &wheel_path);
        fanout.keyboard_report(0x01, &[0x04]).await.unwrap();
        fanout.abs_mouse_report(100, 200, 1).await.unwrap();
        fanout.wheel_report(-1).await.unwrap();

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn handle_binary_report_decodes_keyboard_tag() {
        let dir = std::env::temp_dir().join(format!("kvmd-hid-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let keyboard_path = dir.join("keyboard");
        let mouse_path = dir.join("mouse");
        let wheel_path = dir.join("wheel");
        std::fs::write(&keyboard_path, []).unwrap();
        std::fs::write(&mouse_path, []).unwrap();
        std::fs::write(&wheel_path, []).unwrap();

        let fanout = HidFanOut::at_paths(&keyboard_path, &mouse_path, &wheel_path);
        fanout.handle_binary_report(&[REPORT_TAG_KEYBOARD, 0x02, 0x04]).await.unwrap();
        fanout.handle_binary_report(&[REPORT_TAG_MOUSE, 0x10, 0x00, 0x20, 0x00, 0x01]).await.unwrap();
        fanout.handle_binary_report(&[REPORT_TAG_WHEEL, (-3i8) as u8]).await.unwrap();

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn handle_binary_report_rejects_unknown_tag() {
        let fanout = HidFanOut::at_paths("/dev/null", "/dev/null", "/dev/null");
        let err = fanout.handle_binary_report(&[0xFF, 0x00]).await.unwrap_err();
        assert!(err.to_string().contains("unknown hid report tag"));
    }

    #[tokio::test]
    async fn handle_binary_report_rejects_empty_frame() {
        let fanout = HidFanOut::at_paths("/dev/null", "/dev/null", "/dev/null");
        let err = fanout.handle_binary_report(&[]).await.unwrap_err();
        assert!(err.to_string().contains("empty hid report frame"));
    }
}
