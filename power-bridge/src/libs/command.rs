//! Remote commands: classification of raw command strings and their serial frames.

use std::io::Error as IoError;

use log::{info, warn};
use thiserror::Error;

use super::{frame_codec, serial_link::FrameSink};

/// Command to switch every component off.
pub const TURN_OFF_ALL: &'static str = "TURNOFFALL";
/// Prefix of toggle commands such as `TOGGLE:2:ON`.
pub const TOGGLE_PREFIX: &'static str = "TOGGLE:";

const TOGGLE_MIN_LEN: usize = 11;
const TOGGLE_ID_OFFSET: usize = 7;
const TOGGLE_SEP_OFFSET: usize = 8;
const TOGGLE_STATE_OFFSET: usize = 9;

/// A component of the subordinate controller, always in `1..=3`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComponentId(u8);

/// A frame write failed. Frames before it were already sent.
#[derive(Debug, Error)]
#[error("sent {sent} of {total} frames: {source}")]
pub struct DispatchError {
    pub sent: usize,
    pub total: usize,
    #[source]
    pub source: IoError,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandEvent {
    Toggle { id: ComponentId, state: bool },
    TurnOffAll,
    Invalid(String),
}

impl ComponentId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 3;

    pub fn new(id: u8) -> Option<Self> {
        match (Self::MIN..=Self::MAX).contains(&id) {
            false => None,
            true => Some(ComponentId(id)),
        }
    }

    /// All components in ascending order.
    pub fn all() -> impl Iterator<Item = ComponentId> {
        (Self::MIN..=Self::MAX).map(ComponentId)
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

/// Classify a raw command string.
///
/// `TOGGLE:<d>:<state>` needs at least 11 bytes, the digit `1`~`3` at offset 7 and `:` at
/// offset 8. The state is `ON` for on and anything else for off.
pub fn classify(raw: &str) -> CommandEvent {
    if raw == TURN_OFF_ALL {
        return CommandEvent::TurnOffAll;
    }
    if !raw.starts_with(TOGGLE_PREFIX) || raw.len() < TOGGLE_MIN_LEN {
        return CommandEvent::Invalid(raw.to_string());
    }

    let bytes = raw.as_bytes();
    if bytes[TOGGLE_SEP_OFFSET] != b':' {
        return CommandEvent::Invalid(raw.to_string());
    }
    let id = match bytes[TOGGLE_ID_OFFSET] {
        d @ b'0'..=b'9' => ComponentId::new(d - b'0'),
        _ => None,
    };
    let (id, state) = match (id, raw.get(TOGGLE_STATE_OFFSET..)) {
        (Some(id), Some(state)) => (id, state),
        _ => return CommandEvent::Invalid(raw.to_string()),
    };
    CommandEvent::Toggle {
        id,
        state: state == "ON",
    }
}

/// Send the frames of `event` to `sink` and return the number of frames sent.
///
/// [`CommandEvent::TurnOffAll`] sends one `OFF` frame per component in ascending order and stops
/// at the first failed write. [`CommandEvent::Invalid`] sends nothing.
pub async fn dispatch(event: &CommandEvent, sink: &dyn FrameSink) -> Result<usize, DispatchError> {
    const FN_NAME: &'static str = "dispatch";

    let frames: Vec<String> = match event {
        CommandEvent::Toggle { id, state } => vec![frame_codec::encode_toggle(*id, *state)],
        CommandEvent::TurnOffAll => ComponentId::all()
            .map(|id| frame_codec::encode_toggle(id, false))
            .collect(),
        CommandEvent::Invalid(raw) => {
            warn!("[{}] drop invalid command: {}", FN_NAME, raw);
            return Ok(0);
        }
    };

    for (sent, frame) in frames.iter().enumerate() {
        if let Err(e) = sink.send_frame(frame.as_str()).await {
            return Err(DispatchError {
                sent,
                total: frames.len(),
                source: e,
            });
        }
        info!("[{}] sent frame {}", FN_NAME, frame);
    }
    Ok(frames.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::mock::RecordingSink;

    fn toggle(id: u8, state: bool) -> CommandEvent {
        CommandEvent::Toggle {
            id: ComponentId::new(id).unwrap(),
            state,
        }
    }

    #[test]
    fn component_id_range() {
        assert!(ComponentId::new(0).is_none());
        assert!(ComponentId::new(4).is_none());
        let ids: Vec<u8> = ComponentId::all().map(|id| id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn classify_known_commands() {
        assert_eq!(classify("TOGGLE:2:ON"), toggle(2, true));
        assert_eq!(classify("TOGGLE:2:OFF"), toggle(2, false));
        assert_eq!(classify("TOGGLE:1:on"), toggle(1, false));
        assert_eq!(classify("TOGGLE:3:ONX"), toggle(3, false));
        assert_eq!(classify("TURNOFFALL"), CommandEvent::TurnOffAll);
    }

    #[test]
    fn classify_invalid_commands() {
        for raw in [
            "garbage",
            "",
            "TOGGLE",
            "TOGGLE:2:",
            "TOGGLE:2:O",
            "TOGGLE:0:ON",
            "TOGGLE:4:ON",
            "TOGGLE:x:ON",
            "TOGGLE:22:ON",
            "TURNOFFALL ",
            "turnoffall",
        ] {
            assert_eq!(
                classify(raw),
                CommandEvent::Invalid(raw.to_string()),
                "raw: {:?}",
                raw
            );
        }
    }

    #[test]
    fn classify_non_ascii() {
        let raw = "TOGGLE:2:\u{00e9}N";
        assert_eq!(classify(raw), toggle(2, false));
        let raw = "TOGGLE:\u{00e9}ON";
        assert_eq!(classify(raw), CommandEvent::Invalid(raw.to_string()));
    }

    #[tokio::test]
    async fn dispatch_toggle() {
        let sink = RecordingSink::new();
        assert_eq!(dispatch(&toggle(3, true), &sink).await.unwrap(), 1);
        assert_eq!(sink.frames(), vec!["TOGGLE:3:ON"]);
    }

    #[tokio::test]
    async fn dispatch_turn_off_all_in_order() {
        let sink = RecordingSink::new();
        assert_eq!(dispatch(&CommandEvent::TurnOffAll, &sink).await.unwrap(), 3);
        assert_eq!(
            sink.frames(),
            vec!["TOGGLE:1:OFF", "TOGGLE:2:OFF", "TOGGLE:3:OFF"]
        );
    }

    #[tokio::test]
    async fn dispatch_invalid_sends_nothing() {
        let sink = RecordingSink::new();
        let event = CommandEvent::Invalid("garbage".to_string());
        assert_eq!(dispatch(&event, &sink).await.unwrap(), 0);
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn dispatch_propagates_write_error() {
        let sink = RecordingSink::new();
        sink.set_connected(false);
        let e = dispatch(&CommandEvent::TurnOffAll, &sink).await.unwrap_err();
        assert_eq!((e.sent, e.total), (0, 3));
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn dispatch_reports_partial_turn_off_all() {
        let sink = RecordingSink::new();
        sink.fail_after(2);
        let e = dispatch(&CommandEvent::TurnOffAll, &sink).await.unwrap_err();
        assert_eq!((e.sent, e.total), (2, 3));
        assert_eq!(e.source.kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(e.to_string(), "sent 2 of 3 frames: broken pipe");
        assert_eq!(sink.frames(), vec!["TOGGLE:1:OFF", "TOGGLE:2:OFF"]);
    }
}
