//! Handles change notifications of the remote command slot:
//! - Filter values that are not commands and values already processed.
//! - Dispatch the command to the serial link.
//! - Delete the slot to mark the command consumed.

use std::sync::Arc;

use log::{debug, error, info, warn};

use super::{
    command::{self, TURN_OFF_ALL},
    serial_link::FrameSink,
    store::{CommandNotification, RemoteStore},
};

/// The last raw command processed by this bridge instance.
#[derive(Debug, Default)]
pub struct DedupMemo {
    last: Option<String>,
}

/// What [`CommandStreamHandler::handle`] did with one notification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HandleOutcome {
    Timeout,
    /// Empty value or not shaped like a command.
    Ignored,
    /// Same value as the last processed command.
    Duplicate,
    Dispatched { frames: usize, clear: ClearOutcome },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearOutcome {
    Deleted,
    AlreadyCleared,
    Failed,
}

pub struct CommandStreamHandler {
    store: Arc<dyn RemoteStore>,
    sink: Arc<dyn FrameSink>,
    path: String,
    memo: DedupMemo,
}

/// Prefix accepted by the shape filter. Full validation is done by [`command::classify`].
const COMMAND_PREFIX: &'static str = "TOGGLE";

impl DedupMemo {
    pub fn new() -> Self {
        DedupMemo { last: None }
    }

    pub fn is_duplicate(&self, raw: &str) -> bool {
        match self.last.as_ref() {
            None => false,
            Some(last) => last.as_str() == raw,
        }
    }

    pub fn remember(&mut self, raw: &str) {
        self.last = Some(raw.to_string());
    }

    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }
}

/// Whether `raw` looks like a command at all.
pub fn is_command_shape(raw: &str) -> bool {
    raw.starts_with(COMMAND_PREFIX) || raw == TURN_OFF_ALL
}

impl CommandStreamHandler {
    pub fn new(store: Arc<dyn RemoteStore>, sink: Arc<dyn FrameSink>, path: &str) -> Self {
        CommandStreamHandler {
            store,
            sink,
            path: path.to_string(),
            memo: DedupMemo::new(),
        }
    }

    pub fn memo(&self) -> &DedupMemo {
        &self.memo
    }

    pub async fn handle(&mut self, notification: CommandNotification) -> HandleOutcome {
        const FN_NAME: &'static str = "CommandStreamHandler::handle";

        let raw = match notification {
            CommandNotification::Timeout => {
                warn!("[{}] stream {} timeout, resuming", FN_NAME, self.path);
                return HandleOutcome::Timeout;
            }
            CommandNotification::Value(raw) => raw,
        };
        info!("[{}] stream {} data: {:?}", FN_NAME, self.path, raw);

        if !is_command_shape(raw.as_str()) {
            debug!("[{}] ignore non-command value", FN_NAME);
            return HandleOutcome::Ignored;
        }
        if self.memo.is_duplicate(raw.as_str()) {
            debug!("[{}] ignore processed command {}", FN_NAME, raw);
            return HandleOutcome::Duplicate;
        }

        self.memo.remember(raw.as_str());
        let event = command::classify(raw.as_str());
        let frames = match command::dispatch(&event, self.sink.as_ref()).await {
            Err(e) => {
                error!("[{}] send command {} error: {}", FN_NAME, raw, e);
                e.sent
            }
            Ok(frames) => frames,
        };
        let clear = self.clear_slot().await;
        HandleOutcome::Dispatched { frames, clear }
    }

    /// Delete the command slot if it still holds a value.
    async fn clear_slot(&self) -> ClearOutcome {
        const FN_NAME: &'static str = "CommandStreamHandler::clear_slot";

        match self.store.get(self.path.as_str()).await {
            Err(e) => {
                error!("[{}] read {} error: {}", FN_NAME, self.path, e);
                return ClearOutcome::Failed;
            }
            Ok(None) => {
                info!("[{}] command already cleared or missing", FN_NAME);
                return ClearOutcome::AlreadyCleared;
            }
            Ok(Some(_)) => (),
        }
        if let Err(e) = self.store.delete(self.path.as_str()).await {
            error!("[{}] clear {} error: {}", FN_NAME, self.path, e);
            return ClearOutcome::Failed;
        }
        info!("[{}] command cleared from {}", FN_NAME, self.path);
        ClearOutcome::Deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::mock::{Calls, MemoryStore, RecordingSink};

    const PATH: &'static str = "monitoring/command";

    fn new_handler() -> (Arc<MemoryStore>, Arc<RecordingSink>, CommandStreamHandler) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let handler = CommandStreamHandler::new(store.clone(), sink.clone(), PATH);
        (store, sink, handler)
    }

    fn value(raw: &str) -> CommandNotification {
        CommandNotification::Value(raw.to_string())
    }

    #[test]
    fn memo_tracks_last_value() {
        let mut memo = DedupMemo::new();
        assert!(!memo.is_duplicate(""));
        assert!(!memo.is_duplicate("TURNOFFALL"));
        memo.remember("TURNOFFALL");
        assert!(memo.is_duplicate("TURNOFFALL"));
        memo.remember("TOGGLE:1:ON");
        assert!(!memo.is_duplicate("TURNOFFALL"));
        assert_eq!(memo.last(), Some("TOGGLE:1:ON"));
    }

    #[test]
    fn command_shape_filter() {
        assert!(is_command_shape("TOGGLE:1:ON"));
        assert!(is_command_shape("TOGGLE"));
        assert!(is_command_shape("TURNOFFALL"));
        assert!(!is_command_shape(""));
        assert!(!is_command_shape("toggle:1:on"));
        assert!(!is_command_shape("TURNOFFALL2"));
        assert!(!is_command_shape(" TOGGLE:1:ON"));
    }

    #[tokio::test]
    async fn dispatch_and_clear() {
        let (store, sink, mut handler) = new_handler();
        store.remote_write(PATH, "TOGGLE:2:ON");

        let outcome = handler.handle(value("TOGGLE:2:ON")).await;
        assert_eq!(
            outcome,
            HandleOutcome::Dispatched {
                frames: 1,
                clear: ClearOutcome::Deleted
            }
        );
        assert_eq!(sink.frames(), vec!["TOGGLE:2:ON"]);
        assert_eq!(store.value(PATH), None);
        assert_eq!(handler.memo().last(), Some("TOGGLE:2:ON"));
    }

    #[tokio::test]
    async fn same_value_twice_dispatches_once() {
        let (store, sink, mut handler) = new_handler();
        store.remote_write(PATH, "TURNOFFALL");

        handler.handle(value("TURNOFFALL")).await;
        let outcome = handler.handle(value("TURNOFFALL")).await;
        assert_eq!(outcome, HandleOutcome::Duplicate);
        assert_eq!(sink.frames().len(), 3);
        assert_eq!(
            store.calls(),
            Calls {
                get: 1,
                delete: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn different_value_dispatches_again() {
        let (store, sink, mut handler) = new_handler();
        store.remote_write(PATH, "TOGGLE:1:ON");
        handler.handle(value("TOGGLE:1:ON")).await;
        store.remote_write(PATH, "TOGGLE:1:OFF");
        handler.handle(value("TOGGLE:1:OFF")).await;
        store.remote_write(PATH, "TOGGLE:1:ON");
        handler.handle(value("TOGGLE:1:ON")).await;

        assert_eq!(
            sink.frames(),
            vec!["TOGGLE:1:ON", "TOGGLE:1:OFF", "TOGGLE:1:ON"]
        );
        assert_eq!(store.calls().delete, 3);
    }

    #[tokio::test]
    async fn timeout_changes_nothing() {
        let (store, sink, mut handler) = new_handler();
        store.remote_write(PATH, "TOGGLE:1:ON");
        handler.handle(value("TOGGLE:1:ON")).await;

        let outcome = handler.handle(CommandNotification::Timeout).await;
        assert_eq!(outcome, HandleOutcome::Timeout);
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(handler.memo().last(), Some("TOGGLE:1:ON"));
        assert_eq!(store.calls().get, 1);
    }

    #[tokio::test]
    async fn ignore_non_commands() {
        let (store, sink, mut handler) = new_handler();
        for raw in ["", "hello", "turnoffall", "DATA:1,2,3"] {
            assert_eq!(handler.handle(value(raw)).await, HandleOutcome::Ignored);
        }
        assert!(sink.frames().is_empty());
        assert_eq!(handler.memo().last(), None);
        assert_eq!(store.calls(), Calls::default());
    }

    #[tokio::test]
    async fn invalid_toggle_is_consumed_without_frames() {
        let (store, sink, mut handler) = new_handler();
        store.remote_write(PATH, "TOGGLE:9:ON");

        let outcome = handler.handle(value("TOGGLE:9:ON")).await;
        assert_eq!(
            outcome,
            HandleOutcome::Dispatched {
                frames: 0,
                clear: ClearOutcome::Deleted
            }
        );
        assert!(sink.frames().is_empty());
        assert_eq!(store.value(PATH), None);
    }

    #[tokio::test]
    async fn clear_skips_missing_slot() {
        let (store, sink, mut handler) = new_handler();

        let outcome = handler.handle(value("TOGGLE:3:OFF")).await;
        assert_eq!(
            outcome,
            HandleOutcome::Dispatched {
                frames: 1,
                clear: ClearOutcome::AlreadyCleared
            }
        );
        assert_eq!(sink.frames(), vec!["TOGGLE:3:OFF"]);
        assert_eq!(store.calls().delete, 0);
    }

    #[tokio::test]
    async fn failed_clear_is_not_retried() {
        let (store, sink, mut handler) = new_handler();
        store.remote_write(PATH, "TOGGLE:1:ON");
        store.set_fail_writes(true);

        let outcome = handler.handle(value("TOGGLE:1:ON")).await;
        assert_eq!(
            outcome,
            HandleOutcome::Dispatched {
                frames: 1,
                clear: ClearOutcome::Failed
            }
        );
        // The stale value is redelivered and filtered by the memo.
        assert_eq!(
            handler.handle(value("TOGGLE:1:ON")).await,
            HandleOutcome::Duplicate
        );
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(store.calls().delete, 1);
        assert!(store.value(PATH).is_some());
    }

    #[tokio::test]
    async fn serial_failure_still_clears() {
        let (store, sink, mut handler) = new_handler();
        store.remote_write(PATH, "TOGGLE:1:ON");
        sink.set_connected(false);

        let outcome = handler.handle(value("TOGGLE:1:ON")).await;
        assert_eq!(
            outcome,
            HandleOutcome::Dispatched {
                frames: 0,
                clear: ClearOutcome::Deleted
            }
        );
        assert_eq!(store.value(PATH), None);
    }

    #[tokio::test]
    async fn partial_turn_off_all_reports_sent_frames() {
        let (store, sink, mut handler) = new_handler();
        store.remote_write(PATH, "TURNOFFALL");
        sink.fail_after(1);

        let outcome = handler.handle(value("TURNOFFALL")).await;
        assert_eq!(
            outcome,
            HandleOutcome::Dispatched {
                frames: 1,
                clear: ClearOutcome::Deleted
            }
        );
        assert_eq!(sink.frames(), vec!["TOGGLE:1:OFF"]);
        assert_eq!(store.value(PATH), None);
    }
}
