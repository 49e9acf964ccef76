//! In-memory collaborators for running the bridge without a serial port or a remote database.

use std::{
    collections::HashMap,
    io::{Error as IoError, ErrorKind},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::{
    serial_link::FrameSink,
    store::{CommandNotification, RemoteStore, StoreError, command_string},
};

/// A [`RemoteStore`] keeping values in a flat path map.
///
/// Writes from "remote clients" are simulated with [`MemoryStore::remote_write`].
pub struct MemoryStore {
    ready: AtomicBool,
    fail_writes: AtomicBool,
    data: Mutex<HashMap<String, Value>>,
    subscribers: Mutex<Vec<(String, Sender<CommandNotification>)>>,
    calls: Mutex<Calls>,
}

/// Operation counters of [`MemoryStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Calls {
    pub get: usize,
    pub update: usize,
    pub delete: usize,
    pub subscribe: usize,
}

/// A [`FrameSink`] recording every frame.
pub struct RecordingSink {
    connected: AtomicBool,
    /// Frames accepted before every further write fails.
    capacity: AtomicUsize,
    frames: Mutex<Vec<String>>,
}

const SUBSCRIBE_QUEUE: usize = 16;

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            ready: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            data: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(vec![]),
            calls: Mutex::new(Calls::default()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make `update` and `delete` fail with status 500.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Set a value as another client would and notify subscribers of `path`.
    pub fn remote_write(&self, path: &str, value: &str) {
        {
            let mut mutex = self.data.lock().unwrap();
            (*mutex).insert(path.to_string(), Value::String(value.to_string()));
        }
        self.notify(path, CommandNotification::Value(value.to_string()));
    }

    /// Deliver a stream timeout to subscribers of `path`.
    pub fn remote_timeout(&self, path: &str) {
        self.notify(path, CommandNotification::Timeout);
    }

    pub fn value(&self, path: &str) -> Option<Value> {
        self.data.lock().unwrap().get(path).cloned()
    }

    pub fn calls(&self) -> Calls {
        *self.calls.lock().unwrap()
    }

    fn notify(&self, path: &str, notification: CommandNotification) {
        let mut mutex = self.subscribers.lock().unwrap();
        (*mutex).retain(|(sub_path, tx)| {
            if sub_path.as_str() != path {
                return !tx.is_closed();
            }
            tx.try_send(notification.clone()).is_ok() || !tx.is_closed()
        });
    }

    fn check_write(&self, path: &str) -> Result<(), StoreError> {
        match self.fail_writes.load(Ordering::SeqCst) {
            false => Ok(()),
            true => Err(StoreError::Status {
                path: path.to_string(),
                status: 500,
                reason: "write rejected".to_string(),
            }),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.calls.lock().unwrap().get += 1;
        Ok(self.value(path))
    }

    async fn update(&self, path: &str, fields: &Map<String, Value>) -> Result<(), StoreError> {
        self.calls.lock().unwrap().update += 1;
        self.check_write(path)?;

        let mut mutex = self.data.lock().unwrap();
        let node = (*mutex)
            .entry(path.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Value::Object(obj) = node {
            for (key, value) in fields.iter() {
                obj.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.calls.lock().unwrap().delete += 1;
        self.check_write(path)?;

        let removed = { self.data.lock().unwrap().remove(path) };
        if removed.is_some() {
            self.notify(path, CommandNotification::Value(command_string(&Value::Null)));
        }
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<Receiver<CommandNotification>, StoreError> {
        self.calls.lock().unwrap().subscribe += 1;
        if !self.is_ready() {
            return Err(StoreError::NotReady);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBE_QUEUE);
        if let Some(value) = self.value(path) {
            let _ = tx.try_send(CommandNotification::Value(command_string(&value)));
        }
        self.subscribers
            .lock()
            .unwrap()
            .push((path.to_string(), tx));
        Ok(rx)
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink {
            connected: AtomicBool::new(true),
            capacity: AtomicUsize::new(usize::MAX),
            frames: Mutex::new(vec![]),
        }
    }

    /// Accept `count` more frames, then fail with `BrokenPipe` like an unplugged port.
    pub fn fail_after(&self, count: usize) {
        let sent = self.frames.lock().unwrap().len();
        self.capacity.store(sent.saturating_add(count), Ordering::SeqCst);
    }

    /// Make `send_frame` fail with `NotConnected` while `false`.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_frame(&self, frame: &str) -> Result<(), IoError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(IoError::from(ErrorKind::NotConnected));
        }
        let mut frames = self.frames.lock().unwrap();
        if frames.len() >= self.capacity.load(Ordering::SeqCst) {
            return Err(IoError::from(ErrorKind::BrokenPipe));
        }
        frames.push(frame.to_string());
        Ok(())
    }
}
