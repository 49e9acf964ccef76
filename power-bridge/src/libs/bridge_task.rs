//! Bridge task drives both directions between the serial link and the remote store:
//! - Wait until the store is ready.
//! - Subscribe to the command slot and handle notifications as they arrive.
//! - Use a timer to drain buffered serial lines and publish telemetry frames.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::{
    sync::mpsc::{Receiver, error::TryRecvError},
    task::{self, JoinHandle},
    time,
};

use super::{
    command_stream::CommandStreamHandler,
    frame_codec::{self, Decoded},
    serial_link::FrameSink,
    store::{CommandNotification, RemoteStore},
    telemetry::TelemetryPublisher,
};

pub struct Options {
    pub store: Arc<dyn RemoteStore>,
    pub sink: Arc<dyn FrameSink>,
    /// Lines received from the serial link.
    pub lines: Receiver<String>,
    pub monitoring_path: String,
    pub command_path: String,
    /// Telemetry poll interval in milliseconds.
    pub poll_interval: u64,
}

#[derive(Clone)]
pub struct BridgeTask {
    opts: OptionsInner,

    store: Arc<dyn RemoteStore>,
    sink: Arc<dyn FrameSink>,
    task_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    command_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

#[derive(Clone)]
struct OptionsInner {
    monitoring_path: String,
    command_path: String,
    poll_interval: u64,
}

/// Results of one drain of the serial line buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DrainStats {
    pub published: usize,
    pub ignored: usize,
    pub rejected: usize,
    pub failed: usize,
}

const SLEEP_IDLE_MS: u64 = 100;

impl BridgeTask {
    pub fn new(opts: Options) -> Self {
        let task = BridgeTask {
            opts: OptionsInner {
                monitoring_path: opts.monitoring_path,
                command_path: opts.command_path,
                poll_interval: opts.poll_interval.max(1),
            },
            store: opts.store,
            sink: opts.sink,
            task_handle: Arc::new(Mutex::new(None)),
            command_handle: Arc::new(Mutex::new(None)),
        };
        {
            *task.task_handle.lock().unwrap() = Some(create_event_loop(task.clone(), opts.lines));
        }
        task
    }

    /// Stop the event loop and the command loop.
    pub fn abort(&self) {
        if let Some(handle) = self.task_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.command_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// To create an event loop runtime task.
fn create_event_loop(task: BridgeTask, mut lines: Receiver<String>) -> JoinHandle<()> {
    task::spawn(async move {
        const FN_NAME: &'static str = "event_loop";

        wait_ready(task.store.as_ref()).await;
        info!("[{}] store ready", FN_NAME);

        let notifications = loop {
            match task.store.subscribe(task.opts.command_path.as_str()).await {
                Err(e) => {
                    error!(
                        "[{}] subscribe {} error: {}",
                        FN_NAME, task.opts.command_path, e
                    );
                    time::sleep(Duration::from_millis(SLEEP_IDLE_MS)).await;
                }
                Ok(rx) => break rx,
            }
        };
        let handler = CommandStreamHandler::new(
            task.store.clone(),
            task.sink.clone(),
            task.opts.command_path.as_str(),
        );
        {
            *task.command_handle.lock().unwrap() =
                Some(create_command_loop(handler, notifications));
        }

        // Telemetry loop.
        let publisher = TelemetryPublisher::new(task.store.clone(), &task.opts.monitoring_path);
        let interval = task.opts.poll_interval as i64;
        loop {
            let sleep_time = interval - Utc::now().timestamp_millis().rem_euclid(interval);
            time::sleep(Duration::from_millis(sleep_time as u64)).await;

            if !task.store.is_ready() {
                debug!("[{}] store not ready, skip tick", FN_NAME);
                continue;
            }
            match drain_lines(&mut lines, &publisher).await {
                None => {
                    error!("[{}] serial line source closed", FN_NAME);
                    return;
                }
                Some(stats) => {
                    if stats != DrainStats::default() {
                        debug!("[{}] drained {:?}", FN_NAME, stats);
                    }
                }
            }
        }
    })
}

/// To create the task that consumes command notifications in arrival order.
fn create_command_loop(
    mut handler: CommandStreamHandler,
    mut notifications: Receiver<CommandNotification>,
) -> JoinHandle<()> {
    task::spawn(async move {
        const FN_NAME: &'static str = "command_loop";

        while let Some(notification) = notifications.recv().await {
            let outcome = handler.handle(notification).await;
            debug!("[{}] {:?}", FN_NAME, outcome);
        }
        warn!("[{}] command subscription ended", FN_NAME);
    })
}

/// Poll until the store reports ready.
pub async fn wait_ready(store: &dyn RemoteStore) {
    while !store.is_ready() {
        time::sleep(Duration::from_millis(SLEEP_IDLE_MS)).await;
    }
}

/// Publish every line currently buffered. Returns `None` once the line source is closed and
/// empty.
pub async fn drain_lines(
    lines: &mut Receiver<String>,
    publisher: &TelemetryPublisher,
) -> Option<DrainStats> {
    let mut stats = DrainStats::default();
    loop {
        let line = match lines.try_recv() {
            Err(TryRecvError::Empty) => return Some(stats),
            Err(TryRecvError::Disconnected) => return None,
            Ok(line) => line,
        };
        handle_line(line.as_str(), publisher, &mut stats).await;
    }
}

async fn handle_line(line: &str, publisher: &TelemetryPublisher, stats: &mut DrainStats) {
    const FN_NAME: &'static str = "handle_line";

    match frame_codec::decode_telemetry(line) {
        Err(e) => {
            warn!("[{}] invalid DATA received: {} ({})", FN_NAME, line, e);
            stats.rejected += 1;
        }
        Ok(Decoded::Ignored) => {
            info!("[{}] ignored non-DATA serial message: {}", FN_NAME, line);
            stats.ignored += 1;
        }
        Ok(Decoded::Telemetry(record)) => match publisher.publish(&record).await {
            Err(_) => stats.failed += 1,
            Ok(()) => stats.published += 1,
        },
    }
}
