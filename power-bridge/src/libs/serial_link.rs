//! Line-oriented serial link to the power-monitoring controller.
//!
//! A reader task owns the port: it buffers received lines into a bounded queue and re-opens the
//! port when it fails. Frames are written through [`FrameSink`].

use std::{
    io::{Error as IoError, ErrorKind},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, WriteHalf},
    sync::{
        Mutex,
        mpsc::{self, Receiver, Sender, error::TrySendError},
    },
    task::{self, JoinHandle},
    time,
};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Outbound side of a line-oriented link.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one frame. The line terminator is added by the sink.
    async fn send_frame(&self, frame: &str) -> Result<(), IoError>;
}

pub struct Options {
    /// Serial port device path such as `/dev/ttyUSB0` or `COM1`.
    pub dev_path: String,
    pub baud_rate: u32,
}

#[derive(Clone)]
pub struct SerialLink {
    opts: Arc<Options>,
    writer: Arc<Mutex<Option<WriteHalf<SerialStream>>>>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Terminator of outbound frames.
pub const LINE_END: &'static str = "\r\n";
/// Lines kept while nobody drains the queue.
pub const LINE_BUFFER: usize = 64;
/// Longer inbound lines are dropped.
pub const MAX_LINE_LEN: usize = 4096;

/// Why [`read_lines`] returned.
#[derive(Debug, PartialEq)]
pub enum ReadEnd {
    /// End of stream or read error. The port should be re-opened.
    PortClosed,
    /// The line receiver was dropped.
    ReceiverDropped,
}

const SLEEP_IDLE_MS: u64 = 100;

impl SerialLink {
    /// Start the reader task. Received lines (trimmed, non-empty) are delivered to the returned
    /// receiver. The task stops when the receiver is dropped.
    pub fn new(opts: Options) -> (Self, Receiver<String>) {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let link = SerialLink {
            opts: Arc::new(opts),
            writer: Arc::new(Mutex::new(None)),
            task_handle: Arc::new(StdMutex::new(None)),
        };
        {
            *link.task_handle.lock().unwrap() = Some(create_read_loop(link.clone(), tx));
        }
        (link, rx)
    }
}

#[async_trait]
impl FrameSink for SerialLink {
    async fn send_frame(&self, frame: &str) -> Result<(), IoError> {
        let mut writer = self.writer.lock().await;
        let port = match writer.as_mut() {
            None => {
                return Err(IoError::new(
                    ErrorKind::NotConnected,
                    format!("{} is not open", self.opts.dev_path),
                ));
            }
            Some(port) => port,
        };
        let line = format!("{}{}", frame, LINE_END);
        port.write_all(line.as_bytes()).await?;
        port.flush().await
    }
}

/// To create the task that reads lines and re-opens the port.
fn create_read_loop(link: SerialLink, tx: Sender<String>) -> JoinHandle<()> {
    task::spawn(async move {
        const FN_NAME: &'static str = "read_loop";

        loop {
            let port = connect_port(&link).await;
            let (reader, writer) = io::split(port);
            {
                *link.writer.lock().await = Some(writer);
            }
            info!("[{}] connected to {}", FN_NAME, link.opts.dev_path);

            let end = read_lines(reader, &tx).await;
            {
                *link.writer.lock().await = None;
            }
            if end == ReadEnd::ReceiverDropped || tx.is_closed() {
                debug!("[{}] receiver dropped, stop", FN_NAME);
                return;
            }
        }
    })
}

/// Read `\n`-terminated lines from `reader` and queue them to `tx` until the reader ends or the
/// receiver is dropped.
///
/// Lines are trimmed and empty lines are skipped. A line is dropped when the queue is full or when
/// it grows beyond [`MAX_LINE_LEN`] bytes.
pub async fn read_lines<R: AsyncRead + Unpin>(reader: R, tx: &Sender<String>) -> ReadEnd {
    const FN_NAME: &'static str = "read_lines";

    let mut reader = BufReader::new(reader);
    let mut buff: Vec<u8> = vec![];
    let mut overlong = false;
    loop {
        let (consumed, line_end) = {
            let chunk = match reader.fill_buf().await {
                Err(e) => {
                    error!("[{}] read error: {}", FN_NAME, e);
                    return ReadEnd::PortClosed;
                }
                Ok(chunk) => chunk,
            };
            if chunk.len() == 0 {
                warn!("[{}] port closed", FN_NAME);
                return ReadEnd::PortClosed;
            }
            let (data, consumed, line_end) = match chunk.iter().position(|b| *b == b'\n') {
                None => (chunk, chunk.len(), false),
                Some(pos) => (&chunk[..pos], pos + 1, true),
            };
            if !overlong {
                buff.extend_from_slice(data);
            }
            (consumed, line_end)
        };
        reader.consume(consumed);

        if !overlong && buff.len() > MAX_LINE_LEN {
            warn!("[{}] line longer than {} bytes, drop", FN_NAME, MAX_LINE_LEN);
            overlong = true;
            buff.clear();
        }
        if !line_end {
            continue;
        }
        if overlong {
            overlong = false;
            continue;
        }

        let line = String::from_utf8_lossy(buff.as_slice()).trim().to_string();
        buff.clear();
        if line.len() == 0 {
            continue;
        }
        match tx.try_send(line) {
            Ok(()) => (),
            Err(TrySendError::Full(line)) => {
                warn!("[{}] line buffer full, drop: {}", FN_NAME, line);
            }
            Err(TrySendError::Closed(_)) => return ReadEnd::ReceiverDropped,
        }
    }
}

async fn connect_port(link: &SerialLink) -> SerialStream {
    const FN_NAME: &'static str = "connect_port";

    loop {
        let opts = &link.opts;
        match tokio_serial::new(opts.dev_path.as_str(), opts.baud_rate).open_native_async() {
            Err(e) => {
                error!("[{}] open {} error: {}", FN_NAME, opts.dev_path, e);
                time::sleep(Duration::from_millis(SLEEP_IDLE_MS)).await;
            }
            Ok(port) => break port,
        }
    }
}
