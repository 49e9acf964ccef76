pub mod bridge_task;
pub mod command;
pub mod command_stream;
pub mod config;
pub mod frame_codec;
pub mod mock;
pub mod rtdb;
pub mod serial_link;
pub mod sse;
pub mod store;
pub mod telemetry;
