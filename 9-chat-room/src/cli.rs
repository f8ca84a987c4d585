use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    server::RoomConfig,
    trace::{LogTracer, Off, Tracer, WriterTracer},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve a single chat room over WebSocket at `/room`.
    Serve(ServeArgs),
    /// Join a room and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Pending outbound messages allowed per participant before it is
    /// disconnected as too slow.
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..))]
    pub queue_capacity: u32,

    /// Milliseconds a single frame write may take before the connection is dropped.
    #[arg(long, default_value_t = 10_000)]
    pub write_timeout_ms: u64,

    /// Largest inbound message accepted, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    pub max_message_size: usize,

    /// Where room activity (joins, leaves, deliveries) is traced.
    #[arg(long, value_enum, default_value_t = TracerKind::Off)]
    pub tracer: TracerKind,
}

impl ServeArgs {
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            queue_capacity: self.queue_capacity as usize,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            max_message_size: self.max_message_size,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerKind {
    /// Discard trace events.
    Off,
    /// Print one line per event on stdout.
    Stdout,
    /// Emit trace events as debug-level log records.
    Log,
}

impl TracerKind {
    pub fn build(self) -> Arc<dyn Tracer> {
        match self {
            TracerKind::Off => Arc::new(Off),
            TracerKind::Stdout => Arc::new(WriterTracer::new(io::stdout())),
            TracerKind::Log => Arc::new(LogTracer),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket URL of the room to join.
    #[arg(long, default_value = "ws://127.0.0.1:8080/room")]
    pub server: String,
}
