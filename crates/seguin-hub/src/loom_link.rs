use crate::client_sink::ClientSink;
use crate::mock_loom::MockLoom;
use crate::serial_device::SerialDevice;
use seguin_core::client_messages::{ClientReply, ConnectionState};
use seguin_core::loom_protocol::{decode_line, LoomCommand, LoomReply, ProtocolError, TERMINATOR};
use std::{
    fmt, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

type LoomReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type LoomWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Where loom commands go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoomTarget {
    Mock,
    /// A serial device, already configured for the loom's line settings.
    Serial(PathBuf),
}

impl LoomTarget {
    pub fn from_arg(arg: &str) -> Self {
        if arg == "mock" {
            LoomTarget::Mock
        } else {
            LoomTarget::Serial(PathBuf::from(arg))
        }
    }
}

impl fmt::Display for LoomTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoomTarget::Mock => f.write_str("mock loom"),
            LoomTarget::Serial(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot write to the loom: no connection")]
    NotConnected,
    #[error("could not open {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("loom i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("loom write timed out after {0:?}")]
    WriteTimeout(Duration),
}

#[derive(Debug)]
pub enum LoomEvent {
    Reply(Result<LoomReply, ProtocolError>),
    /// The reply stream ended; `reason` is set for read failures.
    Closed { reason: Option<String> },
}

/// A loom event tagged with the connection it came from, so events from a
/// torn-down connection can be told apart from the live one.
#[derive(Debug)]
pub struct LinkEvent {
    pub generation: u64,
    pub event: LoomEvent,
}

/// Owns the loom transport. Replies are read by a spawned task and delivered
/// through the events channel; every state transition is reported to the
/// attached client.
pub struct LoomLink {
    target: LoomTarget,
    write_timeout: Duration,
    state: ConnectionState,
    writer: Option<LoomWriter>,
    reader_task: Option<JoinHandle<()>>,
    reader_eof: Arc<AtomicBool>,
    mock: Option<MockLoom>,
    generation: u64,
    events: mpsc::Sender<LinkEvent>,
}

impl LoomLink {
    pub fn new(
        target: LoomTarget,
        write_timeout: Duration,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            target,
            write_timeout,
            state: ConnectionState::Disconnected,
            writer: None,
            reader_task: None,
            reader_eof: Arc::new(AtomicBool::new(false)),
            mock: None,
            generation: 0,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
            && self.reader_task.is_some()
            && self.state == ConnectionState::Connected
            && !self.reader_eof.load(Ordering::SeqCst)
    }

    fn has_handles(&self) -> bool {
        self.writer.is_some() || self.reader_task.is_some() || self.mock.is_some()
    }

    pub async fn connect(&mut self, client: &mut ClientSink) -> Result<(), LinkError> {
        if self.has_handles() {
            self.disconnect(client).await;
        }
        self.set_state(ConnectionState::Connecting, None, client).await;
        let (reader, writer, mock) = match self.open().await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "loom_connect_failed", target = %self.target, error = %err);
                self.set_state(ConnectionState::Disconnected, Some(err.to_string()), client)
                    .await;
                return Err(err);
            }
        };
        self.generation += 1;
        self.reader_eof = Arc::new(AtomicBool::new(false));
        self.writer = Some(writer);
        self.mock = mock;
        self.set_state(ConnectionState::Connected, None, client).await;
        self.reader_task = Some(tokio::spawn(read_loom_loop(
            self.generation,
            reader,
            self.reader_eof.clone(),
            self.events.clone(),
        )));
        info!(event = "loom_connected", target = %self.target, generation = self.generation);
        Ok(())
    }

    /// Tear down whatever handles exist; a no-op when there are none.
    /// Replies still queued from the old connection become stale.
    pub async fn disconnect(&mut self, client: &mut ClientSink) {
        if !self.has_handles() {
            return;
        }
        self.generation += 1;
        self.set_state(ConnectionState::Disconnecting, None, client).await;
        if let Some(mut writer) = self.writer.take() {
            match tokio::time::timeout(self.write_timeout, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(event = "loom_writer_close_error", error = %err),
                Err(_) => warn!(event = "loom_writer_close_timeout"),
            }
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut mock) = self.mock.take() {
            mock.close().await;
        }
        self.set_state(ConnectionState::Disconnected, None, client).await;
        info!(event = "loom_disconnected", target = %self.target, generation = self.generation);
    }

    /// Frame and write one command, waiting for the flush.
    pub async fn send(&mut self, command: &LoomCommand) -> Result<(), LinkError> {
        if self.state == ConnectionState::Disconnecting {
            return Err(LinkError::NotConnected);
        }
        let write_timeout = self.write_timeout;
        let Some(writer) = self.writer.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        debug!(event = "loom_command", command = %command);
        let line = command.encode();
        let write = async {
            writer.write_all(&line).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, write).await {
            Ok(result) => result.map_err(LinkError::from),
            Err(_) => Err(LinkError::WriteTimeout(write_timeout)),
        }
    }

    async fn set_state(
        &mut self,
        state: ConnectionState,
        reason: Option<String>,
        client: &mut ClientSink,
    ) {
        self.state = state;
        debug!(event = "loom_connection_state", state = %state);
        client
            .send(&ClientReply::LoomConnectionState { state, reason })
            .await;
    }

    async fn open(&self) -> Result<(LoomReader, LoomWriter, Option<MockLoom>), LinkError> {
        match &self.target {
            LoomTarget::Mock => {
                let (mock, stream) = MockLoom::spawn();
                let (reader, writer) = tokio::io::split(stream);
                let reader: LoomReader = Box::new(reader);
                let writer: LoomWriter = Box::new(writer);
                Ok((reader, writer, Some(mock)))
            }
            LoomTarget::Serial(path) => {
                let device = SerialDevice::open(path).map_err(|source| LinkError::Open {
                    target: path.display().to_string(),
                    source,
                })?;
                let (reader, writer) = tokio::io::split(device);
                let reader: LoomReader = Box::new(reader);
                let writer: LoomWriter = Box::new(writer);
                Ok((reader, writer, None))
            }
        }
    }
}

async fn read_loom_loop(
    generation: u64,
    reader: LoomReader,
    eof: Arc<AtomicBool>,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut reader = BufReader::new(reader);
    let reason = loop {
        let mut line = Vec::new();
        match reader.read_until(TERMINATOR, &mut line).await {
            Ok(0) => break None,
            Ok(_) => {}
            Err(err) => {
                warn!(event = "loom_read_error", generation = generation, error = %err);
                break Some(err.to_string());
            }
        }
        let text = decode_line(&line);
        if text.trim().is_empty() {
            continue;
        }
        debug!(event = "loom_reply", generation = generation, line = %text);
        let event = LinkEvent {
            generation,
            event: LoomEvent::Reply(LoomReply::decode(&text)),
        };
        if events.send(event).await.is_err() {
            return;
        }
    };
    eof.store(true, Ordering::SeqCst);
    let _ = events
        .send(LinkEvent {
            generation,
            event: LoomEvent::Closed { reason },
        })
        .await;
}
