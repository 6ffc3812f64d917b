use seguin_core::loom_protocol::{
    decode_line, LoomCommand, LoomReply, StatusWord, TERMINATOR,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

const DUPLEX_CAPACITY: usize = 4096;
pub const MOCK_VERSION: &str = "001";

/// What the emulator does with one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    Reply(LoomReply),
    Quit,
    Ignore,
}

/// Emulated loom controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLoomState {
    pub shaft_word: u32,
    pub weave_forward: bool,
    pub error_flag: bool,
    pub cycle_completed: bool,
}

impl Default for MockLoomState {
    fn default() -> Self {
        Self {
            shaft_word: 0,
            weave_forward: true,
            error_flag: false,
            cycle_completed: false,
        }
    }
}

impl MockLoomState {
    /// Shed closed is always reported while running.
    pub fn status(&self) -> StatusWord {
        StatusWord::from_flags(true, self.cycle_completed, self.error_flag)
    }

    /// Replies sent as soon as the loom comes up.
    pub fn initial_replies(&self) -> [LoomReply; 3] {
        [
            LoomReply::Status(self.status()),
            LoomReply::Direction {
                forward: self.weave_forward,
            },
            LoomReply::Shafts(self.shaft_word),
        ]
    }

    pub fn handle(&mut self, command: LoomCommand) -> MockResponse {
        match command {
            LoomCommand::SetShafts(word) => {
                self.shaft_word = word;
                self.cycle_completed = false;
                MockResponse::Reply(LoomReply::Shafts(word))
            }
            LoomCommand::SetDirection { forward } => {
                self.weave_forward = forward;
                MockResponse::Reply(LoomReply::Direction { forward })
            }
            LoomCommand::QueryStatus => MockResponse::Reply(LoomReply::Status(self.status())),
            LoomCommand::QueryVersion => {
                MockResponse::Reply(LoomReply::Version(MOCK_VERSION.to_string()))
            }
            // Lowercased because some client keyboards default to uppercase.
            LoomCommand::OutOfBand(payload) => match payload.to_lowercase().as_str() {
                "d" => {
                    self.weave_forward = !self.weave_forward;
                    MockResponse::Reply(LoomReply::Direction {
                        forward: self.weave_forward,
                    })
                }
                "e" => {
                    self.error_flag = !self.error_flag;
                    MockResponse::Reply(LoomReply::Status(self.status()))
                }
                "n" => {
                    self.cycle_completed = true;
                    MockResponse::Reply(LoomReply::Status(self.status()))
                }
                "q" => MockResponse::Quit,
                other => {
                    warn!(event = "mock_loom_unknown_oob", command = %other);
                    MockResponse::Ignore
                }
            },
        }
    }
}

/// In-process loom emulator speaking the wire protocol over a duplex pipe.
pub struct MockLoom {
    shutdown: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl MockLoom {
    /// Start the emulator. The returned stream is the controller's serial
    /// side: write commands to it and read replies from it.
    pub fn spawn() -> (Self, DuplexStream) {
        let (client_end, loom_end) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            run(loom_end, MockLoomState::default(), shutdown_rx).await;
            let _ = done_tx.send(true);
        });
        (
            Self {
                shutdown: shutdown_tx,
                done: done_rx,
                task: Some(task),
            },
            client_end,
        )
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the emulator has stopped, after `#q` or `close`.
    pub async fn wait_done(&mut self) {
        while !*self.done.borrow_and_update() {
            if self.done.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(event = "mock_loom_closed");
    }
}

impl Drop for MockLoom {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(stream: DuplexStream, mut state: MockLoomState, mut shutdown: watch::Receiver<bool>) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    for reply in state.initial_replies() {
        if writer.write_all(&reply.encode()).await.is_err() {
            return;
        }
    }
    if writer.flush().await.is_err() {
        return;
    }

    loop {
        let mut line = Vec::new();
        let read = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            read = reader.read_until(TERMINATOR, &mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(event = "mock_loom_read_error", error = %err);
                break;
            }
        }
        let text = decode_line(&line);
        if text.trim().is_empty() {
            continue;
        }
        let command = match LoomCommand::decode(&text) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "mock_loom_invalid_command", line = %text, error = %err);
                continue;
            }
        };
        debug!(event = "mock_loom_command", command = %command);
        match state.handle(command) {
            MockResponse::Reply(reply) => {
                debug!(event = "mock_loom_reply", reply = %reply);
                let write = async {
                    writer.write_all(&reply.encode()).await?;
                    writer.flush().await
                };
                if let Err(err) = write.await {
                    warn!(event = "mock_loom_write_error", error = %err);
                    break;
                }
            }
            MockResponse::Quit => {
                info!(event = "mock_loom_quit");
                let _ = writer.shutdown().await;
                break;
            }
            MockResponse::Ignore => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncRead, ReadHalf};

    async fn read_reply<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Option<LoomReply> {
        let mut line = Vec::new();
        let read = tokio::time::timeout(
            Duration::from_secs(3),
            reader.read_until(TERMINATOR, &mut line),
        )
        .await
        .expect("read timeout")
        .expect("read error");
        if read == 0 {
            return None;
        }
        Some(LoomReply::decode(&decode_line(&line)).expect("decode"))
    }

    async fn start() -> (
        MockLoom,
        BufReader<ReadHalf<DuplexStream>>,
        tokio::io::WriteHalf<DuplexStream>,
    ) {
        let (mock, stream) = MockLoom::spawn();
        let (reader, writer) = tokio::io::split(stream);
        (mock, BufReader::new(reader), writer)
    }

    async fn send(writer: &mut tokio::io::WriteHalf<DuplexStream>, command: &LoomCommand) {
        writer.write_all(&command.encode()).await.expect("write");
        writer.flush().await.expect("flush");
    }

    #[test]
    fn status_word_tracks_flags() {
        let mut state = MockLoomState::default();
        assert_eq!(state.status(), StatusWord(0x1));
        state.handle(LoomCommand::OutOfBand("n".to_string()));
        assert_eq!(state.status(), StatusWord(0x5));
        state.handle(LoomCommand::OutOfBand("E".to_string()));
        assert_eq!(state.status(), StatusWord(0xD));
        state.handle(LoomCommand::SetShafts(0x3));
        assert_eq!(state.status(), StatusWord(0x9));
    }

    #[test]
    fn unknown_oob_command_is_ignored() {
        let mut state = MockLoomState::default();
        assert_eq!(
            state.handle(LoomCommand::OutOfBand("z".to_string())),
            MockResponse::Ignore
        );
        assert_eq!(state, MockLoomState::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emits_initial_state_in_order() {
        let (mut mock, mut reader, _writer) = start().await;
        assert_eq!(
            read_reply(&mut reader).await,
            Some(LoomReply::Status(StatusWord(0x1)))
        );
        assert_eq!(
            read_reply(&mut reader).await,
            Some(LoomReply::Direction { forward: true })
        );
        assert_eq!(read_reply(&mut reader).await, Some(LoomReply::Shafts(0)));
        mock.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn answers_each_command() {
        let (mut mock, mut reader, mut writer) = start().await;
        for _ in 0..3 {
            read_reply(&mut reader).await;
        }

        send(&mut writer, &LoomCommand::SetShafts(0xdead_beef)).await;
        assert_eq!(
            read_reply(&mut reader).await,
            Some(LoomReply::Shafts(0xdead_beef))
        );

        send(&mut writer, &LoomCommand::SetDirection { forward: false }).await;
        assert_eq!(
            read_reply(&mut reader).await,
            Some(LoomReply::Direction { forward: false })
        );

        send(&mut writer, &LoomCommand::OutOfBand("d".to_string())).await;
        assert_eq!(
            read_reply(&mut reader).await,
            Some(LoomReply::Direction { forward: true })
        );

        send(&mut writer, &LoomCommand::OutOfBand("n".to_string())).await;
        assert_eq!(
            read_reply(&mut reader).await,
            Some(LoomReply::Status(StatusWord(0x5)))
        );

        send(&mut writer, &LoomCommand::QueryVersion).await;
        assert_eq!(
            read_reply(&mut reader).await,
            Some(LoomReply::Version("001".to_string()))
        );
        mock.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_commands_do_not_stop_the_loom() {
        let (mut mock, mut reader, mut writer) = start().await;
        for _ in 0..3 {
            read_reply(&mut reader).await;
        }
        writer.write_all(b"garbage\r=Cxyz\r=\r").await.expect("write");
        send(&mut writer, &LoomCommand::QueryStatus).await;
        assert_eq!(
            read_reply(&mut reader).await,
            Some(LoomReply::Status(StatusWord(0x1)))
        );
        assert!(!mock.is_done());
        mock.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn quit_closes_the_stream() {
        let (mut mock, mut reader, mut writer) = start().await;
        for _ in 0..3 {
            read_reply(&mut reader).await;
        }
        send(&mut writer, &LoomCommand::OutOfBand("q".to_string())).await;
        assert_eq!(read_reply(&mut reader).await, None);
        tokio::time::timeout(Duration::from_secs(3), mock.wait_done())
            .await
            .expect("done timeout");
        assert!(mock.is_done());
    }
}
