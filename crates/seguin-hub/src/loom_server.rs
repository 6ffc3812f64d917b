use crate::client_sink::{ClientSink, CloseCode, Outbound};
use crate::loom_link::{LinkError, LinkEvent, LoomEvent, LoomLink, LoomTarget};
use anyhow::{anyhow, Context};
use futures_util::FutureExt;
use seguin_core::client_messages::{
    parse_client_command, ClientCommand, ClientReply, MessageSeverity,
};
use seguin_core::loom_protocol::{LoomCommand, LoomReply, StatusWord, TERMINATOR};
use seguin_core::pattern::{ReducedPattern, SequenceError};
use seguin_core::pattern_store::PatternStore;
use seguin_core::wif::{read_pattern, PatternFileError};
use std::{any::Any, panic::AssertUnwindSafe, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const REQUEST_QUEUE_CAPACITY: usize = 256;
const LINK_EVENT_CAPACITY: usize = 256;
const INTERNAL_ERROR_REASON: &str = "internal error";

#[derive(Clone, Debug)]
pub struct LoomServerConfig {
    pub target: LoomTarget,
    pub write_timeout: Duration,
}

/// Problems with a client command. Reported to the client as warnings.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no pattern selected")]
    NoPattern,
    #[error("no such pattern: {0}")]
    UnknownPattern(String),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error("cannot load pattern {name:?}: unsupported file type")]
    UnsupportedFileType { name: String },
    #[error(transparent)]
    PatternFile(PatternFileError),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl From<PatternFileError> for CommandError {
    fn from(err: PatternFileError) -> Self {
        match err {
            PatternFileError::UnsupportedFileType { name } => {
                CommandError::UnsupportedFileType { name }
            }
            other => CommandError::PatternFile(other),
        }
    }
}

/// Returned to a transport when its client is attached.
pub struct Attachment {
    pub conn_id: u64,
    /// Fires when the session is done with this client: another client
    /// barged in, the transport failed, or the server closed.
    pub done: oneshot::Receiver<()>,
}

enum ServerRequest {
    Attach {
        sender: mpsc::Sender<Outbound>,
        reply: oneshot::Sender<Attachment>,
    },
    ClientMessage {
        conn_id: u64,
        text: String,
    },
    ClientGone {
        conn_id: u64,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap handle to the session task; every transport talks to the session
/// through one of these.
#[derive(Clone)]
pub struct LoomServerHandle {
    requests: mpsc::Sender<ServerRequest>,
}

impl LoomServerHandle {
    pub async fn attach(&self, sender: mpsc::Sender<Outbound>) -> anyhow::Result<Attachment> {
        let (reply, attached) = oneshot::channel();
        self.requests
            .send(ServerRequest::Attach { sender, reply })
            .await
            .map_err(|_| anyhow!("loom server is not running"))?;
        attached.await.context("loom server dropped the attach request")
    }

    pub async fn client_message(&self, conn_id: u64, text: String) -> anyhow::Result<()> {
        self.requests
            .send(ServerRequest::ClientMessage { conn_id, text })
            .await
            .map_err(|_| anyhow!("loom server is not running"))
    }

    pub async fn client_gone(&self, conn_id: u64) {
        let _ = self
            .requests
            .send(ServerRequest::ClientGone { conn_id })
            .await;
    }

    /// Disconnect the loom, close the client and stop the session task.
    pub async fn close(&self) {
        let (reply, closed) = oneshot::channel();
        if self
            .requests
            .send(ServerRequest::Close { reply })
            .await
            .is_ok()
        {
            let _ = closed.await;
        }
    }
}

/// Session engine. Owns the pattern store, the loom link and the attached
/// client; all session state is mutated only by this task.
pub struct LoomServer {
    link: LoomLink,
    client: ClientSink,
    patterns: PatternStore,
    current_pattern: Option<String>,
    weave_forward: bool,
    loom_error_flag: bool,
    conn_counter: u64,
    requests: mpsc::Receiver<ServerRequest>,
    link_events: mpsc::Receiver<LinkEvent>,
}

impl LoomServer {
    pub fn spawn(config: LoomServerConfig) -> (LoomServerHandle, JoinHandle<()>) {
        let (server, handle) = Self::new(config);
        (handle, tokio::spawn(server.run()))
    }

    fn new(config: LoomServerConfig) -> (Self, LoomServerHandle) {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let server = LoomServer {
            link: LoomLink::new(config.target, config.write_timeout, events_tx),
            client: ClientSink::default(),
            patterns: PatternStore::new(),
            current_pattern: None,
            weave_forward: true,
            loom_error_flag: false,
            conn_counter: 0,
            requests: requests_rx,
            link_events: events_rx,
        };
        (
            server,
            LoomServerHandle {
                requests: requests_tx,
            },
        )
    }

    async fn run(mut self) {
        if let Err(err) = self.link.connect(&mut self.client).await {
            warn!(event = "loom_initial_connect_failed", error = %err);
        }
        loop {
            let handled = tokio::select! {
                request = self.requests.recv() => match request {
                    Some(ServerRequest::Close { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => {
                        AssertUnwindSafe(self.handle_request(request))
                            .catch_unwind()
                            .await
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.link_events.recv() => {
                    AssertUnwindSafe(self.handle_link_event(event))
                        .catch_unwind()
                        .await
                }
            };
            if let Err(panic) = handled {
                let message = panic_message(&*panic);
                self.fault(&message).await;
            }
        }
        info!(event = "loom_server_stopped");
    }

    /// A handler panicked and session state may be half-updated. Drop the
    /// client with an error close and disconnect the loom; later clients
    /// attach as usual.
    async fn fault(&mut self, message: &str) {
        error!(event = "loom_server_fault", error = %message);
        self.client
            .problem(MessageSeverity::Error, format!("internal error: {message}"))
            .await;
        self.client.close(CloseCode::Error, INTERNAL_ERROR_REASON).await;
        self.link.disconnect(&mut self.client).await;
    }

    async fn shutdown(&mut self) {
        self.link.disconnect(&mut self.client).await;
        self.client.close(CloseCode::Normal, "").await;
    }

    async fn handle_request(&mut self, request: ServerRequest) {
        match request {
            ServerRequest::Attach { sender, reply } => self.attach(sender, reply).await,
            ServerRequest::ClientMessage { conn_id, text } => {
                if self.client.conn_id() != Some(conn_id) {
                    debug!(event = "client_message_stale", conn_id = conn_id);
                    return;
                }
                self.handle_client_text(&text).await;
            }
            ServerRequest::ClientGone { conn_id } => {
                if self.client.detach(conn_id) {
                    info!(event = "client_detached", conn_id = conn_id);
                }
            }
            ServerRequest::Close { .. } => {}
        }
    }

    async fn attach(&mut self, sender: mpsc::Sender<Outbound>, reply: oneshot::Sender<Attachment>) {
        self.conn_counter += 1;
        let conn_id = self.conn_counter;
        let (done_tx, done_rx) = oneshot::channel();
        self.client.attach(conn_id, sender, done_tx).await;
        if reply
            .send(Attachment {
                conn_id,
                done: done_rx,
            })
            .is_err()
        {
            self.client.detach(conn_id);
            return;
        }
        info!(event = "client_attached", conn_id = conn_id);

        self.send_snapshot().await;
        if self.link.is_connected() {
            if let Err(err) = self.link.send(&LoomCommand::QueryStatus).await {
                self.loom_failed(err).await;
            }
        } else if let Err(err) = self.link.connect(&mut self.client).await {
            warn!(event = "loom_connect_failed", conn_id = conn_id, error = %err);
        }
    }

    async fn send_snapshot(&mut self) {
        self.client
            .send(&ClientReply::LoomConnectionState {
                state: self.link.state(),
                reason: None,
            })
            .await;
        self.report_pattern_names().await;
        self.client
            .send(&ClientReply::WeaveDirection {
                forward: self.weave_forward,
            })
            .await;
        self.report_current_pattern().await;
        self.report_pick_number().await;
    }

    async fn handle_client_text(&mut self, text: &str) {
        let command = match parse_client_command(text) {
            Ok(value) => value,
            Err(err) if err.is_reportable() => {
                warn!(event = "client_command_invalid", error = %err);
                self.client
                    .problem(MessageSeverity::Warning, err.to_string())
                    .await;
                return;
            }
            Err(err) => {
                warn!(event = "client_message_malformed", error = %err);
                return;
            }
        };
        let kind = command.kind();
        debug!(event = "client_command", kind = kind);
        let Err(err) = self.dispatch(command).await else {
            return;
        };
        if let Some(command_error) = err.downcast_ref::<CommandError>() {
            warn!(event = "client_command_rejected", kind = kind, error = %command_error);
            self.client
                .problem(MessageSeverity::Warning, command_error.to_string())
                .await;
            return;
        }
        error!(event = "client_command_failed", kind = kind, error = %format!("{err:#}"));
        self.client
            .problem(MessageSeverity::Error, format!("{kind} failed: {err:#}"))
            .await;
        if let Some(link_error) = err.downcast_ref::<LinkError>() {
            if !matches!(link_error, LinkError::NotConnected) {
                self.link.disconnect(&mut self.client).await;
            }
        }
    }

    async fn dispatch(&mut self, command: ClientCommand) -> anyhow::Result<()> {
        match command {
            ClientCommand::ClearPatternNames => {
                self.patterns.clear_except(self.current_pattern.as_deref());
                self.report_pattern_names().await;
            }
            ClientCommand::File { name, data } => self.load_pattern(name, &data).await?,
            ClientCommand::SelectPattern { name } => self.select_pattern(name).await?,
            ClientCommand::JumpToPick {
                pick_number,
                repeat_number,
            } => self.jump_to_pick(pick_number, repeat_number).await?,
            ClientCommand::GotoNextPick => {
                if self.current_pattern.is_none() {
                    return Err(CommandError::NoPattern.into());
                }
                self.advance_and_command().await?;
            }
            ClientCommand::WeaveDirection { forward } => {
                // The loom's `u` reply is what flips the tracked direction.
                self.link
                    .send(&LoomCommand::SetDirection { forward })
                    .await?;
            }
            ClientCommand::Oobcommand { command } => {
                if command.is_empty() || command.contains(TERMINATOR as char) {
                    return Err(CommandError::InvalidCommand(format!(
                        "out-of-band command {command:?} must be non-empty and single-line"
                    ))
                    .into());
                }
                self.link.send(&LoomCommand::OutOfBand(command)).await?;
            }
        }
        Ok(())
    }

    async fn load_pattern(&mut self, name: String, data: &str) -> Result<(), CommandError> {
        if name.trim().is_empty() {
            return Err(CommandError::InvalidCommand(
                "file name must not be empty".to_string(),
            ));
        }
        let pattern = read_pattern(&name, data)?;
        info!(
            event = "pattern_loaded",
            name = %name,
            picks = pattern.pick_count(),
            shafts = pattern.picks.first().map_or(0, |pick| pick.are_shafts_up.len())
        );
        let evicted = self
            .patterns
            .add(pattern, self.current_pattern.as_deref());
        if !evicted.is_empty() {
            debug!(event = "patterns_evicted", names = ?evicted);
        }
        self.report_pattern_names().await;
        if self.current_pattern.as_deref() == Some(name.as_str()) {
            self.report_current_pattern().await;
            self.report_pick_number().await;
        }
        Ok(())
    }

    async fn select_pattern(&mut self, name: String) -> Result<(), CommandError> {
        if self.current_pattern.as_deref() == Some(name.as_str()) {
            return Ok(());
        }
        if !self.patterns.contains(&name) {
            return Err(CommandError::UnknownPattern(name));
        }
        info!(event = "pattern_selected", name = %name);
        self.current_pattern = Some(name);
        self.report_current_pattern().await;
        self.report_pick_number().await;
        Ok(())
    }

    async fn jump_to_pick(
        &mut self,
        pick_number: i64,
        repeat_number: Option<i64>,
    ) -> anyhow::Result<()> {
        let pattern = self.current_mut().ok_or(CommandError::NoPattern)?;
        let repeat_number = repeat_number.unwrap_or(pattern.repeat_number);
        pattern
            .jump_to(pick_number, repeat_number)
            .map_err(CommandError::from)?;
        let shaft_word = pattern.current_pick().ok().map(|pick| pick.shaft_word());
        let report = ClientReply::pick_number(pattern);
        let sent = match shaft_word {
            Some(word) => self.link.send(&LoomCommand::SetShafts(word)).await,
            None => Ok(()),
        };
        self.client.send(&report).await;
        sent?;
        Ok(())
    }

    /// Step the current pattern in the weave direction, command the new pick
    /// if there is one, and report the position.
    async fn advance_and_command(&mut self) -> Result<(), LinkError> {
        let forward = self.weave_forward;
        let Some(pattern) = self.current_mut() else {
            return Ok(());
        };
        let pick_number = pattern.advance(forward);
        let shaft_word = if pick_number > 0 {
            pattern.current_pick().ok().map(|pick| pick.shaft_word())
        } else {
            None
        };
        let report = ClientReply::pick_number(pattern);
        let sent = match shaft_word {
            Some(word) => self.link.send(&LoomCommand::SetShafts(word)).await,
            None => Ok(()),
        };
        self.client.send(&report).await;
        sent
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        if event.generation != self.link.generation() {
            debug!(event = "loom_event_stale", generation = event.generation);
            return;
        }
        match event.event {
            LoomEvent::Reply(Ok(reply)) => {
                if let Err(err) = self.handle_loom_reply(reply).await {
                    self.loom_failed(err).await;
                }
            }
            LoomEvent::Reply(Err(err)) => {
                warn!(event = "loom_reply_invalid", error = %err);
                self.client
                    .problem(
                        MessageSeverity::Warning,
                        format!("invalid reply from the loom: {err}"),
                    )
                    .await;
            }
            LoomEvent::Closed { reason } => {
                warn!(event = "loom_closed", reason = reason.as_deref().unwrap_or("end of stream"));
                self.link.disconnect(&mut self.client).await;
            }
        }
    }

    async fn handle_loom_reply(&mut self, reply: LoomReply) -> Result<(), LinkError> {
        match reply {
            LoomReply::Shafts(word) => {
                debug!(event = "loom_shafts", shaft_word = %format!("{word:08x}"));
                Ok(())
            }
            LoomReply::Direction { forward } => {
                self.weave_forward = forward;
                self.client
                    .send(&ClientReply::WeaveDirection { forward })
                    .await;
                self.advance_and_command().await
            }
            LoomReply::Status(status) => {
                self.client.send(&ClientReply::loom_state(status)).await;
                self.track_error_flag(status);
                if status.cycle_complete() {
                    self.advance_and_command().await?;
                }
                Ok(())
            }
            LoomReply::Version(version) => {
                info!(event = "loom_version", version = %version);
                Ok(())
            }
        }
    }

    fn track_error_flag(&mut self, status: StatusWord) {
        if status.error() == self.loom_error_flag {
            return;
        }
        self.loom_error_flag = status.error();
        if self.loom_error_flag {
            warn!(event = "loom_error_set");
        } else {
            info!(event = "loom_error_cleared");
        }
    }

    async fn loom_failed(&mut self, err: LinkError) {
        error!(event = "loom_write_failed", error = %err);
        self.link.disconnect(&mut self.client).await;
    }

    fn current_mut(&mut self) -> Option<&mut ReducedPattern> {
        let name = self.current_pattern.as_deref()?;
        self.patterns.get_mut(name)
    }

    async fn report_pattern_names(&mut self) {
        let mut names = self.patterns.names();
        if let Some(current) = &self.current_pattern {
            if !names.contains(current) {
                names.push(current.clone());
            }
        }
        self.client.send(&ClientReply::PatternNames { names }).await;
    }

    async fn report_current_pattern(&mut self) {
        let Some(name) = self.current_pattern.as_deref() else {
            return;
        };
        let Some(pattern) = self.patterns.get(name) else {
            return;
        };
        let reply = ClientReply::ReducedPattern(pattern.clone());
        self.client.send(&reply).await;
    }

    async fn report_pick_number(&mut self) {
        let Some(name) = self.current_pattern.as_deref() else {
            return;
        };
        let Some(pattern) = self.patterns.get(name) else {
            return;
        };
        let reply = ClientReply::pick_number(pattern);
        self.client.send(&reply).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "session handler panicked".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use seguin_core::client_messages::ConnectionState;

    const PLAIN_WIF: &str = "\
[WIF]
Version=1.1
[WEAVING]
Shafts=4
Rising Shed=true
[WARP]
Threads=4
Color=1
[WEFT]
Threads=4
Color=2
[COLOR PALETTE]
Range=0,255
[COLOR TABLE]
1=255,255,255
2=0,0,0
[THREADING]
1=1
2=2
3=3
4=4
[TIEUP]
1=1,3
2=2,4
[TREADLING]
1=1
2=2
3=1
4=2
";

    struct TestClient {
        conn_id: u64,
        outbound: mpsc::Receiver<Outbound>,
        done: oneshot::Receiver<()>,
    }

    impl TestClient {
        async fn attach(handle: &LoomServerHandle) -> Self {
            let (tx, rx) = mpsc::channel(256);
            let attachment = handle.attach(tx).await.expect("attach");
            Self {
                conn_id: attachment.conn_id,
                outbound: rx,
                done: attachment.done,
            }
        }

        async fn send(&self, handle: &LoomServerHandle, value: serde_json::Value) {
            handle
                .client_message(self.conn_id, value.to_string())
                .await
                .expect("client message");
        }

        async fn next(&mut self) -> Outbound {
            tokio::time::timeout(Duration::from_secs(3), self.outbound.recv())
                .await
                .expect("reply timeout")
                .expect("outbound closed")
        }

        async fn next_reply(&mut self) -> ClientReply {
            match self.next().await {
                Outbound::Text(text) => serde_json::from_str(&text).expect("decode reply"),
                other => panic!("unexpected frame {other:?}"),
            }
        }

        /// Skip replies until one matches.
        async fn wait_for<F>(&mut self, mut matches: F) -> ClientReply
        where
            F: FnMut(&ClientReply) -> bool,
        {
            loop {
                let reply = self.next_reply().await;
                if matches(&reply) {
                    return reply;
                }
            }
        }

        async fn wait_for_pick(&mut self) -> (usize, i64) {
            match self
                .wait_for(|reply| matches!(reply, ClientReply::CurrentPickNumber { .. }))
                .await
            {
                ClientReply::CurrentPickNumber {
                    pick_number,
                    repeat_number,
                } => (pick_number, repeat_number),
                _ => unreachable!(),
            }
        }

        async fn wait_for_problem(&mut self) -> (String, MessageSeverity) {
            match self
                .wait_for(|reply| matches!(reply, ClientReply::CommandProblem { .. }))
                .await
            {
                ClientReply::CommandProblem { message, severity } => (message, severity),
                _ => unreachable!(),
            }
        }

        /// Wait until the loom link reports connected and the mock's opening
        /// replies have been seen.
        async fn wait_until_ready(&mut self) {
            self.wait_for(|reply| {
                matches!(
                    reply,
                    ClientReply::LoomConnectionState {
                        state: ConnectionState::Connected,
                        ..
                    }
                )
            })
            .await;
            self.wait_for(|reply| matches!(reply, ClientReply::LoomState { .. }))
                .await;
        }
    }

    fn spawn_mock_server() -> (LoomServerHandle, JoinHandle<()>) {
        LoomServer::spawn(LoomServerConfig {
            target: LoomTarget::Mock,
            write_timeout: Duration::from_secs(1),
        })
    }

    async fn load_plain(client: &mut TestClient, handle: &LoomServerHandle) {
        client
            .send(
                handle,
                serde_json::json!({"type": "file", "name": "plain.wif", "data": PLAIN_WIF}),
            )
            .await;
        let names = client
            .wait_for(|reply| matches!(reply, ClientReply::PatternNames { names } if !names.is_empty()))
            .await;
        assert_eq!(
            names,
            ClientReply::PatternNames {
                names: vec!["plain.wif".to_string()]
            }
        );
        client
            .send(
                handle,
                serde_json::json!({"type": "select_pattern", "name": "plain.wif"}),
            )
            .await;
        let pattern = client
            .wait_for(|reply| matches!(reply, ClientReply::ReducedPattern(_)))
            .await;
        match pattern {
            ClientReply::ReducedPattern(pattern) => assert_eq!(pattern.pick_count(), 4),
            _ => unreachable!(),
        }
        assert_eq!(client.wait_for_pick().await, (0, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_on_attach() {
        let (handle, task) = spawn_mock_server();
        let mut client = TestClient::attach(&handle).await;
        assert!(matches!(
            client.next_reply().await,
            ClientReply::LoomConnectionState { .. }
        ));
        assert_eq!(
            client.next_reply().await,
            ClientReply::PatternNames { names: Vec::new() }
        );
        assert_eq!(
            client.next_reply().await,
            ClientReply::WeaveDirection { forward: true }
        );
        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn goto_next_pick_walks_into_the_next_repeat() {
        let (handle, task) = spawn_mock_server();
        let mut client = TestClient::attach(&handle).await;
        client.wait_until_ready().await;
        load_plain(&mut client, &handle).await;

        let next = serde_json::json!({"type": "goto_next_pick"});
        for expected in 1..=4 {
            client.send(&handle, next.clone()).await;
            assert_eq!(client.wait_for_pick().await, (expected, 1));
        }
        client.send(&handle, next).await;
        assert_eq!(client.wait_for_pick().await, (0, 2));

        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn goto_next_pick_without_pattern_is_reported() {
        let (handle, task) = spawn_mock_server();
        let mut client = TestClient::attach(&handle).await;
        client
            .send(&handle, serde_json::json!({"type": "goto_next_pick"}))
            .await;
        let (message, severity) = client.wait_for_problem().await;
        assert_eq!(severity, MessageSeverity::Warning);
        assert!(message.contains("no pattern"), "{message}");

        client
            .send(&handle, serde_json::json!({"type": "clear_pattern_names"}))
            .await;
        assert_eq!(
            client
                .wait_for(|reply| matches!(reply, ClientReply::PatternNames { .. }))
                .await,
            ClientReply::PatternNames { names: Vec::new() }
        );
        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_client_barges_in() {
        let (handle, task) = spawn_mock_server();
        let mut first = TestClient::attach(&handle).await;
        first.wait_until_ready().await;
        load_plain(&mut first, &handle).await;

        let mut second = TestClient::attach(&handle).await;
        loop {
            match first.next().await {
                Outbound::Close { code, reason } => {
                    assert_eq!(code, CloseCode::GoingAway);
                    assert_eq!(code.code(), 1001);
                    assert_eq!(reason, "another client barged in");
                    break;
                }
                Outbound::Text(_) => {}
            }
        }
        tokio::time::timeout(Duration::from_secs(3), &mut first.done)
            .await
            .expect("first released")
            .expect("done signal");

        assert_eq!(
            second.next_reply().await,
            ClientReply::LoomConnectionState {
                state: ConnectionState::Connected,
                reason: None
            }
        );
        assert_eq!(
            second.next_reply().await,
            ClientReply::PatternNames {
                names: vec!["plain.wif".to_string()]
            }
        );
        assert_eq!(
            second.next_reply().await,
            ClientReply::WeaveDirection { forward: true }
        );
        assert!(matches!(
            second.next_reply().await,
            ClientReply::ReducedPattern(_)
        ));
        assert_eq!(second.wait_for_pick().await, (0, 1));

        // Messages from the displaced client are ignored.
        first
            .send(&handle, serde_json::json!({"type": "goto_next_pick"}))
            .await;
        second
            .send(&handle, serde_json::json!({"type": "goto_next_pick"}))
            .await;
        assert_eq!(second.wait_for_pick().await, (1, 1));

        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loom_requested_pick_and_direction() {
        let (handle, task) = spawn_mock_server();
        let mut client = TestClient::attach(&handle).await;
        client.wait_until_ready().await;
        load_plain(&mut client, &handle).await;

        client
            .send(&handle, serde_json::json!({"type": "oobcommand", "command": "n"}))
            .await;
        assert_eq!(client.wait_for_pick().await, (1, 1));

        client
            .send(&handle, serde_json::json!({"type": "weave_direction", "forward": false}))
            .await;
        assert_eq!(
            client
                .wait_for(|reply| matches!(reply, ClientReply::WeaveDirection { .. }))
                .await,
            ClientReply::WeaveDirection { forward: false }
        );
        assert_eq!(client.wait_for_pick().await, (0, 1));

        client
            .send(&handle, serde_json::json!({"type": "oobcommand", "command": "d"}))
            .await;
        assert_eq!(
            client
                .wait_for(|reply| matches!(reply, ClientReply::WeaveDirection { .. }))
                .await,
            ClientReply::WeaveDirection { forward: true }
        );
        assert_eq!(client.wait_for_pick().await, (1, 1));

        client
            .send(&handle, serde_json::json!({"type": "oobcommand", "command": "e"}))
            .await;
        assert_eq!(
            client
                .wait_for(|reply| matches!(reply, ClientReply::LoomState { error: true, .. }))
                .await,
            ClientReply::LoomState {
                shed_closed: true,
                cycle_complete: false,
                error: true
            }
        );

        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn jump_to_pick_validates_range() {
        let (handle, task) = spawn_mock_server();
        let mut client = TestClient::attach(&handle).await;
        client.wait_until_ready().await;
        load_plain(&mut client, &handle).await;

        client
            .send(&handle, serde_json::json!({"type": "jump_to_pick", "pick_number": 3}))
            .await;
        assert_eq!(client.wait_for_pick().await, (3, 1));

        client
            .send(
                &handle,
                serde_json::json!({"type": "jump_to_pick", "pick_number": 2, "repeat_number": -1}),
            )
            .await;
        assert_eq!(client.wait_for_pick().await, (2, -1));

        client
            .send(&handle, serde_json::json!({"type": "jump_to_pick", "pick_number": 5}))
            .await;
        let (message, severity) = client.wait_for_problem().await;
        assert_eq!(severity, MessageSeverity::Warning);
        assert!(message.contains('5'), "{message}");

        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_messages_do_not_end_the_session() {
        let (handle, task) = spawn_mock_server();
        let mut client = TestClient::attach(&handle).await;
        client.wait_until_ready().await;

        handle
            .client_message(client.conn_id, "{not json".to_string())
            .await
            .expect("send");
        client
            .send(&handle, serde_json::json!({"no_type": 1}))
            .await;
        let (_, severity) = client.wait_for_problem().await;
        assert_eq!(severity, MessageSeverity::Warning);

        client
            .send(&handle, serde_json::json!({"type": "dance"}))
            .await;
        let (message, _) = client.wait_for_problem().await;
        assert!(message.contains("dance"), "{message}");

        client
            .send(
                &handle,
                serde_json::json!({"type": "file", "name": "notes.txt", "data": "x"}),
            )
            .await;
        let (message, severity) = client.wait_for_problem().await;
        assert_eq!(severity, MessageSeverity::Warning);
        assert!(message.contains("unsupported file type"), "{message}");

        client
            .send(
                &handle,
                serde_json::json!({"type": "select_pattern", "name": "missing.wif"}),
            )
            .await;
        let (message, _) = client.wait_for_problem().await;
        assert!(message.contains("missing.wif"), "{message}");

        load_plain(&mut client, &handle).await;
        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loom_quit_disconnects_and_attach_reconnects() {
        let (handle, task) = spawn_mock_server();
        let mut client = TestClient::attach(&handle).await;
        client.wait_until_ready().await;

        client
            .send(&handle, serde_json::json!({"type": "oobcommand", "command": "q"}))
            .await;
        client
            .wait_for(|reply| {
                matches!(
                    reply,
                    ClientReply::LoomConnectionState {
                        state: ConnectionState::Disconnected,
                        ..
                    }
                )
            })
            .await;

        client
            .send(&handle, serde_json::json!({"type": "weave_direction", "forward": true}))
            .await;
        let (message, severity) = client.wait_for_problem().await;
        assert_eq!(severity, MessageSeverity::Error);
        assert!(message.contains("no connection"), "{message}");

        let mut again = TestClient::attach(&handle).await;
        assert_eq!(
            again.next_reply().await,
            ClientReply::LoomConnectionState {
                state: ConnectionState::Disconnected,
                reason: None
            }
        );
        again.wait_until_ready().await;

        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_releases_the_client() {
        let (handle, task) = spawn_mock_server();
        let mut client = TestClient::attach(&handle).await;
        client.wait_until_ready().await;
        handle.close().await;
        let mut saw_normal_close = false;
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_secs(3), client.outbound.recv()).await
        {
            if let Outbound::Close { code, .. } = frame {
                assert_eq!(code, CloseCode::Normal);
                saw_normal_close = true;
            }
        }
        assert!(saw_normal_close);
        assert!(client.done.await.is_ok());
        task.await.expect("server task");
        assert!(handle.attach(mpsc::channel(1).0).await.is_err());
    }

    /// A mock-backed session whose link events can also be fed by the test.
    fn spawn_with_loom_events() -> (LoomServerHandle, JoinHandle<()>, mpsc::Sender<LinkEvent>) {
        let config = LoomServerConfig {
            target: LoomTarget::Mock,
            write_timeout: Duration::from_secs(1),
        };
        let (mut server, handle) = LoomServer::new(config.clone());
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        server.link = LoomLink::new(config.target, config.write_timeout, events_tx.clone());
        server.link_events = events_rx;
        (handle, tokio::spawn(server.run()), events_tx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_loom_reply_is_a_warning() {
        let (handle, task, loom_events) = spawn_with_loom_events();
        let mut client = TestClient::attach(&handle).await;
        client.wait_until_ready().await;

        for line in ["garbage", "=z1"] {
            loom_events
                .send(LinkEvent {
                    generation: 1,
                    event: LoomEvent::Reply(LoomReply::decode(line)),
                })
                .await
                .expect("inject");
            let (message, severity) = client.wait_for_problem().await;
            assert_eq!(severity, MessageSeverity::Warning);
            assert!(message.contains("invalid reply"), "{message}");
        }

        loom_events
            .send(LinkEvent {
                generation: 1,
                event: LoomEvent::Reply(LoomReply::decode("=s1")),
            })
            .await
            .expect("inject");
        assert_eq!(
            client
                .wait_for(|reply| matches!(reply, ClientReply::LoomState { .. }))
                .await,
            ClientReply::LoomState {
                shed_closed: true,
                cycle_complete: false,
                error: false
            }
        );

        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_pattern_upload_is_rejected() {
        let (handle, task) = spawn_mock_server();
        let mut client = TestClient::attach(&handle).await;
        client.wait_until_ready().await;

        let huge = "[WEAVING]\nShafts=4\n[LIFTPLAN]\n18446744073709551615=1\n";
        client
            .send(
                &handle,
                serde_json::json!({"type": "file", "name": "huge.wif", "data": huge}),
            )
            .await;
        let (message, severity) = client.wait_for_problem().await;
        assert_eq!(severity, MessageSeverity::Warning);
        assert!(message.contains("exceeds the limit"), "{message}");

        let mut again = TestClient::attach(&handle).await;
        assert!(matches!(
            again.next_reply().await,
            ClientReply::LoomConnectionState { .. }
        ));
        assert_eq!(
            again.next_reply().await,
            ClientReply::PatternNames { names: Vec::new() }
        );
        load_plain(&mut again, &handle).await;

        handle.close().await;
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fault_closes_the_client_with_an_error() {
        let (mut server, _handle) = LoomServer::new(LoomServerConfig {
            target: LoomTarget::Mock,
            write_timeout: Duration::from_secs(1),
        });
        let (tx, mut outbound) = mpsc::channel(64);
        let (reply, attached) = oneshot::channel();
        server.attach(tx, reply).await;
        let attachment = attached.await.expect("attached");
        assert!(server.link.is_connected());

        server.fault("boom").await;
        let mut saw_problem = false;
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(3), outbound.recv())
                .await
                .expect("frame timeout")
                .expect("outbound closed");
            match frame {
                Outbound::Text(text) => {
                    if let Ok(ClientReply::CommandProblem { message, severity }) =
                        serde_json::from_str::<ClientReply>(&text)
                    {
                        assert_eq!(severity, MessageSeverity::Error);
                        assert!(message.contains("boom"), "{message}");
                        saw_problem = true;
                    }
                }
                Outbound::Close { code, .. } => {
                    assert_eq!(code, CloseCode::Error);
                    assert_eq!(code.code(), 1011);
                    break;
                }
            }
        }
        assert!(saw_problem);
        assert!(attachment.done.await.is_ok());
        assert!(!server.client.is_attached());
        assert!(!server.link.is_connected());
    }

    #[test]
    fn session_task_can_run_on_any_worker() {
        fn assert_send<T: Send>(_: T) {}
        let (server, _handle) = LoomServer::new(LoomServerConfig {
            target: LoomTarget::Serial("/dev/null".into()),
            write_timeout: Duration::from_secs(1),
        });
        assert_send(server.run());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*payload), "static message");
        let payload: Box<dyn Any + Send> = Box::new(format!("pick {}", 3));
        assert_eq!(panic_message(&*payload), "pick 3");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "session handler panicked");
    }
}
