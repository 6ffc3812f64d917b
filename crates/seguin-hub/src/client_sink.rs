use seguin_core::client_messages::{ClientReply, MessageSeverity};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Closing a client is best effort and must not stall the session.
pub const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_millis(100);
pub const BARGE_IN_REASON: &str = "another client barged in";

/// Websocket close codes (RFC 6455 section 7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    GoingAway,
    Error,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Error => 1011,
        }
    }
}

/// Frames queued for a client's transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: CloseCode, reason: String },
}

struct AttachedClient {
    conn_id: u64,
    sender: mpsc::Sender<Outbound>,
    done: Option<oneshot::Sender<()>>,
}

impl AttachedClient {
    async fn close(self, code: CloseCode, reason: &str) {
        let frame = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        match tokio::time::timeout(CLIENT_CLOSE_TIMEOUT, self.sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(event = "client_close_skipped", conn_id = self.conn_id),
            Err(_) => warn!(event = "client_close_timeout", conn_id = self.conn_id),
        }
    }
}

impl Drop for AttachedClient {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// The one client that may be attached to the session. Dropping an
/// attachment releases whoever is waiting on its done signal.
#[derive(Default)]
pub struct ClientSink {
    client: Option<AttachedClient>,
}

impl ClientSink {
    pub fn is_attached(&self) -> bool {
        self.client.is_some()
    }

    pub fn conn_id(&self) -> Option<u64> {
        self.client.as_ref().map(|client| client.conn_id)
    }

    /// Attach a client, closing any previous one with `GoingAway`.
    pub async fn attach(
        &mut self,
        conn_id: u64,
        sender: mpsc::Sender<Outbound>,
        done: oneshot::Sender<()>,
    ) {
        let previous = self.client.replace(AttachedClient {
            conn_id,
            sender,
            done: Some(done),
        });
        if let Some(previous) = previous {
            warn!(
                event = "client_barged_in",
                previous_conn_id = previous.conn_id,
                conn_id = conn_id
            );
            previous.close(CloseCode::GoingAway, BARGE_IN_REASON).await;
        }
    }

    /// Forget a client whose transport went away. Returns false for a stale id.
    pub fn detach(&mut self, conn_id: u64) -> bool {
        if self.conn_id() != Some(conn_id) {
            return false;
        }
        self.client = None;
        true
    }

    pub async fn close(&mut self, code: CloseCode, reason: &str) {
        if let Some(client) = self.client.take() {
            client.close(code, reason).await;
        }
    }

    pub async fn send(&mut self, reply: &ClientReply) {
        let Some(client) = self.client.as_ref() else {
            debug!(event = "client_reply_dropped", kind = reply.kind());
            return;
        };
        let text = match serde_json::to_string(reply) {
            Ok(value) => value,
            Err(err) => {
                error!(event = "client_reply_encode_error", kind = reply.kind(), error = %err);
                return;
            }
        };
        debug!(event = "client_reply", conn_id = client.conn_id, kind = reply.kind());
        if client.sender.send(Outbound::Text(text)).await.is_err() {
            warn!(event = "client_send_error", conn_id = client.conn_id);
            self.client = None;
        }
    }

    pub async fn problem(&mut self, severity: MessageSeverity, message: impl Into<String>) {
        self.send(&ClientReply::problem(severity, message)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn attaching_a_second_client_closes_the_first() {
        let mut sink = ClientSink::default();
        let (first_tx, mut first_rx) = mpsc::channel(8);
        let (first_done_tx, first_done_rx) = oneshot::channel();
        sink.attach(1, first_tx, first_done_tx).await;

        let (second_tx, _second_rx) = mpsc::channel(8);
        let (second_done_tx, _second_done_rx) = oneshot::channel();
        sink.attach(2, second_tx, second_done_tx).await;

        assert_eq!(
            first_rx.recv().await,
            Some(Outbound::Close {
                code: CloseCode::GoingAway,
                reason: BARGE_IN_REASON.to_string(),
            })
        );
        assert!(first_done_rx.await.is_ok());
        assert_eq!(sink.conn_id(), Some(2));
        assert!(!sink.detach(1));
        assert!(sink.detach(2));
        assert!(!sink.is_attached());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_error_detaches_the_client() {
        let mut sink = ClientSink::default();
        let (tx, rx) = mpsc::channel(8);
        let (done_tx, done_rx) = oneshot::channel();
        sink.attach(7, tx, done_tx).await;
        drop(rx);
        sink.problem(MessageSeverity::Warning, "gone").await;
        assert!(!sink.is_attached());
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_times_out_on_a_full_queue() {
        let mut sink = ClientSink::default();
        let (tx, _rx) = mpsc::channel(1);
        tx.send(Outbound::Text("filler".to_string()))
            .await
            .expect("fill");
        let (done_tx, done_rx) = oneshot::channel();
        sink.attach(3, tx, done_tx).await;
        tokio::time::timeout(Duration::from_secs(1), sink.close(CloseCode::Normal, ""))
            .await
            .expect("close is bounded");
        assert!(done_rx.await.is_ok());
    }
}
