//! Per-client session state machine.
//!
//! Lifecycle: New -> HandshakeForwarded -> AuthInProgress -> Ready -> Closed.
//! The session owns its backend connection for its whole lifetime, relays
//! packets strictly FIFO in each direction, and substitutes rewritten
//! COM_QUERY payloads on the way to the backend. It never parses
//! result-set rows; it only recognises the terminating packets that hand
//! control back to the command loop.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use quotient_protocol::commands::{
    self, command_name, transaction_control, TransactionControl,
};
use quotient_protocol::packet::{read_packet, write_packet, Packet, MAX_PAYLOAD};
use quotient_protocol::payload;
use quotient_protocol::{ProtocolError, ProtocolResult};
use quotient_shared::config::ConfigStore;
use quotient_shared::exception::QuotientError;
use quotient_shared::metrics::{ErrorKind, MetricsSink, QueryOp};

use crate::pool::{BackendConn, BackendPool};
use crate::sql::{rewrite_query, Rewrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    HandshakeForwarded,
    AuthInProgress,
    Ready,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::HandshakeForwarded => "handshake_forwarded",
            SessionState::AuthInProgress => "auth_in_progress",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        }
    }
}

/// How a session ended; decides whether the backend connection may be
/// returned to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Clean,
    DiscardBackend,
}

/// Classification of a relayed backend response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseKind {
    Ok,
    Err,
    ResultSet,
}

pub struct Session {
    conn_id: u64,
    pool: Arc<BackendPool>,
    store: Arc<ConfigStore>,
    metrics: Arc<dyn MetricsSink>,
    state: SessionState,
    database: String,
    in_transaction: bool,
    client_caps: u32,
}

impl Session {
    pub fn new(
        conn_id: u64,
        pool: Arc<BackendPool>,
        store: Arc<ConfigStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            conn_id,
            pool,
            store,
            metrics,
            state: SessionState::New,
            database: String::new(),
            in_transaction: false,
            client_caps: 0,
        }
    }

    /// Drive the session to completion and dispose of the backend
    /// connection according to the outcome.
    pub async fn run(mut self, mut client: TcpStream) {
        let mut backend = match self.pool.acquire().await {
            Ok(backend) => backend,
            Err(error) => {
                self.metrics.record_error(ErrorKind::Backend);
                warn!(
                    conn_id = self.conn_id,
                    error = %error,
                    "could not acquire backend connection"
                );
                let message = match &error {
                    QuotientError::BackendUnavailable { .. } => {
                        "backend unavailable (circuit breaker open)".to_string()
                    }
                    QuotientError::PoolExhausted => {
                        "backend unavailable (connection pool exhausted)".to_string()
                    }
                    other => format!("backend unavailable ({other})"),
                };
                let err = payload::build_err_payload(
                    payload::ER_UNKNOWN_ERROR,
                    payload::SQLSTATE_GENERAL,
                    &message,
                );
                let _ = write_packet(&mut client, 0, &err).await;
                return;
            }
        };

        match self.handle(&mut client, &mut backend).await {
            Ok(SessionEnd::Clean) => {
                self.state = SessionState::Closed;
                debug!(conn_id = self.conn_id, "session closed");
                self.pool.release(backend).await;
            }
            Ok(SessionEnd::DiscardBackend) => {
                self.state = SessionState::Closed;
                self.pool.discard(backend);
            }
            Err(error) => {
                self.metrics.record_error(ErrorKind::Protocol);
                warn!(
                    conn_id = self.conn_id,
                    error = %error,
                    state = self.state.as_str(),
                    "session ended with error"
                );
                self.state = SessionState::Closed;
                self.pool.discard(backend);
            }
        }
    }

    async fn handle(
        &mut self,
        client: &mut TcpStream,
        backend: &mut BackendConn,
    ) -> ProtocolResult<SessionEnd> {
        // Initial handshake travels backend -> client.
        let greeting = read_packet(backend.stream_mut()).await?;
        write_packet(client, greeting.seq_id, &greeting.payload).await?;
        self.state = SessionState::HandshakeForwarded;

        // Handshake response travels client -> backend.
        let auth = read_packet(client).await?;
        if let Some(caps) = payload::handshake_response_caps(&auth.payload) {
            if caps & payload::CLIENT_SSL != 0 {
                let err = payload::build_err_payload(
                    payload::ER_UNKNOWN_ERROR,
                    payload::SQLSTATE_GENERAL,
                    "TLS is not supported by this proxy",
                );
                write_packet(client, auth.seq_id.wrapping_add(1), &err).await?;
                return Ok(SessionEnd::DiscardBackend);
            }
            self.client_caps = caps;
        }
        write_packet(backend.stream_mut(), auth.seq_id, &auth.payload).await?;
        self.state = SessionState::AuthInProgress;

        match relay_auth_exchange(backend.stream_mut(), client).await? {
            AuthOutcome::Success => {
                info!(conn_id = self.conn_id, "authentication complete");
            }
            AuthOutcome::Failed => {
                debug!(conn_id = self.conn_id, "authentication failed; closing");
                return Ok(SessionEnd::DiscardBackend);
            }
        }
        self.state = SessionState::Ready;

        self.command_loop(client, backend).await
    }

    async fn command_loop(
        &mut self,
        client: &mut TcpStream,
        backend: &mut BackendConn,
    ) -> ProtocolResult<SessionEnd> {
        loop {
            let command_packet = match read_packet(client).await {
                Ok(packet) => packet,
                // A peer that simply drops the socket is a normal end of
                // session between commands.
                Err(ProtocolError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof
                        || e.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    return Ok(SessionEnd::Clean);
                }
                Err(e) => return Err(e),
            };
            if command_packet.payload.is_empty() {
                continue;
            }

            let command = command_packet.payload[0];
            debug!(
                conn_id = self.conn_id,
                command = command_name(command),
                "received command"
            );

            match command {
                commands::COM_QUIT => {
                    debug!(conn_id = self.conn_id, "client requested disconnect");
                    return Ok(SessionEnd::Clean);
                }
                commands::COM_INIT_DB => {
                    let database =
                        String::from_utf8_lossy(&command_packet.payload[1..]).into_owned();
                    self.database = database.clone();
                    backend.set_database(database);
                    debug!(
                        conn_id = self.conn_id,
                        database = %self.database,
                        "default database changed"
                    );
                    self.forward(backend, &command_packet).await?;
                    relay_response(backend.stream_mut(), client, self.client_caps).await?;
                }
                commands::COM_QUERY => {
                    self.handle_query(client, backend, &command_packet).await?;
                }
                commands::COM_STMT_PREPARE => {
                    self.forward(backend, &command_packet).await?;
                    relay_prepare_response(backend.stream_mut(), client, self.client_caps)
                        .await?;
                }
                commands::COM_STMT_CLOSE | commands::COM_STMT_SEND_LONG_DATA => {
                    // Fire-and-forget commands: the backend sends no reply.
                    self.forward(backend, &command_packet).await?;
                }
                commands::COM_FIELD_LIST => {
                    self.forward(backend, &command_packet).await?;
                    relay_until_eof(backend.stream_mut(), client).await?;
                }
                commands::COM_STATISTICS => {
                    self.forward(backend, &command_packet).await?;
                    let reply = read_packet(backend.stream_mut()).await?;
                    write_packet(client, reply.seq_id, &reply.payload).await?;
                }
                _ => {
                    self.forward(backend, &command_packet).await?;
                    relay_response(backend.stream_mut(), client, self.client_caps).await?;
                }
            }
        }
    }

    async fn forward(&self, backend: &mut BackendConn, packet: &Packet) -> ProtocolResult<()> {
        write_packet(backend.stream_mut(), packet.seq_id, &packet.payload).await?;
        Ok(())
    }

    async fn handle_query(
        &mut self,
        client: &mut TcpStream,
        backend: &mut BackendConn,
        command_packet: &Packet,
    ) -> ProtocolResult<()> {
        let started = Instant::now();
        let text = std::str::from_utf8(&command_packet.payload[1..]).ok();

        let mut op = QueryOp::Other;
        let mut rewritten = None;
        if let Some(text) = text {
            op = QueryOp::classify(text);
            match transaction_control(text) {
                Some(TransactionControl::Begin) => {
                    self.in_transaction = true;
                    backend.set_in_transaction(true);
                    debug!(conn_id = self.conn_id, "transaction started");
                }
                Some(TransactionControl::End) => {
                    self.in_transaction = false;
                    backend.set_in_transaction(false);
                    debug!(conn_id = self.conn_id, "transaction ended");
                }
                None => {}
            }

            let snapshot = self.store.current();
            if let Rewrite::Replaced(statement) = rewrite_query(text, &snapshot) {
                rewritten = Some(statement);
            }
        }

        let dual_write = rewritten.is_some();
        match rewritten {
            Some(statement) => {
                debug!(
                    conn_id = self.conn_id,
                    query_type = op.as_str(),
                    "forwarding dual-write statement"
                );
                let mut new_payload = Vec::with_capacity(1 + statement.len());
                new_payload.push(commands::COM_QUERY);
                new_payload.extend_from_slice(statement.as_bytes());
                write_packet(backend.stream_mut(), command_packet.seq_id, &new_payload).await?;
            }
            None => {
                write_packet(
                    backend.stream_mut(),
                    command_packet.seq_id,
                    &command_packet.payload,
                )
                .await?;
            }
        }

        let outcome = relay_response(backend.stream_mut(), client, self.client_caps).await?;
        self.metrics.record_query_duration(op, started.elapsed());
        if dual_write {
            self.metrics
                .record_dual_write(!matches!(outcome, ResponseKind::Err));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthOutcome {
    Success,
    Failed,
}

/// Relay the authentication exchange after the handshake response has been
/// forwarded: backend verdicts flow to the client; auth-switch and
/// more-data rounds pull one more client packet each.
pub(crate) async fn relay_auth_exchange<B, C>(
    backend: &mut B,
    client: &mut C,
) -> ProtocolResult<AuthOutcome>
where
    B: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let packet = read_packet(backend).await?;
        write_packet(client, packet.seq_id, &packet.payload).await?;

        if payload::is_ok(&packet.payload) {
            return Ok(AuthOutcome::Success);
        }
        if payload::is_err(&packet.payload) {
            return Ok(AuthOutcome::Failed);
        }
        if payload::is_auth_continuation(&packet.payload) {
            let reply = read_packet(client).await?;
            write_packet(backend, reply.seq_id, &reply.payload).await?;
            continue;
        }
        return Err(ProtocolError::Unexpected {
            phase: "authentication",
        });
    }
}

/// Relay one complete command response, honouring
/// `SERVER_MORE_RESULTS_EXISTS` across result sets.
pub(crate) async fn relay_response<B, C>(
    backend: &mut B,
    client: &mut C,
    client_caps: u32,
) -> ProtocolResult<ResponseKind>
where
    B: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    let deprecate_eof = client_caps & payload::CLIENT_DEPRECATE_EOF != 0;
    let mut overall = None;

    loop {
        let first = read_packet(backend).await?;
        write_packet(client, first.seq_id, &first.payload).await?;

        if payload::is_err(&first.payload) {
            return Ok(ResponseKind::Err);
        }
        if payload::is_ok(&first.payload) || payload::is_eof(&first.payload) {
            let flags = payload::terminator_status_flags(&first.payload);
            overall.get_or_insert(ResponseKind::Ok);
            if flags & payload::SERVER_MORE_RESULTS_EXISTS != 0 {
                continue;
            }
            return Ok(overall.unwrap_or(ResponseKind::Ok));
        }
        if payload::is_local_infile(&first.payload) {
            // The client streams the file, terminated by an empty packet,
            // then the backend answers with OK/ERR.
            loop {
                let chunk = read_packet(client).await?;
                let done = chunk.payload.is_empty();
                write_packet(backend, chunk.seq_id, &chunk.payload).await?;
                if done {
                    break;
                }
            }
            let verdict = read_packet(backend).await?;
            write_packet(client, verdict.seq_id, &verdict.payload).await?;
            if payload::is_err(&verdict.payload) {
                return Ok(ResponseKind::Err);
            }
            let flags = payload::terminator_status_flags(&verdict.payload);
            overall.get_or_insert(ResponseKind::Ok);
            if flags & payload::SERVER_MORE_RESULTS_EXISTS != 0 {
                continue;
            }
            return Ok(overall.unwrap_or(ResponseKind::Ok));
        }

        // Result set: the first payload is the column count.
        let mut cursor: &[u8] = &first.payload;
        let column_count = payload::read_lenc_int(&mut cursor)
            .ok_or_else(|| ProtocolError::malformed("invalid column count"))?;

        for _ in 0..column_count {
            let definition = read_packet(backend).await?;
            write_packet(client, definition.seq_id, &definition.payload).await?;
            if payload::is_err(&definition.payload) {
                return Ok(ResponseKind::Err);
            }
        }
        if !deprecate_eof {
            let eof = read_packet(backend).await?;
            write_packet(client, eof.seq_id, &eof.payload).await?;
            if payload::is_err(&eof.payload) {
                return Ok(ResponseKind::Err);
            }
        }

        // Rows stream until an EOF / terminal OK. A genuine row never
        // starts with 0xFE unless its first value is enormous, in which
        // case the reassembled payload exceeds one frame.
        let flags = loop {
            let row = read_packet(backend).await?;
            write_packet(client, row.seq_id, &row.payload).await?;
            if payload::is_err(&row.payload) {
                return Ok(ResponseKind::Err);
            }
            if row.payload.first() == Some(&payload::EOF_HEADER) && row.payload.len() < MAX_PAYLOAD
            {
                break payload::terminator_status_flags(&row.payload);
            }
        };
        overall.get_or_insert(ResponseKind::ResultSet);
        if flags & payload::SERVER_MORE_RESULTS_EXISTS != 0 {
            continue;
        }
        return Ok(overall.unwrap_or(ResponseKind::ResultSet));
    }
}

/// Relay a COM_STMT_PREPARE response: the prepare-OK header followed by
/// the advertised parameter and column definition groups.
pub(crate) async fn relay_prepare_response<B, C>(
    backend: &mut B,
    client: &mut C,
    client_caps: u32,
) -> ProtocolResult<ResponseKind>
where
    B: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    let deprecate_eof = client_caps & payload::CLIENT_DEPRECATE_EOF != 0;
    let head = read_packet(backend).await?;
    write_packet(client, head.seq_id, &head.payload).await?;
    if payload::is_err(&head.payload) {
        return Ok(ResponseKind::Err);
    }
    if head.payload.len() < 9 {
        return Err(ProtocolError::malformed("prepare response too short"));
    }
    let num_columns = u16::from_le_bytes([head.payload[5], head.payload[6]]) as usize;
    let num_params = u16::from_le_bytes([head.payload[7], head.payload[8]]) as usize;

    for group in [num_params, num_columns] {
        if group == 0 {
            continue;
        }
        for _ in 0..group {
            let definition = read_packet(backend).await?;
            write_packet(client, definition.seq_id, &definition.payload).await?;
        }
        if !deprecate_eof {
            let eof = read_packet(backend).await?;
            write_packet(client, eof.seq_id, &eof.payload).await?;
        }
    }
    Ok(ResponseKind::Ok)
}

/// Relay packets until an EOF or ERR terminator (COM_FIELD_LIST style).
pub(crate) async fn relay_until_eof<B, C>(backend: &mut B, client: &mut C) -> ProtocolResult<()>
where
    B: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let packet = read_packet(backend).await?;
        write_packet(client, packet.seq_id, &packet.payload).await?;
        if payload::is_eof(&packet.payload) || payload::is_err(&packet.payload) {
            return Ok(());
        }
    }
}
