//! Single-connection state machine: dial, TLS, handshake, authentication,
//! and the asynchronous-message fallthrough handler (spec §4.5).
//!
//! There is no reactor thread here (see `SPEC_FULL.md`'s "Architectural
//! decision" section) — `ProtocolConnection` owns its socket directly and
//! every call borrows `&mut self` for the duration of one request, the
//! same way the teacher's `Client::roundtrip_blocking` owns the stream for
//! the duration of one command before returning control to the caller.

pub mod auth;
pub mod granular_flow;
pub mod pool;
pub mod reconnecting;
pub mod transactable;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{root_store_for, Addr, ConnectionConfig, TlsSecurity};
use crate::error::{Error, Result};
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::codec::{CodecRegistry, Value};
use crate::protocol::descriptor::DescriptorCache;
use crate::protocol::message::{CompileParams, Message, MessageType, TransactionState};
use crate::protocol::state::SessionState;
use crate::protocol::{Capabilities, CompilationFlags, ProtocolVersion, MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION};
use crate::query::{Fingerprint, IdPair};

/// Unifies a plain and a TLS-wrapped socket behind one object-safe trait so
/// `ProtocolConnection` doesn't need a generic parameter.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Socket for T {}

/// Monotonic id assigned to each connection at dial time, used only to tag
/// log lines from a busy pool (SPEC_FULL.md's "structured log fields").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Snapshot of server-advertised settings relevant to pooling (spec §4.5's
/// `ParameterStatus` fallthrough cases, spec §3's `PoolEntry`).
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    pub session_idle_timeout: Option<Duration>,
    pub suggested_pool_concurrency: Option<u32>,
}

/// Reads one framed message off a socket (the job `protocol::buffer`'s
/// doc comment defers to this module: filling bytes, as opposed to
/// parsing already-buffered ones).
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(MessageType, Vec<u8>)> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.map_err(Error::from_io)?;
    let msg_type = MessageType::from_byte(header[0])?;
    let length = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
    if length < 4 {
        return Err(Error::BinaryProtocol(format!(
            "frame length {length} is shorter than its own length prefix"
        )));
    }

    let mut payload = vec![0u8; length - 4];
    stream.read_exact(&mut payload).await.map_err(Error::from_io)?;
    Ok((msg_type, payload))
}

/// Owns one socket; version/state/codec bookkeeping; message dispatch
/// (spec §3 `ProtocolConnection`).
pub struct ProtocolConnection {
    pub(crate) id: ConnectionId,
    pub(crate) socket: Box<dyn Socket>,
    pub(crate) version: ProtocolVersion,
    pub(crate) descriptors: Arc<DescriptorCache>,
    pub(crate) codecs: Arc<CodecRegistry>,
    /// The descriptor id the server last told us its session-state shape
    /// is. `Uuid::nil()` until the first `StateDataDescription` arrives.
    pub(crate) state_type_id: uuid::Uuid,
    pub(crate) system_config: SystemConfig,
    pub(crate) transaction_state: TransactionState,
    pub(crate) idle_since: Instant,
    pub(crate) closed: bool,
    pub(crate) id_pairs: HashMap<Fingerprint, IdPair>,
    pub(crate) capabilities_by_fingerprint: HashMap<Fingerprint, Capabilities>,
}

impl std::fmt::Debug for ProtocolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolConnection")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ProtocolConnection {
    /// Dials, negotiates TLS, performs the handshake and authentication,
    /// and consumes the ready-loop fallthrough messages up to the first
    /// `ReadyForCommand` (spec §4.5).
    pub async fn connect(
        config: &ConnectionConfig,
        descriptors: Arc<DescriptorCache>,
        codecs: Arc<CodecRegistry>,
    ) -> Result<ProtocolConnection> {
        let id = ConnectionId::next();
        log::debug!(target: "dbflow_core::connection", "{id}: dialing");

        let socket = timeout(config.connect_timeout, dial(config))
            .await
            .map_err(|_| {
                Error::ClientConnectionTimeout(format!(
                    "connect timed out after {:?}",
                    config.connect_timeout
                ))
            })??;

        let mut conn = ProtocolConnection {
            id,
            socket,
            version: MAX_SUPPORTED_VERSION,
            descriptors,
            codecs,
            state_type_id: uuid::Uuid::nil(),
            system_config: SystemConfig::default(),
            transaction_state: TransactionState::NotInTransaction,
            idle_since: Instant::now(),
            closed: false,
            id_pairs: HashMap::new(),
            capabilities_by_fingerprint: HashMap::new(),
        };

        conn.handshake(config).await?;
        conn.authenticate(config).await?;
        conn.consume_ready_loop().await?;

        log::debug!(target: "dbflow_core::connection", "{id}: ready, protocol {}", conn.version);
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn idle_since(&self) -> Instant {
        self.idle_since
    }

    pub fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    pub fn system_config(&self) -> &SystemConfig {
        &self.system_config
    }

    async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let mut w = BufferWriter::new();
        msg.encode(&mut w);
        let bytes = w.finish();
        self.socket.write_all(&bytes).await.map_err(|e| self.fail(e))?;
        Ok(())
    }

    async fn read_raw(&mut self) -> Result<(MessageType, Vec<u8>)> {
        match read_frame(&mut self.socket).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.closed = true;
                Err(e)
            }
        }
    }

    fn fail(&mut self, e: std::io::Error) -> Error {
        self.closed = true;
        Error::from_io(e)
    }

    async fn handshake(&mut self, config: &ConnectionConfig) -> Result<()> {
        let mut params = vec![("user".to_owned(), config.user.clone())];
        params.push(("branch".to_owned(), config.branch_or_database()?.to_owned()));
        if let Some(secret_key) = &config.secret_key {
            params.push(("secret_key".to_owned(), secret_key.clone()));
        }

        self.write_message(&Message::ClientHandshake {
            major: MAX_SUPPORTED_VERSION.major,
            minor: MAX_SUPPORTED_VERSION.minor,
            params,
            extensions: vec![],
        })
        .await?;

        let (msg_type, payload) = self.read_raw().await?;
        if msg_type == MessageType::ServerHandshake {
            let msg = Message::decode(msg_type, &mut BufferReader::new(&payload))?;
            let Message::ServerHandshake { major, minor, .. } = msg else {
                unreachable!()
            };
            let negotiated = ProtocolVersion::new(major, minor).min(MAX_SUPPORTED_VERSION);
            if negotiated < MIN_SUPPORTED_VERSION {
                self.closed = true;
                return Err(Error::ClientConnectionFailed(format!(
                    "server's protocol version {negotiated} is older than the minimum supported {MIN_SUPPORTED_VERSION}"
                )));
            }
            self.version = negotiated;
            // The next message is the authentication exchange proper.
            let (auth_type, auth_payload) = self.read_raw().await?;
            self.handle_authentication(auth_type, &auth_payload, config).await
        } else {
            self.handle_authentication(msg_type, &payload, config).await
        }
    }

    async fn authenticate(&mut self, _config: &ConnectionConfig) -> Result<()> {
        // Authentication is driven to completion inside `handshake` because
        // the first post-handshake message is ambiguous (`ServerHandshake`
        // vs `Authentication`) and both paths converge on the same
        // SASL state machine.
        Ok(())
    }

    async fn handle_authentication(
        &mut self,
        msg_type: MessageType,
        payload: &[u8],
        config: &ConnectionConfig,
    ) -> Result<()> {
        if msg_type != MessageType::Authentication {
            self.closed = true;
            return Err(Error::UnexpectedMessage(format!(
                "expected an authentication message, got {msg_type:?}"
            )));
        }

        let msg = Message::decode(msg_type, &mut BufferReader::new(payload))?;
        match msg {
            Message::AuthenticationOk => Ok(()),
            Message::AuthenticationSasl { methods } => self.scram_exchange(&methods, config).await,
            other => {
                self.closed = true;
                Err(Error::UnexpectedMessage(format!(
                    "unexpected message during authentication: {other:?}"
                )))
            }
        }
    }

    async fn scram_exchange(&mut self, methods: &[String], config: &ConnectionConfig) -> Result<()> {
        if !methods.iter().any(|m| m == auth::SCRAM_SHA_256) {
            self.closed = true;
            return Err(Error::Authentication(format!(
                "server only offers {methods:?}, client only supports {}",
                auth::SCRAM_SHA_256
            )));
        }

        let password = config.password.as_deref().unwrap_or("");
        let mut scram = auth::ScramSha256::new();

        self.write_message(&Message::AuthenticationSaslInitialResponse {
            method: auth::SCRAM_SHA_256.to_owned(),
            sasl_data: scram.client_first(),
        })
        .await?;

        let (msg_type, payload) = self.read_raw().await?;
        let continue_msg = Message::decode(msg_type, &mut BufferReader::new(&payload))?;
        let Message::AuthenticationSaslContinue { sasl_data } = continue_msg else {
            self.closed = true;
            return Err(Error::Authentication(format!(
                "expected a SASL continue challenge, got {continue_msg:?}"
            )));
        };

        let client_final = scram.handle_server_first(&sasl_data, password)?;
        self.write_message(&Message::AuthenticationSaslResponse {
            sasl_data: client_final,
        })
        .await?;

        let (msg_type, payload) = self.read_raw().await?;
        let final_msg = Message::decode(msg_type, &mut BufferReader::new(&payload))?;
        let Message::AuthenticationSaslFinal { sasl_data } = final_msg else {
            self.closed = true;
            return Err(Error::Authentication(format!(
                "expected a SASL final message, got {final_msg:?}"
            )));
        };
        scram.verify_server_final(&sasl_data)?;

        let (msg_type, payload) = self.read_raw().await?;
        match Message::decode(msg_type, &mut BufferReader::new(&payload))? {
            Message::AuthenticationOk => Ok(()),
            other => {
                self.closed = true;
                Err(Error::Authentication(format!(
                    "expected AuthenticationOk after SCRAM exchange, got {other:?}"
                )))
            }
        }
    }

    /// Consumes fallthrough messages until `ReadyForCommand` (spec §4.5's
    /// "ready loop"). Used right after authentication and, from
    /// `granular_flow`, after every `Sync`.
    pub(crate) async fn consume_ready_loop(&mut self) -> Result<()> {
        loop {
            let (msg_type, payload) = self.read_raw().await?;
            if msg_type == MessageType::ReadyForCommand {
                let msg = Message::decode(msg_type, &mut BufferReader::new(&payload))?;
                let Message::ReadyForCommand { transaction_state } = msg else {
                    unreachable!()
                };
                self.transaction_state = transaction_state;
                return Ok(());
            }

            self.dispatch_fallthrough(msg_type, &payload).await?;
        }
    }

    /// Handles the asynchronous message kinds the server may send between
    /// (or instead of) the messages a flow is actively waiting for (spec
    /// §4.5). Returns an error for message kinds no fallthrough path
    /// recognizes.
    pub(crate) async fn dispatch_fallthrough(
        &mut self,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<()> {
        let msg = Message::decode(msg_type, &mut BufferReader::new(payload))?;
        match msg {
            Message::ParameterStatus { name, value } => self.handle_parameter_status(&name, &value),
            Message::LogMessage {
                severity,
                code,
                text,
            } => {
                log::debug!(
                    target: "dbflow_core::connection",
                    "{}: server log (severity {severity}, code {code:#x}): {text}",
                    self.id
                );
                Ok(())
            }
            Message::StateDataDescription {
                type_id,
                type_descriptor,
            } => {
                self.descriptors
                    .decode_and_intern(type_id, &type_descriptor, self.version)?;
                self.state_type_id = type_id;
                Ok(())
            }
            Message::ErrorResponse {
                severity,
                code,
                message,
                headers,
            } => Err(Error::BinaryProtocol(Error::display_with_caret(
                &format!("server error {code:#x} (severity {severity}): {message}"),
                None,
                headers.hint().as_deref(),
                headers.position_start(),
                headers.line_start(),
            ))),
            other => Err(Error::UnexpectedMessage(format!(
                "unexpected asynchronous message: {other:?}"
            ))),
        }
    }

    fn handle_parameter_status(&mut self, name: &str, value: &[u8]) -> Result<()> {
        match name {
            "suggested_pool_concurrency" => {
                if value.len() == 4 {
                    self.system_config.suggested_pool_concurrency =
                        Some(u32::from_be_bytes(value.try_into().unwrap()));
                }
                Ok(())
            }
            "system_config" => self.decode_system_config(value),
            "pgaddr" | "pgdsn" => Ok(()),
            other => Err(Error::UnexpectedMessage(format!(
                "unrecognized ParameterStatus name {other:?}"
            ))),
        }
    }

    fn decode_system_config(&mut self, value: &[u8]) -> Result<()> {
        let mut r = BufferReader::new(value);
        let descriptor_bytes = r.pop_len_prefixed_bytes()?;
        let descriptor = crate::protocol::descriptor::decode(descriptor_bytes, self.version)?;
        let payload = r.pop_len_prefixed_bytes()?;

        let decoder = self.codecs.get_or_build_decoder(&descriptor, 0)?;
        let mut target = Value::default();
        let mut payload_reader = BufferReader::new(payload);
        decoder.decode(&mut payload_reader, &mut target)?;

        if let Value::Object(fields) = target {
            for (name, v) in fields {
                if name == "session_idle_timeout" {
                    if let Value::Int64(micros) = v {
                        self.system_config.session_idle_timeout =
                            Some(Duration::from_micros(micros.max(0) as u64));
                    }
                }
            }
        }

        Ok(())
    }

    /// Builds an `Execute`/`Parse` `CompileParams` for `query` carrying the
    /// session-state blob (or a no-op placeholder when the state hasn't
    /// diverged from default). Shared by `granular_flow`.
    pub(crate) fn compile_params(
        &self,
        command_text: &str,
        state: &SessionState,
        capabilities: Capabilities,
        expected_cardinality: crate::protocol::Cardinality,
        output_format: u8,
    ) -> Result<CompileParams> {
        let state_data = if state.is_default() {
            vec![]
        } else {
            state.encode()?
        };

        Ok(CompileParams {
            capabilities,
            compilation_flags: CompilationFlags::empty(),
            implicit_limit: 0,
            output_format,
            expected_cardinality,
            command_text: command_text.to_owned(),
            state_type_id: self.state_type_id,
            state_data,
        })
    }
}

/// Dials (handshake + auth included) with retry against temporary failures
/// until `config.wait_until_available` elapses (spec §4.7, §4.9).
async fn dial_with_retry(
    config: &ConnectionConfig,
    descriptors: Arc<DescriptorCache>,
    codecs: Arc<CodecRegistry>,
) -> Result<ProtocolConnection> {
    let deadline = Instant::now() + config.wait_until_available;
    let mut attempt: u32 = 0;

    loop {
        match ProtocolConnection::connect(config, descriptors.clone(), codecs.clone()).await {
            Ok(conn) => return Ok(conn),
            Err(e) if e.has_tag(crate::error::ErrorTag::ShouldRetry) && Instant::now() < deadline => {
                attempt += 1;
                log::debug!(
                    target: "dbflow_core::connection",
                    "dial attempt {attempt} failed ({e}), retrying within wait_until_available"
                );
                tokio::time::sleep(crate::retry::default_backoff(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn dial(config: &ConnectionConfig) -> Result<Box<dyn Socket>> {
    match &config.addr {
        Addr::Tcp { host, port } => {
            let tcp = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(Error::from_io)?;
            tcp.set_nodelay(true).ok();
            wrap_tls(tcp, config).await
        }
        #[cfg(unix)]
        Addr::Unix(path) => {
            let unix = tokio::net::UnixStream::connect(path)
                .await
                .map_err(Error::from_io)?;
            Ok(Box::new(unix))
        }
    }
}

async fn wrap_tls(tcp: TcpStream, config: &ConnectionConfig) -> Result<Box<dyn Socket>> {
    use rustls::pki_types::ServerName;

    let source: Arc<dyn crate::config::RootCertSource> =
        Arc::new(crate::config::NativeRootCertSource);
    let roots = root_store_for(config.tls_ca_pem.as_deref(), &source)?;

    let mut tls_config = match config.tls_security {
        TlsSecurity::Strict => rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
        TlsSecurity::NoHostVerification => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(auth::PermissiveVerifier {
                roots: Some(roots),
            }))
            .with_no_client_auth(),
        TlsSecurity::Insecure => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(auth::PermissiveVerifier { roots: None }))
            .with_no_client_auth(),
    };
    tls_config.alpn_protocols = vec![b"edgedb-binary".to_vec()];

    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
    let server_name = config
        .tls_server_name
        .clone()
        .or_else(|| config.tcp_target().map(|(h, _)| h.to_owned()))
        .unwrap_or_default();
    let server_name = ServerName::try_from(server_name)
        .map_err(|e| Error::Configuration(format!("invalid TLS server name: {e}")))?
        .to_owned();

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(Error::from_io)?;

    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_display() {
        let id = ConnectionId::next();
        assert!(id.to_string().starts_with("conn#"));
    }
}
