//! Wire message types exchanged with the server (spec §4.1, §6).
//!
//! Every message is `{type: u8, length: u32, payload[length-4]}`; this
//! module only concerns itself with decoding/encoding the payload once
//! [`crate::connection`] has framed it into a [`BufferReader`]/
//! [`BufferWriter`] pair. Mirrors the split the teacher draws between
//! `Command` (the typed message) and `TagStructRead`/`TagStructWrite`
//! (how it gets in and out of bytes).

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use uuid::Uuid;

use crate::error::Error;
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::{Capabilities, Cardinality, CompilationFlags};

/// The leading type byte of a framed message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum MessageType {
    ClientHandshake = b'V',
    ServerHandshake = b'v',
    Authentication = b'R',
    Parse = b'P',
    Execute = b'O',
    Sync = b'S',
    CommandDataDescription = b'T',
    StateDataDescription = b't',
    Data = b'D',
    CommandComplete = b'C',
    ReadyForCommand = b'Z',
    ErrorResponse = b'E',
    LogMessage = b'L',
    ParameterStatus = b'K',
}

impl MessageType {
    pub fn from_byte(b: u8) -> Result<Self, Error> {
        MessageType::from_u8(b)
            .ok_or_else(|| Error::BinaryProtocol(format!("unknown message type byte {b:#x}")))
    }
}

/// The `transaction_state` byte carried by `ReadyForCommand` (spec §4.5).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum TransactionState {
    NotInTransaction = b'I',
    InTransaction = b'T',
    InFailedTransaction = b'E',
}

/// Known `ErrorResponse` attribute keys (spec §6: hint/position/line).
/// Unrecognized keys are kept in [`ErrorHeaders::raw`] rather than
/// dropped.
mod attr {
    pub const HINT: u16 = 0x0001;
    pub const DETAILS: u16 = 0x0002;
    pub const POSITION_START: u16 = 0x0003;
    pub const POSITION_END: u16 = 0x0004;
    pub const LINE_START: u16 = 0x0005;
}

/// Parsed `ErrorResponse` attributes (spec §6).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorHeaders {
    pub raw: Vec<(u16, Vec<u8>)>,
}

fn attr_str(raw: &[(u16, Vec<u8>)], key: u16) -> Option<String> {
    raw.iter()
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| std::str::from_utf8(v).ok())
        .map(str::to_owned)
}

fn attr_u32(raw: &[(u16, Vec<u8>)], key: u16) -> Option<u32> {
    raw.iter()
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.as_slice().try_into().ok())
        .map(u32::from_be_bytes)
}

impl ErrorHeaders {
    pub fn hint(&self) -> Option<String> {
        attr_str(&self.raw, attr::HINT)
    }

    pub fn details(&self) -> Option<String> {
        attr_str(&self.raw, attr::DETAILS)
    }

    pub fn position_start(&self) -> Option<u32> {
        attr_u32(&self.raw, attr::POSITION_START)
    }

    pub fn position_end(&self) -> Option<u32> {
        attr_u32(&self.raw, attr::POSITION_END)
    }

    pub fn line_start(&self) -> Option<u32> {
        attr_u32(&self.raw, attr::LINE_START)
    }
}

fn read_headers(r: &mut BufferReader<'_>) -> Result<Vec<(u16, Vec<u8>)>, Error> {
    let n = r.pop_u16()?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let key = r.pop_u16()?;
        let value = r.pop_len_prefixed_bytes()?.to_vec();
        out.push((key, value));
    }
    Ok(out)
}

fn write_headers(w: &mut BufferWriter, headers: &[(u16, Vec<u8>)]) {
    w.write_u16(headers.len() as u16);
    for (key, value) in headers {
        w.write_u16(*key);
        w.write_len_prefixed_bytes(value);
    }
}

fn read_str_pairs(r: &mut BufferReader<'_>) -> Result<Vec<(String, String)>, Error> {
    let n = r.pop_u32()?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let k = r.pop_string()?.to_owned();
        let v = r.pop_string()?.to_owned();
        out.push((k, v));
    }
    Ok(out)
}

fn write_str_pairs(w: &mut BufferWriter, pairs: &[(String, String)]) {
    w.write_u32(pairs.len() as u32);
    for (k, v) in pairs {
        w.write_string(k);
        w.write_string(v);
    }
}

fn read_string_list(r: &mut BufferReader<'_>) -> Result<Vec<String>, Error> {
    let n = r.pop_u16()?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        out.push(r.pop_string()?.to_owned());
    }
    Ok(out)
}

fn write_string_list(w: &mut BufferWriter, items: &[String]) {
    w.write_u16(items.len() as u16);
    for item in items {
        w.write_string(item);
    }
}

/// A single query's compile-time parameters, shared by `Parse` and
/// `Execute` (spec §4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct CompileParams {
    pub capabilities: Capabilities,
    pub compilation_flags: CompilationFlags,
    pub implicit_limit: u64,
    pub output_format: u8,
    pub expected_cardinality: Cardinality,
    pub command_text: String,
    pub state_type_id: Uuid,
    pub state_data: Vec<u8>,
}

impl CompileParams {
    fn write(&self, w: &mut BufferWriter) {
        w.write_u16(0); // headers, unused by this core
        w.write_u64(self.capabilities.bits());
        w.write_u64(self.compilation_flags.bits());
        w.write_u64(self.implicit_limit);
        w.write_u8(self.output_format);
        w.write_u8(self.expected_cardinality as u8);
        w.write_string(&self.command_text);
        w.write_uuid(&self.state_type_id);
        w.write_len_prefixed_bytes(&self.state_data);
    }

    fn read(r: &mut BufferReader<'_>) -> Result<Self, Error> {
        let _headers = read_headers(r)?;
        let capabilities = Capabilities::from_bits_retain(r.pop_u64()?);
        let compilation_flags = CompilationFlags::from_bits_retain(r.pop_u64()?);
        let implicit_limit = r.pop_u64()?;
        let output_format = r.pop_u8()?;
        let expected_cardinality = Cardinality::from_u8(r.pop_u8()?)
            .ok_or_else(|| Error::BinaryProtocol("unknown cardinality byte".into()))?;
        let command_text = r.pop_string()?.to_owned();
        let state_type_id = r.pop_uuid()?;
        let state_data = r.pop_len_prefixed_bytes()?.to_vec();

        Ok(CompileParams {
            capabilities,
            compilation_flags,
            implicit_limit,
            output_format,
            expected_cardinality,
            command_text,
            state_type_id,
            state_data,
        })
    }
}

/// A decoded protocol message. Encoding/decoding is split by direction:
/// `Message::encode` writes the ones a client ever sends; `Message::decode`
/// reads the ones a server ever sends. Calling the wrong direction is a
/// logic error, not a wire error, so both panic on an unreachable variant
/// rather than returning `Result`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ClientHandshake {
        major: u16,
        minor: u16,
        params: Vec<(String, String)>,
        extensions: Vec<String>,
    },
    ServerHandshake {
        major: u16,
        minor: u16,
        extensions: Vec<String>,
    },
    AuthenticationOk,
    AuthenticationSasl {
        methods: Vec<String>,
    },
    AuthenticationSaslContinue {
        sasl_data: Vec<u8>,
    },
    AuthenticationSaslFinal {
        sasl_data: Vec<u8>,
    },
    AuthenticationSaslInitialResponse {
        method: String,
        sasl_data: Vec<u8>,
    },
    AuthenticationSaslResponse {
        sasl_data: Vec<u8>,
    },
    Parse {
        params: CompileParams,
    },
    Execute {
        params: CompileParams,
        input_type_id: Uuid,
        output_type_id: Uuid,
        arguments: Vec<u8>,
    },
    Sync,
    CommandDataDescription {
        capabilities: Capabilities,
        result_cardinality: Cardinality,
        input_type_id: Uuid,
        input_type_descriptor: Vec<u8>,
        output_type_id: Uuid,
        output_type_descriptor: Vec<u8>,
    },
    StateDataDescription {
        type_id: Uuid,
        type_descriptor: Vec<u8>,
    },
    Data {
        chunks: Vec<Vec<u8>>,
    },
    CommandComplete {
        capabilities: Capabilities,
        status: String,
        state_type_id: Uuid,
        state_data: Vec<u8>,
    },
    ReadyForCommand {
        transaction_state: TransactionState,
    },
    ErrorResponse {
        severity: u8,
        code: u32,
        message: String,
        headers: ErrorHeaders,
    },
    LogMessage {
        severity: u8,
        code: u32,
        text: String,
    },
    ParameterStatus {
        name: String,
        value: Vec<u8>,
    },
}

const AUTH_OK: u32 = 0;
const AUTH_SASL: u32 = 0x0a;
const AUTH_SASL_CONTINUE: u32 = 0x0b;
const AUTH_SASL_FINAL: u32 = 0x0c;

impl Message {
    /// Writes this message as a complete framed payload (type byte +
    /// length prefix + body) onto `w`.
    pub fn encode(&self, w: &mut BufferWriter) {
        let msg_type = self.message_type();
        w.begin_message(msg_type as u8);

        match self {
            Message::ClientHandshake {
                major,
                minor,
                params,
                extensions,
            } => {
                w.write_u16(*major);
                w.write_u16(*minor);
                write_str_pairs(w, params);
                write_string_list(w, extensions);
            }
            Message::AuthenticationSaslInitialResponse { method, sasl_data } => {
                w.write_u32(AUTH_SASL);
                w.write_string(method);
                w.write_len_prefixed_bytes(sasl_data);
            }
            Message::AuthenticationSaslResponse { sasl_data } => {
                w.write_u32(AUTH_SASL_CONTINUE);
                w.write_len_prefixed_bytes(sasl_data);
            }
            Message::Parse { params } => params.write(w),
            Message::Execute {
                params,
                input_type_id,
                output_type_id,
                arguments,
            } => {
                params.write(w);
                w.write_uuid(input_type_id);
                w.write_uuid(output_type_id);
                w.write_bytes(arguments);
            }
            Message::Sync => {}
            other => unreachable!("{other:?} is never sent by a client"),
        }

        w.end_message();
    }

    fn message_type(&self) -> MessageType {
        match self {
            Message::ClientHandshake { .. } => MessageType::ClientHandshake,
            Message::ServerHandshake { .. } => MessageType::ServerHandshake,
            Message::AuthenticationOk
            | Message::AuthenticationSasl { .. }
            | Message::AuthenticationSaslContinue { .. }
            | Message::AuthenticationSaslFinal { .. }
            | Message::AuthenticationSaslInitialResponse { .. }
            | Message::AuthenticationSaslResponse { .. } => MessageType::Authentication,
            Message::Parse { .. } => MessageType::Parse,
            Message::Execute { .. } => MessageType::Execute,
            Message::Sync => MessageType::Sync,
            Message::CommandDataDescription { .. } => MessageType::CommandDataDescription,
            Message::StateDataDescription { .. } => MessageType::StateDataDescription,
            Message::Data { .. } => MessageType::Data,
            Message::CommandComplete { .. } => MessageType::CommandComplete,
            Message::ReadyForCommand { .. } => MessageType::ReadyForCommand,
            Message::ErrorResponse { .. } => MessageType::ErrorResponse,
            Message::LogMessage { .. } => MessageType::LogMessage,
            Message::ParameterStatus { .. } => MessageType::ParameterStatus,
        }
    }

    /// Decodes one message body, given its type byte and a reader bounded
    /// to exactly this message's payload.
    pub fn decode(msg_type: MessageType, r: &mut BufferReader<'_>) -> Result<Message, Error> {
        Ok(match msg_type {
            MessageType::ServerHandshake => {
                let major = r.pop_u16()?;
                let minor = r.pop_u16()?;
                let n = r.pop_u16()?;
                let mut extensions = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    extensions.push(r.pop_string()?.to_owned());
                    let _ext_headers = read_headers(r)?;
                }
                Message::ServerHandshake {
                    major,
                    minor,
                    extensions,
                }
            }
            MessageType::Authentication => {
                let status = r.pop_u32()?;
                match status {
                    AUTH_OK => Message::AuthenticationOk,
                    AUTH_SASL => {
                        let methods = read_string_list(r)?;
                        Message::AuthenticationSasl { methods }
                    }
                    AUTH_SASL_CONTINUE => Message::AuthenticationSaslContinue {
                        sasl_data: r.pop_len_prefixed_bytes()?.to_vec(),
                    },
                    AUTH_SASL_FINAL => Message::AuthenticationSaslFinal {
                        sasl_data: r.pop_len_prefixed_bytes()?.to_vec(),
                    },
                    other => {
                        return Err(Error::BinaryProtocol(format!(
                            "unknown authentication status {other}"
                        )))
                    }
                }
            }
            MessageType::CommandDataDescription => {
                let _headers = read_headers(r)?;
                let capabilities = Capabilities::from_bits_retain(r.pop_u64()?);
                let result_cardinality = Cardinality::from_u8(r.pop_u8()?)
                    .ok_or_else(|| Error::BinaryProtocol("unknown cardinality byte".into()))?;
                let input_type_id = r.pop_uuid()?;
                let input_type_descriptor = r.pop_len_prefixed_bytes()?.to_vec();
                let output_type_id = r.pop_uuid()?;
                let output_type_descriptor = r.pop_len_prefixed_bytes()?.to_vec();
                Message::CommandDataDescription {
                    capabilities,
                    result_cardinality,
                    input_type_id,
                    input_type_descriptor,
                    output_type_id,
                    output_type_descriptor,
                }
            }
            MessageType::StateDataDescription => Message::StateDataDescription {
                type_id: r.pop_uuid()?,
                type_descriptor: r.pop_len_prefixed_bytes()?.to_vec(),
            },
            MessageType::Data => {
                let n = r.pop_u16()?;
                let mut chunks = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    chunks.push(r.pop_len_prefixed_bytes()?.to_vec());
                }
                Message::Data { chunks }
            }
            MessageType::CommandComplete => {
                let _headers = read_headers(r)?;
                let capabilities = Capabilities::from_bits_retain(r.pop_u64()?);
                let status = r.pop_string()?.to_owned();
                let state_type_id = r.pop_uuid()?;
                let state_data = r.pop_len_prefixed_bytes()?.to_vec();
                Message::CommandComplete {
                    capabilities,
                    status,
                    state_type_id,
                    state_data,
                }
            }
            MessageType::ReadyForCommand => {
                let _headers = read_headers(r)?;
                let transaction_state = TransactionState::from_u8(r.pop_u8()?).ok_or_else(|| {
                    Error::BinaryProtocol("unknown transaction_state byte".into())
                })?;
                Message::ReadyForCommand { transaction_state }
            }
            MessageType::ErrorResponse => {
                let severity = r.pop_u8()?;
                let code = r.pop_u32()?;
                let message = r.pop_string()?.to_owned();
                let raw = read_headers(r)?;
                Message::ErrorResponse {
                    severity,
                    code,
                    message,
                    headers: ErrorHeaders { raw },
                }
            }
            MessageType::LogMessage => {
                let severity = r.pop_u8()?;
                let code = r.pop_u32()?;
                let text = r.pop_string()?.to_owned();
                let _headers = read_headers(r)?;
                Message::LogMessage {
                    severity,
                    code,
                    text,
                }
            }
            MessageType::ParameterStatus => {
                let name = r.pop_string()?.to_owned();
                let value = r.pop_len_prefixed_bytes()?.to_vec();
                Message::ParameterStatus { name, value }
            }
            other @ (MessageType::ClientHandshake
            | MessageType::Parse
            | MessageType::Execute
            | MessageType::Sync) => {
                return Err(Error::UnexpectedMessage(format!(
                    "{other:?} is never sent by a server"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::buffer::BufferReader;

    #[test]
    fn client_handshake_is_client_only() {
        let msg = Message::ClientHandshake {
            major: 2,
            minor: 0,
            params: vec![("user".into(), "admin".into())],
            extensions: vec![],
        };
        let mut w = BufferWriter::new();
        msg.encode(&mut w);
        assert_eq!(msg.message_type(), MessageType::ClientHandshake);
    }

    #[test]
    fn server_handshake_roundtrip() {
        let mut w = BufferWriter::new();
        w.begin_message(MessageType::ServerHandshake as u8);
        w.write_u16(1);
        w.write_u16(0);
        w.write_u16(0);
        w.end_message();
        let bytes = w.finish();

        let mut r = BufferReader::new(&bytes[5..]);
        let decoded = Message::decode(MessageType::ServerHandshake, &mut r).unwrap();
        assert_eq!(
            decoded,
            Message::ServerHandshake {
                major: 1,
                minor: 0,
                extensions: vec![],
            }
        );
    }

    #[test]
    fn error_response_headers_expose_caret_fields() {
        let mut w = BufferWriter::new();
        w.write_u8(5);
        w.write_u32(0x01);
        w.write_string("invalid reference");
        w.write_u16(2);
        w.write_u16(0x0001);
        w.write_len_prefixed_bytes(b"did you mean foo?");
        w.write_u16(0x0003);
        w.write_len_prefixed_bytes(&17u32.to_be_bytes());
        let bytes = w.finish();

        let mut r = BufferReader::new(&bytes);
        let msg = Message::decode(MessageType::ErrorResponse, &mut r).unwrap();
        let Message::ErrorResponse { headers, .. } = msg else {
            panic!("expected ErrorResponse");
        };
        assert_eq!(headers.hint().as_deref(), Some("did you mean foo?"));
        assert_eq!(headers.position_start(), Some(17));
    }

    #[test]
    fn execute_frame_is_well_formed() {
        // `Message::decode` deliberately has no case for `Execute` (a
        // server never sends one), so this checks the encoded frame shape
        // directly rather than round-tripping through `decode`.
        let msg = Message::Execute {
            params: CompileParams {
                capabilities: Capabilities::empty(),
                compilation_flags: CompilationFlags::empty(),
                implicit_limit: 0,
                output_format: 0,
                expected_cardinality: Cardinality::Many,
                command_text: "select 1".into(),
                state_type_id: Uuid::nil(),
                state_data: vec![],
            },
            input_type_id: Uuid::nil(),
            output_type_id: Uuid::nil(),
            arguments: vec![1, 2, 3],
        };

        let mut w = BufferWriter::new();
        msg.encode(&mut w);
        let bytes = w.finish();

        assert_eq!(bytes[0], MessageType::Execute as u8);
        let length = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as usize;
        assert_eq!(length, bytes.len() - 1);

        let mut r = BufferReader::new(&bytes[5..]);
        let params = CompileParams::read(&mut r).unwrap();
        assert_eq!(params.command_text, "select 1");
        assert_eq!(r.pop_uuid().unwrap(), Uuid::nil());
        assert_eq!(r.pop_uuid().unwrap(), Uuid::nil());
        assert!(r.pop_bytes(r.remaining()).unwrap() == [1, 2, 3]);
    }

    #[test]
    fn decode_rejects_client_only_message_types() {
        let bytes = [0u8; 0];
        let mut r = BufferReader::new(&bytes);
        let err = Message::decode(MessageType::Execute, &mut r).unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
    }

    #[test]
    fn unknown_auth_status_is_binary_protocol_error() {
        let mut w = BufferWriter::new();
        w.write_u32(999);
        let bytes = w.finish();
        let mut r = BufferReader::new(&bytes);
        let err = Message::decode(MessageType::Authentication, &mut r).unwrap_err();
        assert!(matches!(err, Error::BinaryProtocol(_)));
    }
}
