//! Caller-facing argument/result value type, and codecs for the built-in
//! scalar descriptors (spec §4.3, §9).
//!
//! Well-known scalar ids are assigned locally rather than read off a live
//! server's schema introspection, since base-scalar descriptors on the
//! wire carry no name (spec §4.2: a `BaseScalar` tag is bare id, no
//! string) — a client has to know in advance which id means `int32`.
//! Real deployments pin these to the server's actual ids; tests and
//! in-process round-trips only need them to be self-consistent.

use std::sync::Arc;

use uuid::Uuid;

use super::{Decoder, Encoder};
use crate::error::Error;
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::descriptor::Descriptor;
use crate::protocol::DescriptorId;

/// A dynamically-typed argument or result value; also the destination
/// [`Encoder`]/[`Decoder`] consume when no generated binding is in play
/// (`Value` implements [`super::Target`] directly).
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
    Object(Vec<(String, Value)>),
}

/// Locally-assigned ids for the built-in scalar types. Stable within one
/// process (declared as `const`s), not portable across processes or
/// meant to match any particular server's actual type ids.
pub mod well_known {
    use uuid::{uuid, Uuid};

    pub const BOOL: Uuid = uuid!("00000000-0000-0000-0000-000000000001");
    pub const INT16: Uuid = uuid!("00000000-0000-0000-0000-000000000002");
    pub const INT32: Uuid = uuid!("00000000-0000-0000-0000-000000000003");
    pub const INT64: Uuid = uuid!("00000000-0000-0000-0000-000000000004");
    pub const FLOAT32: Uuid = uuid!("00000000-0000-0000-0000-000000000005");
    pub const FLOAT64: Uuid = uuid!("00000000-0000-0000-0000-000000000006");
    pub const STR: Uuid = uuid!("00000000-0000-0000-0000-000000000007");
    pub const BYTES: Uuid = uuid!("00000000-0000-0000-0000-000000000008");
    pub const UUID: Uuid = uuid!("00000000-0000-0000-0000-000000000009");
    pub const JSON: Uuid = uuid!("00000000-0000-0000-0000-00000000000a");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
    Bytes,
    Uuid,
    Json,
}

fn kind_for(id: DescriptorId) -> Option<Kind> {
    use well_known::*;
    Some(match id {
        x if x == BOOL => Kind::Bool,
        x if x == INT16 => Kind::Int16,
        x if x == INT32 => Kind::Int32,
        x if x == INT64 => Kind::Int64,
        x if x == FLOAT32 => Kind::Float32,
        x if x == FLOAT64 => Kind::Float64,
        x if x == STR => Kind::Str,
        x if x == BYTES => Kind::Bytes,
        x if x == UUID => Kind::Uuid,
        x if x == JSON => Kind::Json,
        _ => return None,
    })
}

/// A [`Descriptor::Scalar`] for `std::str`, useful for building `Input`
/// shapes in tests without going through the server.
pub fn string_descriptor() -> Arc<Descriptor> {
    Arc::new(Descriptor::Scalar {
        id: well_known::STR,
        name: Some("std::str".into()),
        base_type: None,
    })
}

#[derive(Debug)]
struct ScalarCodec {
    id: DescriptorId,
    kind: Kind,
}

impl Decoder for ScalarCodec {
    fn descriptor_id(&self) -> DescriptorId {
        self.id
    }

    fn decode(
        &self,
        r: &mut BufferReader<'_>,
        dest: &mut dyn super::Target,
    ) -> Result<(), Error> {
        match self.kind {
            Kind::Bool => dest.set_bool(r.pop_u8()? != 0),
            Kind::Int16 => dest.set_i16(r.pop_u16()? as i16),
            Kind::Int32 => dest.set_i32(r.pop_i32()?),
            Kind::Int64 => dest.set_i64(r.pop_i64()?),
            Kind::Float32 => dest.set_f32(f32::from_bits(r.pop_u32()?)),
            Kind::Float64 => dest.set_f64(f64::from_bits(r.pop_u64()?)),
            Kind::Str | Kind::Json => {
                let bytes = r.pop_bytes(r.remaining())?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| Error::BinaryProtocol(format!("invalid utf-8: {e}")))?;
                dest.set_string(s.to_owned())
            }
            Kind::Bytes => {
                let bytes = r.pop_bytes(r.remaining())?.to_vec();
                dest.set_bytes(bytes)
            }
            Kind::Uuid => dest.set_uuid(r.pop_uuid()?),
        }
    }
}

impl Encoder for ScalarCodec {
    fn descriptor_id(&self) -> DescriptorId {
        self.id
    }

    fn encode(
        &self,
        w: &mut BufferWriter,
        value: &Value,
        path: &str,
        required: bool,
    ) -> Result<(), Error> {
        if matches!(value, Value::Null) {
            if required {
                return Err(Error::InvalidArgument(format!(
                    "{path}: required value is missing"
                )));
            }
            return Ok(());
        }

        match (self.kind, value) {
            (Kind::Bool, Value::Bool(v)) => w.write_u8(*v as u8),
            (Kind::Int16, Value::Int16(v)) => w.write_u16(*v as u16),
            (Kind::Int32, Value::Int32(v)) => w.write_i32(*v),
            (Kind::Int64, Value::Int64(v)) => w.write_i64(*v),
            (Kind::Float32, Value::Float32(v)) => w.write_u32(v.to_bits()),
            (Kind::Float64, Value::Float64(v)) => w.write_u64(v.to_bits()),
            (Kind::Str, Value::Str(v)) | (Kind::Json, Value::Str(v)) => w.write_bytes(v.as_bytes()),
            (Kind::Bytes, Value::Bytes(v)) => w.write_bytes(v),
            (Kind::Uuid, Value::Uuid(v)) => w.write_uuid(v),
            (kind, other) => {
                return Err(Error::InvalidArgument(format!(
                    "{path}: expected a value compatible with {kind:?}, got {other:?}"
                )))
            }
        }

        Ok(())
    }
}

pub(super) fn scalar_decoder(id: DescriptorId) -> Result<Arc<dyn Decoder>, Error> {
    let kind = kind_for(id)
        .ok_or_else(|| Error::InvalidArgument(format!("scalar {id} has no built-in codec")))?;
    Ok(Arc::new(ScalarCodec { id, kind }))
}

pub(super) fn scalar_encoder(id: DescriptorId) -> Result<Arc<dyn Encoder>, Error> {
    let kind = kind_for(id)
        .ok_or_else(|| Error::InvalidArgument(format!("scalar {id} has no built-in codec")))?;
    Ok(Arc::new(ScalarCodec { id, kind }))
}

/// Enum members come across the wire as plain strings; we represent a
/// decoded enum value as [`Value::Str`] rather than inventing a distinct
/// variant.
pub(super) fn scalar_decoder_as_string(id: DescriptorId) -> Arc<dyn Decoder> {
    Arc::new(ScalarCodec { id, kind: Kind::Str })
}

pub(super) fn scalar_encoder_as_string(id: DescriptorId) -> Arc<dyn Encoder> {
    Arc::new(ScalarCodec { id, kind: Kind::Str })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_roundtrip() {
        let codec = ScalarCodec {
            id: well_known::INT32,
            kind: Kind::Int32,
        };
        let mut w = BufferWriter::new();
        codec.encode(&mut w, &Value::Int32(-7), "", true).unwrap();
        let bytes = w.finish();

        let mut r = BufferReader::new(&bytes);
        let mut target = Value::default();
        codec.decode(&mut r, &mut target).unwrap();
        assert_eq!(target, Value::Int32(-7));
    }

    #[test]
    fn unknown_scalar_id_has_no_codec() {
        assert!(scalar_decoder(Uuid::new_v4()).is_err());
    }

    #[test]
    fn type_mismatch_on_encode_is_invalid_argument() {
        let codec = ScalarCodec {
            id: well_known::BOOL,
            kind: Kind::Bool,
        };
        let mut w = BufferWriter::new();
        let err = codec.encode(&mut w, &Value::Int32(1), "arg0", true).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(msg) if msg.contains("arg0")));
    }
}
