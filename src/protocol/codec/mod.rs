//! Codec registry: turns descriptors into encoders/decoders and caches
//! them by descriptor id (spec §4.3).
//!
//! Mirrors the split the teacher draws between a type (`TagStructRead`/
//! `TagStructWrite`) and the thing that walks it (`TagStructReader`/
//! `Writer`), except here the descriptor tree is data (decoded at
//! runtime from the server, not known at compile time), so encoders and
//! decoders are built dynamically by walking a [`Descriptor`] tree rather
//! than derived on a Rust type.

pub mod scalars;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::descriptor::{CompoundOp, Descriptor, DescriptorId, FieldCardinality};
use crate::protocol::ProtocolVersion;

pub use scalars::Value;

/// Opaque handle identifying a caller's result-destination *type* (not
/// instance) — participates in the `out_codecs` cache key alongside the
/// descriptor id, so one descriptor can coexist with decoders built for
/// several different caller types (spec §4.3). Reflection-based bindings
/// would derive this from a `TypeId`; generated bindings can just assign
/// sequential ids per generated type.
pub type TargetFingerprint = u64;

/// The write side of the descriptor/codec tree (spec §9's `Target`
/// design note): the decoder speaks only this interface, so reflection
/// bindings implement it once and generated bindings implement it per
/// type.
pub trait Target: std::fmt::Debug {
    /// Descends into a named field, returning a child target to decode
    /// into. Used for object/named-tuple/input shapes.
    fn set_field<'a>(&'a mut self, name: &str) -> Result<&'a mut dyn Target, Error>;

    /// Descends into a positional element (tuple, or the next slot of an
    /// array/set being filled left-to-right).
    fn set_element<'a>(&'a mut self, index: usize) -> Result<&'a mut dyn Target, Error>;

    /// Appends and returns a new element slot, for set/array destinations
    /// whose length isn't known up front.
    fn push_element(&mut self) -> Result<&mut dyn Target, Error>;

    /// Reserves room for `n` upcoming elements, if the destination can
    /// use the hint; purely advisory.
    fn reserve(&mut self, _n: usize) {}

    fn set_bool(&mut self, v: bool) -> Result<(), Error>;
    fn set_i16(&mut self, v: i16) -> Result<(), Error>;
    fn set_i32(&mut self, v: i32) -> Result<(), Error>;
    fn set_i64(&mut self, v: i64) -> Result<(), Error>;
    fn set_f32(&mut self, v: f32) -> Result<(), Error>;
    fn set_f64(&mut self, v: f64) -> Result<(), Error>;
    fn set_string(&mut self, v: String) -> Result<(), Error>;
    fn set_bytes(&mut self, v: Vec<u8>) -> Result<(), Error>;
    fn set_uuid(&mut self, v: uuid::Uuid) -> Result<(), Error>;

    /// Marks this slot as present-but-empty-result, used when
    /// `AtMostOne` cardinality yields zero rows into an optional-capable
    /// destination (spec §4.6). Destinations that can't represent
    /// "missing" should return an `InvalidArgument` error.
    fn set_missing(&mut self) -> Result<(), Error> {
        Err(Error::InvalidArgument(
            "destination does not support a missing/optional result".into(),
        ))
    }

    /// Whether `set_missing` is meaningful for this destination (spec
    /// §4.6's "optional capability").
    fn is_optional_capable(&self) -> bool {
        false
    }

    /// Whether this destination accepts a single scalar value (spec
    /// §4.10: `QuerySingle` requires a scalar or optional scalar).
    fn is_scalar(&self) -> bool {
        false
    }

    /// Whether this destination accepts a single byte sequence — `str` or
    /// `bytes` — used for JSON-formatted results (spec §4.10:
    /// `QuerySingleJSON` requires a byte sequence or optional byte
    /// sequence).
    fn is_byte_sequence(&self) -> bool {
        false
    }

    /// Whether this destination can grow to hold an unbounded number of
    /// elements via [`Target::push_element`] (spec §4.10: `Query` requires
    /// a growable sequence whose element type supplies a decoder).
    fn is_growable_sequence(&self) -> bool {
        false
    }
}

/// Decodes wire bytes for one descriptor into a caller's [`Target`].
pub trait Decoder: Send + Sync + std::fmt::Debug {
    fn descriptor_id(&self) -> DescriptorId;
    fn decode(&self, r: &mut BufferReader<'_>, dest: &mut dyn Target) -> Result<(), Error>;
}

/// Encodes a caller-supplied [`Value`] into wire bytes for one
/// descriptor.
pub trait Encoder: Send + Sync + std::fmt::Debug {
    fn descriptor_id(&self) -> DescriptorId;

    /// `path` is a dotted location used for error messages (spec §4.3:
    /// `state.globals.mod::name`); `required` means a missing value at
    /// this position is an error rather than encoded as empty.
    fn encode(
        &self,
        w: &mut BufferWriter,
        value: &Value,
        path: &str,
        required: bool,
    ) -> Result<(), Error>;
}

fn join_path(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_owned()
    } else {
        format!("{path}.{field}")
    }
}

#[derive(Debug)]
struct ArrayLikeDecoder {
    id: DescriptorId,
    element: Arc<dyn Decoder>,
}

impl Decoder for ArrayLikeDecoder {
    fn descriptor_id(&self) -> DescriptorId {
        self.id
    }

    fn decode(&self, r: &mut BufferReader<'_>, dest: &mut dyn Target) -> Result<(), Error> {
        let n = r.pop_u32()? as usize;
        dest.reserve(n);
        for _ in 0..n {
            let len = r.pop_u32()? as usize;
            let mut sub = r.sub_reader(len)?;
            let slot = dest.push_element()?;
            self.element.decode(&mut sub, slot)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TupleDecoder {
    id: DescriptorId,
    elements: Vec<Arc<dyn Decoder>>,
}

impl Decoder for TupleDecoder {
    fn descriptor_id(&self) -> DescriptorId {
        self.id
    }

    fn decode(&self, r: &mut BufferReader<'_>, dest: &mut dyn Target) -> Result<(), Error> {
        let n = r.pop_u32()? as usize;
        if n != self.elements.len() {
            return Err(Error::BinaryProtocol(format!(
                "tuple element count mismatch: descriptor has {}, wire has {n}",
                self.elements.len()
            )));
        }
        for (i, element) in self.elements.iter().enumerate() {
            let len = r.pop_u32()? as usize;
            let mut sub = r.sub_reader(len)?;
            let slot = dest.set_element(i)?;
            element.decode(&mut sub, slot)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct NamedTupleDecoder {
    id: DescriptorId,
    fields: Vec<(String, Arc<dyn Decoder>)>,
}

#[derive(Debug)]
struct ObjectDecoder {
    id: DescriptorId,
    fields: Vec<(String, Arc<dyn Decoder>)>,
}

fn decode_fields(
    fields: &[(String, Arc<dyn Decoder>)],
    r: &mut BufferReader<'_>,
    dest: &mut dyn Target,
) -> Result<(), Error> {
    let n = r.pop_u32()? as usize;
    if n != fields.len() {
        return Err(Error::BinaryProtocol(format!(
            "field count mismatch: descriptor has {}, wire has {n}",
            fields.len()
        )));
    }
    for (name, decoder) in fields {
        let len = r.pop_i32()?;
        let slot = dest.set_field(name)?;
        if len < 0 {
            // A negative length marks an absent (not-included) field.
            slot.set_missing()?;
            continue;
        }
        let mut sub = r.sub_reader(len as usize)?;
        decoder.decode(&mut sub, slot)?;
    }
    Ok(())
}

impl Decoder for NamedTupleDecoder {
    fn descriptor_id(&self) -> DescriptorId {
        self.id
    }

    fn decode(&self, r: &mut BufferReader<'_>, dest: &mut dyn Target) -> Result<(), Error> {
        decode_fields(&self.fields, r, dest)
    }
}

impl Decoder for ObjectDecoder {
    fn descriptor_id(&self) -> DescriptorId {
        self.id
    }

    fn decode(&self, r: &mut BufferReader<'_>, dest: &mut dyn Target) -> Result<(), Error> {
        decode_fields(&self.fields, r, dest)
    }
}

/// Builds a [`Decoder`] for `descriptor`, writing into destinations that
/// match `fingerprint`.
pub fn build_decoder(
    descriptor: &Arc<Descriptor>,
    _fingerprint: TargetFingerprint,
) -> Result<Arc<dyn Decoder>, Error> {
    Ok(match descriptor.as_ref() {
        Descriptor::Scalar { id, .. } => scalars::scalar_decoder(*id)?,
        Descriptor::Set { id, element_type } | Descriptor::Array { id, element_type } => {
            Arc::new(ArrayLikeDecoder {
                id: *id,
                element: build_decoder(element_type, _fingerprint)?,
            })
        }
        Descriptor::Range { id, element_type } => Arc::new(ArrayLikeDecoder {
            id: *id,
            element: build_decoder(element_type, _fingerprint)?,
        }),
        Descriptor::Tuple { id, elements } => {
            let elements = elements
                .iter()
                .map(|e| build_decoder(e, _fingerprint))
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(TupleDecoder { id: *id, elements })
        }
        Descriptor::NamedTuple { id, fields } => {
            let fields = fields
                .iter()
                .map(|f| Ok((f.name.clone(), build_decoder(&f.type_desc, _fingerprint)?)))
                .collect::<Result<Vec<_>, Error>>()?;
            Arc::new(NamedTupleDecoder { id: *id, fields })
        }
        Descriptor::Object { id, fields } | Descriptor::Input { id, fields } => {
            let decoded_fields = fields
                .iter()
                .map(|f| Ok((f.name.clone(), build_decoder(&f.type_desc, _fingerprint)?)))
                .collect::<Result<Vec<_>, Error>>()?;
            Arc::new(ObjectDecoder {
                id: *id,
                fields: decoded_fields,
            })
        }
        Descriptor::Enum { id, .. } => scalars::scalar_decoder_as_string(*id),
        Descriptor::ObjectType { id, .. } | Descriptor::Compound { id, .. } => {
            return Err(Error::InvalidArgument(format!(
                "descriptor {id} has no representable output shape"
            )))
        }
    })
}

#[derive(Debug)]
struct ArrayLikeEncoder {
    id: DescriptorId,
    element: Arc<dyn Encoder>,
}

impl Encoder for ArrayLikeEncoder {
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
        let items = match value {
            Value::Array(items) => items,
            Value::Null if !required => {
                w.write_i32(-1);
                return Ok(());
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "{path}: expected an array, got {other:?}"
                )))
            }
        };

        w.write_u32(items.len() as u32);
        for (i, item) in items.iter().enumerate() {
            encode_with_length(w, self.element.as_ref(), item, &format!("{path}[{i}]"), true)?;
        }
        Ok(())
    }
}

fn encode_with_length(
    w: &mut BufferWriter,
    encoder: &dyn Encoder,
    value: &Value,
    path: &str,
    required: bool,
) -> Result<(), Error> {
    let mut inner = BufferWriter::new();
    encoder.encode(&mut inner, value, path, required)?;
    let bytes = inner.finish();
    w.write_u32(bytes.len() as u32);
    w.write_bytes(&bytes);
    Ok(())
}

#[derive(Debug)]
struct ObjectEncoder {
    id: DescriptorId,
    fields: Vec<(String, Arc<dyn Encoder>, bool)>,
}

impl Encoder for ObjectEncoder {
    fn descriptor_id(&self) -> DescriptorId {
        self.id
    }

    fn encode(
        &self,
        w: &mut BufferWriter,
        value: &Value,
        path: &str,
        _required: bool,
    ) -> Result<(), Error> {
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "{path}: expected an object, got {other:?}"
                )))
            }
        };

        w.write_u32(self.fields.len() as u32);
        for (name, encoder, required) in &self.fields {
            let field_path = join_path(path, name);
            let found = map.iter().find(|(k, _)| k == name).map(|(_, v)| v);

            match found {
                Some(v) => encode_with_length(w, encoder.as_ref(), v, &field_path, *required)?,
                None if *required => {
                    return Err(Error::InvalidArgument(format!(
                        "{field_path}: required value is missing"
                    )))
                }
                None => w.write_i32(-1),
            }
        }
        Ok(())
    }
}

/// Builds an [`Encoder`] for `descriptor` (an `Input` shape or a scalar
/// argument), for `version`.
pub fn build_encoder(
    descriptor: &Arc<Descriptor>,
    version: ProtocolVersion,
) -> Result<Arc<dyn Encoder>, Error> {
    Ok(match descriptor.as_ref() {
        Descriptor::Scalar { id, .. } => scalars::scalar_encoder(*id)?,
        Descriptor::Array { id, element_type } | Descriptor::Set { id, element_type } => {
            Arc::new(ArrayLikeEncoder {
                id: *id,
                element: build_encoder(element_type, version)?,
            })
        }
        Descriptor::Range { id, element_type } => Arc::new(ArrayLikeEncoder {
            id: *id,
            element: build_encoder(element_type, version)?,
        }),
        Descriptor::Input { id, fields } | Descriptor::Object { id, fields } => {
            let fields = fields
                .iter()
                .map(|f| {
                    Ok((
                        f.name.clone(),
                        build_encoder(&f.type_desc, version)?,
                        matches!(f.cardinality, FieldCardinality::One | FieldCardinality::AtLeastOne),
                    ))
                })
                .collect::<Result<Vec<_>, Error>>()?;
            Arc::new(ObjectEncoder { id: *id, fields })
        }
        Descriptor::Enum { id, .. } => scalars::scalar_encoder_as_string(*id),
        other => {
            return Err(Error::InvalidArgument(format!(
                "descriptor {} has no representable input shape ({other:?})",
                other.id()
            )))
        }
    })
}

/// Cache key for the output-codec map: a descriptor id paired with the
/// caller's destination type, so the same descriptor can be decoded into
/// more than one Rust type concurrently (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct OutKey(DescriptorId, TargetFingerprint);

/// Builds and caches encoders/decoders by descriptor id (spec §4.3).
/// Shared by descriptor-id across all connections of one client; never
/// mutated after construction of an individual codec (only the maps grow).
#[derive(Debug, Default)]
pub struct CodecRegistry {
    in_codecs: RwLock<HashMap<DescriptorId, Arc<dyn Encoder>>>,
    out_codecs: RwLock<HashMap<OutKey, Arc<dyn Decoder>>>,
}

impl CodecRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn encoder_for(&self, id: DescriptorId) -> Option<Arc<dyn Encoder>> {
        self.in_codecs.read().unwrap().get(&id).cloned()
    }

    pub fn decoder_for(
        &self,
        id: DescriptorId,
        fingerprint: TargetFingerprint,
    ) -> Option<Arc<dyn Decoder>> {
        self.out_codecs
            .read()
            .unwrap()
            .get(&OutKey(id, fingerprint))
            .cloned()
    }

    /// Builds (if absent) and returns the encoder for `descriptor`.
    pub fn get_or_build_encoder(
        &self,
        descriptor: &Arc<Descriptor>,
        version: ProtocolVersion,
    ) -> Result<Arc<dyn Encoder>, Error> {
        if let Some(enc) = self.encoder_for(descriptor.id()) {
            return Ok(enc);
        }

        let enc = build_encoder(descriptor, version)?;
        self.in_codecs
            .write()
            .unwrap()
            .insert(descriptor.id(), enc.clone());
        Ok(enc)
    }

    /// Builds (if absent) and returns the decoder for `descriptor` against
    /// `fingerprint`.
    pub fn get_or_build_decoder(
        &self,
        descriptor: &Arc<Descriptor>,
        fingerprint: TargetFingerprint,
    ) -> Result<Arc<dyn Decoder>, Error> {
        if let Some(dec) = self.decoder_for(descriptor.id(), fingerprint) {
            return Ok(dec);
        }

        let dec = build_decoder(descriptor, fingerprint)?;
        self.out_codecs
            .write()
            .unwrap()
            .insert(OutKey(descriptor.id(), fingerprint), dec.clone());
        Ok(dec)
    }
}

/// [`Value`] implements [`Target`] directly, so it doubles as the
/// destination used by tests and by callers who haven't generated a typed
/// binding — the dynamic analogue of reflection (spec §9: "Reflection-based
/// bindings implement it once").
impl Target for Value {
    fn set_field<'a>(&'a mut self, name: &str) -> Result<&'a mut dyn Target, Error> {
        if !matches!(self, Value::Object(_)) {
            *self = Value::Object(Vec::new());
        }
        let Value::Object(fields) = self else {
            unreachable!()
        };
        if !fields.iter().any(|(k, _)| k == name) {
            fields.push((name.to_owned(), Value::Null));
        }
        let (_, slot) = fields.iter_mut().find(|(k, _)| k == name).unwrap();
        Ok(slot)
    }

    fn set_element<'a>(&'a mut self, index: usize) -> Result<&'a mut dyn Target, Error> {
        if !matches!(self, Value::Tuple(_)) {
            *self = Value::Tuple(Vec::new());
        }
        let Value::Tuple(items) = self else {
            unreachable!()
        };
        while items.len() <= index {
            items.push(Value::Null);
        }
        Ok(&mut items[index])
    }

    fn push_element(&mut self) -> Result<&mut dyn Target, Error> {
        if !matches!(self, Value::Array(_)) {
            *self = Value::Array(Vec::new());
        }
        let Value::Array(items) = self else {
            unreachable!()
        };
        items.push(Value::Null);
        Ok(items.last_mut().unwrap())
    }

    fn set_bool(&mut self, v: bool) -> Result<(), Error> {
        *self = Value::Bool(v);
        Ok(())
    }

    fn set_i16(&mut self, v: i16) -> Result<(), Error> {
        *self = Value::Int16(v);
        Ok(())
    }

    fn set_i32(&mut self, v: i32) -> Result<(), Error> {
        *self = Value::Int32(v);
        Ok(())
    }

    fn set_i64(&mut self, v: i64) -> Result<(), Error> {
        *self = Value::Int64(v);
        Ok(())
    }

    fn set_f32(&mut self, v: f32) -> Result<(), Error> {
        *self = Value::Float32(v);
        Ok(())
    }

    fn set_f64(&mut self, v: f64) -> Result<(), Error> {
        *self = Value::Float64(v);
        Ok(())
    }

    fn set_string(&mut self, v: String) -> Result<(), Error> {
        *self = Value::Str(v);
        Ok(())
    }

    fn set_bytes(&mut self, v: Vec<u8>) -> Result<(), Error> {
        *self = Value::Bytes(v);
        Ok(())
    }

    fn set_uuid(&mut self, v: uuid::Uuid) -> Result<(), Error> {
        *self = Value::Uuid(v);
        Ok(())
    }

    fn set_missing(&mut self) -> Result<(), Error> {
        *self = Value::Null;
        Ok(())
    }

    fn is_optional_capable(&self) -> bool {
        true
    }

    fn is_scalar(&self) -> bool {
        true
    }

    fn is_byte_sequence(&self) -> bool {
        true
    }

    fn is_growable_sequence(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::descriptor::{self, ObjectField};
    use uuid::Uuid;

    fn bool_descriptor() -> Arc<Descriptor> {
        Arc::new(Descriptor::Scalar {
            id: scalars::well_known::BOOL,
            name: Some("std::bool".into()),
            base_type: None,
        })
    }

    fn int32_descriptor() -> Arc<Descriptor> {
        Arc::new(Descriptor::Scalar {
            id: scalars::well_known::INT32,
            name: Some("std::int32".into()),
            base_type: None,
        })
    }

    #[test]
    fn scalar_roundtrip_through_registry() {
        let registry = CodecRegistry::new();
        let desc = int32_descriptor();

        let enc = registry.get_or_build_encoder(&desc, ProtocolVersion::new(2, 0)).unwrap();
        let mut w = BufferWriter::new();
        enc.encode(&mut w, &Value::Int32(42), "", true).unwrap();
        let bytes = w.finish();

        let dec = registry.get_or_build_decoder(&desc, 1).unwrap();
        let mut r = BufferReader::new(&bytes);
        let mut target = Value::default();
        dec.decode(&mut r, &mut target).unwrap();

        assert_eq!(target, Value::Int32(42));
    }

    #[test]
    fn array_of_bool_roundtrip() {
        let array_id = Uuid::new_v4();
        let desc = Arc::new(Descriptor::Array {
            id: array_id,
            element_type: bool_descriptor(),
        });

        let enc = build_encoder(&desc, ProtocolVersion::new(2, 0)).unwrap();
        let mut w = BufferWriter::new();
        let value = Value::Array(vec![Value::Bool(true), Value::Bool(false)]);
        enc.encode(&mut w, &value, "", true).unwrap();
        let bytes = w.finish();

        let dec = build_decoder(&desc, 1).unwrap();
        let mut r = BufferReader::new(&bytes);
        let mut target = Value::default();
        dec.decode(&mut r, &mut target).unwrap();

        assert_eq!(
            target,
            Value::Array(vec![Value::Bool(true), Value::Bool(false)])
        );
    }

    #[test]
    fn object_with_missing_required_field_is_invalid_argument() {
        let object_id = Uuid::new_v4();
        let desc = Arc::new(Descriptor::Input {
            id: object_id,
            fields: vec![ObjectField {
                name: "name".into(),
                type_desc: scalars::string_descriptor(),
                cardinality: descriptor::FieldCardinality::One,
            }],
        });

        let enc = build_encoder(&desc, ProtocolVersion::new(2, 0)).unwrap();
        let mut w = BufferWriter::new();
        let err = enc.encode(&mut w, &Value::Object(vec![]), "state", true).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(msg) if msg.contains("state.name")));
    }
}
