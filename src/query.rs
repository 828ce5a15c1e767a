//! The `Query` value and the method-name → `{format, cardinality}` table
//! (spec §3 `Query`/`IdPair`, §4.10 Query API façade).
//!
//! The full convenience API (`client.query::<T>(...)`, JSON variants,
//! reflection-based struct binding) is an external collaborator (spec
//! §1); this module is the thin internal piece it builds on: resolving a
//! method name to wire parameters and producing the immutable `Query`
//! value `granular_flow` consumes.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::codec::{TargetFingerprint, Target, Value};
use crate::protocol::state::SessionState;
use crate::protocol::Capabilities;

pub use crate::protocol::Cardinality;

/// Wire encoding requested for the result set (spec §4.6 "Format rules").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Binary,
    Json,
    Null,
}

impl Format {
    /// The byte `CompileParams::output_format` carries on the wire.
    pub fn wire_byte(&self) -> u8 {
        match self {
            Format::Binary => b'b',
            Format::Json => b'j',
            Format::Null => b'n',
        }
    }
}

/// The five methods the façade resolves (spec §4.10's table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMethod {
    Execute,
    Query,
    QuerySingle,
    QueryJson,
    QuerySingleJson,
}

impl QueryMethod {
    /// `(format, expected_cardinality)` for this method, per spec §4.10.
    pub fn format_and_cardinality(&self) -> (Format, Cardinality) {
        match self {
            QueryMethod::Execute => (Format::Null, Cardinality::Many),
            QueryMethod::Query => (Format::Binary, Cardinality::Many),
            QueryMethod::QuerySingle => (Format::Binary, Cardinality::AtMostOne),
            QueryMethod::QueryJson => (Format::Json, Cardinality::Many),
            QueryMethod::QuerySingleJson => (Format::Json, Cardinality::AtMostOne),
        }
    }
}

/// The composite cache key for per-connection `IdPair`/capabilities maps
/// (Glossary: "Fingerprint").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub command_text: Arc<str>,
    pub format: Format,
    pub expected_cardinality: Cardinality,
    pub target_type_fingerprint: TargetFingerprint,
}

/// A cached pair of descriptor ids for one fingerprint (spec §3 `IdPair`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdPair {
    pub input_type_id: uuid::Uuid,
    pub output_type_id: uuid::Uuid,
}

/// The polymorphic write target for a query's result, paired with the
/// opaque handle that keys the output-codec cache (spec §3: "Destination
/// carries the polymorphic write target").
pub struct Destination {
    pub target: Box<dyn Target>,
    pub target_type_fingerprint: TargetFingerprint,
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("target", &self.target)
            .field("target_type_fingerprint", &self.target_type_fingerprint)
            .finish()
    }
}

impl Destination {
    pub fn new(target: Box<dyn Target>, target_type_fingerprint: TargetFingerprint) -> Self {
        Destination {
            target,
            target_type_fingerprint,
        }
    }

    pub fn is_optional_capable(&self) -> bool {
        self.target.is_optional_capable()
    }
}

/// Callback invoked with a non-empty warnings list decoded from a server
/// response header (spec §4.6 "Warnings"). Returning an error aborts the
/// call.
pub type WarningHandler = Arc<dyn Fn(&[Error]) -> Result<()> + Send + Sync>;

/// An immutable description of one call into `granular_flow` (spec §3
/// `Query`).
pub struct Query {
    pub method: QueryMethod,
    pub command_text: Arc<str>,
    pub format: Format,
    pub expected_cardinality: Cardinality,
    pub arguments: Value,
    pub capabilities_mask: Capabilities,
    pub session_state: SessionState,
    pub destination: Destination,
    pub warning_handler: Option<WarningHandler>,
    pub is_script: bool,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("method", &self.method)
            .field("command_text", &self.command_text)
            .field("format", &self.format)
            .field("expected_cardinality", &self.expected_cardinality)
            .field("is_script", &self.is_script)
            .finish_non_exhaustive()
    }
}

impl Query {
    /// Builds a `Query` for `method`, validating the destination against
    /// that method's rules (spec §4.10 "Destination validation").
    pub fn build(
        method: QueryMethod,
        command_text: impl Into<Arc<str>>,
        arguments: Value,
        destination: Destination,
        capabilities_mask: Capabilities,
        session_state: SessionState,
    ) -> Result<Query> {
        let (format, expected_cardinality) = method.format_and_cardinality();

        match method {
            QueryMethod::QuerySingleJson if !destination.target.is_byte_sequence() => {
                return Err(Error::Interface(
                    "QuerySingleJson destination must be a byte sequence or optional byte sequence"
                        .into(),
                ));
            }
            QueryMethod::Query if !destination.target.is_growable_sequence() => {
                return Err(Error::Interface(
                    "Query destination must be a growable sequence whose element type supplies a decoder"
                        .into(),
                ));
            }
            QueryMethod::QuerySingle if !destination.target.is_scalar() => {
                return Err(Error::Interface(
                    "QuerySingle destination must be a scalar or optional scalar".into(),
                ));
            }
            _ => {}
        }

        Ok(Query {
            method,
            command_text: command_text.into(),
            format,
            expected_cardinality,
            arguments,
            capabilities_mask,
            session_state,
            destination,
            warning_handler: None,
            is_script: false,
        })
    }

    /// A script-mode call (spec §4.6 "Script-mode"): skips Parse, ignores
    /// in/out codecs, used for transaction control and multi-statement
    /// scripts.
    pub fn script(command_text: impl Into<Arc<str>>, capabilities_mask: Capabilities) -> Query {
        Query {
            method: QueryMethod::Execute,
            command_text: command_text.into(),
            format: Format::Null,
            expected_cardinality: Cardinality::Many,
            arguments: Value::Null,
            capabilities_mask,
            session_state: SessionState::new(),
            destination: Destination::new(Box::new(Value::default()), 0),
            warning_handler: None,
            is_script: true,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            command_text: self.command_text.clone(),
            format: self.format,
            expected_cardinality: self.expected_cardinality,
            target_type_fingerprint: self.destination.target_type_fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_table_matches_spec() {
        assert_eq!(
            QueryMethod::Execute.format_and_cardinality(),
            (Format::Null, Cardinality::Many)
        );
        assert_eq!(
            QueryMethod::QuerySingle.format_and_cardinality(),
            (Format::Binary, Cardinality::AtMostOne)
        );
        assert_eq!(
            QueryMethod::QuerySingleJson.format_and_cardinality(),
            (Format::Json, Cardinality::AtMostOne)
        );
    }

    #[test]
    fn fingerprint_is_stable_for_identical_inputs() {
        let dest = || Destination::new(Box::new(Value::default()), 7);
        let q1 = Query::build(
            QueryMethod::Query,
            "select 1",
            Value::Null,
            dest(),
            Capabilities::empty(),
            SessionState::new(),
        )
        .unwrap();
        let q2 = Query::build(
            QueryMethod::Query,
            "select 1",
            Value::Null,
            dest(),
            Capabilities::empty(),
            SessionState::new(),
        )
        .unwrap();
        assert_eq!(q1.fingerprint(), q2.fingerprint());
    }

    /// A destination that refuses every shape predicate, standing in for a
    /// generated binding that doesn't fit any of the three checked methods.
    #[derive(Debug, Default)]
    struct OpaqueTarget;

    impl Target for OpaqueTarget {
        fn set_field<'a>(&'a mut self, _name: &str) -> Result<&'a mut dyn Target, Error> {
            unreachable!()
        }
        fn set_element<'a>(&'a mut self, _index: usize) -> Result<&'a mut dyn Target, Error> {
            unreachable!()
        }
        fn push_element(&mut self) -> Result<&mut dyn Target, Error> {
            unreachable!()
        }
        fn set_bool(&mut self, _v: bool) -> Result<(), Error> {
            unreachable!()
        }
        fn set_i16(&mut self, _v: i16) -> Result<(), Error> {
            unreachable!()
        }
        fn set_i32(&mut self, _v: i32) -> Result<(), Error> {
            unreachable!()
        }
        fn set_i64(&mut self, _v: i64) -> Result<(), Error> {
            unreachable!()
        }
        fn set_f32(&mut self, _v: f32) -> Result<(), Error> {
            unreachable!()
        }
        fn set_f64(&mut self, _v: f64) -> Result<(), Error> {
            unreachable!()
        }
        fn set_string(&mut self, _v: String) -> Result<(), Error> {
            unreachable!()
        }
        fn set_bytes(&mut self, _v: Vec<u8>) -> Result<(), Error> {
            unreachable!()
        }
        fn set_uuid(&mut self, _v: uuid::Uuid) -> Result<(), Error> {
            unreachable!()
        }
    }

    #[test]
    fn query_rejects_a_destination_that_is_not_a_growable_sequence() {
        let err = Query::build(
            QueryMethod::Query,
            "select 1",
            Value::Null,
            Destination::new(Box::new(OpaqueTarget), 1),
            Capabilities::empty(),
            SessionState::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Interface(msg) if msg.contains("growable sequence")));
    }

    #[test]
    fn query_single_rejects_a_non_scalar_destination() {
        let err = Query::build(
            QueryMethod::QuerySingle,
            "select 1",
            Value::Null,
            Destination::new(Box::new(OpaqueTarget), 1),
            Capabilities::empty(),
            SessionState::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Interface(msg) if msg.contains("scalar")));
    }

    #[test]
    fn query_single_json_rejects_a_non_byte_sequence_destination() {
        let err = Query::build(
            QueryMethod::QuerySingleJson,
            "select 1",
            Value::Null,
            Destination::new(Box::new(OpaqueTarget), 1),
            Capabilities::empty(),
            SessionState::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Interface(msg) if msg.contains("byte sequence")));
    }

    #[test]
    fn execute_accepts_any_destination_shape() {
        Query::build(
            QueryMethod::Execute,
            "select 1",
            Value::Null,
            Destination::new(Box::new(OpaqueTarget), 1),
            Capabilities::empty(),
            SessionState::new(),
        )
        .unwrap();
    }
}
