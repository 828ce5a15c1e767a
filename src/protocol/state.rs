//! Session state: the module/config/globals a connection carries across
//! statements, and its wire encoding (spec §4.4).
//!
//! Unlike query arguments, session state has no server-advertised
//! descriptor; its shape is fixed and known to the client ahead of time,
//! so it gets its own small hand-written codec instead of going through
//! [`crate::protocol::codec`].

use std::collections::BTreeMap;

use crate::error::Error;
use crate::protocol::buffer::{BufferReader, BufferWriter};

/// The session config keys the server accepts (spec §4.4: "every
/// user-supplied key must match a known path"). `globals`/`aliases` name
/// schema objects rather than a fixed option set, so only `config` is
/// checked against an allowlist; an unknown or mistyped key here is a
/// mistake the client can catch before ever writing it to the wire.
const KNOWN_CONFIG_KEYS: &[&str] = &[
    "apply_access_policies",
    "allow_bare_ddl",
    "allow_dml_in_functions",
    "allow_user_specified_id",
    "cardinality",
    "simple_scoping",
    "warn_old_scoping",
    "idle_transaction_timeout",
    "query_execution_timeout",
];

fn check_known_path(section: &str, key: &str) -> Result<(), Error> {
    if KNOWN_CONFIG_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(Error::BinaryProtocol(format!(
            "unknown session state path state.{section}.{key}"
        )))
    }
}

/// The `TransactionIsolation` session setting (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionIsolation {
    #[default]
    Serializable,
    RepeatableRead,
}

impl TransactionIsolation {
    fn as_str(&self) -> &'static str {
        match self {
            TransactionIsolation::Serializable => "Serializable",
            TransactionIsolation::RepeatableRead => "RepeatableRead",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "Serializable" => Ok(TransactionIsolation::Serializable),
            "RepeatableRead" => Ok(TransactionIsolation::RepeatableRead),
            other => Err(Error::InvalidArgument(format!(
                "unknown transaction isolation {other:?}"
            ))),
        }
    }
}

/// Everything a connection needs to resend after a reconnect to put the
/// server back into the same session (spec §4.4: "`module`, `aliases`,
/// `config`, `globals`"). Encoded as a `NamedTuple`-shaped payload on the
/// wire, keyed by these four fixed slots plus a free-form `config`/
/// `globals` map each.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionState {
    pub module: Option<String>,
    pub aliases: BTreeMap<String, String>,
    pub config: BTreeMap<String, String>,
    pub globals: BTreeMap<String, String>,
    pub isolation: Option<TransactionIsolation>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current module (`set module foo`), clearing it if `None`.
    pub fn set_module(&mut self, module: Option<String>) {
        self.module = module;
    }

    pub fn set_alias(&mut self, name: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(name.into(), target.into());
    }

    /// Sets a single config key (spec §4.4's `state.config.<key>`
    /// addressing used in error paths). An empty `value` removes the key
    /// (`reset`).
    pub fn set_config(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let key = key.into();
        if value.is_empty() {
            self.config.remove(&key);
        } else {
            self.config.insert(key, value);
        }
    }

    pub fn set_global(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let key = key.into();
        if value.is_empty() {
            self.globals.remove(&key);
        } else {
            self.globals.insert(key, value);
        }
    }

    /// Encodes this state for inclusion in a `Parse`/`Execute` message's
    /// state fields: `(type_id, data)`. A never-touched default state
    /// encodes to the zero-length `State_data_description` id, per spec
    /// §4.4's "an all-defaults session omits the state payload entirely"
    /// note — callers should check [`SessionState::is_default`] first and
    /// send the empty/no-op encoding instead of calling this.
    ///
    /// Every `config` key must match a known session setting; an unknown
    /// or mistyped one fails with [`Error::BinaryProtocol`] carrying a
    /// `state.config.<key>` path (spec §4.4).
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        for key in self.config.keys() {
            check_known_path("config", key)?;
        }

        let mut w = BufferWriter::new();
        write_map(&mut w, self.module.as_deref().into_iter().map(|m| ("module", m)));
        write_pairs(&mut w, &self.aliases);
        write_pairs(&mut w, &self.config);
        write_pairs(&mut w, &self.globals);
        w.write_string(
            self.isolation
                .unwrap_or_default()
                .as_str(),
        );
        Ok(w.finish().to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<SessionState, Error> {
        let mut r = BufferReader::new(data);
        let module = read_map(&mut r)?.into_iter().next().map(|(_, v)| v);
        let aliases = read_pairs(&mut r)?;
        let config = read_pairs(&mut r)?;
        let globals = read_pairs(&mut r)?;
        let isolation = Some(TransactionIsolation::parse(r.pop_string()?)?);

        Ok(SessionState {
            module,
            aliases,
            config,
            globals,
            isolation,
        })
    }

    /// True when this state matches a freshly-created connection's
    /// state, meaning it can be omitted from a message entirely.
    pub fn is_default(&self) -> bool {
        *self == SessionState::default()
    }
}

fn write_pairs(w: &mut BufferWriter, map: &BTreeMap<String, String>) {
    write_map(w, map.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

fn write_map<'a>(w: &mut BufferWriter, items: impl Iterator<Item = (&'a str, &'a str)>) {
    let items: Vec<_> = items.collect();
    w.write_u32(items.len() as u32);
    for (k, v) in items {
        w.write_string(k);
        w.write_string(v);
    }
}

fn read_pairs(r: &mut BufferReader<'_>) -> Result<BTreeMap<String, String>, Error> {
    Ok(read_map(r)?.into_iter().collect())
}

fn read_map(r: &mut BufferReader<'_>) -> Result<Vec<(String, String)>, Error> {
    let n = r.pop_u32()?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let k = r.pop_string()?.to_owned();
        let v = r.pop_string()?.to_owned();
        out.push((k, v));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_default() {
        assert!(SessionState::new().is_default());
    }

    #[test]
    fn roundtrip_through_encode_decode() {
        let mut state = SessionState::new();
        state.set_module(Some("default".into()));
        state.set_alias("std", "std");
        state.set_config("apply_access_policies", "true");
        state.set_global("current_user", "admin");

        let encoded = state.encode().unwrap();
        let decoded = SessionState::decode(&encoded).unwrap();
        assert_eq!(state, decoded);
        assert!(!decoded.is_default());
    }

    #[test]
    fn empty_value_removes_the_key() {
        let mut state = SessionState::new();
        state.set_config("apply_access_policies", "true");
        state.set_config("apply_access_policies", "");
        assert!(state.config.is_empty());
    }

    #[test]
    fn unknown_isolation_is_rejected() {
        let err = TransactionIsolation::parse("Chaotic").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn unknown_config_key_fails_encode_with_binary_protocol_error() {
        let mut state = SessionState::new();
        state.set_config("definitely_not_a_real_setting", "true");
        let err = state.encode().unwrap_err();
        assert!(matches!(
            err,
            Error::BinaryProtocol(msg) if msg.contains("state.config.definitely_not_a_real_setting")
        ));
    }

    #[test]
    fn known_config_key_encodes_successfully() {
        let mut state = SessionState::new();
        state.set_config("allow_bare_ddl", "AlwaysAllow");
        assert!(state.encode().is_ok());
    }
}
