//! Entitlements and their embedded blob forms
//!
//! One insertion-ordered dictionary feeds both the XML blob (slot 5) and the
//! DER blob (slot 7), so the two can never disagree.

use super::constants::{CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, CSMAGIC_EMBEDDED_ENTITLEMENTS};
use super::der;
use super::superblob::wrap_blob;
use crate::Result;
use plist::{Dictionary, Value};

/// Key granting debugger attachment.
pub const GET_TASK_ALLOW: &str = "get-task-allow";

/// An entitlements dictionary.
///
/// Keys keep their insertion order, which makes the serialized blobs
/// byte-stable for a given construction sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entitlements {
    dict: Dictionary,
}

impl Entitlements {
    /// Empty entitlements, as embedded in non-executable binaries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing dictionary.
    pub fn from_dictionary(dict: Dictionary) -> Self {
        Self { dict }
    }

    /// Parse an XML or binary plist holding a dictionary.
    pub fn from_plist_bytes(data: &[u8]) -> Result<Self> {
        let dict: Dictionary = plist::from_bytes(data)?;
        Ok(Self { dict })
    }

    /// Insert or replace a key, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.dict.insert(key.into(), value.into());
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.dict.get(key)
    }

    /// The underlying dictionary.
    pub fn as_dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// True when `get-task-allow` is set, i.e. a debuggable build.
    pub fn get_task_allow(&self) -> bool {
        self.dict
            .get(GET_TASK_ALLOW)
            .and_then(Value::as_boolean)
            .unwrap_or(false)
    }

    /// The `application-identifier` entitlement, if any.
    pub fn application_identifier(&self) -> Option<&str> {
        self.dict
            .get("application-identifier")
            .and_then(Value::as_string)
    }

    /// Serialize as an XML plist.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &self.dict)?;
        Ok(buf)
    }

    /// XML entitlements blob (0xfade7171).
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(wrap_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, &self.to_xml()?))
    }

    /// DER entitlements blob (0xfade7172).
    pub fn to_der_blob(&self) -> Result<Vec<u8>> {
        Ok(wrap_blob(
            CSMAGIC_EMBEDDED_DER_ENTITLEMENTS,
            &der::encode_entitlements(&self.dict)?,
        ))
    }
}
