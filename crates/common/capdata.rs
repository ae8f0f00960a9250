//! Capdata: the serialized value format that crosses every space boundary.
//!
//! A capdata value is a JSON body plus a slots array of capability
//! references. Capability positions in the body are marked with
//! `{"@qclass":"slot","index":n}`; the slots array at index `n` holds the
//! reference string (a `KRef` in kernel space, an `ERef` in an endpoint
//! space). The body never changes when a value crosses a boundary; only the
//! slots are rewritten.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CapDataError {
    #[error("capdata body is not valid JSON: {0}")]
    BadBody(String),
    #[error("slot marker index {index} out of range for {len} slots")]
    SlotIndexOutOfRange { index: u64, len: usize },
    #[error("slot {0} is never referenced by the body")]
    UnreferencedSlot(usize),
    #[error("slot marker has a malformed index")]
    MalformedSlotIndex,
}

/// A serialized value: JSON body plus capability slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<String>,
}

impl CapData {
    /// Builds a capdata value, validating that the slots array is exactly the
    /// set of slots the body references.
    pub fn new(body: impl Into<String>, slots: Vec<String>) -> Result<Self, CapDataError> {
        let capdata = CapData {
            body: body.into(),
            slots,
        };
        capdata.validate()?;
        Ok(capdata)
    }

    /// A capdata `null` with no slots.
    pub fn empty() -> Self {
        CapData {
            body: "null".to_string(),
            slots: Vec::new(),
        }
    }

    pub fn from_value(value: &Value, slots: Vec<String>) -> Result<Self, CapDataError> {
        CapData::new(value.to_string(), slots)
    }

    /// A value that is exactly one capability reference.
    pub fn single_slot(slot: impl Into<String>) -> Self {
        CapData {
            body: json!({"@qclass": "slot", "index": 0}).to_string(),
            slots: vec![slot.into()],
        }
    }

    /// Standard method-invocation encoding: `[method, [args...]]`.
    pub fn methargs(
        method: &str,
        args: Vec<Value>,
        slots: Vec<String>,
    ) -> Result<Self, CapDataError> {
        CapData::from_value(&json!([method, args]), slots)
    }

    pub fn body_value(&self) -> Result<Value, CapDataError> {
        serde_json::from_str(&self.body).map_err(|e| CapDataError::BadBody(e.to_string()))
    }

    /// If the body is exactly one slot marker, the referenced slot.
    pub fn as_single_slot(&self) -> Option<&str> {
        let value = self.body_value().ok()?;
        let index = slot_marker_index(&value)?;
        if index == 0 && self.slots.len() == 1 {
            self.slots.first().map(String::as_str)
        } else {
            None
        }
    }

    /// The set of slot indices the body references.
    pub fn referenced_slots(&self) -> Result<BTreeSet<u64>, CapDataError> {
        let value = self.body_value()?;
        let mut out = BTreeSet::new();
        collect_slot_refs(&value, &mut out)?;
        Ok(out)
    }

    /// Checks that slots are non-negative-integer addressable and exactly the
    /// set referenced by the body.
    pub fn validate(&self) -> Result<(), CapDataError> {
        let referenced = self.referenced_slots()?;
        for &index in &referenced {
            if index as usize >= self.slots.len() {
                return Err(CapDataError::SlotIndexOutOfRange {
                    index,
                    len: self.slots.len(),
                });
            }
        }
        for slot in 0..self.slots.len() {
            if !referenced.contains(&(slot as u64)) {
                return Err(CapDataError::UnreferencedSlot(slot));
            }
        }
        Ok(())
    }

    /// Rewrites every slot through `translate`, keeping the body intact.
    pub fn map_slots<E>(
        &self,
        mut translate: impl FnMut(&str) -> Result<String, E>,
    ) -> Result<CapData, E> {
        let mut slots = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            slots.push(translate(slot)?);
        }
        Ok(CapData {
            body: self.body.clone(),
            slots,
        })
    }
}

fn slot_marker_index(value: &Value) -> Option<u64> {
    let obj = value.as_object()?;
    if obj.len() == 2 && obj.get("@qclass")?.as_str()? == "slot" {
        obj.get("index")?.as_u64()
    } else {
        None
    }
}

fn collect_slot_refs(value: &Value, out: &mut BTreeSet<u64>) -> Result<(), CapDataError> {
    match value {
        Value::Object(obj) => {
            if obj.get("@qclass").and_then(Value::as_str) == Some("slot") {
                let index = obj
                    .get("index")
                    .and_then(Value::as_u64)
                    .ok_or(CapDataError::MalformedSlotIndex)?;
                out.insert(index);
                return Ok(());
            }
            for child in obj.values() {
                collect_slot_refs(child, out)?;
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_slot_refs(child, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_exact_slot_set() {
        let ok = CapData::new(
            r#"["deposit",[{"@qclass":"slot","index":0},{"@qclass":"slot","index":1}]]"#,
            vec!["ko1".into(), "ko2".into()],
        );
        assert!(ok.is_ok());

        let out_of_range = CapData::new(r#"{"@qclass":"slot","index":1}"#, vec!["ko1".into()]);
        assert_eq!(
            out_of_range,
            Err(CapDataError::SlotIndexOutOfRange { index: 1, len: 1 })
        );

        let unreferenced = CapData::new("[1,2,3]", vec!["ko1".into()]);
        assert_eq!(unreferenced, Err(CapDataError::UnreferencedSlot(0)));
    }

    #[test]
    fn single_slot_detection() {
        let capdata = CapData::single_slot("ko5");
        assert_eq!(capdata.as_single_slot(), Some("ko5"));
        assert!(capdata.validate().is_ok());

        let data = CapData::new("42", vec![]).expect("valid");
        assert_eq!(data.as_single_slot(), None);
    }

    #[test]
    fn map_slots_keeps_body() {
        let capdata = CapData::methargs(
            "foo",
            vec![json!({"@qclass":"slot","index":0})],
            vec!["ko1".into()],
        )
        .expect("valid");
        let translated = capdata
            .map_slots(|_| Ok::<_, CapDataError>("vo-1".to_string()))
            .expect("translate");
        assert_eq!(translated.body, capdata.body);
        assert_eq!(translated.slots, vec!["vo-1".to_string()]);
    }

    #[test]
    fn round_trip_preserves_structure() {
        let capdata = CapData::methargs(
            "bootstrap",
            vec![json!({"alice":{"@qclass":"slot","index":0},"bob":{"@qclass":"slot","index":1}})],
            vec!["ko1".into(), "ko2".into()],
        )
        .expect("valid");
        let encoded = serde_json::to_string(&capdata).expect("encode");
        let decoded: CapData = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, capdata);
        assert_eq!(
            decoded.referenced_slots().expect("slots"),
            [0, 1].into_iter().collect()
        );
    }
}
