//! Attribute-value maps and modification lists shared by the protocol
//! decoder, schema validation and backends.

use std::collections::BTreeMap;

/// An entry's attributes: attribute description to its values.
pub type Attributes = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add,
    Delete,
    Replace,
    /// Set the values outright; used when a whole entry is validated as new.
    Set,
}

impl ModifyOperation {
    /// Wire value of ModifyRequest `operation` ENUMERATED.
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(ModifyOperation::Add),
            1 => Some(ModifyOperation::Delete),
            2 => Some(ModifyOperation::Replace),
            _ => None,
        }
    }
}

/// One `attr -> [opKind, values...]` change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub op: ModifyOperation,
    pub attr: String,
    pub values: Vec<String>,
}

impl Modification {
    pub fn new(op: ModifyOperation, attr: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            op,
            attr: attr.into(),
            values,
        }
    }

    pub fn add(attr: impl Into<String>, values: Vec<String>) -> Self {
        Self::new(ModifyOperation::Add, attr, values)
    }

    pub fn delete(attr: impl Into<String>, values: Vec<String>) -> Self {
        Self::new(ModifyOperation::Delete, attr, values)
    }

    pub fn replace(attr: impl Into<String>, values: Vec<String>) -> Self {
        Self::new(ModifyOperation::Replace, attr, values)
    }
}

/// Case-insensitive attribute lookup, for callers without a schema.
pub fn get_values<'a>(attrs: &'a Attributes, name: &str) -> Option<&'a Vec<String>> {
    attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

/// Apply one change to a plain value list (no schema checks).
pub fn apply_values(current: &mut Vec<String>, op: ModifyOperation, values: &[String]) {
    match op {
        ModifyOperation::Add => {
            for v in values {
                if !current.contains(v) {
                    current.push(v.clone());
                }
            }
        }
        ModifyOperation::Delete => {
            if values.is_empty() {
                current.clear();
            } else {
                current.retain(|v| !values.contains(v));
            }
        }
        ModifyOperation::Replace | ModifyOperation::Set => {
            *current = values.to_vec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vals(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_apply_add_dedups() {
        let mut cur = vals(&["a", "b"]);
        apply_values(&mut cur, ModifyOperation::Add, &vals(&["b", "c"]));
        assert_eq!(cur, vals(&["a", "b", "c"]));
    }

    #[test]
    fn test_apply_delete() {
        let mut cur = vals(&["a", "b", "c"]);
        apply_values(&mut cur, ModifyOperation::Delete, &vals(&["b"]));
        assert_eq!(cur, vals(&["a", "c"]));
        apply_values(&mut cur, ModifyOperation::Delete, &[]);
        assert!(cur.is_empty());
    }

    #[test]
    fn test_apply_replace() {
        let mut cur = vals(&["a"]);
        apply_values(&mut cur, ModifyOperation::Replace, &vals(&["x", "y"]));
        assert_eq!(cur, vals(&["x", "y"]));
    }

    #[test]
    fn test_get_values_case_insensitive() {
        let mut attrs = Attributes::new();
        attrs.insert("objectClass".to_string(), vals(&["top"]));
        assert_eq!(get_values(&attrs, "OBJECTCLASS"), Some(&vals(&["top"])));
        assert_eq!(get_values(&attrs, "cn"), None);
    }

    #[test]
    fn test_operation_from_wire() {
        assert_eq!(ModifyOperation::from_wire(0), Some(ModifyOperation::Add));
        assert_eq!(ModifyOperation::from_wire(2), Some(ModifyOperation::Replace));
        assert_eq!(ModifyOperation::from_wire(3), None);
    }
}
