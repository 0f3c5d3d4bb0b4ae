//! Reference-resolution helpers for `[TABLE:NAME]` fields.
//!
//! QoS, buffer and CoPP entries point at sibling objects through
//! bracketed references. A reference resolves against the owning
//! subsystem's type maps: table name to (object name to handle).

use crate::consumer::KeyOpFieldValues;
use crate::task::{OrchError, OrchResult};
use std::collections::HashMap;
use switchyd_sad::RawOid;

/// Table name to (object name to handle).
pub type TypeMaps = HashMap<String, HashMap<String, RawOid>>;

/// Outcome of resolving a singleton reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefResolve {
    /// Field present and its reference resolved.
    Success(RawOid),
    /// Field absent from the entry.
    FieldNotFound,
    /// Field present but the referenced object is not installed yet.
    NotResolved,
    /// Field appears more than once.
    Multiple,
}

/// Outcome of resolving a reference-list field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefArrayResolve {
    Success(Vec<RawOid>),
    FieldNotFound,
    NotResolved,
    Multiple,
}

/// Parses `[TABLE:NAME]`, validating the bracket framing and the
/// single `:` separator.
pub fn parse_reference(reference: &str) -> OrchResult<(String, String)> {
    if reference.len() < 3 || !reference.starts_with('[') || !reference.ends_with(']') {
        return Err(OrchError::parse(format!(
            "malformed reference {:?}: must be framed by [ ]",
            reference
        )));
    }
    let content = &reference[1..reference.len() - 1];
    let mut tokens = content.split(':');
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(table), Some(name), None) if !table.is_empty() && !name.is_empty() => {
            Ok((table.to_string(), name.to_string()))
        }
        _ => Err(OrchError::parse(format!(
            "malformed reference {:?}: must contain one ':'",
            reference
        ))),
    }
}

fn resolve_one(type_maps: &TypeMaps, reference: &str) -> Option<RawOid> {
    let (table, name) = parse_reference(reference).ok()?;
    type_maps.get(&table)?.get(&name).copied()
}

/// Resolves a singleton `[TABLE:NAME]` field of an entry.
pub fn resolve_field_ref(
    type_maps: &TypeMaps,
    field_name: &str,
    entry: &KeyOpFieldValues,
) -> RefResolve {
    let mut hit: Option<RawOid> = None;
    for (field, value) in &entry.field_values {
        if field != field_name {
            continue;
        }
        if hit.is_some() {
            return RefResolve::Multiple;
        }
        match resolve_one(type_maps, value) {
            Some(oid) => hit = Some(oid),
            None => return RefResolve::NotResolved,
        }
    }
    match hit {
        Some(oid) => RefResolve::Success(oid),
        None => RefResolve::FieldNotFound,
    }
}

/// Resolves a comma-separated reference-list field of an entry.
pub fn resolve_field_ref_array(
    type_maps: &TypeMaps,
    field_name: &str,
    entry: &KeyOpFieldValues,
) -> RefArrayResolve {
    let mut hit: Option<Vec<RawOid>> = None;
    for (field, value) in &entry.field_values {
        if field != field_name {
            continue;
        }
        if hit.is_some() {
            return RefArrayResolve::Multiple;
        }
        let mut oids = Vec::new();
        for item in value.split(',') {
            match resolve_one(type_maps, item) {
                Some(oid) => oids.push(oid),
                None => return RefArrayResolve::NotResolved,
            }
        }
        hit = Some(oids);
    }
    match hit {
        Some(oids) => RefArrayResolve::Success(oids),
        None => RefArrayResolve::FieldNotFound,
    }
}

/// Parses `"lo-hi"` or `"n"` into an inclusive (low, high) pair.
pub fn parse_index_range(input: &str) -> OrchResult<(u32, u32)> {
    if let Some((low_str, high_str)) = input.split_once('-') {
        let low = parse_u32_auto(low_str)?;
        let high = parse_u32_auto(high_str)?;
        if low >= high {
            return Err(OrchError::parse(format!(
                "malformed index range {:?}: low must be less than high",
                input
            )));
        }
        Ok((low, high))
    } else {
        let value = parse_u32_auto(input)?;
        Ok((value, value))
    }
}

/// Parses a decimal or 0x-prefixed hexadecimal unsigned number.
pub fn parse_u32_auto(input: &str) -> OrchResult<u32> {
    let s = input.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| OrchError::parse(format!("invalid number {:?}", input)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::KeyOpFieldValues;

    fn maps() -> TypeMaps {
        let mut maps = TypeMaps::new();
        let mut profiles = HashMap::new();
        profiles.insert("wred0".to_string(), 0x10u64);
        profiles.insert("wred1".to_string(), 0x11u64);
        maps.insert("WRED_PROFILE_TABLE".to_string(), profiles);
        maps
    }

    #[test]
    fn test_parse_reference() {
        let (table, name) = parse_reference("[WRED_PROFILE_TABLE:wred0]").unwrap();
        assert_eq!(table, "WRED_PROFILE_TABLE");
        assert_eq!(name, "wred0");

        assert!(parse_reference("WRED_PROFILE_TABLE:wred0").is_err());
        assert!(parse_reference("[WRED_PROFILE_TABLE]").is_err());
        assert!(parse_reference("[a:b:c]").is_err());
        assert!(parse_reference("[]").is_err());
    }

    #[test]
    fn test_resolve_field_ref() {
        let entry = KeyOpFieldValues::set(
            "Ethernet0:3",
            vec![(
                "wred_profile".to_string(),
                "[WRED_PROFILE_TABLE:wred0]".to_string(),
            )],
        );

        assert_eq!(
            resolve_field_ref(&maps(), "wred_profile", &entry),
            RefResolve::Success(0x10)
        );
        assert_eq!(
            resolve_field_ref(&maps(), "scheduler", &entry),
            RefResolve::FieldNotFound
        );
    }

    #[test]
    fn test_resolve_field_ref_unresolved() {
        let entry = KeyOpFieldValues::set(
            "Ethernet0:3",
            vec![(
                "wred_profile".to_string(),
                "[WRED_PROFILE_TABLE:missing]".to_string(),
            )],
        );
        assert_eq!(
            resolve_field_ref(&maps(), "wred_profile", &entry),
            RefResolve::NotResolved
        );
    }

    #[test]
    fn test_resolve_field_ref_array() {
        let entry = KeyOpFieldValues::set(
            "Ethernet0",
            vec![(
                "profile_list".to_string(),
                "[WRED_PROFILE_TABLE:wred0],[WRED_PROFILE_TABLE:wred1]".to_string(),
            )],
        );
        assert_eq!(
            resolve_field_ref_array(&maps(), "profile_list", &entry),
            RefArrayResolve::Success(vec![0x10, 0x11])
        );
    }

    #[test]
    fn test_parse_index_range() {
        assert_eq!(parse_index_range("3").unwrap(), (3, 3));
        assert_eq!(parse_index_range("0-7").unwrap(), (0, 7));
        assert!(parse_index_range("7-0").is_err());
        assert!(parse_index_range("3-3").is_err());
        assert!(parse_index_range("x").is_err());
    }

    #[test]
    fn test_parse_u32_auto() {
        assert_eq!(parse_u32_auto("255").unwrap(), 255);
        assert_eq!(parse_u32_auto("0x88be").unwrap(), 0x88be);
        assert!(parse_u32_auto("0xzz").is_err());
    }
}
