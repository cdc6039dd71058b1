//! Canonical blueprints: the byte string an environment specification
//! deterministically boils down to, and whose SHA256 keys the catalog.

use data_encoding::HEXLOWER;
use serde_yaml::Value;
use sha2::{Digest as _, Sha256};

/// Canonicalize an environment specification so that two logically equal
/// specs produce byte-identical blueprints.
///
/// YAML input is parsed and re-emitted with mapping keys sorted at every
/// level; sequences keep their order (channel priority is meaning, not
/// noise). Input that doesn't parse as YAML falls back to line
/// normalization: `\n` endings, trailing whitespace trimmed, trailing
/// blank lines dropped. Either way the result ends with one newline.
pub fn canonical(spec: &str) -> Vec<u8> {
    match serde_yaml::from_str::<Value>(spec) {
        Ok(value) => {
            let normalized = normalize(value);
            match serde_yaml::to_string(&normalized) {
                Ok(out) => out.into_bytes(),
                Err(_) => normalize_lines(spec),
            }
        }
        Err(_) => normalize_lines(spec),
    }
}

fn normalize(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut entries: Vec<(Value, Value)> = map
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .collect();
            entries.sort_by_key(|(k, _)| key_string(k));
            Value::Mapping(entries.into_iter().collect())
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(normalize).collect()),
        other => other,
    }
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default(),
    }
}

fn normalize_lines(spec: &str) -> Vec<u8> {
    let mut lines: Vec<&str> = spec.lines().map(|l| l.trim_end()).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out.into_bytes()
}

/// `hex(sha256(blueprint))`, the catalog key.
pub fn hash(blueprint: &[u8]) -> String {
    HEXLOWER.encode(&Sha256::digest(blueprint))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn equivalent_specs_hash_identically() {
        let a = "channels:\r\n  - conda-forge\r\n  - defaults   \r\ndependencies:\r\n  - python=3.11\r\n  - pip\r\n\r\n";
        let b = "dependencies:\n  - python=3.11\n  - pip\nchannels:\n  - conda-forge\n  - defaults";
        assert_eq!(canonical(a), canonical(b));
        assert_eq!(hash(&canonical(a)), hash(&canonical(b)));
    }

    #[test]
    fn nested_keys_sort_too() {
        let a = "outer:\n  zeta: 1\n  alpha: 2\n";
        let b = "outer:\n  alpha: 2\n  zeta: 1\n";
        assert_eq!(canonical(a), canonical(b));
    }

    #[test]
    fn sequence_order_is_meaning() {
        let a = "channels:\n  - conda-forge\n  - defaults\n";
        let b = "channels:\n  - defaults\n  - conda-forge\n";
        assert_ne!(canonical(a), canonical(b));
    }

    #[test]
    fn non_yaml_falls_back_to_line_normalization() {
        let a = "just: some: odd :: text  \nwith trailing   \n\n\n";
        let canon = canonical(a);
        assert!(canon.ends_with(b"\n"));
        assert!(!canon.ends_with(b"\n\n"));
    }

    #[test]
    fn hash_shape() {
        let h = hash(&canonical("dependencies:\n  - python\n"));
        assert_eq!(h.len(), 64);
        assert!(crate::hashing::plausible_digest(&h));
    }
}
