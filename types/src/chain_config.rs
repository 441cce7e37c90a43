use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde_json::Value;

// Spec fields compared across upstreams. A disagreement on any of them means
// the endpoints are not on the same chain.
const TRACKED_FIELDS: &[&str] = &[
    "PRESET_BASE",
    "CONFIG_NAME",
    "SECONDS_PER_SLOT",
    "SLOTS_PER_EPOCH",
    "DEPOSIT_CHAIN_ID",
    "DEPOSIT_NETWORK_ID",
];

/// Chain configuration assembled from an upstream `/eth/v1/config/spec`
/// response. The first upstream to report a spec freezes it for the pool.
#[derive(Clone, Debug, Default)]
pub struct ChainConfig {
    pub preset_base: String,
    pub config_name: String,
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    raw: BTreeMap<String, String>,
}

impl ChainConfig {
    pub fn from_spec_values(values: &BTreeMap<String, Value>) -> Result<Self> {
        let raw = values
            .iter()
            .map(|(key, value)| (key.clone(), display_value(value)))
            .collect::<BTreeMap<_, _>>();

        Ok(Self {
            preset_base: string_field(&raw, "PRESET_BASE"),
            config_name: string_field(&raw, "CONFIG_NAME"),
            seconds_per_slot: numeric_field(&raw, "SECONDS_PER_SLOT")?,
            slots_per_epoch: numeric_field(&raw, "SLOTS_PER_EPOCH")?,
            raw,
        })
    }

    /// Compares the tracked spec fields and reports every disagreement.
    #[must_use]
    pub fn check_mismatch(&self, other: &Self) -> Vec<String> {
        TRACKED_FIELDS
            .iter()
            .filter_map(|field| {
                let own = self.raw.get(*field);
                let theirs = other.raw.get(*field);

                match (own, theirs) {
                    (Some(own), Some(theirs)) if own != theirs => {
                        Some(format!("{field}: {own} != {theirs}"))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn raw_values(&self) -> &BTreeMap<String, String> {
        &self.raw
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(string) => string.clone(),
        other => other.to_string(),
    }
}

fn string_field(raw: &BTreeMap<String, String>, field: &str) -> String {
    raw.get(field).cloned().unwrap_or_default()
}

fn numeric_field(raw: &BTreeMap<String, String>, field: &str) -> Result<u64> {
    let value = raw
        .get(field)
        .ok_or_else(|| anyhow!("spec is missing {field}"))?;

    value
        .parse()
        .map_err(|_| anyhow!("spec field {field} is not a number: {value}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn spec_values(slots_per_epoch: &str) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("PRESET_BASE".to_owned(), json!("mainnet")),
            ("CONFIG_NAME".to_owned(), json!("mainnet")),
            ("SECONDS_PER_SLOT".to_owned(), json!("12")),
            ("SLOTS_PER_EPOCH".to_owned(), json!(slots_per_epoch)),
            ("DEPOSIT_CHAIN_ID".to_owned(), json!("1")),
        ])
    }

    #[test]
    fn spec_values_are_parsed() -> Result<()> {
        let config = ChainConfig::from_spec_values(&spec_values("32"))?;

        assert_eq!(config.preset_base, "mainnet");
        assert_eq!(config.seconds_per_slot, 12);
        assert_eq!(config.slots_per_epoch, 32);

        Ok(())
    }

    #[test]
    fn matching_specs_produce_no_mismatches() -> Result<()> {
        let first = ChainConfig::from_spec_values(&spec_values("32"))?;
        let second = ChainConfig::from_spec_values(&spec_values("32"))?;

        assert!(first.check_mismatch(&second).is_empty());

        Ok(())
    }

    #[test]
    fn differing_specs_report_the_offending_field() -> Result<()> {
        let first = ChainConfig::from_spec_values(&spec_values("32"))?;
        let second = ChainConfig::from_spec_values(&spec_values("16"))?;

        let mismatches = first.check_mismatch(&second);

        assert_eq!(mismatches, vec!["SLOTS_PER_EPOCH: 32 != 16"]);

        Ok(())
    }

    #[test]
    fn missing_numeric_field_is_an_error() {
        let mut values = spec_values("32");
        values.remove("SLOTS_PER_EPOCH");

        ChainConfig::from_spec_values(&values)
            .expect_err("missing SLOTS_PER_EPOCH should fail parsing");
    }
}
