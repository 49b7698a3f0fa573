//! Physical naming of pre-aggregation tables. A built table is named
//! `{table}_{content_version}_{structure_version}_{timestamp}`; the listing of
//! a schema is parsed back into [`VersionEntry`]s to find what is built.

use std::{
    collections::BTreeMap,
    sync::LazyLock,
};

use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    json,
    Value,
};
use sha2::{
    Digest,
    Sha256,
};

use super::PreAggregationDescription;
use crate::driver::TableCacheEntry;

const HASH_CHARSET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz012345";

/// Timestamps shorter than this are base32 seconds, longer ones raw millis.
const RAW_MILLIS_TIMESTAMP_LEN: usize = 13;

static TABLE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)_(.+)_(.+)_(.+)$").unwrap());

/// One physical table of a pre-aggregation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    /// Logical `schema.table` name.
    pub table_name: String,
    pub content_version: String,
    pub structure_version: String,
    /// Unix millis of the build start.
    pub last_updated_at: i64,
    /// 2 encodes the timestamp as base32 seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub naming_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_range_end: Option<String>,
}

/// Version entries of a schema, newest first, with lookups where the most
/// recent entry wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VersionEntries {
    pub version_entries: Vec<VersionEntry>,
    /// Keyed by `{table_name}_{structure_version}`.
    pub by_structure: BTreeMap<String, VersionEntry>,
    /// Keyed by `{table_name}_{content_version}`.
    pub by_content: BTreeMap<String, VersionEntry>,
    pub by_table_name: BTreeMap<String, VersionEntry>,
}

impl VersionEntries {
    pub fn new(version_entries: Vec<VersionEntry>) -> Self {
        let mut entries = Self::default();
        for entry in &version_entries {
            entries
                .by_content
                .entry(format!("{}_{}", entry.table_name, entry.content_version))
                .or_insert_with(|| entry.clone());
            entries
                .by_structure
                .entry(format!("{}_{}", entry.table_name, entry.structure_version))
                .or_insert_with(|| entry.clone());
            entries
                .by_table_name
                .entry(entry.table_name.clone())
                .or_insert_with(|| entry.clone());
        }
        entries.version_entries = version_entries;
        entries
    }
}

/// Short base32 digest of a JSON value. Stable across processes since it
/// only depends on the serialized value.
pub fn version(value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    let mut result = String::new();
    let mut residue: u64 = 0;
    let mut shift_counter: u32 = 0;
    for byte in &digest[..5] {
        shift_counter += 8;
        residue |= u64::from(*byte) << (shift_counter - 8);
        while residue >> 5 != 0 {
            result.push(char::from(HASH_CHARSET[(residue % 32) as usize]));
            shift_counter -= 5;
            residue >>= 5;
        }
    }
    result.push(char::from(HASH_CHARSET[(residue % 32) as usize]));
    result
}

fn version_components(pre_aggregation: &PreAggregationDescription) -> Vec<Value> {
    let load_sql = pre_aggregation
        .structure_version_load_sql
        .as_ref()
        .unwrap_or(&pre_aggregation.load_sql);
    let mut components = vec![json!(load_sql)];
    if !pre_aggregation.indexes_sql.is_empty() {
        components.push(json!(pre_aggregation.indexes_sql));
    }
    if let Some(stream_offset) = &pre_aggregation.stream_offset {
        components.push(json!(stream_offset));
    }
    if let Some(output_column_types) = &pre_aggregation.output_column_types {
        components.push(json!(output_column_types));
    }
    components
}

/// Changes whenever the table's shape changes: its SQL, indexes or stream
/// settings. Partition boundaries are excluded.
pub fn structure_version(pre_aggregation: &PreAggregationDescription) -> String {
    let mut components = version_components(pre_aggregation);
    if components.len() == 1 {
        version(&components.remove(0))
    } else {
        version(&Value::Array(components))
    }
}

/// Changes whenever the structure or the refresh-key values change.
pub fn content_version(
    pre_aggregation: &PreAggregationDescription,
    invalidation_keys: &Value,
) -> String {
    let mut components = version_components(pre_aggregation);
    components.push(invalidation_keys.clone());
    version(&Value::Array(components))
}

fn encode_base32(mut n: u64) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    if n == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 32) as usize]);
        n /= 32;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn encode_timestamp(entry: &VersionEntry) -> String {
    if entry.naming_version == Some(2) {
        encode_base32(u64::try_from(entry.last_updated_at / 1000).unwrap_or(0))
    } else {
        entry.last_updated_at.to_string()
    }
}

/// Physical name of the table described by `entry`.
pub fn target_table_name(entry: &VersionEntry) -> String {
    format!(
        "{}_{}_{}_{}",
        entry.table_name,
        entry.content_version,
        entry.structure_version,
        encode_timestamp(entry)
    )
}

/// Glob of every table `target_table_name` can produce for this structure.
pub fn target_table_name_pattern(table_name: &str, structure_version: &str) -> String {
    format!("{table_name}_*_{structure_version}_*")
}

/// Parses the table listing of `schema`. Tables that don't follow the
/// naming scheme are ignored.
pub fn tables_to_version_entries(schema: &str, tables: &[TableCacheEntry]) -> Vec<VersionEntry> {
    let mut entries: Vec<VersionEntry> = tables
        .iter()
        .filter_map(|table| {
            let captures = TABLE_NAME_REGEX.captures(&table.table_name)?;
            let timestamp = &captures[4];
            let (last_updated_at, naming_version) = if timestamp.len() < RAW_MILLIS_TIMESTAMP_LEN {
                (i64::from_str_radix(timestamp, 32).ok()? * 1000, Some(2))
            } else {
                (timestamp.parse().ok()?, None)
            };
            Some(VersionEntry {
                table_name: format!("{schema}.{}", &captures[1]),
                content_version: captures[2].to_owned(),
                structure_version: captures[3].to_owned(),
                last_updated_at,
                naming_version,
                build_range_end: table.build_range_end.clone(),
            })
        })
        .collect();
    entries.sort_by_key(|entry| std::cmp::Reverse(entry.last_updated_at));
    entries
}

/// Error text for a pre-aggregation that has no built partition yet.
pub fn no_pre_aggregation_partitions_built_message(
    pre_aggregations: &[PreAggregationDescription],
) -> String {
    let expected: Vec<String> = pre_aggregations
        .iter()
        .map(|p| target_table_name_pattern(&p.table_name, &structure_version(p)))
        .collect();
    format!(
        "No pre-aggregation partitions were built yet for the pre-aggregation serving this \
         query and this API instance wasn't set up to build pre-aggregations. Please make sure \
         your refresh worker is configured correctly, running, pre-aggregation tables are built \
         and all pre-aggregation refresh settings like timezone match. Expected table name \
         patterns: {}",
        expected.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{
        content_version,
        structure_version,
        tables_to_version_entries,
        target_table_name,
        version,
        VersionEntries,
        VersionEntry,
    };
    use crate::{
        driver::TableCacheEntry,
        pre_aggregations::PreAggregationDescription,
        query_cache::QueryWithParams,
    };

    fn table(name: &str) -> TableCacheEntry {
        TableCacheEntry {
            table_name: name.to_owned(),
            build_range_end: None,
        }
    }

    #[test]
    fn test_version_is_short_and_stable() {
        let v = version(&json!(["SELECT 1", []]));
        assert_eq!(v, version(&json!(["SELECT 1", []])));
        assert_ne!(v, version(&json!(["SELECT 2", []])));
        assert!(v.len() <= 8);
        assert!(v
            .chars()
            .all(|c| c.is_ascii_lowercase() || ('0'..='5').contains(&c)));
    }

    #[test]
    fn test_structure_and_content_versions() {
        let mut p = PreAggregationDescription {
            table_name: "pre.orders".to_owned(),
            load_sql: QueryWithParams::new("CREATE TABLE pre.orders AS SELECT 1", vec![]),
            ..Default::default()
        };
        let structure = structure_version(&p);
        assert_eq!(structure, version(&json!(p.load_sql)));
        let content = content_version(&p, &json!([[{"max": 1}]]));
        assert_ne!(content, content_version(&p, &json!([[{"max": 2}]])));

        p.structure_version_load_sql = Some(QueryWithParams::new("partition shape", vec![]));
        assert_ne!(structure_version(&p), structure);
    }

    #[test]
    fn test_most_recent_entry_wins() {
        let entries = tables_to_version_entries(
            "pre",
            &[
                table("foo_v1_s1_100"),
                table("foo_v2_s1_200"),
                table("not_versioned"),
            ],
        );
        assert_eq!(entries.len(), 2);
        let entries = VersionEntries::new(entries);
        let latest = &entries.by_structure["pre.foo_s1"];
        assert_eq!(latest.content_version, "v2");
        assert_eq!(target_table_name(latest), "pre.foo_v2_s1_200");
        assert_eq!(entries.by_table_name["pre.foo"].content_version, "v2");
        // Short timestamps are base32 seconds.
        assert_eq!(entries.by_content["pre.foo_v1"].last_updated_at, 1024 * 1000);
    }

    #[test]
    fn test_naming_versions() {
        let entry = VersionEntry {
            table_name: "pre.orders_by_day".to_owned(),
            content_version: "abc".to_owned(),
            structure_version: "def".to_owned(),
            last_updated_at: 1_700_000_000_000,
            naming_version: Some(2),
            build_range_end: None,
        };
        let name = target_table_name(&entry);
        assert_eq!(name, "pre.orders_by_day_abc_def_1il7s80");
        let parsed = tables_to_version_entries("pre", &[table(&name["pre.".len()..])]);
        assert_eq!(parsed, vec![entry.clone()]);

        let legacy = VersionEntry {
            naming_version: None,
            ..entry
        };
        let name = target_table_name(&legacy);
        assert_eq!(name, "pre.orders_by_day_abc_def_1700000000000");
        let parsed = tables_to_version_entries("pre", &[table(&name["pre.".len()..])]);
        assert_eq!(parsed, vec![legacy]);
    }
}
