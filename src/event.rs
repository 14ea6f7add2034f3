use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

/// One record as delivered by the streaming source. Only `value` is
/// processed; the rest is envelope metadata used for logging.
///
/// Null fields (tombstones carry a null `value`) read as their default so a
/// single odd record cannot reject the whole batch.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaRecord {
    #[serde(deserialize_with = "null_as_default")]
    pub topic: String,
    #[serde(deserialize_with = "null_as_default")]
    pub partition: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub offset: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp_type: String,
    pub key: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub value: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A batch of records grouped by partition key (`<topic>-<partition>`).
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaEvent {
    pub event_source: Option<String>,
    pub event_source_arn: Option<String>,
    pub bootstrap_servers: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub records: BTreeMap<String, Vec<KafkaRecord>>,
}

impl KafkaEvent {
    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}
