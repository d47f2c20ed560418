//! Stamped values and the wire shapes built from them.
//!
//! A stamp is serialized as a JSON array `[value]`, `[value, time]` or
//! `[value, time, hash]`. Interior stamps carry an object of child stamps as
//! their value.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// Table, row, cell and value identifier.
pub type Id = String;

/// An encoded HLC timestamp; empty means never set.
pub type Time = String;

/// A primitive cell or value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    String(String),
    Number(f64),
    Boolean(bool),
}

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

impl CellValue {
    pub fn is_valid(&self) -> bool {
        match self {
            CellValue::Number(n) => n.is_finite(),
            _ => true,
        }
    }

    /// JSON text of an optional value, rendering an absent value as `null`.
    pub fn to_json(value: Option<&CellValue>) -> String {
        serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string())
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::String(s) => write!(f, "{s}"),
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::String(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::String(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<i32> for CellValue {
    fn from(value: i32) -> Self {
        CellValue::Number(f64::from(value))
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Number(value as f64)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Boolean(value)
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::String(s) => serializer.serialize_str(s),
            // Integral numbers render without a fraction so hashes agree
            // with peers that print `1` rather than `1.0`.
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER => {
                serializer.serialize_i64(*n as i64)
            }
            CellValue::Number(n) => serializer.serialize_f64(*n),
            CellValue::Boolean(b) => serializer.serialize_bool(*b),
        }
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CellValueVisitor;

        impl<'de> Visitor<'de> for CellValueVisitor {
            type Value = CellValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string, number or boolean")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<CellValue, E> {
                Ok(CellValue::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<CellValue, E> {
                Ok(CellValue::String(v))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<CellValue, E> {
                Ok(CellValue::Boolean(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<CellValue, E> {
                Ok(CellValue::Number(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<CellValue, E> {
                Ok(CellValue::Number(v as f64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<CellValue, E> {
                Ok(CellValue::Number(v))
            }
        }

        deserializer.deserialize_any(CellValueVisitor)
    }
}

/// A value tagged with its timestamp and, optionally, its hash.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stamp<T> {
    pub value: T,
    pub time: Time,
    pub hash: Option<Hash>,
}

impl<T> Stamp<T> {
    pub fn new(value: T, time: impl Into<Time>) -> Self {
        Self {
            value,
            time: time.into(),
            hash: None,
        }
    }

    pub fn with_hash(value: T, time: impl Into<Time>, hash: Hash) -> Self {
        Self {
            value,
            time: time.into(),
            hash: Some(hash),
        }
    }
}

impl<T: Serialize> Serialize for Stamp<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = match (&self.hash, self.time.is_empty()) {
            (Some(_), _) => 3,
            (None, false) => 2,
            (None, true) => 1,
        };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.value)?;
        if len > 1 {
            seq.serialize_element(&self.time)?;
        }
        if let Some(hash) = &self.hash {
            seq.serialize_element(hash)?;
        }
        seq.end()
    }
}

impl<'de, T> Deserialize<'de> for Stamp<T>
where
    T: Deserialize<'de> + Default,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StampVisitor<T>(PhantomData<T>);

        impl<'de, T> Visitor<'de> for StampVisitor<T>
        where
            T: Deserialize<'de> + Default,
        {
            type Value = Stamp<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a stamp array of one to three elements")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Stamp<T>, A::Error> {
                let value = seq.next_element::<T>()?.unwrap_or_default();
                let time = seq.next_element::<Option<Time>>()?.flatten().unwrap_or_default();
                let hash = seq.next_element::<Option<Hash>>()?.flatten();
                while seq.next_element::<de::IgnoredAny>()?.is_some() {}
                Ok(Stamp { value, time, hash })
            }
        }

        deserializer.deserialize_seq(StampVisitor(PhantomData))
    }
}

pub type CellStamp = Stamp<Option<CellValue>>;
pub type ValueStamp = CellStamp;
pub type RowStamp = Stamp<BTreeMap<Id, CellStamp>>;
pub type TableStamp = Stamp<BTreeMap<Id, RowStamp>>;
pub type TablesStamp = Stamp<BTreeMap<Id, TableStamp>>;
pub type ValuesStamp = Stamp<BTreeMap<Id, ValueStamp>>;

/// Hashes of one level of the hierarchy, keyed by id.
pub type TableHashes = BTreeMap<Id, Hash>;
pub type ValueHashes = BTreeMap<Id, Hash>;
/// Row hashes keyed by table id then row id.
pub type RowHashes = BTreeMap<Id, BTreeMap<Id, Hash>>;
/// Cell hashes keyed by table id, row id then cell id.
pub type CellHashes = BTreeMap<Id, BTreeMap<Id, BTreeMap<Id, Hash>>>;

/// New tables the requester lacks, plus hashes of shared tables that differ.
pub type TableDiff = (TablesStamp, TableHashes);
/// New rows the requester lacks, plus hashes of shared rows that differ.
pub type RowDiff = (TablesStamp, RowHashes);

/// The whole stamped dataset, or any subset of it exchanged as changes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeableContent {
    pub tables: TablesStamp,
    pub values: ValuesStamp,
}

/// Changes share the shape of content; they are merged rather than replaced.
pub type MergeableChanges = MergeableContent;

impl MergeableContent {
    pub fn new(tables: TablesStamp, values: ValuesStamp) -> Self {
        Self { tables, values }
    }

    /// True when neither tables nor values carry any children.
    pub fn is_empty(&self) -> bool {
        self.tables.value.is_empty() && self.values.value.is_empty()
    }

    /// A copy with every hash stripped, as pushed over the wire.
    pub fn without_hashes(&self) -> Self {
        fn strip<T: Clone, U>(stamp: &Stamp<BTreeMap<Id, T>>, f: impl Fn(&T) -> U) -> Stamp<BTreeMap<Id, U>> {
            Stamp::new(
                stamp.value.iter().map(|(id, child)| (id.clone(), f(child))).collect(),
                stamp.time.clone(),
            )
        }
        let leaf = |stamp: &CellStamp| Stamp::new(stamp.value.clone(), stamp.time.clone());
        Self {
            tables: strip(&self.tables, |table| {
                strip(table, |row| strip(row, leaf))
            }),
            values: strip(&self.values, leaf),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Serialize for MergeableContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.tables, &self.values).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MergeableContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ContentVisitor;

        impl<'de> Visitor<'de> for ContentVisitor {
            type Value = MergeableContent;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [tables, values] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<MergeableContent, A::Error> {
                let tables = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let values = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                // Changes may carry a trailing marker element.
                while seq.next_element::<de::IgnoredAny>()?.is_some() {}
                Ok(MergeableContent { tables, values })
            }
        }

        deserializer.deserialize_seq(ContentVisitor)
    }
}

/// Root hashes of the tables and values trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentHashes(pub Hash, pub Hash);

impl ContentHashes {
    pub fn tables(&self) -> Hash {
        self.0
    }

    pub fn values(&self) -> Hash {
        self.1
    }
}

/// Folds a diff response into an accumulated changes stamp.
///
/// Leaves are replaced; maps recurse and keep the latest time.
pub trait FoldStamp {
    fn fold(&mut self, other: Self);
}

impl FoldStamp for CellStamp {
    fn fold(&mut self, other: Self) {
        *self = other;
    }
}

impl<T: FoldStamp + Default> FoldStamp for Stamp<BTreeMap<Id, T>> {
    fn fold(&mut self, other: Self) {
        for (id, child) in other.value {
            self.value.entry(id).or_default().fold(child);
        }
        if other.time > self.time {
            self.time = other.time;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integral_numbers_serialize_without_fraction() {
        assert_eq!(CellValue::to_json(Some(&CellValue::Number(1.0))), "1");
        assert_eq!(CellValue::to_json(Some(&CellValue::Number(1.5))), "1.5");
        assert_eq!(CellValue::to_json(Some(&CellValue::from("x"))), "\"x\"");
        assert_eq!(CellValue::to_json(None), "null");
    }

    #[test]
    fn test_stamp_serialization_lengths() {
        let bare: CellStamp = Stamp::new(Some(CellValue::Boolean(true)), "");
        let timed: CellStamp = Stamp::new(Some(CellValue::Boolean(true)), "T1");
        let hashed: CellStamp = Stamp::with_hash(None, "T1", 7);

        assert_eq!(serde_json::to_value(&bare).unwrap(), json!([true]));
        assert_eq!(serde_json::to_value(&timed).unwrap(), json!([true, "T1"]));
        assert_eq!(serde_json::to_value(&hashed).unwrap(), json!([null, "T1", 7]));
    }

    #[test]
    fn test_stamp_deserialization_defaults() {
        let stamp: CellStamp = serde_json::from_value(json!([3])).unwrap();
        assert_eq!(stamp.value, Some(CellValue::Number(3.0)));
        assert_eq!(stamp.time, "");
        assert_eq!(stamp.hash, None);

        let row: RowStamp = serde_json::from_value(json!([{"qty": [2, "T2", 9]}, "T2", 11])).unwrap();
        assert_eq!(row.hash, Some(11));
        assert_eq!(row.value["qty"].hash, Some(9));
    }

    #[test]
    fn test_content_accepts_trailing_marker() {
        let content = MergeableContent::from_json(r#"[[{}, ""], [{"a": [1, "T"]}], 1]"#).unwrap();
        assert!(content.tables.value.is_empty());
        assert_eq!(content.values.value["a"].time, "T");
    }

    #[test]
    fn test_content_rejects_wrong_shape() {
        assert!(MergeableContent::from_json(r#"[[{}]]"#).is_err());
        assert!(MergeableContent::from_json(r#"{"tables": 1}"#).is_err());
        assert!(MergeableContent::from_json(r#"[[{"t": [{"r": [{"c": [[1]]}]}]}], [{}]]"#).is_err());
    }

    #[test]
    fn test_without_hashes() {
        let content = MergeableContent::from_json(
            r#"[[{"t": [{"r": [{"c": [1, "T", 5]}, "T", 6]}, "T", 7]}, "T", 8], [{}, "", 0]]"#,
        )
        .unwrap();
        let stripped = content.without_hashes();
        assert_eq!(
            serde_json::to_value(&stripped).unwrap(),
            json!([[{"t": [{"r": [{"c": [1, "T"]}, "T"]}, "T"]}, "T"], [{}]])
        );
    }

    #[test]
    fn test_fold_keeps_latest_time_and_replaces_leaves() {
        let mut acc: TablesStamp =
            serde_json::from_value(json!([{"t": [{"r": [{"a": [1, "T1"]}, "T1"]}, "T1"]}, "T1"])).unwrap();
        let other: TablesStamp =
            serde_json::from_value(json!([{"t": [{"r": [{"a": [2, "T3"], "b": [3, "T2"]}, "T3"]}, "T0"]}, "T0"]))
                .unwrap();
        acc.fold(other);

        let row = &acc.value["t"].value["r"];
        assert_eq!(row.value["a"].value, Some(CellValue::Number(2.0)));
        assert_eq!(row.value["b"].value, Some(CellValue::Number(3.0)));
        assert_eq!(row.time, "T3");
        assert_eq!(acc.value["t"].time, "T1");
    }
}
