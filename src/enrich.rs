//! Data shaping for raw marketplace records.
//!
//! Converts one raw Keepa record into a flat row: an unprefixed `asin` key
//! plus one prefixed value per configured column. Fields with provider
//! quirks (category paths, tiered price statistics in integer cents, rank
//! maps) go through a registered extraction strategy; everything else is a
//! direct lookup by name. Extraction and coercion are total: a missing or
//! malformed field yields null (or the type's fill value), never an error.

use crate::config::ColumnType;
use crate::keepa::date_from_keepa_min;
use chrono::NaiveDate;
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// How a configured field is pulled out of the raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// Same-name lookup on the record.
    Direct,
    /// `categoryTree` list of `{name}` objects joined into a single path.
    CategoryPath,
    /// `salesRank` scalar, falling back to the raw `salesRanks` map.
    SalesRank,
    /// Price statistic under `stats`, stored in integer cents.
    ///
    /// `tiered` statistics hold `[keepa_minute, cents]` pairs per price
    /// tier (index 0 is the Amazon tier); non-tiered ones are bare cents.
    Stat { key: &'static str, tiered: bool },
}

/// Strategy table for specially-handled fields; unlisted names are direct.
pub fn extraction_for(field: &str) -> Extraction {
    match field {
        "categoryTree" => Extraction::CategoryPath,
        "salesRank" => Extraction::SalesRank,
        "minPrice" => Extraction::Stat {
            key: "min",
            tiered: true,
        },
        "maxPrice" => Extraction::Stat {
            key: "max",
            tiered: true,
        },
        "avgPrice" => Extraction::Stat {
            key: "avg",
            tiered: false,
        },
        "minIntervalPrice" => Extraction::Stat {
            key: "minInInterval",
            tiered: true,
        },
        "maxIntervalPrice" => Extraction::Stat {
            key: "maxInInterval",
            tiered: true,
        },
        _ => Extraction::Direct,
    }
}

/// Extracted value plus the observation date carried by tiered prices.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub value: Value,
    pub observed: Option<NaiveDate>,
}

impl Extracted {
    fn bare(value: Value) -> Self {
        Self {
            value,
            observed: None,
        }
    }
}

/// Apply one extraction strategy. Pure over the record; missing or
/// unexpected shapes yield null.
pub fn extract(record: &Value, field: &str, strategy: Extraction) -> Extracted {
    match strategy {
        Extraction::Direct => Extracted::bare(record.get(field).cloned().unwrap_or(Value::Null)),
        Extraction::CategoryPath => Extracted::bare(category_path(record)),
        Extraction::SalesRank => Extracted::bare(
            record
                .get("salesRank")
                .filter(|value| !value.is_null())
                .or_else(|| record.get("salesRanks"))
                .cloned()
                .unwrap_or(Value::Null),
        ),
        Extraction::Stat { key, tiered } => stat_price(record, key, tiered),
    }
}

fn category_path(record: &Value) -> Value {
    let Some(tree) = record.get("categoryTree").and_then(Value::as_array) else {
        return Value::Null;
    };
    let names: Vec<&str> = tree
        .iter()
        .map(|node| node.get("name").and_then(Value::as_str).unwrap_or(""))
        .collect();
    Value::String(names.join(" > "))
}

/// Tiered stats hold `[keepa_minute, cents]` at the Amazon tier; bare
/// stats are cents directly. Cents convert to decimal currency only when
/// strictly positive (zero and negative sentinels mean "no observation").
fn stat_price(record: &Value, key: &str, tiered: bool) -> Extracted {
    let Some(stat) = record
        .get("stats")
        .and_then(|stats| stats.get(key))
        .and_then(Value::as_array)
        .and_then(|tiers| tiers.first())
    else {
        return Extracted::bare(Value::Null);
    };
    if tiered {
        let observation = stat.as_array();
        let cents = observation
            .and_then(|pair| pair.get(1))
            .and_then(Value::as_i64);
        let keepa_min = observation
            .and_then(|pair| pair.first())
            .and_then(Value::as_i64);
        match cents {
            Some(cents) if cents > 0 => Extracted {
                value: currency(cents),
                observed: keepa_min.and_then(date_from_keepa_min),
            },
            _ => Extracted::bare(Value::Null),
        }
    } else {
        match stat.as_i64() {
            Some(cents) if cents > 0 => Extracted::bare(currency(cents)),
            _ => Extracted::bare(Value::Null),
        }
    }
}

fn currency(cents: i64) -> Value {
    Number::from_f64(cents as f64 / 100.0)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Coerce a value to its declared column type. Never errors: integer
/// failures fill with zero, float failures yield null, text is total.
pub fn coerce(value: Value, ty: ColumnType) -> Value {
    match ty {
        ColumnType::Int => Value::Number(coerce_int(&value).into()),
        ColumnType::Float => coerce_float(&value)
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ColumnType::Str => match value {
            Value::Null => Value::Null,
            Value::String(text) => Value::String(text),
            other => Value::String(other.to_string()),
        },
    }
}

fn coerce_int(value: &Value) -> i64 {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .unwrap_or(0),
        Value::String(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|float| float as i64))
                .unwrap_or(0)
        }
        Value::Bool(flag) => i64::from(*flag),
        _ => 0,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(flag) => Some(f64::from(u8::from(*flag))),
        _ => None,
    }
}

/// Shape one raw record into a flat enrichment row.
///
/// Output keys: unprefixed `asin`, one `{prefix}{field}` per configured
/// column, and `{prefix}{field}Date` for tiered prices that carried an
/// observation timestamp.
pub fn shape_record(
    record: &Value,
    columns: &BTreeMap<String, ColumnType>,
    prefix: &str,
) -> BTreeMap<String, Value> {
    let mut row = BTreeMap::new();
    row.insert(
        "asin".to_string(),
        record.get("asin").cloned().unwrap_or(Value::Null),
    );
    for (field, ty) in columns {
        let extracted = extract(record, field, extraction_for(field));
        row.insert(format!("{prefix}{field}"), coerce(extracted.value, *ty));
        if let Some(observed) = extracted.observed {
            row.insert(
                format!("{prefix}{field}Date"),
                Value::String(observed.to_string()),
            );
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coercion_never_raises() {
        // The declared-type contract: float from string, int zero-fill.
        assert_eq!(
            coerce(json!("12.5"), ColumnType::Float),
            json!(12.5),
        );
        assert_eq!(coerce(Value::Null, ColumnType::Int), json!(0));
        assert_eq!(coerce(json!("not a number"), ColumnType::Int), json!(0));
        assert_eq!(coerce(json!("not a number"), ColumnType::Float), Value::Null);
        assert_eq!(coerce(json!({"nested": 1}), ColumnType::Str), json!("{\"nested\":1}"));
        assert_eq!(coerce(Value::Null, ColumnType::Str), Value::Null);
    }

    #[test]
    fn int_coercion_truncates_fractional_input() {
        assert_eq!(coerce(json!(12.9), ColumnType::Int), json!(12));
        assert_eq!(coerce(json!("12.9"), ColumnType::Int), json!(12));
    }

    #[test]
    fn category_tree_flattens_to_a_path() {
        let record = json!({
            "categoryTree": [
                {"name": "Home"},
                {"name": "Kitchen"},
                {"name": "Kettles"}
            ]
        });
        let extracted = extract(&record, "categoryTree", Extraction::CategoryPath);
        assert_eq!(extracted.value, json!("Home > Kitchen > Kettles"));
    }

    #[test]
    fn sales_rank_falls_back_to_the_rank_map() {
        let record = json!({"salesRanks": {"1000": 42}});
        let extracted = extract(&record, "salesRank", Extraction::SalesRank);
        assert_eq!(extracted.value, json!({"1000": 42}));

        let record = json!({"salesRank": 7});
        let extracted = extract(&record, "salesRank", Extraction::SalesRank);
        assert_eq!(extracted.value, json!(7));
    }

    #[test]
    fn tiered_price_converts_cents_and_carries_the_observation_date() {
        let record = json!({"stats": {"min": [[0, 1299], [5, 1099]]}});
        let extracted = extract(
            &record,
            "minPrice",
            Extraction::Stat {
                key: "min",
                tiered: true,
            },
        );
        assert_eq!(extracted.value, json!(12.99));
        assert_eq!(
            extracted.observed.map(|date| date.to_string()),
            Some("2011-01-01".to_string())
        );
    }

    #[test]
    fn non_positive_cents_yield_null_not_zero_price() {
        let record = json!({"stats": {"min": [[100, 0]], "avg": [-1]}});
        let min = extract(
            &record,
            "minPrice",
            Extraction::Stat {
                key: "min",
                tiered: true,
            },
        );
        assert_eq!(min.value, Value::Null);
        assert_eq!(min.observed, None);

        let avg = extract(
            &record,
            "avgPrice",
            Extraction::Stat {
                key: "avg",
                tiered: false,
            },
        );
        assert_eq!(avg.value, Value::Null);
    }

    #[test]
    fn average_price_reads_the_bare_cents_scalar() {
        let record = json!({"stats": {"avg": [2450]}});
        let extracted = extract(
            &record,
            "avgPrice",
            Extraction::Stat {
                key: "avg",
                tiered: false,
            },
        );
        assert_eq!(extracted.value, json!(24.5));
    }

    #[test]
    fn shape_record_prefixes_columns_and_null_fills_missing_fields() {
        let mut columns = BTreeMap::new();
        columns.insert("price".to_string(), ColumnType::Float);
        columns.insert("rank".to_string(), ColumnType::Int);
        columns.insert("title".to_string(), ColumnType::Str);
        let record = json!({"asin": "B00X0001", "price": "12.5", "rank": null});

        let row = shape_record(&record, &columns, "keepa_");
        assert_eq!(row.get("asin"), Some(&json!("B00X0001")));
        assert_eq!(row.get("keepa_price"), Some(&json!(12.5)));
        assert_eq!(row.get("keepa_rank"), Some(&json!(0)));
        assert_eq!(row.get("keepa_title"), Some(&Value::Null));
        assert!(!row.contains_key("price"));
    }
}
