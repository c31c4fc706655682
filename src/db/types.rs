//! Row decoding into ordered JSON rows.
//!
//! Each column is first sorted into a [`TypeCategory`] from its type name,
//! then decoded by the backend's decoder. A value that cannot be decoded
//! becomes JSON `null` instead of failing the whole query.

use crate::models::{DatabaseType, Row as ResultRow};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySql, MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef, Postgres};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row, Type, TypeInfo, ValueRef};

/// Logical category for a column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    /// Exact numerics, rendered as strings.
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Temporal,
    Unknown,
}

pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();
    match lower.as_str() {
        // Before the substring checks: INTERVAL and POINT contain "int"
        "interval" | "point" => return TypeCategory::Unknown,
        "numeric" if db == DatabaseType::SQLite => return TypeCategory::Float,
        "bool" | "boolean" => return TypeCategory::Boolean,
        "real" | "float4" | "float8" => return TypeCategory::Float,
        "json" | "jsonb" => return TypeCategory::Json,
        "uuid" => return TypeCategory::Uuid,
        "bytea" => return TypeCategory::Binary,
        "date" | "time" | "datetime" | "timetz" => return TypeCategory::Temporal,
        "text" | "name" => return TypeCategory::Text,
        _ => {}
    }

    if lower.contains("decimal") || lower.contains("numeric") {
        TypeCategory::Decimal
    } else if lower.contains("int") || lower.contains("serial") {
        TypeCategory::Integer
    } else if lower.contains("float") || lower.contains("double") {
        TypeCategory::Float
    } else if lower.contains("blob") || lower.contains("binary") {
        TypeCategory::Binary
    } else if lower.starts_with("timestamp") {
        TypeCategory::Temporal
    } else if lower.contains("char") {
        TypeCategory::Text
    } else {
        TypeCategory::Unknown
    }
}

/// Exact numeric or UUID value kept in its textual form.
#[derive(Debug)]
struct Exact(String);

impl Type<MySql> for Exact {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("decimal")
    }
}

impl<'r> Decode<'r, MySql> for Exact {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        // MySQL sends DECIMAL as text in both protocols
        Ok(Exact(<&str as Decode<MySql>>::decode(value)?.to_string()))
    }
}

impl Type<Postgres> for Exact {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        matches!(ty.name(), "NUMERIC" | "UUID")
    }
}

impl<'r> Decode<'r, Postgres> for Exact {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        if matches!(value.format(), PgValueFormat::Text) {
            return Ok(Exact(value.as_str()?.to_string()));
        }
        let is_uuid = value.type_info().name() == "UUID";
        let bytes = value.as_bytes()?;
        if is_uuid {
            return Ok(Exact(uuid::Uuid::from_slice(bytes)?.to_string()));
        }
        pg_numeric_to_string(bytes)
            .map(Exact)
            .ok_or_else(|| "malformed binary NUMERIC".into())
    }
}

const PG_NUMERIC_NEG: u16 = 0x4000;
const PG_NUMERIC_NAN: u16 = 0xC000;
const PG_NUMERIC_PINF: u16 = 0xD000;
const PG_NUMERIC_NINF: u16 = 0xF000;

/// Render PostgreSQL's binary NUMERIC (base-10000 digit groups) as decimal text.
fn pg_numeric_to_string(bytes: &[u8]) -> Option<String> {
    let word = |i: usize| {
        bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    };
    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i32;
    let sign = word(2)?;
    let dscale = word(3)? as usize;
    let groups = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Option<Vec<u16>>>()?;
    let group = |i: i32| {
        usize::try_from(i)
            .ok()
            .and_then(|i| groups.get(i).copied())
            .unwrap_or(0)
    };

    match sign {
        PG_NUMERIC_NAN => return Some("NaN".to_string()),
        PG_NUMERIC_PINF => return Some("Infinity".to_string()),
        PG_NUMERIC_NINF => return Some("-Infinity".to_string()),
        _ => {}
    }

    let mut out = String::new();
    if sign == PG_NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for i in 1..=weight {
            out.push_str(&format!("{:04}", group(i)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::new();
        let mut i = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", group(i)));
            i += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Some(out)
}

/// Decode column `idx` as `T`; `None` for NULL or an incompatible type.
fn cell<'r, R, T>(row: &'r R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Encode binary data as a base64 JSON string.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn binary<R>(row: &R, idx: usize) -> Option<JsonValue>
where
    R: Row,
    usize: ColumnIndex<R>,
    for<'r> Vec<u8>: Decode<'r, R::Database> + Type<R::Database>,
{
    cell::<R, Vec<u8>>(row, idx).map(|v| encode_binary_value(&v))
}

/// Converts a driver row into an ordered result row.
pub trait IntoResultRow {
    fn to_result_row(&self) -> ResultRow;
}

fn convert<R: Row>(
    row: &R,
    db: DatabaseType,
    decode: impl Fn(&R, usize, TypeCategory) -> Option<JsonValue>,
) -> ResultRow {
    ResultRow::from_pairs(row.columns().iter().enumerate().map(|(idx, col)| {
        let category = categorize_type(col.type_info().name(), db);
        let value = decode(row, idx, category).unwrap_or(JsonValue::Null);
        (col.name().to_string(), value)
    }))
}

impl IntoResultRow for PgRow {
    fn to_result_row(&self) -> ResultRow {
        convert(self, DatabaseType::PostgreSQL, decode_postgres)
    }
}

impl IntoResultRow for MySqlRow {
    fn to_result_row(&self) -> ResultRow {
        convert(self, DatabaseType::MySQL, decode_mysql)
    }
}

impl IntoResultRow for SqliteRow {
    fn to_result_row(&self) -> ResultRow {
        convert(self, DatabaseType::SQLite, decode_sqlite)
    }
}

fn decode_postgres(row: &PgRow, idx: usize, category: TypeCategory) -> Option<JsonValue> {
    match category {
        TypeCategory::Integer => cell::<_, i64>(row, idx)
            .or_else(|| cell::<_, i32>(row, idx).map(i64::from))
            .or_else(|| cell::<_, i16>(row, idx).map(i64::from))
            .map(JsonValue::from),
        TypeCategory::Float => cell::<_, f64>(row, idx)
            .or_else(|| cell::<_, f32>(row, idx).map(f64::from))
            .map(float_value),
        TypeCategory::Decimal | TypeCategory::Uuid => {
            cell::<_, Exact>(row, idx).map(|v| JsonValue::String(v.0))
        }
        TypeCategory::Boolean => cell::<_, bool>(row, idx).map(JsonValue::Bool),
        TypeCategory::Binary => binary(row, idx),
        TypeCategory::Json => cell::<_, JsonValue>(row, idx),
        TypeCategory::Temporal => cell::<_, chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|v| v.to_rfc3339())
            .or_else(|| cell::<_, chrono::NaiveDateTime>(row, idx).map(|v| v.to_string()))
            .or_else(|| cell::<_, chrono::NaiveDate>(row, idx).map(|v| v.to_string()))
            .or_else(|| cell::<_, chrono::NaiveTime>(row, idx).map(|v| v.to_string()))
            .map(JsonValue::String),
        TypeCategory::Text | TypeCategory::Unknown => {
            cell::<_, String>(row, idx).map(JsonValue::String)
        }
    }
}

fn decode_mysql(row: &MySqlRow, idx: usize, category: TypeCategory) -> Option<JsonValue> {
    match category {
        // Signed and unsigned columns decode through different Rust types
        TypeCategory::Integer => cell::<_, i64>(row, idx)
            .map(JsonValue::from)
            .or_else(|| cell::<_, u64>(row, idx).map(JsonValue::from)),
        TypeCategory::Float => cell::<_, f64>(row, idx)
            .or_else(|| cell::<_, f32>(row, idx).map(f64::from))
            .map(float_value),
        TypeCategory::Decimal => cell::<_, Exact>(row, idx).map(|v| JsonValue::String(v.0)),
        TypeCategory::Boolean => cell::<_, bool>(row, idx).map(JsonValue::Bool),
        TypeCategory::Binary => binary(row, idx),
        TypeCategory::Json => cell::<_, JsonValue>(row, idx),
        TypeCategory::Temporal => cell::<_, chrono::NaiveDateTime>(row, idx)
            .map(|v| v.to_string())
            .or_else(|| cell::<_, chrono::NaiveDate>(row, idx).map(|v| v.to_string()))
            .or_else(|| cell::<_, chrono::NaiveTime>(row, idx).map(|v| v.to_string()))
            .map(JsonValue::String),
        TypeCategory::Uuid | TypeCategory::Text | TypeCategory::Unknown => {
            cell::<_, String>(row, idx).map(JsonValue::String)
        }
    }
}

/// SQLite reports the runtime storage class for expression columns, so the
/// fallback tries text, then integer, then real.
fn decode_sqlite(row: &SqliteRow, idx: usize, category: TypeCategory) -> Option<JsonValue> {
    match category {
        TypeCategory::Integer => cell::<_, i64>(row, idx).map(JsonValue::from),
        // NUMERIC affinity stores whole numbers as INTEGER
        TypeCategory::Float | TypeCategory::Decimal => cell::<_, f64>(row, idx)
            .map(float_value)
            .or_else(|| cell::<_, i64>(row, idx).map(JsonValue::from)),
        TypeCategory::Boolean => cell::<_, bool>(row, idx).map(JsonValue::Bool),
        TypeCategory::Binary => binary(row, idx),
        _ => cell::<_, String>(row, idx)
            .map(JsonValue::String)
            .or_else(|| cell::<_, i64>(row, idx).map(JsonValue::from))
            .or_else(|| cell::<_, f64>(row, idx).map(float_value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, groups: &[u16]) -> Vec<u8> {
        let mut words = vec![ndigits, weight as u16, sign, dscale];
        words.extend_from_slice(groups);
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    #[test]
    fn test_categorize_type() {
        let pg = DatabaseType::PostgreSQL;
        assert_eq!(categorize_type("INT8", pg), TypeCategory::Integer);
        assert_eq!(categorize_type("BIGINT", DatabaseType::MySQL), TypeCategory::Integer);
        assert_eq!(categorize_type("INTERVAL", pg), TypeCategory::Unknown);
        assert_eq!(categorize_type("NUMERIC", pg), TypeCategory::Decimal);
        assert_eq!(categorize_type("numeric", DatabaseType::SQLite), TypeCategory::Float);
        assert_eq!(categorize_type("NAME", pg), TypeCategory::Text);
        assert_eq!(categorize_type("VARCHAR", DatabaseType::MySQL), TypeCategory::Text);
        assert_eq!(categorize_type("TIMESTAMPTZ", pg), TypeCategory::Temporal);
        assert_eq!(categorize_type("jsonb", pg), TypeCategory::Json);
        assert_eq!(categorize_type("UUID", pg), TypeCategory::Uuid);
        assert_eq!(categorize_type("BLOB", DatabaseType::SQLite), TypeCategory::Binary);
    }

    #[test]
    fn test_pg_numeric_rendering() {
        // 123.45
        assert_eq!(
            pg_numeric_to_string(&numeric(2, 0, 0, 2, &[123, 4500])).as_deref(),
            Some("123.45")
        );
        // -10000
        assert_eq!(
            pg_numeric_to_string(&numeric(1, 1, PG_NUMERIC_NEG, 0, &[1])).as_deref(),
            Some("-10000")
        );
        // 0.00001
        assert_eq!(
            pg_numeric_to_string(&numeric(1, -2, 0, 5, &[1000])).as_deref(),
            Some("0.00001")
        );
        assert_eq!(
            pg_numeric_to_string(&numeric(0, 0, 0, 0, &[])).as_deref(),
            Some("0")
        );
        assert_eq!(
            pg_numeric_to_string(&numeric(0, 0, PG_NUMERIC_NAN, 0, &[])).as_deref(),
            Some("NaN")
        );
        assert!(pg_numeric_to_string(&[0, 2, 0, 0]).is_none());
    }

    #[tokio::test]
    async fn test_sqlite_row_conversion() {
        use sqlx::{Connection, SqliteConnection};

        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE t (id INTEGER, price NUMERIC, qty NUMERIC, data BLOB, note TEXT)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        sqlx::query("INSERT INTO t VALUES (1, 2.5, 3, x'68690a', NULL)")
            .execute(&mut conn)
            .await
            .unwrap();

        let row = sqlx::query("SELECT id, price, qty, data, note, 1 + 1 AS two FROM t")
            .fetch_one(&mut conn)
            .await
            .unwrap()
            .to_result_row();

        assert_eq!(row.get("id"), Some(&JsonValue::from(1)));
        assert_eq!(row.get("price"), Some(&JsonValue::from(2.5)));
        assert_eq!(row.get("data"), Some(&JsonValue::String("aGkK".to_string())));
        assert_eq!(row.get("qty"), Some(&JsonValue::from(3)));
        assert_eq!(row.get("note"), Some(&JsonValue::Null));
        assert_eq!(row.get("two"), Some(&JsonValue::from(2)));
    }

    #[test]
    fn test_encode_binary_value() {
        assert_eq!(
            encode_binary_value(b"hello world"),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(encode_binary_value(&[]), JsonValue::String(String::new()));
    }
}
