//! Partition storage schema and the `Bar` <-> DataFrame conversions.
//!
//! Prices are stored as Int64 fixed-point at [`PRICE_SCALE`] decimal places so
//! Parquet never sees a float.

use crate::domain::{Bar, Symbol};
use chrono::{TimeZone, Utc};
use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Decimal places of the fixed-point price columns.
pub const PRICE_SCALE: u32 = 8;

const PRICE_COLUMNS: [&str; 4] = ["open", "high", "low", "close"];

/// Expected schema for partition files.
pub struct BarSchema;

impl BarSchema {
    pub fn schema() -> Schema {
        Schema::from_iter(vec![
            Field::new("timestamp".into(), DataType::Datetime(TimeUnit::Nanoseconds, None)),
            Field::new("symbol".into(), DataType::String),
            Field::new("open".into(), DataType::Int64),
            Field::new("high".into(), DataType::Int64),
            Field::new("low".into(), DataType::Int64),
            Field::new("close".into(), DataType::Int64),
            Field::new("volume".into(), DataType::Int64),
        ])
    }

    /// Validate DataFrame against schema
    pub fn validate(df: &DataFrame) -> Result<(), SchemaError> {
        let expected = Self::schema();
        let actual = df.schema();

        for field in expected.iter_fields() {
            let actual_dtype = actual
                .get(field.name())
                .ok_or_else(|| SchemaError::MissingColumn(field.name().to_string()))?;
            if actual_dtype != field.dtype() {
                return Err(SchemaError::TypeMismatch {
                    column: field.name().to_string(),
                    expected: field.dtype().clone(),
                    actual: actual_dtype.clone(),
                });
            }
        }

        Ok(())
    }

    /// Encode bars in the storage schema, preserving their order.
    pub fn to_frame(bars: &[Bar]) -> Result<DataFrame, SchemaError> {
        let timestamps = bars
            .iter()
            .map(|b| {
                b.timestamp
                    .timestamp_nanos_opt()
                    .ok_or_else(|| SchemaError::TimestampOutOfRange(b.timestamp.to_rfc3339()))
            })
            .collect::<Result<Vec<i64>, _>>()?;
        let symbols: Vec<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();
        let fixed = |get: fn(&Bar) -> Decimal| -> Result<Vec<i64>, SchemaError> {
            bars.iter().map(|b| price_to_fixed(get(b))).collect()
        };
        let volumes: Vec<i64> = bars.iter().map(|b| b.volume).collect();

        DataFrame::new(vec![
            Column::new("timestamp".into(), timestamps)
                .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))
                .map_err(|e| SchemaError::Polars(format!("timestamp cast: {e}")))?,
            Column::new("symbol".into(), symbols),
            Column::new("open".into(), fixed(|b| b.open)?),
            Column::new("high".into(), fixed(|b| b.high)?),
            Column::new("low".into(), fixed(|b| b.low)?),
            Column::new("close".into(), fixed(|b| b.close)?),
            Column::new("volume".into(), volumes),
        ])
        .map_err(|e| SchemaError::Polars(format!("dataframe creation: {e}")))
    }

    /// Decode a storage-schema DataFrame. Nulls are rejected.
    pub fn from_frame(df: &DataFrame) -> Result<Vec<Bar>, SchemaError> {
        Self::validate(df)?;
        let col = |name: &str| df.column(name).map_err(|e| SchemaError::Polars(format!("column {name}: {e}")));

        let ts_col = col("timestamp")?
            .cast(&DataType::Int64)
            .map_err(|e| SchemaError::Polars(format!("timestamp cast: {e}")))?;
        let ts = ts_col
            .i64()
            .map_err(|e| SchemaError::Polars(format!("timestamp column type: {e}")))?;
        let sym = col("symbol")?
            .str()
            .map_err(|e| SchemaError::Polars(format!("symbol column type: {e}")))?;
        let mut prices = Vec::with_capacity(PRICE_COLUMNS.len());
        for name in PRICE_COLUMNS {
            prices.push(
                col(name)?
                    .i64()
                    .map_err(|e| SchemaError::Polars(format!("{name} column type: {e}")))?,
            );
        }
        let vol = col("volume")?
            .i64()
            .map_err(|e| SchemaError::Polars(format!("volume column type: {e}")))?;

        let null = |column: &str, row: usize| SchemaError::NullValue {
            column: column.to_string(),
            row,
        };

        let mut bars = Vec::with_capacity(df.height());
        let mut last_symbol: Option<Symbol> = None;
        for i in 0..df.height() {
            let nanos = ts.get(i).ok_or_else(|| null("timestamp", i))?;
            let raw_symbol = sym.get(i).ok_or_else(|| null("symbol", i))?;
            let symbol = match last_symbol.take() {
                Some(s) if s.as_str() == raw_symbol => s,
                _ => Symbol::new(raw_symbol).map_err(|e| SchemaError::InvalidSymbol(e.to_string()))?,
            };
            let mut p = [Decimal::ZERO; 4];
            for (slot, (ca, name)) in p.iter_mut().zip(prices.iter().zip(PRICE_COLUMNS)) {
                *slot = price_from_fixed(ca.get(i).ok_or_else(|| null(name, i))?);
            }

            bars.push(Bar {
                symbol: symbol.clone(),
                timestamp: Utc.timestamp_nanos(nanos),
                open: p[0],
                high: p[1],
                low: p[2],
                close: p[3],
                volume: vol.get(i).ok_or_else(|| null("volume", i))?,
            });
            last_symbol = Some(symbol);
        }
        Ok(bars)
    }

    /// Hex blake3 digest of the canonical fixed-point rows, in the given order.
    pub fn content_hash(bars: &[Bar]) -> Result<String, SchemaError> {
        let mut hasher = blake3::Hasher::new();
        for bar in bars {
            let nanos = bar
                .timestamp
                .timestamp_nanos_opt()
                .ok_or_else(|| SchemaError::TimestampOutOfRange(bar.timestamp.to_rfc3339()))?;
            hasher.update(&nanos.to_le_bytes());
            hasher.update(bar.symbol.as_str().as_bytes());
            hasher.update(&[0]);
            for price in [bar.open, bar.high, bar.low, bar.close] {
                hasher.update(&price_to_fixed(price)?.to_le_bytes());
            }
            hasher.update(&bar.volume.to_le_bytes());
        }
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Decimal to fixed-point at [`PRICE_SCALE`]. Extra precision or overflow
/// is an error, never rounded away.
pub fn price_to_fixed(price: Decimal) -> Result<i64, SchemaError> {
    if price.round_dp(PRICE_SCALE) != price {
        return Err(SchemaError::Precision(price.to_string()));
    }
    price
        .checked_mul(Decimal::from(10_i64.pow(PRICE_SCALE)))
        .and_then(|scaled| scaled.trunc().to_i64())
        .ok_or_else(|| SchemaError::Precision(price.to_string()))
}

pub fn price_from_fixed(value: i64) -> Decimal {
    Decimal::new(value, PRICE_SCALE).normalize()
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("price {0} does not fit the fixed-point storage scale")]
    Precision(String),

    #[error("timestamp {0} is outside the nanosecond range")]
    TimestampOutOfRange(String),

    #[error("null {column} at row {row}")]
    NullValue { column: String, row: usize },

    #[error("invalid symbol in partition: {0}")]
    InvalidSymbol(String),

    #[error("polars: {0}")]
    Polars(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn ts0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 20, 13, 30, 0).unwrap()
    }

    fn sample_bars() -> Vec<Bar> {
        let symbol = Symbol::new("SPY").unwrap();
        (0..3)
            .map(|i| Bar {
                symbol: symbol.clone(),
                timestamp: ts0() + Duration::minutes(i),
                open: Decimal::new(54450 + i, 2),
                high: Decimal::new(54_525_123_456 + i, 8),
                low: Decimal::new(544, 0),
                close: Decimal::new(5451, 1),
                volume: 12_000 + i,
            })
            .collect()
    }

    #[test]
    fn test_schema_has_all_required_columns() {
        let schema = BarSchema::schema();
        for name in ["timestamp", "symbol", "open", "high", "low", "close", "volume"] {
            assert!(schema.contains(name), "{name}");
        }
    }

    #[test]
    fn frame_roundtrip_is_exact() {
        let bars = sample_bars();
        let df = BarSchema::to_frame(&bars).unwrap();
        BarSchema::validate(&df).unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(BarSchema::from_frame(&df).unwrap(), bars);
    }

    #[test]
    fn test_validate_rejects_missing_column() {
        let df = BarSchema::to_frame(&sample_bars()).unwrap().drop("volume").unwrap();
        assert!(matches!(BarSchema::validate(&df), Err(SchemaError::MissingColumn(c)) if c == "volume"));
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let mut df = BarSchema::to_frame(&sample_bars()).unwrap();
        df.with_column(Column::new("open".into(), &[1.0f64, 2.0, 3.0])).unwrap();
        assert!(matches!(BarSchema::validate(&df), Err(SchemaError::TypeMismatch { .. })));
    }

    #[test]
    fn fixed_point_conversion() {
        assert_eq!(price_to_fixed(Decimal::new(21075, 2)).unwrap(), 21_075_000_000);
        assert_eq!(price_from_fixed(21_075_000_000), Decimal::new(21075, 2));
        assert_eq!(price_from_fixed(21_075_000_000).to_string(), "210.75");
        assert!(matches!(
            price_to_fixed(Decimal::new(1, 9)),
            Err(SchemaError::Precision(_))
        ));
        assert!(price_to_fixed(Decimal::MAX).is_err());
    }

    #[test]
    fn content_hash_tracks_values_not_representation() {
        let bars = sample_bars();
        let mut rescaled = bars.clone();
        rescaled[0].low = Decimal::new(54400, 2); // 544.00 vs 544
        assert_eq!(
            BarSchema::content_hash(&bars).unwrap(),
            BarSchema::content_hash(&rescaled).unwrap()
        );

        let mut changed = bars.clone();
        changed[2].volume += 1;
        assert_ne!(
            BarSchema::content_hash(&bars).unwrap(),
            BarSchema::content_hash(&changed).unwrap()
        );
    }
}
