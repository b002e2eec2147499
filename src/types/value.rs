//! Owned runtime values: predicate operands and row inputs.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use super::DataType;

/// An owned scalar value, used at the insert/select boundary. The engine
/// never parses text; callers arrive with values already typed.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnedValue {
    Null,
    Int(i32),
    BigInt(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl OwnedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, OwnedValue::Null)
    }

    /// Encodes the value as a column block of the given type.
    ///
    /// Fixed-width types use little-endian byte order; variable-width types
    /// are stored verbatim (their length travels in the row's block prefix).
    pub fn encode(&self, data_type: DataType) -> Result<Vec<u8>> {
        Ok(match (data_type, self) {
            (DataType::Int, OwnedValue::Int(v)) => v.to_le_bytes().to_vec(),
            (DataType::BigInt, OwnedValue::BigInt(v)) => v.to_le_bytes().to_vec(),
            (DataType::BigInt, OwnedValue::Int(v)) => (*v as i64).to_le_bytes().to_vec(),
            (DataType::Float, OwnedValue::Float(v)) => v.to_le_bytes().to_vec(),
            (DataType::Bool, OwnedValue::Bool(v)) => vec![*v as u8],
            (DataType::Varchar, OwnedValue::Text(v)) => v.as_bytes().to_vec(),
            (DataType::Binary, OwnedValue::Bytes(v)) => v.clone(),
            (ty, value) => bail!("value {:?} cannot be encoded as {:?}", value, ty),
        })
    }

    /// Decodes a column block back into an owned value.
    pub fn decode(data_type: DataType, bytes: &[u8]) -> Result<Self> {
        Ok(match data_type {
            DataType::Int => {
                ensure!(bytes.len() == 4, "INT block must be 4 bytes, got {}", bytes.len());
                OwnedValue::Int(i32::from_le_bytes(bytes.try_into().expect("length checked")))
            }
            DataType::BigInt => {
                ensure!(bytes.len() == 8, "BIGINT block must be 8 bytes, got {}", bytes.len());
                OwnedValue::BigInt(i64::from_le_bytes(bytes.try_into().expect("length checked")))
            }
            DataType::Float => {
                ensure!(bytes.len() == 8, "FLOAT block must be 8 bytes, got {}", bytes.len());
                OwnedValue::Float(f64::from_le_bytes(bytes.try_into().expect("length checked")))
            }
            DataType::Bool => {
                ensure!(bytes.len() == 1, "BOOL block must be 1 byte, got {}", bytes.len());
                OwnedValue::Bool(bytes[0] != 0)
            }
            DataType::Varchar => OwnedValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            DataType::Binary => OwnedValue::Bytes(bytes.to_vec()),
        })
    }

    /// Total order used by predicate evaluation. Nulls sort first; values of
    /// mismatched types do not compare.
    pub fn compare(&self, other: &OwnedValue) -> Result<Ordering> {
        Ok(match (self, other) {
            (OwnedValue::Null, OwnedValue::Null) => Ordering::Equal,
            (OwnedValue::Null, _) => Ordering::Less,
            (_, OwnedValue::Null) => Ordering::Greater,
            (OwnedValue::Int(a), OwnedValue::Int(b)) => a.cmp(b),
            (OwnedValue::BigInt(a), OwnedValue::BigInt(b)) => a.cmp(b),
            (OwnedValue::Int(a), OwnedValue::BigInt(b)) => (*a as i64).cmp(b),
            (OwnedValue::BigInt(a), OwnedValue::Int(b)) => a.cmp(&(*b as i64)),
            (OwnedValue::Float(a), OwnedValue::Float(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (OwnedValue::Bool(a), OwnedValue::Bool(b)) => a.cmp(b),
            (OwnedValue::Text(a), OwnedValue::Text(b)) => a.cmp(b),
            (OwnedValue::Bytes(a), OwnedValue::Bytes(b)) => a.cmp(b),
            (a, b) => bail!("cannot compare {:?} with {:?}", a, b),
        })
    }
}
