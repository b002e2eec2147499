//! Column definitions pairing a [`DataType`] with per-column metadata.

use super::DataType;

/// One column of a table: name, type, declared size, position, nullability.
///
/// `declared_size` is the maximum encoded width for variable-width types and
/// the fixed width otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    name: String,
    data_type: DataType,
    declared_size: u16,
    index: u16,
    nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType, index: u16) -> Self {
        let declared_size = data_type.fixed_size().unwrap_or(255) as u16;
        Self {
            name: name.into(),
            data_type,
            declared_size,
            index,
            nullable: true,
        }
    }

    /// Creates a VARCHAR(n) column.
    pub fn varchar(name: impl Into<String>, max_len: u16, index: u16) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::Varchar,
            declared_size: max_len,
            index,
            nullable: true,
        }
    }

    /// Creates a BINARY(n) column.
    pub fn binary(name: impl Into<String>, max_len: u16, index: u16) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::Binary,
            declared_size: max_len,
            index,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Used when reloading the catalog, where every field is explicit.
    pub fn from_parts(
        name: String,
        data_type: DataType,
        declared_size: u16,
        index: u16,
        nullable: bool,
    ) -> Self {
        Self {
            name,
            data_type,
            declared_size,
            index,
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn declared_size(&self) -> u16 {
        self.declared_size
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_column_derives_size() {
        let col = ColumnDef::new("id", DataType::BigInt, 0);

        assert_eq!(col.declared_size(), 8);
        assert!(col.nullable());
    }

    #[test]
    fn varchar_column_keeps_declared_size() {
        let col = ColumnDef::varchar("name", 120, 1).not_null();

        assert_eq!(col.data_type(), DataType::Varchar);
        assert_eq!(col.declared_size(), 120);
        assert!(!col.nullable());
    }
}
