use std::fs;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use tracing::info;
use crate::core::error::{Error, Result};
use crate::core::types::{
    ATTR_TYPE_INTEGER, ATTR_TYPE_STRING, MAX_SORT_BITS, SORT_KEY_COUNT, SortKey, attr_header,
};
use crate::storage::layout::StorageLayout;

pub const MAX_COLUMNS: usize = 100;
pub const MAX_COLUMN_NAME: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Integer,
    String,
    Fulltext,
}

/// Where a sort column lives inside the packed 128-bit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub bit_offset: u32,
    pub bit_len: u32,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub id: u8,
    pub kind: ColumnKind,
    pub bit_len: u32,       // 0 for string-like columns
    pub indexed: bool,
    pub primary_key: bool,
    pub sort: Option<SortSpec>,
}

impl Column {
    fn new(name: &str, id: u8) -> Self {
        Column {
            name: name.to_string(),
            id,
            kind: ColumnKind::String,
            bit_len: 0,
            indexed: true,
            primary_key: false,
            sort: None,
        }
    }

    /// Phrase header byte: type bit plus attribute id.
    pub fn header(&self) -> u8 {
        match self.kind {
            ColumnKind::Integer => attr_header(self.id, ATTR_TYPE_INTEGER),
            ColumnKind::String | ColumnKind::Fulltext => attr_header(self.id, ATTR_TYPE_STRING),
        }
    }

    pub fn is_integer(&self) -> bool {
        self.kind == ColumnKind::Integer
    }

    pub fn is_fulltext(&self) -> bool {
        self.kind == ColumnKind::Fulltext
    }

    fn apply_spec(&mut self, spec: &str) -> Result<()> {
        match spec {
            "pkey" => {
                self.kind = ColumnKind::Integer;
                self.bit_len = 32;
                self.primary_key = true;
                self.indexed = false;
            }
            "int" | "int32" | "integer" => self.integer(32),
            "int16" | "smallint" => self.integer(16),
            "int8" | "tinyint" => self.integer(8),
            "bool" | "boolean" => self.integer(1),
            "string" => {
                self.kind = ColumnKind::String;
                self.bit_len = 0;
                self.primary_key = false;
            }
            "fulltext" => {
                self.kind = ColumnKind::Fulltext;
                self.bit_len = 0;
                self.primary_key = false;
            }
            "index" => self.indexed = true,
            "noindex" => self.indexed = false,
            other => {
                return Err(Error::schema(format!(
                    "column '{}' has an unknown spec '{}'",
                    self.name, other
                )));
            }
        }
        Ok(())
    }

    fn integer(&mut self, bits: u32) {
        self.kind = ColumnKind::Integer;
        self.bit_len = bits;
        self.primary_key = false;
    }
}

/// Direction a result ordering asks for one sort column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub column: Column,
    pub descending: bool,
}

/// Column definitions and the packed sort key layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Parse `{"columns": {name: "spec,..."}, "sortkeys": ["col[,asc|desc]"]}`.
    pub fn from_settings(settings: &Value) -> Result<Self> {
        let columns = settings
            .get("columns")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::schema("settings need a 'columns' object"))?;
        if columns.len() > MAX_COLUMNS {
            return Err(Error::schema(format!(
                "{} columns exceed the limit of {}",
                columns.len(),
                MAX_COLUMNS
            )));
        }

        let mut schema = Schema { columns: Vec::with_capacity(columns.len()) };
        for (i, (name, spec)) in columns.iter().enumerate() {
            if name.is_empty() || name.len() > MAX_COLUMN_NAME {
                return Err(Error::schema(format!("column name '{}' has an invalid length", name)));
            }
            let spec = spec
                .as_str()
                .ok_or_else(|| Error::schema(format!("column '{}' spec must be a string", name)))?;
            let mut column = Column::new(name, (i + 1) as u8);
            for part in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                column.apply_spec(part)?;
            }
            schema.columns.push(column);
        }

        if let Some(sortkeys) = settings.get("sortkeys") {
            let sortkeys = sortkeys
                .as_array()
                .ok_or_else(|| Error::schema("'sortkeys' must be an array"))?;
            let mut next_bit = 0u32;
            for entry in sortkeys {
                let entry = entry
                    .as_str()
                    .ok_or_else(|| Error::schema("sort key must be 'column[,asc|desc]'"))?;
                let mut parts = entry.split(',').map(str::trim);
                let name = parts.next().unwrap_or_default();
                let descending = match parts.next() {
                    None | Some("asc") => false,
                    Some("desc") => true,
                    Some(other) => {
                        return Err(Error::schema(format!("sort direction '{}' is not asc or desc", other)));
                    }
                };
                let column = schema
                    .columns
                    .iter_mut()
                    .find(|c| c.name == name)
                    .ok_or_else(|| Error::schema(format!("sort key '{}' is not a column", name)))?;
                if column.bit_len == 0 {
                    return Err(Error::schema(format!("sort key '{}' is not an integer column", name)));
                }
                if column.sort.is_some() {
                    return Err(Error::schema(format!("sort key '{}' is listed twice", name)));
                }
                column.sort = Some(SortSpec { bit_offset: next_bit, bit_len: column.bit_len, descending });
                next_bit += column.bit_len;
            }
        }

        schema.validate()?;
        Ok(schema)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_settings(&serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        match self.columns.iter().filter(|c| c.primary_key).count() {
            1 => {}
            0 => return Err(Error::schema("schema has no primary key column")),
            n => return Err(Error::schema(format!("schema has {} primary key columns", n))),
        }
        let width: u32 = self.columns.iter().filter_map(|c| c.sort).map(|s| s.bit_len).sum();
        if width > MAX_SORT_BITS {
            return Err(Error::schema(format!("sort keys need {} bits, limit is {}", width, MAX_SORT_BITS)));
        }
        Ok(())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Result<&Column> {
        self.columns
            .iter()
            .find(|c| c.primary_key)
            .ok_or_else(|| Error::schema("schema has no primary key column"))
    }

    /// Sort columns in bit order.
    pub fn sort_columns(&self) -> Vec<&Column> {
        let mut sorted: Vec<&Column> = self.columns.iter().filter(|c| c.sort.is_some()).collect();
        sorted.sort_by_key(|c| c.sort.map(|s| s.bit_offset));
        sorted
    }

    /// Pack every sort column's value. Results sort by descending key, so
    /// ascending columns are stored with inverted bits.
    pub fn pack_sortkey(&self, mut value_of: impl FnMut(&Column) -> i32) -> SortKey {
        let mut packed = 0u128;
        for column in self.sort_columns() {
            if let Some(spec) = column.sort {
                let raw = value_of(column) as u32;
                let stored = if spec.descending { raw } else { !raw };
                place_bits(&mut packed, spec.bit_offset, spec.bit_len, stored);
            }
        }
        to_sortkey(packed)
    }

    /// Raw value of a sort column recovered from a packed key.
    pub fn sort_value(&self, column: &Column, sortkey: &SortKey) -> Option<u32> {
        let spec = self.column(&column.name)?.sort?;
        let stored = take_bits(from_sortkey(sortkey), spec.bit_offset, spec.bit_len);
        Some(if spec.descending { stored } else { !stored & mask(spec.bit_len) })
    }

    /// Repack a stored key so it sorts by `order` instead of the schema's sort keys.
    pub fn reorder(&self, order: &[OrderKey], sortkey: &SortKey) -> SortKey {
        let mut packed = 0u128;
        let mut bit = 0u32;
        for key in order {
            let Some(raw) = self.sort_value(&key.column, sortkey) else {
                continue;
            };
            let len = key.column.bit_len;
            let stored = if key.descending { raw } else { !raw };
            place_bits(&mut packed, bit, len, stored);
            bit += len;
        }
        to_sortkey(packed)
    }

    pub fn save(&self, storage: &StorageLayout) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        fs::write(storage.schema_path(), bytes)?;
        Ok(())
    }

    pub fn load(storage: &StorageLayout) -> Result<Option<Self>> {
        let path = storage.schema_path();
        if !path.exists() {
            return Ok(None);
        }
        let schema: Schema = bincode::deserialize(&fs::read(&path)?)?;
        schema.validate()?;
        info!(columns = schema.columns.len(), "schema loaded");
        Ok(Some(schema))
    }
}

fn mask(len: u32) -> u32 {
    match len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => (1u32 << n) - 1,
    }
}

/// Bits `[offset, offset + len)` counted from the most significant end.
fn place_bits(packed: &mut u128, offset: u32, len: u32, value: u32) {
    let Some(shift) = MAX_SORT_BITS.checked_sub(offset + len) else {
        return;
    };
    *packed |= ((value & mask(len)) as u128) << shift;
}

fn take_bits(packed: u128, offset: u32, len: u32) -> u32 {
    match MAX_SORT_BITS.checked_sub(offset + len) {
        Some(shift) => ((packed >> shift) as u32) & mask(len),
        None => 0,
    }
}

fn to_sortkey(packed: u128) -> SortKey {
    let mut key = [0u32; SORT_KEY_COUNT];
    for (i, word) in key.iter_mut().enumerate() {
        *word = (packed >> (32 * (SORT_KEY_COUNT - 1 - i))) as u32;
    }
    key
}

fn from_sortkey(key: &SortKey) -> u128 {
    key.iter().fold(0u128, |acc, word| (acc << 32) | *word as u128)
}
