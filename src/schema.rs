//! Table and column metadata shared by the source and warehouse sides.
//!
//! A [`TableSchema`] keeps columns in whatever order they were supplied.
//! Anything that renders columns (create statements, bulk-load column lists)
//! must go through [`TableSchema::ordered`], which sorts by ordinal.

/// A single column of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnInfo {
    /// Position within the table. Unique per table.
    pub ordinal: i32,
    pub name: String,
    /// Warehouse type, e.g. `int` or `VARCHAR(MAX)`.
    pub col_type: String,
    pub default_val: Option<String>,
    pub not_null: bool,
    pub primary_key: bool,
    /// Distribution key hint.
    pub dist_key: bool,
    /// Sort key hint. Primary key columns are always sort keys.
    pub sort_key: bool,
}

impl ColumnInfo {
    pub fn new(ordinal: i32, name: impl Into<String>, col_type: impl Into<String>) -> Self {
        Self {
            ordinal,
            name: name.into(),
            col_type: col_type.into(),
            ..Default::default()
        }
    }

    pub fn with_default(mut self, default_val: impl Into<String>) -> Self {
        self.default_val = Some(default_val.into());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn sort_key(mut self) -> Self {
        self.sort_key = true;
        self
    }

    pub fn dist_key(mut self) -> Self {
        self.dist_key = true;
        self
    }
}

/// The columns of one table, in no particular order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns }
    }

    /// Columns as supplied.
    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// Columns sorted ascending by ordinal.
    pub fn ordered(&self) -> Vec<&ColumnInfo> {
        let mut columns: Vec<&ColumnInfo> = self.columns.iter().collect();
        columns.sort_by_key(|c| c.ordinal);
        columns
    }

    /// Column names sorted ascending by ordinal.
    pub fn column_names(&self) -> Vec<&str> {
        self.ordered().into_iter().map(|c| c.name.as_str()).collect()
    }

    /// The first ordinal that appears more than once, if any.
    pub fn duplicate_ordinal(&self) -> Option<i32> {
        self.ordered()
            .windows(2)
            .find(|pair| pair[0].ordinal == pair[1].ordinal)
            .map(|pair| pair[0].ordinal)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnInfo> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<ColumnInfo> for TableSchema {
    fn from_iter<I: IntoIterator<Item = ColumnInfo>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Refresh metadata that is not part of the table definition itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableMeta {
    /// Column marking when a row's data was gathered.
    pub data_date_column: Option<String>,
}

/// Everything needed to refresh one table. Immutable for a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    /// Namespace the table was read from.
    pub namespace: String,
    pub schema: TableSchema,
    pub meta: TableMeta,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            schema,
            meta: TableMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: TableMeta) -> Self {
        self.meta = meta;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out_of_order() -> TableSchema {
        TableSchema::new(vec![
            ColumnInfo::new(3, "field3", "type3").with_default("defaultval3"),
            ColumnInfo::new(1, "field1", "type1").not_null(),
            ColumnInfo::new(2, "field2", "type2").primary_key(),
        ])
    }

    #[test]
    fn test_ordered_sorts_by_ordinal() {
        let schema = out_of_order();
        let ordinals: Vec<i32> = schema.ordered().iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
        assert_eq!(schema.column_names(), vec!["field1", "field2", "field3"]);

        // Supplied order is left alone
        assert_eq!(schema.columns()[0].name, "field3");
    }

    #[test]
    fn test_duplicate_ordinal_detected() {
        assert_eq!(out_of_order().duplicate_ordinal(), None);

        let schema: TableSchema = vec![
            ColumnInfo::new(1, "a", "int"),
            ColumnInfo::new(2, "b", "int"),
            ColumnInfo::new(1, "c", "int"),
        ]
        .into_iter()
        .collect();
        assert_eq!(schema.duplicate_ordinal(), Some(1));
    }

    #[test]
    fn test_column_mut_applies_hints() {
        let mut schema = out_of_order();
        schema.column_mut("field1").unwrap().dist_key = true;
        assert!(schema.columns()[1].dist_key);
        assert!(schema.column_mut("missing").is_none());
        assert!(schema.contains("field3"));
    }
}
