use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;

use crate::error::ConfigError;

use super::value::{FieldKind, FieldValue};

/// One entry of the offset-table build contract: a declared member, its
/// type tag, and whether it is a property (only properties may be networked).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: String,
    pub type_tag: String,
    pub is_property: bool,
}

impl FieldDecl {
    pub fn property(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            is_property: true,
        }
    }

    pub fn plain(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            is_property: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEntry {
    pub name: String,
    pub offset: usize,
    pub kind: FieldKind,
}

impl FieldEntry {
    pub fn width(&self) -> usize {
        self.kind.width()
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.kind.width()
    }
}

/// Typed handle to a field at a fixed offset inside a state block.
pub struct Field<T> {
    offset: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FieldValue> Field<T> {
    pub(crate) fn at(offset: usize) -> Self {
        Self {
            offset: offset as u32,
            _marker: PhantomData,
        }
    }

    pub fn offset(self) -> usize {
        self.offset as usize
    }

    pub fn range(self) -> std::ops::Range<usize> {
        let start = self.offset as usize;
        start..start + T::KIND.width()
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for Field<T> {}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field(+{})", self.offset)
    }
}

/// Packed layout of one networked type. Offsets follow declaration order
/// with no padding and never change after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTable {
    type_name: String,
    fields: Vec<FieldEntry>,
    block_size: usize,
}

impl OffsetTable {
    pub fn from_decls(type_name: &str, decls: &[FieldDecl]) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(decls.len());
        let mut offset = 0;

        for decl in decls {
            if !decl.is_property {
                return Err(ConfigError::NotAProperty {
                    type_name: type_name.to_string(),
                    field: decl.name.clone(),
                });
            }
            let kind = FieldKind::from_tag(&decl.type_tag).ok_or_else(|| {
                ConfigError::UnsupportedFieldType {
                    type_name: type_name.to_string(),
                    field: decl.name.clone(),
                    type_tag: decl.type_tag.clone(),
                }
            })?;
            if !seen.insert(decl.name.as_str()) {
                return Err(ConfigError::DuplicateField {
                    type_name: type_name.to_string(),
                    field: decl.name.clone(),
                });
            }
            fields.push(FieldEntry {
                name: decl.name.clone(),
                offset,
                kind,
            });
            offset += kind.width();
        }

        if fields.is_empty() {
            return Err(ConfigError::EmptyType {
                type_name: type_name.to_string(),
            });
        }

        Ok(Self {
            type_name: type_name.to_string(),
            fields,
            block_size: offset,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn fields(&self) -> &[FieldEntry] {
        &self.fields
    }

    pub fn entry(&self, name: &str) -> Option<&FieldEntry> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// `(offset, width)` of a field within the block.
    pub fn offset(&self, name: &str) -> Option<(usize, usize)> {
        self.entry(name).map(|f| (f.offset, f.width()))
    }

    pub fn field<T: FieldValue>(&self, name: &str) -> Result<Field<T>, ConfigError> {
        let entry = self.entry(name).ok_or_else(|| ConfigError::UnknownField {
            type_name: self.type_name.clone(),
            field: name.to_string(),
        })?;
        if entry.kind != T::KIND {
            return Err(ConfigError::FieldKindMismatch {
                type_name: self.type_name.clone(),
                field: name.to_string(),
                declared: entry.kind.name(),
                requested: T::KIND.name(),
            });
        }
        Ok(Field::at(entry.offset))
    }

    /// Like [`field`](Self::field) but treats absence or a kind mismatch as
    /// "this type does not carry it".
    pub fn try_field<T: FieldValue>(&self, name: &str) -> Option<Field<T>> {
        self.field(name).ok()
    }
}

/// Incremental form of [`OffsetTable::from_decls`].
#[derive(Debug, Clone)]
pub struct OffsetTableBuilder {
    type_name: String,
    decls: Vec<FieldDecl>,
}

impl OffsetTableBuilder {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            decls: Vec::new(),
        }
    }

    pub fn property(mut self, name: &str, type_tag: &str) -> Self {
        self.decls.push(FieldDecl::property(name, type_tag));
        self
    }

    pub fn field(mut self, name: &str, type_tag: &str) -> Self {
        self.decls.push(FieldDecl::plain(name, type_tag));
        self
    }

    pub fn decls(&self) -> &[FieldDecl] {
        &self.decls
    }

    pub fn build(self) -> Result<OffsetTable, ConfigError> {
        OffsetTable::from_decls(&self.type_name, &self.decls)
    }
}

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};

    use super::*;

    fn avatar() -> OffsetTable {
        OffsetTableBuilder::new("Avatar")
            .property("position", "Vec3")
            .property("rotation", "Quat")
            .property("health", "i32")
            .property("alive", "bool")
            .property("score", "f64")
            .build()
            .unwrap()
    }

    #[test]
    fn offsets_follow_declaration_order() {
        let table = avatar();
        assert_eq!(table.offset("position"), Some((0, 12)));
        assert_eq!(table.offset("rotation"), Some((12, 16)));
        assert_eq!(table.offset("health"), Some((28, 4)));
        assert_eq!(table.offset("alive"), Some((32, 4)));
        assert_eq!(table.offset("score"), Some((36, 8)));
        assert_eq!(table.block_size(), 44);
        assert_eq!(table.offset("missing"), None);
    }

    #[test]
    fn layout_is_stable_across_builds() {
        assert_eq!(avatar(), avatar());
    }

    #[test]
    fn typed_field_checks_kind() {
        let table = avatar();
        let position: Field<Vec3> = table.field("position").unwrap();
        assert_eq!(position.offset(), 0);
        assert!(matches!(
            table.field::<Quat>("position"),
            Err(ConfigError::FieldKindMismatch { .. })
        ));
        assert!(table.try_field::<f32>("health").is_none());
    }

    #[test]
    fn rejects_unsupported_type() {
        let err = OffsetTableBuilder::new("Crate")
            .property("label", "String")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedFieldType {
                type_name: "Crate".into(),
                field: "label".into(),
                type_tag: "String".into(),
            }
        );
        assert!(err.to_string().contains("Crate.label"));
    }

    #[test]
    fn rejects_plain_fields_and_duplicates() {
        let err = OffsetTableBuilder::new("Door")
            .field("open", "bool")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotAProperty { .. }));

        let err = OffsetTableBuilder::new("Door")
            .property("open", "bool")
            .property("open", "bool")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateField { .. }));
    }
}
