//! Field schemas, per segment and per writer.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::document::DocValuesType;
use crate::error::{HalberdError, Result};

/// Schema of one field inside a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub number: u32,
    pub indexed: bool,
    pub stored: bool,
    pub doc_values: DocValuesType,
}

/// The fields used by one segment, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfos {
    by_name: BTreeMap<String, FieldInfo>,
}

impl FieldInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a usage of `name` into the schema.
    pub fn add(&mut self, name: &str, number: u32, indexed: bool, stored: bool, doc_values: DocValuesType) {
        let info = self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| FieldInfo {
                name: name.to_string(),
                number,
                indexed: false,
                stored: false,
                doc_values: DocValuesType::None,
            });
        info.indexed |= indexed;
        info.stored |= stored;
        if doc_values != DocValuesType::None {
            info.doc_values = doc_values;
        }
    }

    /// Merge a whole field info into the schema.
    pub fn add_info(&mut self, other: &FieldInfo) {
        self.add(&other.name, other.number, other.indexed, other.stored, other.doc_values);
    }

    pub fn get(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct GlobalField {
    number: u32,
    doc_values: DocValuesType,
}

/// A field usage requested by one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldUsage<'a> {
    pub name: &'a str,
    pub doc_values: DocValuesType,
}

/// Writer-wide field registry.
///
/// A field keeps one number and one doc-values type for the lifetime of the
/// index. Seeded from existing segments when a writer opens.
#[derive(Debug, Default)]
pub struct FieldNumbers {
    fields: Mutex<BTreeMap<String, GlobalField>>,
}

impl FieldNumbers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the field infos of an existing segment.
    pub fn seed(&self, infos: &FieldInfos) -> Result<()> {
        let mut fields = self.fields.lock();
        for info in infos.iter() {
            match fields.get_mut(&info.name) {
                Some(existing) => {
                    check_compatible(&info.name, existing.doc_values, info.doc_values)?;
                    if existing.doc_values == DocValuesType::None {
                        existing.doc_values = info.doc_values;
                    }
                }
                None => {
                    let number = fields.len() as u32;
                    fields.insert(
                        info.name.clone(),
                        GlobalField {
                            number,
                            doc_values: info.doc_values,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Register all usages of one document, or none of them.
    ///
    /// Returns the field numbers in the order of `usages`. Changing the
    /// doc-values type of a known field fails with `IllegalArgument`, which
    /// fails only the document.
    pub fn register(&self, usages: &[FieldUsage<'_>]) -> Result<Vec<u32>> {
        let mut fields = self.fields.lock();
        for usage in usages {
            if let Some(existing) = fields.get(usage.name) {
                check_compatible(usage.name, existing.doc_values, usage.doc_values)?;
            }
        }

        let mut numbers = Vec::with_capacity(usages.len());
        for usage in usages {
            let next = fields.len() as u32;
            let entry = fields.entry(usage.name.to_string()).or_insert(GlobalField {
                number: next,
                doc_values: DocValuesType::None,
            });
            if entry.doc_values == DocValuesType::None {
                entry.doc_values = usage.doc_values;
            }
            numbers.push(entry.number);
        }
        Ok(numbers)
    }

    /// Doc-values type of a known field.
    pub fn doc_values_type(&self, name: &str) -> Option<DocValuesType> {
        self.fields.lock().get(name).map(|f| f.doc_values)
    }

    /// Number of a known field.
    pub fn number(&self, name: &str) -> Option<u32> {
        self.fields.lock().get(name).map(|f| f.number)
    }

    /// Check that `name` can receive an update of type `kind`.
    ///
    /// Updates never create fields: the field must already exist with the
    /// same updatable doc-values type.
    pub fn check_updatable(&self, name: &str, kind: DocValuesType) -> Result<()> {
        match self.doc_values_type(name) {
            None => Err(HalberdError::schema(format!(
                "can only update existing doc-values fields; field {name:?} does not exist"
            ))),
            Some(existing) if !existing.is_updatable() => Err(HalberdError::schema(format!(
                "field {name:?} has doc-values type {existing}, which cannot be updated"
            ))),
            Some(existing) if existing != kind => Err(HalberdError::schema(format!(
                "field {name:?} is a {existing} doc-values field, got a {kind} update"
            ))),
            Some(_) => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.lock().is_empty()
    }
}

fn check_compatible(name: &str, existing: DocValuesType, requested: DocValuesType) -> Result<()> {
    if existing != DocValuesType::None && requested != DocValuesType::None && existing != requested {
        return Err(HalberdError::illegal_argument(format!(
            "cannot change doc-values type of field {name:?} from {existing} to {requested}"
        )));
    }
    Ok(())
}
