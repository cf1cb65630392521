//! Field classification – scalar vs. attachment-bearing fields.

use std::collections::HashSet;

use crate::source::{FieldDescriptor, FieldId};

/// Field ids split by kind, each list in original field order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPartition {
    pub scalar: Vec<FieldId>,
    pub attachment: Vec<FieldId>,
}

/// Build descriptors from ids, their display names (aligned with `ids`) and
/// the attachment-typed subset reported by the source.
pub fn describe_fields(
    ids: &[FieldId],
    names: Vec<String>,
    attachment_ids: &HashSet<FieldId>,
) -> Vec<FieldDescriptor> {
    ids.iter()
        .zip(names.into_iter().map(Some).chain(std::iter::repeat(None)))
        .map(|(id, name)| FieldDescriptor {
            id: id.clone(),
            display_name: name.filter(|n| !n.is_empty()).unwrap_or_else(|| id.clone()),
            is_attachment: attachment_ids.contains(id),
        })
        .collect()
}

pub fn partition(fields: &[FieldDescriptor]) -> FieldPartition {
    let mut out = FieldPartition::default();
    for field in fields {
        if field.is_attachment {
            out.attachment.push(field.id.clone());
        } else {
            out.scalar.push(field.id.clone());
        }
    }
    out
}
