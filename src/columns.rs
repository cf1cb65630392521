//! Column plan – the ordered, append-only list of output columns.
//!
//! Scalar fields get exactly one column up front. Attachment fields start
//! with none and grow one column per slot index as records reveal longer
//! attachment lists. A column never moves once created.

use std::collections::HashMap;
use std::ops::Range;

use crate::source::{FieldDescriptor, FieldId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlanEntry {
    pub field_id: FieldId,
    pub header: String,
    pub is_attachment: bool,
    /// Slot index within the field's attachment list (attachment columns only).
    pub slot: Option<usize>,
}

/// Result of [`ColumnPlan::ensure_slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGrowth {
    /// Zero-based position of the requested slot.
    pub position: usize,
    /// Positions appended by this call (empty when the slot already existed).
    pub created: Range<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ColumnPlan {
    entries: Vec<ColumnPlanEntry>,
    slot_counts: HashMap<FieldId, usize>,
    index: HashMap<(FieldId, Option<usize>), usize>,
}

/// Header of an attachment slot column: `"<field>(<slot + 1>)"`.
pub fn slot_header(header_base: &str, slot: usize) -> String {
    format!("{header_base}({})", slot + 1)
}

impl ColumnPlan {
    /// One column per scalar field, in field order.
    pub fn build_initial(fields: &[FieldDescriptor]) -> Self {
        let mut plan = Self::default();
        plan.entries = fields
            .iter()
            .filter(|f| !f.is_attachment)
            .map(|f| ColumnPlanEntry {
                field_id: f.id.clone(),
                header: f.display_name.clone(),
                is_attachment: false,
                slot: None,
            })
            .collect();
        plan.rebuild_index();
        plan
    }

    /// Make sure slots `0..=slot` exist for `field_id`, appending the missing
    /// ones in ascending order.
    pub fn ensure_slot(&mut self, field_id: &str, slot: usize, header_base: &str) -> SlotGrowth {
        let start = self.entries.len();
        let current = self.slot_count(field_id);
        if slot >= current {
            for s in current..=slot {
                self.entries.push(ColumnPlanEntry {
                    field_id: field_id.to_string(),
                    header: slot_header(header_base, s),
                    is_attachment: true,
                    slot: Some(s),
                });
            }
            self.slot_counts.insert(field_id.to_string(), slot + 1);
            self.rebuild_index();
        }
        let position = self
            .index_of(field_id, Some(slot))
            .unwrap_or(self.entries.len() - 1);
        SlotGrowth {
            position,
            created: start..self.entries.len(),
        }
    }

    /// Zero-based position of a column, `None` if it does not exist.
    pub fn index_of(&self, field_id: &str, slot: Option<usize>) -> Option<usize> {
        self.index.get(&(field_id.to_string(), slot)).copied()
    }

    /// Number of slot columns created so far for an attachment field.
    pub fn slot_count(&self, field_id: &str) -> usize {
        self.slot_counts.get(field_id).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> &[ColumnPlanEntry] {
        &self.entries
    }

    pub fn headers(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.header.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| ((e.field_id.clone(), e.slot), i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(id: &str, attachment: bool) -> FieldDescriptor {
        FieldDescriptor {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            is_attachment: attachment,
        }
    }

    fn sample_plan() -> ColumnPlan {
        ColumnPlan::build_initial(&[field("a", false), field("p", true), field("b", false)])
    }

    #[test]
    fn initial_plan_has_scalar_columns_only() {
        let plan = sample_plan();
        assert_eq!(plan.headers(), vec!["A", "B"]);
        assert_eq!(plan.index_of("b", None), Some(1));
        assert_eq!(plan.index_of("p", Some(0)), None);
        assert_eq!(plan.slot_count("p"), 0);
    }

    #[test]
    fn ensure_slot_fills_gaps_in_ascending_order() {
        let mut plan = sample_plan();
        let growth = plan.ensure_slot("p", 2, "Photos");
        assert_eq!(growth.position, 4);
        assert_eq!(growth.created, 2..5);
        assert_eq!(plan.headers()[2..], ["Photos(1)", "Photos(2)", "Photos(3)"]);
        assert_eq!(plan.slot_count("p"), 3);
    }

    #[test]
    fn ensure_slot_is_idempotent() {
        let mut plan = sample_plan();
        plan.ensure_slot("p", 1, "Photos");
        let before = plan.headers();
        let growth = plan.ensure_slot("p", 0, "Photos");
        assert_eq!(growth.position, 2);
        assert!(growth.created.is_empty());
        assert_eq!(plan.headers(), before);
    }

    #[test]
    fn columns_never_move_when_other_fields_grow() {
        let mut plan = ColumnPlan::build_initial(&[field("x", true), field("y", true)]);
        plan.ensure_slot("x", 0, "X");
        plan.ensure_slot("y", 0, "Y");
        plan.ensure_slot("x", 1, "X");
        assert_eq!(plan.headers(), vec!["X(1)", "Y(1)", "X(2)"]);
        assert_eq!(plan.index_of("x", Some(0)), Some(0));
        assert_eq!(plan.index_of("y", Some(0)), Some(1));
        assert_eq!(plan.index_of("x", Some(1)), Some(2));
    }
}
