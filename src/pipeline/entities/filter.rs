use super::types::{CodedEntity, FilteredEntity};

/// Keep only codes scored at or above `threshold`; drop entities left with none.
///
/// Scores are carried over untouched and entity/code order is preserved.
pub fn filter_entities(entities: &[CodedEntity], threshold: f32) -> Vec<FilteredEntity> {
    entities
        .iter()
        .filter_map(|entity| {
            let codes: Vec<_> = entity
                .codes
                .iter()
                .filter(|c| c.score >= threshold)
                .cloned()
                .collect();

            if codes.is_empty() {
                return None;
            }

            Some(FilteredEntity {
                text: entity.text.clone(),
                category: entity.category,
                codes,
            })
        })
        .collect()
}
