//! Read-only checklist reference data: which documents each job category needs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::domain::{DocumentType, DocumentTypeId, JobCategory, JobCategoryDocument, JobCategoryId};

/// One checklist line as seen by the review core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    pub document_type: DocumentType,
    pub is_required: bool,
}

/// Job category and document type reference data, owned by an external configuration
/// workflow. The review core only reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequirementCatalog {
    document_types: BTreeMap<DocumentTypeId, DocumentType>,
    job_categories: BTreeMap<JobCategoryId, JobCategory>,
    checklist: Vec<JobCategoryDocument>,
}

impl RequirementCatalog {
    pub fn new(
        document_types: impl IntoIterator<Item = DocumentType>,
        job_categories: impl IntoIterator<Item = JobCategory>,
        checklist: impl IntoIterator<Item = JobCategoryDocument>,
    ) -> Self {
        Self {
            document_types: document_types
                .into_iter()
                .map(|document_type| (document_type.id, document_type))
                .collect(),
            job_categories: job_categories
                .into_iter()
                .map(|category| (category.id, category))
                .collect(),
            checklist: checklist.into_iter().collect(),
        }
    }

    pub fn document_type(&self, id: &DocumentTypeId) -> Option<&DocumentType> {
        self.document_types.get(id)
    }

    pub fn job_category(&self, id: &JobCategoryId) -> Option<&JobCategory> {
        self.job_categories.get(id)
    }

    pub fn job_categories(&self) -> impl Iterator<Item = &JobCategory> {
        self.job_categories.values()
    }

    /// Checklist for a category; rows pointing at unknown document types are skipped.
    pub fn requirements_for(&self, category: &JobCategoryId) -> Vec<Requirement> {
        self.checklist
            .iter()
            .filter(|row| &row.job_category_id == category)
            .filter_map(|row| {
                self.document_types
                    .get(&row.document_type_id)
                    .map(|document_type| Requirement {
                        document_type: document_type.clone(),
                        is_required: row.is_required,
                    })
            })
            .collect()
    }

    pub fn required_types_for(&self, category: &JobCategoryId) -> Vec<DocumentTypeId> {
        self.requirements_for(category)
            .into_iter()
            .filter(|requirement| requirement.is_required)
            .map(|requirement| requirement.document_type.id)
            .collect()
    }

    pub fn requirement(
        &self,
        category: &JobCategoryId,
        document_type: &DocumentTypeId,
    ) -> Option<Requirement> {
        self.requirements_for(category)
            .into_iter()
            .find(|requirement| &requirement.document_type.id == document_type)
    }

    pub fn requires_orientation(&self, category: &JobCategoryId) -> bool {
        self.job_categories
            .get(category)
            .is_some_and(|category| category.require_orientation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document_type(name: &str, required: bool) -> DocumentType {
        DocumentType {
            id: DocumentTypeId::new(),
            name: name.to_string(),
            field_name: name.to_ascii_lowercase(),
            required_by_default: required,
        }
    }

    #[test]
    fn checklist_override_wins_over_default_flag() {
        let id_card = document_type("ID", true);
        let xray = document_type("XRay", true);
        let category = JobCategory {
            id: JobCategoryId::new(),
            name: "Food Handler".to_string(),
            require_orientation: true,
        };
        let catalog = RequirementCatalog::new(
            [id_card.clone(), xray.clone()],
            [category.clone()],
            [
                JobCategoryDocument {
                    job_category_id: category.id,
                    document_type_id: id_card.id,
                    is_required: true,
                },
                JobCategoryDocument {
                    job_category_id: category.id,
                    document_type_id: xray.id,
                    is_required: false,
                },
            ],
        );

        assert_eq!(catalog.required_types_for(&category.id), vec![id_card.id]);
        assert!(catalog.requirement(&category.id, &xray.id).is_some());
        assert!(catalog.requires_orientation(&category.id));
        assert!(!catalog.requires_orientation(&JobCategoryId::new()));
    }

    #[test]
    fn unknown_category_has_empty_checklist() {
        let catalog = RequirementCatalog::default();
        assert!(catalog.requirements_for(&JobCategoryId::new()).is_empty());
    }
}
