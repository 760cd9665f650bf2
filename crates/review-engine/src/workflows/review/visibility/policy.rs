use std::collections::BTreeMap;

use crate::workflows::review::domain::{
    FieldVisibility, FormDefinition, FormField, ReviewerTypeId, Stage,
};

/// Role-scoped field visibility for one stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePolicy<'a> {
    settings: Option<&'a BTreeMap<String, FieldVisibility>>,
}

impl<'a> RolePolicy<'a> {
    /// Every field visible; used for administrator views.
    pub fn open() -> Self {
        Self { settings: None }
    }

    pub fn for_role(stage: &'a Stage, role: Option<&ReviewerTypeId>) -> Self {
        Self {
            settings: stage
                .reviewer_config(role)
                .map(|config| &config.field_visibility),
        }
    }

    pub fn visibility(&self, field: &FormField) -> FieldVisibility {
        let Some(settings) = self.settings else {
            return FieldVisibility::Visible;
        };

        settings
            .get(&field.id.0)
            .or_else(|| settings.get(&field.name))
            .copied()
            .unwrap_or_default()
    }

    pub fn shows(&self, field: &FormField) -> bool {
        self.visibility(field) != FieldVisibility::Hidden
    }
}

/// A section with the fields that survived the role policy, in form order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SectionLayout<'a> {
    pub id: Option<String>,
    pub title: String,
    pub fields: Vec<(&'a FormField, FieldVisibility)>,
}

pub(crate) const UNSECTIONED_TITLE: &str = "Responses";

/// Groups visible fields by section; sections left without visible fields are omitted.
pub(crate) fn layout<'a>(
    form: &'a FormDefinition,
    policy: &RolePolicy<'_>,
) -> Vec<SectionLayout<'a>> {
    let mut fields: Vec<&FormField> = form.fields.iter().collect();
    fields.sort_by_key(|field| field.position);

    let mut sections: Vec<SectionLayout<'a>> = form
        .sections
        .iter()
        .map(|section| SectionLayout {
            id: Some(section.id.clone()),
            title: section.title.clone(),
            fields: Vec::new(),
        })
        .collect();
    let mut loose = SectionLayout {
        id: None,
        title: UNSECTIONED_TITLE.to_string(),
        fields: Vec::new(),
    };

    for field in fields {
        let visibility = policy.visibility(field);
        if visibility == FieldVisibility::Hidden {
            continue;
        }
        let home = field.section_id.as_ref().and_then(|section_id| {
            sections
                .iter_mut()
                .find(|section| section.id.as_ref() == Some(section_id))
        });
        match home {
            Some(section) => section.fields.push((field, visibility)),
            None => loose.fields.push((field, visibility)),
        }
    }

    sections.push(loose);
    sections.retain(|section| !section.fields.is_empty());
    sections
}
