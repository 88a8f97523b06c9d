use std::ops::Range;

use crate::{error::RenderError, render::queue::QueueFamily};

/// Partition of a timeline into command groups. A group is the run of steps up to and including
/// the next step that ends one (a `Submit` or an `AcquireImage`).
#[derive(Clone, Debug, Default)]
pub struct GroupLayout {
    group_indices: Vec<usize>,
    group_families: Vec<Option<QueueFamily>>,
    bounds: Vec<Range<usize>>,
}

impl GroupLayout {
    /// Builds the layout from per-step `(ends_group, family)` tags. A group's family is the
    /// family of its terminating step, or of its first step naming one.
    pub fn from_tags(
        tags: impl IntoIterator<Item = (bool, Option<QueueFamily>)>,
    ) -> Result<Self, RenderError> {
        let mut layout = GroupLayout::default();
        let mut start = 0;
        let mut family = None;

        for (index, (ends_group, step_family)) in tags.into_iter().enumerate() {
            let group = layout.bounds.len();
            layout.group_indices.push(group);
            if family.is_none() {
                family = step_family;
            }
            if ends_group {
                layout.group_families.push(step_family.or(family));
                layout.bounds.push(start..index + 1);
                start = index + 1;
                family = None;
            }
        }

        if start != layout.group_indices.len() {
            return Err(RenderError::InvalidTimeline(format!(
                "steps {}..{} are not terminated by a submit",
                start,
                layout.group_indices.len()
            )));
        }
        Ok(layout)
    }

    pub fn group_count(&self) -> usize {
        self.bounds.len()
    }

    pub fn group_of(&self, step: usize) -> usize {
        self.group_indices[step]
    }

    pub fn family_of(&self, group: usize) -> Option<QueueFamily> {
        self.group_families[group]
    }

    pub fn group_indices(&self) -> &[usize] {
        &self.group_indices
    }

    pub fn group_families(&self) -> &[Option<QueueFamily>] {
        &self.group_families
    }

    pub fn steps_in(&self, group: usize) -> Range<usize> {
        self.bounds[group].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: Option<QueueFamily> = Some(QueueFamily::Graphics);
    const P: Option<QueueFamily> = Some(QueueFamily::Present);

    #[test]
    fn submits_close_groups() {
        let layout = GroupLayout::from_tags([(false, G), (true, G), (false, P), (true, P)]).unwrap();
        assert_eq!(layout.group_count(), 2);
        assert_eq!(layout.group_indices(), &[0, 0, 1, 1]);
        assert_eq!(layout.group_families(), &[G, P]);
        assert_eq!(layout.steps_in(1), 2..4);
    }

    #[test]
    fn acquire_forms_its_own_group() {
        let layout = GroupLayout::from_tags([(true, None), (false, G), (true, G)]).unwrap();
        assert_eq!(layout.group_families(), &[None, G]);
        assert_eq!(layout.group_of(2), 1);
    }

    #[test]
    fn trailing_steps_are_rejected() {
        let err = GroupLayout::from_tags([(false, G), (true, G), (false, G)]).unwrap_err();
        assert!(matches!(err, RenderError::InvalidTimeline(_)));
    }
}
