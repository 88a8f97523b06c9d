mod barrier;
mod drawable;
mod executor;
mod groups;
mod layouts;
mod state;
mod step;

use anyhow::Context;

use crate::{
    error::RenderError,
    render::{
        context::FrameContext,
        gpu::{Gpu, Pipeline},
        queue::QueueFamily,
    },
    resource::MemoryPolicy,
};

pub use barrier::{BufferRange, DependencyPlan, ResourceDependency};
pub use drawable::{BoundResource, Dispatchable, DrawCall, Drawable};
pub use groups::GroupLayout;
pub use layouts::{COLOR_RANGE, DEPTH_RANGE, ImageState, image_barrier, transition_image};
pub use state::TimelineState;
pub use step::{CopyStep, Step, Submit};

/// A validated, ordered list of steps walked once per frame.
#[derive(Debug)]
pub struct Timeline {
    steps: Vec<Step>,
    layout: GroupLayout,
    last_draw_group: Option<usize>,
    present_group: Option<usize>,
}

#[derive(Default)]
pub struct TimelineBuilder {
    steps: Vec<Step>,
}

impl TimelineBuilder {
    pub fn acquire_image(self) -> Self {
        self.step(Step::AcquireImage)
    }

    pub fn initialize(self, family: QueueFamily) -> Self {
        self.step(Step::Initialize(family))
    }

    pub fn draw(self, family: QueueFamily, drawable: impl Drawable + 'static) -> Self {
        self.step(Step::Draw {
            family,
            drawable: Box::new(drawable),
        })
    }

    pub fn dispatch(self, family: QueueFamily, dispatchable: impl Dispatchable + 'static) -> Self {
        self.step(Step::Dispatch {
            family,
            dispatchable: Box::new(dispatchable),
        })
    }

    pub fn dependency(self, dependency: ResourceDependency) -> Self {
        self.step(Step::ResourceDependency(dependency))
    }

    pub fn commit_transfers(self, family: QueueFamily) -> Self {
        self.step(Step::CommitTransfers(family))
    }

    pub fn copy(self, copy: CopyStep) -> Self {
        self.step(Step::Copy(copy))
    }

    pub fn submit(self, submit: Submit) -> Self {
        self.step(Step::Submit(submit))
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> anyhow::Result<Timeline> {
        Timeline::new(self.steps)
    }
}

fn invalid(message: String) -> anyhow::Error {
    RenderError::InvalidTimeline(message).into()
}

impl Timeline {
    pub fn builder() -> TimelineBuilder {
        TimelineBuilder::default()
    }

    pub fn new(steps: Vec<Step>) -> anyhow::Result<Self> {
        let layout =
            GroupLayout::from_tags(steps.iter().map(|s| (s.ends_command_group(), s.family())))?;

        let acquires = steps
            .iter()
            .enumerate()
            .filter(|(_, step)| matches!(step, Step::AcquireImage))
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let presents = steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.is_presenting())
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let draws = steps.iter().any(|step| matches!(step, Step::Draw { .. }));

        match acquires.as_slice() {
            [] if draws || !presents.is_empty() => {
                return Err(invalid(
                    "a timeline that draws or presents must acquire an image first".into(),
                ));
            }
            [] | [0] => {}
            _ => {
                return Err(invalid(
                    "AcquireImage must be the first step and appear once".into(),
                ));
            }
        }
        match presents.as_slice() {
            [] if !acquires.is_empty() => {
                return Err(invalid("an acquired image is never presented".into()));
            }
            [] => {}
            [last] if *last + 1 == steps.len() => {}
            _ => {
                return Err(invalid(
                    "only the final step may be a presenting Submit".into(),
                ));
            }
        }

        for group in 0..layout.group_count() {
            let range = layout.steps_in(group);
            let first = &steps[range.start];
            if matches!(first, Step::AcquireImage) {
                continue;
            }

            let Step::Initialize(family) = first else {
                return Err(invalid(format!(
                    "command group {} starts with {} instead of Initialize",
                    group, first
                )));
            };
            for index in range.clone().skip(1) {
                let step = &steps[index];
                if matches!(step, Step::Initialize(_)) {
                    return Err(invalid(format!(
                        "step {} re-initializes command group {}",
                        index, group
                    )));
                }
                if step.family() != Some(*family) {
                    return Err(invalid(format!(
                        "step {} ({}) is not on {:?}, the family of command group {}",
                        index, step, family, group
                    )));
                }
                Self::validate_step(index, step)?;
            }
        }

        let last_draw_group = steps
            .iter()
            .rposition(|step| matches!(step, Step::Draw { .. }))
            .map(|index| layout.group_of(index));
        let present_group = presents.first().map(|index| layout.group_of(*index));

        Ok(Self {
            steps,
            layout,
            last_draw_group,
            present_group,
        })
    }

    fn validate_step(index: usize, step: &Step) -> anyhow::Result<()> {
        match step {
            Step::Draw { family, .. } if *family != QueueFamily::Graphics => Err(invalid(
                format!("step {} draws on {:?}; draws need the graphics lane", index, family),
            )),
            Step::Dispatch { family, .. }
                if !matches!(family, QueueFamily::Compute | QueueFamily::Graphics) =>
            {
                Err(invalid(format!(
                    "step {} dispatches on {:?}; dispatches need a compute-capable lane",
                    index, family
                )))
            }
            Step::Submit(submit)
                if submit.present
                    && !matches!(submit.family, QueueFamily::Graphics | QueueFamily::Present) =>
            {
                Err(invalid(format!(
                    "step {} presents from {:?}",
                    index, submit.family
                )))
            }
            Step::ResourceDependency(dependency)
                if dependency.is_inter_command()
                    && dependency.family != dependency.producer()
                    && dependency.family != dependency.consumer() =>
            {
                Err(invalid(format!(
                    "step {} records a {:?} -> {:?} dependency on {:?}",
                    index,
                    dependency.producer(),
                    dependency.consumer(),
                    dependency.family
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn layout(&self) -> &GroupLayout {
        &self.layout
    }

    pub fn group_count(&self) -> usize {
        self.layout.group_count()
    }

    pub fn group_families(&self) -> &[Option<QueueFamily>] {
        self.layout.group_families()
    }

    /// Validates resource references against the frame's table and builds every pipeline once.
    pub fn setup<G: Gpu>(&self, frame: &mut FrameContext<G>) -> anyhow::Result<TimelineSetup> {
        let table = frame.resources().table().clone();
        for (index, step) in self.steps.iter().enumerate() {
            for key in step.resources() {
                let descriptor = table
                    .descriptor(key)
                    .with_context(|| format!("step {} ({}) binds an unknown resource", index, step))?;
                let needs_buffer = matches!(step, Step::ResourceDependency(_) | Step::Copy(_));
                if needs_buffer && descriptor.memory == MemoryPolicy::PushConstant {
                    return Err(invalid(format!(
                        "step {} ({}) needs a buffer but {} is a push constant",
                        index, step, key
                    )));
                }
            }
        }

        let mut setup = TimelineSetup {
            pipelines: Vec::with_capacity(self.steps.len()),
        };
        for (index, step) in self.steps.iter().enumerate() {
            let factory = match step {
                Step::Draw { drawable, .. } => Some(drawable.pipeline()),
                Step::Dispatch { dispatchable, .. } => Some(dispatchable.pipeline()),
                _ => None,
            };
            let pipeline = match factory {
                Some(factory) => match frame.gpu_mut().create_pipeline(factory) {
                    Ok(pipeline) => Some(pipeline),
                    Err(e) => {
                        setup.release(frame.gpu_mut());
                        return Err(e.context(format!(
                            "failed to create pipeline for step {} ({})",
                            index, step
                        )));
                    }
                },
                None => None,
            };
            setup.pipelines.push(pipeline);
        }

        log::debug!(
            "Timeline set up: {} steps in {} command groups",
            self.steps.len(),
            self.group_count()
        );
        Ok(setup)
    }
}

/// One-time per-window state created by [`Timeline::setup`].
#[derive(Debug)]
pub struct TimelineSetup {
    pipelines: Vec<Option<Pipeline>>,
}

impl TimelineSetup {
    pub fn pipeline(&self, step: usize) -> anyhow::Result<Pipeline> {
        self.pipelines
            .get(step)
            .copied()
            .flatten()
            .with_context(|| format!("step {} has no pipeline", step))
    }

    pub fn release<G: Gpu>(&mut self, gpu: &mut G) {
        for pipeline in self.pipelines.drain(..).flatten() {
            log::trace!("Destroying timeline pipeline");
            gpu.destroy_pipeline(pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::{
        error::render_error,
        render::timeline::drawable::{BoundResource, DrawCall},
        resource::ResourceKey,
        testing::NullPipeline,
    };

    pub(crate) struct Quads(pub Vec<ResourceKey>);

    impl Drawable for Quads {
        fn name(&self) -> &str {
            "quads"
        }

        fn bindings(&self) -> &[ResourceKey] {
            &self.0
        }

        fn pipeline(&self) -> &dyn crate::render::PipelineFactory {
            &NullPipeline
        }

        fn draw_call(&self, _bound: &[BoundResource]) -> DrawCall {
            DrawCall::Vertices {
                vertex_count: 6,
                instance_count: 1,
            }
        }
    }

    fn is_invalid(result: anyhow::Result<Timeline>) -> bool {
        matches!(
            result.as_ref().err().and_then(render_error),
            Some(RenderError::InvalidTimeline(_))
        )
    }

    #[test]
    fn groups_follow_submits() {
        let timeline = Timeline::builder()
            .initialize(QueueFamily::Graphics)
            .commit_transfers(QueueFamily::Graphics)
            .submit(Submit::new(QueueFamily::Graphics))
            .initialize(QueueFamily::Present)
            .submit(Submit::new(QueueFamily::Present))
            .build()
            .unwrap();

        assert_eq!(timeline.group_count(), 2);
        assert_eq!(
            timeline.group_families(),
            &[Some(QueueFamily::Graphics), Some(QueueFamily::Present)]
        );
    }

    #[test]
    fn presenting_timeline_has_acquire_group() {
        let timeline = Timeline::builder()
            .acquire_image()
            .initialize(QueueFamily::Graphics)
            .draw(QueueFamily::Graphics, Quads(vec![]))
            .submit(Submit::new(QueueFamily::Graphics).present())
            .build()
            .unwrap();

        assert_eq!(timeline.group_families(), &[None, Some(QueueFamily::Graphics)]);
        assert_eq!(timeline.last_draw_group, Some(1));
        assert_eq!(timeline.present_group, Some(1));
    }

    #[test]
    fn structural_errors_are_rejected() {
        // draw without an image
        assert!(is_invalid(
            Timeline::builder()
                .initialize(QueueFamily::Graphics)
                .draw(QueueFamily::Graphics, Quads(vec![]))
                .submit(Submit::new(QueueFamily::Graphics))
                .build()
        ));

        // group without Initialize
        assert!(is_invalid(
            Timeline::builder()
                .commit_transfers(QueueFamily::Transfer)
                .submit(Submit::new(QueueFamily::Transfer))
                .build()
        ));

        // step on a foreign family
        assert!(is_invalid(
            Timeline::builder()
                .initialize(QueueFamily::Transfer)
                .commit_transfers(QueueFamily::Graphics)
                .submit(Submit::new(QueueFamily::Transfer))
                .build()
        ));

        // unterminated group
        assert!(is_invalid(
            Timeline::builder()
                .initialize(QueueFamily::Graphics)
                .build()
        ));

        // present is not last
        assert!(is_invalid(
            Timeline::builder()
                .acquire_image()
                .initialize(QueueFamily::Graphics)
                .submit(Submit::new(QueueFamily::Graphics).present())
                .initialize(QueueFamily::Transfer)
                .submit(Submit::new(QueueFamily::Transfer))
                .build()
        ));

        // dependency recorded on an uninvolved lane
        assert!(is_invalid(
            Timeline::builder()
                .initialize(QueueFamily::Compute)
                .dependency(ResourceDependency::new(
                    QueueFamily::Compute,
                    (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE),
                    (
                        vk::PipelineStageFlags2::VERTEX_INPUT,
                        vk::AccessFlags2::VERTEX_ATTRIBUTE_READ
                    ),
                    [ResourceKey::new(1)],
                ))
                .submit(Submit::new(QueueFamily::Compute))
                .build()
        ));
    }
}
