use ash::vk;
use smallvec::SmallVec;

use crate::{
    error::RenderError,
    render::{
        context::FrameContext,
        gpu::{Gpu, GpuCommand, Pipeline, SemaphoreOp, SemaphoreRef, Submission},
        queue::QueueFamily,
        sync::{signal_stages, sync_point},
        timeline::{
            Timeline, TimelineSetup,
            barrier::{BufferRange, DependencyPlan, ResourceDependency},
            drawable::{BoundResource, DrawCall},
            layouts::ImageState,
            state::TimelineState,
            step::{CopyStep, Step, Submit},
        },
    },
    resource::{MemoryPolicy, ResourceKey},
};

const DRAW_INDIRECT_STRIDE: u32 = std::mem::size_of::<vk::DrawIndirectCommand>() as u32;

type PushConstants = SmallVec<[(vk::ShaderStageFlags, u32, SmallVec<[u8; 128]>); 2]>;

/// Bindings of one draw or dispatch, resolved for the current slot.
struct Resolved {
    bound: SmallVec<[BoundResource; 4]>,
    push_constants: PushConstants,
}

impl Timeline {
    /// Runs every step once for the frame context's next frame. The first failing step aborts
    /// the rest of the frame; its error names the step.
    pub fn render<G: Gpu>(
        &self,
        setup: &TimelineSetup,
        frame: &mut FrameContext<G>,
    ) -> anyhow::Result<()> {
        #[cfg(feature = "tracing")]
        let _span = tracy_client::span!("timeline");

        let mut state = frame.begin_frame()?;
        for (index, step) in self.steps.iter().enumerate() {
            let group = self.layout.group_of(index);
            if let Err(e) = self.execute(index, step, group, setup, frame, &mut state) {
                frame.abort_frame(&state);
                return Err(e.context(format!(
                    "frame {} aborted at step {} ({})",
                    state.frame(),
                    index,
                    step
                )));
            }
        }
        frame.end_frame(&state);
        Ok(())
    }

    fn execute<G: Gpu>(
        &self,
        index: usize,
        step: &Step,
        group: usize,
        setup: &TimelineSetup,
        frame: &mut FrameContext<G>,
        state: &mut TimelineState,
    ) -> anyhow::Result<()> {
        match step {
            Step::AcquireImage => {
                let image_index = frame.acquire_image()?;
                state.image_acquired(image_index);
                Ok(())
            }
            Step::Initialize(family) => {
                if state.recording().is_some() {
                    return Err(RenderError::RecordingState {
                        step: index,
                        expected: None,
                        found: state.recording(),
                    }
                    .into());
                }
                frame.gpu_mut().begin(*family, state.slot())?;
                state.begin_recording(*family);
                Ok(())
            }
            Step::Draw { family, drawable } => {
                state.expect_recording(index, *family)?;
                let pipeline = setup.pipeline(index)?;
                let resolved = resolve(frame, drawable.bindings())?;
                let call = drawable.draw_call(&resolved.bound);
                let Some(command) = draw_command(index, call, &resolved.bound)? else {
                    return Ok(());
                };

                begin_rendering(index, *family, frame, state)?;
                let gpu = frame.gpu_mut();
                let slot = state.slot();
                gpu.record(*family, slot, &GpuCommand::BindPipeline(pipeline))?;
                bind_resources(gpu, *family, slot, pipeline, &resolved)?;
                gpu.record(*family, slot, &command)
            }
            Step::Dispatch {
                family,
                dispatchable,
            } => {
                state.expect_recording(index, *family)?;
                end_rendering(*family, frame, state)?;
                let pipeline = setup.pipeline(index)?;
                let resolved = resolve(frame, dispatchable.bindings())?;
                let groups = dispatchable.workgroups(&resolved.bound);
                if groups.contains(&0) {
                    return Ok(());
                }

                let gpu = frame.gpu_mut();
                let slot = state.slot();
                gpu.record(*family, slot, &GpuCommand::BindPipeline(pipeline))?;
                bind_resources(gpu, *family, slot, pipeline, &resolved)?;
                gpu.record(*family, slot, &GpuCommand::Dispatch { groups })
            }
            Step::ResourceDependency(dependency) => {
                state.expect_recording(index, dependency.family)?;
                end_rendering(dependency.family, frame, state)?;
                record_dependency(dependency, frame, state)
            }
            Step::CommitTransfers(family) => {
                state.expect_recording(index, *family)?;
                end_rendering(*family, frame, state)?;
                let batches = frame.commit_transfers()?;
                for batch in batches {
                    state.note_transfer(batch.dst);
                    frame
                        .gpu_mut()
                        .record(*family, state.slot(), &GpuCommand::CopyBuffer(batch))?;
                }
                Ok(())
            }
            Step::Copy(copy) => {
                state.expect_recording(index, copy.family)?;
                end_rendering(copy.family, frame, state)?;
                record_copy(copy, frame, state)
            }
            Step::Submit(submit) => {
                state.expect_recording(index, submit.family)?;
                self.submit(index, group, submit, frame, state)
            }
        }
    }

    fn submit<G: Gpu>(
        &self,
        index: usize,
        group: usize,
        submit: &Submit,
        frame: &mut FrameContext<G>,
        state: &mut TimelineState,
    ) -> anyhow::Result<()> {
        end_rendering(submit.family, frame, state)?;

        let families = frame.queue_families();
        let draw_family = QueueFamily::Graphics;
        // Presentation runs on the present lane's queue, which owns the image from then on.
        let release_to_present = self.present_group.is_some()
            && families.is_cross_family(draw_family, QueueFamily::Present);
        let queues = (
            families.index(draw_family),
            families.index(QueueFamily::Present),
        );

        if Some(group) == self.last_draw_group {
            let released = state.image_state();
            if !release_to_present {
                let queues = (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED);
                transition(submit.family, ImageState::PRESENT, queues, frame, state, index)?;
            } else if released != ImageState::UNDEFINED {
                transition(submit.family, ImageState::PRESENT, queues, frame, state, index)?;
                state.set_pending_release(released.layout);
            }
        }

        // a group on another lane presenting for a dedicated present family hands the image over
        // in a present-lane submission of its own
        let hand_off =
            submit.present && submit.family != QueueFamily::Present && release_to_present;
        let image_index = if submit.present {
            let image_index = state.require_image(index)?;
            if !hand_off {
                prepare_present(submit.family, queues, frame, state, index)?;
            }
            Some(image_index)
        } else {
            None
        };

        let slot = state.slot();
        frame.gpu_mut().end(submit.family, slot)?;
        state.end_recording();
        let stages = (submit.wait_for, submit.signal_at);
        let finishes = image_index.filter(|_| !hand_off);
        submit_group(submit.family, stages, finishes, frame, state)?;

        let Some(image_index) = image_index else {
            return Ok(());
        };
        if hand_off {
            let lane = QueueFamily::Present;
            frame.gpu_mut().begin(lane, slot)?;
            state.begin_recording(lane);
            prepare_present(lane, queues, frame, state, index)?;
            frame.gpu_mut().end(lane, slot)?;
            state.end_recording();
            let stages = (
                vk::PipelineStageFlags2::empty(),
                vk::PipelineStageFlags2::empty(),
            );
            submit_group(lane, stages, Some(image_index), frame, state)?;
        }

        frame.present(slot, image_index)?;
        state.mark_presented();
        Ok(())
    }
}

/// Leaves the image in the present layout on `family`: either the first transition of an image
/// nothing rendered to, or the acquire half of the release made by the last draw group.
fn prepare_present<G: Gpu>(
    family: QueueFamily,
    queues: (u32, u32),
    frame: &mut FrameContext<G>,
    state: &mut TimelineState,
    index: usize,
) -> anyhow::Result<()> {
    let image_index = state.require_image(index)?;
    if state.image_state() == ImageState::UNDEFINED {
        let ignored = (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED);
        return transition(family, ImageState::PRESENT, ignored, frame, state, index);
    }
    let Some(layout) = state.take_pending_release() else {
        return Ok(());
    };
    let released = ImageState {
        layout,
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    frame.gpu_mut().record(
        family,
        state.slot(),
        &GpuCommand::TransitionImage {
            image_index,
            from: released,
            to: ImageState::PRESENT,
            src_queue_family: queues.0,
            dst_queue_family: queues.1,
        },
    )
}

/// Submits the lane's finished command buffer with the waits and signals of its group.
/// `finishes` names the image whose render-finished semaphore the submission signals.
fn submit_group<G: Gpu>(
    family: QueueFamily,
    (wait_for, signal_at): (vk::PipelineStageFlags2, vk::PipelineStageFlags2),
    finishes: Option<u32>,
    frame: &mut FrameContext<G>,
    state: &mut TimelineState,
) -> anyhow::Result<()> {
    let slot = state.slot();
    let waits = state.waits(wait_for, finishes.is_some());
    let mut signals = signal_stages(signal_at)
        .into_iter()
        .map(|stage| {
            let point = sync_point(family, slot, stage);
            SemaphoreOp {
                semaphore: SemaphoreRef::Timeline(point),
                value: frame.counters().next(point),
                stage,
            }
        })
        .collect::<SmallVec<[SemaphoreOp; 4]>>();
    if let Some(image_index) = finishes {
        signals.push(SemaphoreOp {
            semaphore: SemaphoreRef::RenderFinished { image_index },
            value: 0,
            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        });
    }

    let submission = Submission {
        family,
        slot,
        waits,
        signals,
    };
    frame.submit(&submission)?;
    state.record_submission(&submission);
    Ok(())
}

fn resolve<G: Gpu>(frame: &FrameContext<G>, keys: &[ResourceKey]) -> anyhow::Result<Resolved> {
    let mut resolved = Resolved {
        bound: SmallVec::new(),
        push_constants: SmallVec::new(),
    };
    let mut push_offset = 0u32;
    for key in keys {
        let segment = frame.segment(*key)?;
        if segment.is_push_constant() {
            let bytes = segment.data()?;
            if !bytes.is_empty() {
                resolved.push_constants.push((
                    segment.descriptor().visibility,
                    push_offset,
                    SmallVec::from_slice(bytes),
                ));
            }
            push_offset += segment.capacity() as u32;
        }
        resolved.bound.push(BoundResource::from_segment(&segment));
    }
    Ok(resolved)
}

fn bind_resources<G: Gpu>(
    gpu: &mut G,
    family: QueueFamily,
    slot: usize,
    pipeline: Pipeline,
    resolved: &Resolved,
) -> anyhow::Result<()> {
    for (stages, offset, bytes) in &resolved.push_constants {
        gpu.record(
            family,
            slot,
            &GpuCommand::PushConstants {
                layout: pipeline.layout,
                stages: *stages,
                offset: *offset,
                bytes: bytes.clone(),
            },
        )?;
    }

    if pipeline.bind_point != vk::PipelineBindPoint::GRAPHICS {
        return Ok(());
    }

    let buffers = resolved
        .bound
        .iter()
        .filter(|bound| bound.memory != MemoryPolicy::PushConstant);
    let mut binding = 0;
    let mut index_bound = false;
    for bound in buffers {
        if bound.usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
            gpu.record(
                family,
                slot,
                &GpuCommand::BindVertexBuffer {
                    binding,
                    buffer: bound.buffer,
                    offset: bound.offset,
                },
            )?;
            binding += 1;
        } else if bound.usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) && !index_bound {
            gpu.record(
                family,
                slot,
                &GpuCommand::BindIndexBuffer {
                    buffer: bound.buffer,
                    offset: bound.offset,
                    index_type: vk::IndexType::UINT32,
                },
            )?;
            index_bound = true;
        }
    }
    Ok(())
}

fn draw_command(
    index: usize,
    call: DrawCall,
    bound: &[BoundResource],
) -> anyhow::Result<Option<GpuCommand>> {
    Ok(Some(match call {
        DrawCall::Vertices {
            vertex_count,
            instance_count,
        } => GpuCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        },
        DrawCall::Indexed {
            index_count,
            instance_count,
        } => GpuCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        },
        DrawCall::Indirect { draw_count } => {
            let commands = bound
                .iter()
                .find(|b| b.usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER))
                .ok_or_else(|| {
                    RenderError::InvalidTimeline(format!(
                        "step {} draws indirectly without an indirect buffer binding",
                        index
                    ))
                })?;
            GpuCommand::DrawIndirect {
                buffer: commands.buffer,
                offset: commands.offset,
                draw_count,
                stride: DRAW_INDIRECT_STRIDE,
            }
        }
        DrawCall::Skip => return Ok(None),
    }))
}

fn transition<G: Gpu>(
    family: QueueFamily,
    to: ImageState,
    queues: (u32, u32),
    frame: &mut FrameContext<G>,
    state: &mut TimelineState,
    index: usize,
) -> anyhow::Result<()> {
    let image_index = state.require_image(index)?;
    let from = state.image_state();
    if from == to {
        return Ok(());
    }
    frame.gpu_mut().record(
        family,
        state.slot(),
        &GpuCommand::TransitionImage {
            image_index,
            from,
            to,
            src_queue_family: queues.0,
            dst_queue_family: queues.1,
        },
    )?;
    state.set_image_state(to);
    Ok(())
}

fn begin_rendering<G: Gpu>(
    index: usize,
    family: QueueFamily,
    frame: &mut FrameContext<G>,
    state: &mut TimelineState,
) -> anyhow::Result<()> {
    if state.rendering() {
        return Ok(());
    }
    let image_index = state.require_image(index)?;
    let clear = (state.image_state() == ImageState::UNDEFINED).then(|| frame.clear_color());
    transition(
        family,
        ImageState::COLOR_ATTACHMENT_WRITE,
        (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
        frame,
        state,
        index,
    )?;
    frame.gpu_mut().record(
        family,
        state.slot(),
        &GpuCommand::BeginRendering { image_index, clear },
    )?;
    state.set_rendering(true);
    Ok(())
}

fn end_rendering<G: Gpu>(
    family: QueueFamily,
    frame: &mut FrameContext<G>,
    state: &mut TimelineState,
) -> anyhow::Result<()> {
    if state.rendering() {
        frame
            .gpu_mut()
            .record(family, state.slot(), &GpuCommand::EndRendering)?;
        state.set_rendering(false);
    }
    Ok(())
}

fn record_dependency<G: Gpu>(
    dependency: &ResourceDependency,
    frame: &mut FrameContext<G>,
    state: &TimelineState,
) -> anyhow::Result<()> {
    let families = frame.queue_families();
    // The transfer lane only writes through copies; buffers it did not copy into this frame
    // keep their current owner and need no release/acquire pair.
    let copies_only = dependency.producer() == QueueFamily::Transfer
        && matches!(
            dependency.plan(&families),
            DependencyPlan::OwnershipTransfer { .. }
        );
    let mut ranges = SmallVec::<[BufferRange; 4]>::new();
    for key in &dependency.keys {
        let segment = frame.segment(*key)?;
        if copies_only && !state.was_transferred(segment.buffer()) {
            continue;
        }
        ranges.push(BufferRange {
            buffer: segment.buffer(),
            offset: segment.offset(),
            size: segment.capacity(),
        });
    }
    if ranges.is_empty() {
        return Ok(());
    }

    let batch = dependency.barriers(&families, &ranges);
    if batch.is_empty() {
        return Ok(());
    }
    frame
        .gpu_mut()
        .record(dependency.family, state.slot(), &GpuCommand::Barrier(batch))
}

fn record_copy<G: Gpu>(
    copy: &CopyStep,
    frame: &mut FrameContext<G>,
    state: &mut TimelineState,
) -> anyhow::Result<()> {
    let batch = frame.copy(
        copy.src,
        copy.dst,
        copy.size,
        (copy.src_offset, copy.dst_offset),
    )?;
    state.note_transfer(batch.dst);
    frame
        .gpu_mut()
        .record(copy.family, state.slot(), &GpuCommand::CopyBuffer(batch))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        error::render_error,
        render::{
            AcquireOutcome, FrameConfig, PipelineFactory, QueueFamilies,
            timeline::{Drawable, tests::Quads},
        },
        resource::{ResourceDescriptor, ResourceTable},
        testing::{NullPipeline, ScriptedGpu},
    };

    const VIEW: ResourceKey = ResourceKey::new(1);
    const VERTICES: ResourceKey = ResourceKey::new(2);
    const MESH: ResourceKey = ResourceKey::new(3);

    /// Graphics and compute share family 0; transfer and present are dedicated.
    const SPLIT: QueueFamilies = QueueFamilies {
        graphics: 0,
        compute: 0,
        transfer: 1,
        present: 2,
    };

    struct Nothing;

    impl Drawable for Nothing {
        fn name(&self) -> &str {
            "nothing"
        }

        fn bindings(&self) -> &[ResourceKey] {
            &[]
        }

        fn pipeline(&self) -> &dyn PipelineFactory {
            &NullPipeline
        }

        fn draw_call(&self, _bound: &[BoundResource]) -> DrawCall {
            DrawCall::Skip
        }
    }

    fn frame(gpu: ScriptedGpu) -> FrameContext<ScriptedGpu> {
        let table = ResourceTable::builder()
            .declare(
                VIEW,
                ResourceDescriptor::push_constant(8, vk::ShaderStageFlags::VERTEX),
            )
            .declare(
                VERTICES,
                ResourceDescriptor::shared(vk::BufferUsageFlags::VERTEX_BUFFER, 64).multi(),
            )
            .declare(
                MESH,
                ResourceDescriptor::gpu_local(vk::BufferUsageFlags::VERTEX_BUFFER, 64).single(),
            )
            .build()
            .unwrap();
        FrameContext::new(gpu, Arc::new(table), FrameConfig::default()).unwrap()
    }

    fn kinds(commands: &[&GpuCommand]) -> Vec<&'static str> {
        commands
            .iter()
            .map(|command| match command {
                GpuCommand::Barrier(_) => "barrier",
                GpuCommand::TransitionImage { .. } => "transition",
                GpuCommand::CopyBuffer(_) => "copy",
                GpuCommand::BeginRendering { .. } => "begin_rendering",
                GpuCommand::EndRendering => "end_rendering",
                GpuCommand::BindPipeline(_) => "bind_pipeline",
                GpuCommand::BindVertexBuffer { .. } => "bind_vertices",
                GpuCommand::BindIndexBuffer { .. } => "bind_indices",
                GpuCommand::PushConstants { .. } => "push_constants",
                GpuCommand::Draw { .. } => "draw",
                GpuCommand::DrawIndexed { .. } => "draw_indexed",
                GpuCommand::DrawIndirect { .. } => "draw_indirect",
                GpuCommand::Dispatch { .. } => "dispatch",
            })
            .collect()
    }

    fn present_on_graphics() -> Timeline {
        Timeline::builder()
            .acquire_image()
            .initialize(QueueFamily::Graphics)
            .commit_transfers(QueueFamily::Graphics)
            .draw(QueueFamily::Graphics, Quads(vec![VIEW, VERTICES]))
            .submit(
                Submit::new(QueueFamily::Graphics)
                    .wait_for(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                    .present(),
            )
            .build()
            .unwrap()
    }

    /// Upload `MESH` on the transfer lane, draw on graphics, present from `present_family`.
    fn upload_then_draw(present_family: QueueFamily) -> Timeline {
        let dependency = |family| {
            ResourceDependency::new(
                family,
                (
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                ),
                (
                    vk::PipelineStageFlags2::VERTEX_INPUT,
                    vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
                ),
                [MESH],
            )
        };
        let mut builder = Timeline::builder()
            .acquire_image()
            .initialize(QueueFamily::Transfer)
            .commit_transfers(QueueFamily::Transfer)
            .dependency(dependency(QueueFamily::Transfer))
            .submit(Submit::new(QueueFamily::Transfer).signal_at(vk::PipelineStageFlags2::TRANSFER))
            .initialize(QueueFamily::Graphics)
            .dependency(dependency(QueueFamily::Graphics))
            .draw(QueueFamily::Graphics, Quads(vec![MESH]));
        let draw_submit = Submit::new(QueueFamily::Graphics)
            .wait_for(vk::PipelineStageFlags2::VERTEX_INPUT);
        if present_family == QueueFamily::Graphics {
            builder = builder.submit(draw_submit.present());
        } else {
            builder = builder
                .submit(draw_submit)
                .initialize(present_family)
                .submit(Submit::new(present_family).present());
        }
        builder.build().unwrap()
    }

    fn render(timeline: &Timeline, frame: &mut FrameContext<ScriptedGpu>) -> anyhow::Result<()> {
        let setup = timeline.setup(frame)?;
        timeline.render(&setup, frame)
    }

    #[test]
    fn frame_records_draw_and_presents() {
        let mut frame = frame(ScriptedGpu::unified());
        frame
            .segment_mut(VIEW)
            .unwrap()
            .write(0, &[640.0f32, 480.0])
            .unwrap();
        render(&present_on_graphics(), &mut frame).unwrap();

        let gpu = frame.gpu();
        assert_eq!(
            kinds(&gpu.commands_on(QueueFamily::Graphics)),
            vec![
                "transition",
                "begin_rendering",
                "bind_pipeline",
                "push_constants",
                "bind_vertices",
                "draw",
                "end_rendering",
                "transition",
            ]
        );
        match gpu.commands_on(QueueFamily::Graphics)[1] {
            GpuCommand::BeginRendering { image_index, clear } => {
                assert_eq!(*image_index, 0);
                assert!(clear.is_some());
            }
            other => panic!("expected BeginRendering, found {:?}", other),
        }

        assert_eq!(gpu.submissions.len(), 1);
        let submission = &gpu.submissions[0];
        assert!(
            submission
                .waits
                .iter()
                .any(|op| op.semaphore == SemaphoreRef::ImageAcquired { slot: 0 })
        );
        assert!(
            submission
                .signals
                .iter()
                .any(|op| op.semaphore == SemaphoreRef::RenderFinished { image_index: 0 })
        );
        assert_eq!(gpu.presents, vec![(0, 0)]);
        assert_eq!(frame.frame_count(), 1);
    }

    #[test]
    fn same_family_lanes_record_one_consumer_barrier() {
        let mut frame = frame(ScriptedGpu::unified());
        render(&upload_then_draw(QueueFamily::Graphics), &mut frame).unwrap();

        let gpu = frame.gpu();
        assert!(gpu.commands_on(QueueFamily::Transfer).is_empty());
        let graphics = gpu.commands_on(QueueFamily::Graphics);
        let GpuCommand::Barrier(batch) = graphics[0] else {
            panic!("expected a barrier first, found {:?}", graphics[0]);
        };
        assert_eq!(batch.buffers.len(), 1);
        assert_eq!(batch.buffers[0].src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);

        let [transfer, draw] = gpu.submissions.as_slice() else {
            panic!("expected two submissions");
        };
        assert!(transfer.waits.is_empty());
        // the upload group's TRANSFER signal covers the vertex fetch, then the acquire
        let [upload, acquire] = draw.waits.as_slice() else {
            panic!("expected two waits, found {:?}", draw.waits);
        };
        match upload.semaphore {
            SemaphoreRef::Timeline(point) => {
                assert_eq!(point.family, QueueFamily::Transfer);
                assert_eq!(point.stage, vk::PipelineStageFlags2::TRANSFER);
            }
            other => panic!("expected a timeline wait, found {:?}", other),
        }
        assert_eq!(upload.stage, vk::PipelineStageFlags2::VERTEX_INPUT);
        assert_eq!(acquire.semaphore, SemaphoreRef::ImageAcquired { slot: 0 });
    }

    fn stage_mesh(frame: &mut FrameContext<ScriptedGpu>) {
        frame
            .segment_mut(MESH)
            .unwrap()
            .extend_from_slice(&[0.5f32; 8])
            .unwrap();
    }

    fn finishes_image(submission: &Submission) -> bool {
        submission
            .signals
            .iter()
            .any(|op| matches!(op.semaphore, SemaphoreRef::RenderFinished { .. }))
    }

    #[test]
    fn dedicated_families_transfer_ownership() {
        // presenting from its own lane, and from the graphics group itself
        for present_family in [QueueFamily::Present, QueueFamily::Graphics] {
            let mut frame = frame(ScriptedGpu::new(SPLIT));
            stage_mesh(&mut frame);
            render(&upload_then_draw(present_family), &mut frame).unwrap();
            let gpu = frame.gpu();

            let transfer = gpu.commands_on(QueueFamily::Transfer);
            assert_eq!(kinds(&transfer), vec!["copy", "barrier"]);
            let GpuCommand::Barrier(release) = transfer[1] else {
                panic!("expected the release half, found {:?}", transfer[1]);
            };
            assert_eq!(release.buffers[0].src_queue_family_index, 1);
            assert_eq!(release.buffers[0].dst_queue_family_index, 0);

            let graphics = gpu.commands_on(QueueFamily::Graphics);
            let GpuCommand::Barrier(acquire) = graphics[0] else {
                panic!("expected the acquire half, found {:?}", graphics[0]);
            };
            assert_eq!(acquire.buffers[0].src_queue_family_index, 1);
            match graphics.last() {
                Some(GpuCommand::TransitionImage {
                    to,
                    src_queue_family,
                    dst_queue_family,
                    ..
                }) => {
                    assert_eq!(*to, ImageState::PRESENT);
                    assert_eq!((*src_queue_family, *dst_queue_family), (0, 2));
                }
                other => panic!("expected the image release, found {:?}", other),
            }

            let present = gpu.commands_on(QueueFamily::Present);
            match present.as_slice() {
                [GpuCommand::TransitionImage { from, to, src_queue_family, dst_queue_family, .. }] => {
                    assert_eq!(from.layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
                    assert_eq!(*to, ImageState::PRESENT);
                    assert_eq!((*src_queue_family, *dst_queue_family), (0, 2));
                }
                other => panic!("expected the image acquire, found {:?}", other),
            }

            let [_, draw, hand_off] = gpu.submissions.as_slice() else {
                panic!("expected three submissions, found {:?}", gpu.submissions);
            };
            assert!(!finishes_image(draw));
            assert_eq!(hand_off.family, QueueFamily::Present);
            assert!(finishes_image(hand_off));
            assert_eq!(gpu.presents, vec![(0, 0)]);
        }
    }

    #[test]
    fn unchanged_uploads_skip_the_ownership_transfer() {
        let mut frame = frame(ScriptedGpu::new(SPLIT));
        stage_mesh(&mut frame);
        let timeline = upload_then_draw(QueueFamily::Present);
        let setup = timeline.setup(&mut frame).unwrap();
        timeline.render(&setup, &mut frame).unwrap();
        timeline.render(&setup, &mut frame).unwrap();

        let gpu = frame.gpu();
        let on_second_frame = |family: QueueFamily| {
            gpu.commands
                .iter()
                .filter(|(f, slot, _)| *f == family && *slot == 1)
                .map(|(_, _, command)| command)
                .collect::<Vec<_>>()
        };
        assert!(on_second_frame(QueueFamily::Transfer).is_empty());
        assert!(
            !kinds(&on_second_frame(QueueFamily::Graphics)).contains(&"barrier"),
            "the graphics lane already owns the mesh"
        );
        assert_eq!(kinds(&gpu.commands_on(QueueFamily::Transfer)), vec!["copy", "barrier"]);
        assert_eq!(gpu.presents.len(), 2);
    }

    #[test]
    fn skipped_draws_still_present_a_defined_image() {
        let timeline = Timeline::builder()
            .acquire_image()
            .initialize(QueueFamily::Graphics)
            .draw(QueueFamily::Graphics, Nothing)
            .submit(Submit::new(QueueFamily::Graphics).present())
            .build()
            .unwrap();
        let mut frame = frame(ScriptedGpu::unified());
        render(&timeline, &mut frame).unwrap();

        let graphics = frame.gpu().commands_on(QueueFamily::Graphics);
        match graphics.as_slice() {
            [GpuCommand::TransitionImage { from, to, .. }] => {
                assert_eq!(*from, ImageState::UNDEFINED);
                assert_eq!(*to, ImageState::PRESENT);
            }
            other => panic!("expected one transition, found {:?}", other),
        }
        assert_eq!(frame.gpu().presents.len(), 1);
    }

    #[test]
    fn failed_submit_aborts_and_discards_the_acquire() {
        let mut gpu = ScriptedGpu::unified();
        gpu.fail_submit = Some(QueueFamily::Graphics);
        let mut frame = frame(gpu);

        let err = render(&present_on_graphics(), &mut frame).unwrap_err();
        assert!(matches!(render_error(&err), Some(RenderError::DeviceLost)));
        assert!(format!("{:#}", err).contains("aborted at step 4"));
        assert_eq!(frame.gpu().discarded_acquires, 1);
        assert!(frame.gpu().presents.is_empty());
        assert!(frame.is_surface_stale());
        assert_eq!(frame.frame_count(), 1);

        frame.gpu_mut().fail_submit = None;
        render(&present_on_graphics(), &mut frame).unwrap();
        assert_eq!(frame.gpu().rebuilds, 1);
        assert_eq!(frame.gpu().presents.len(), 1);
    }

    #[test]
    fn suboptimal_acquire_rebuilds_within_the_frame() {
        let mut gpu = ScriptedGpu::unified();
        gpu.acquire_script.extend([
            AcquireOutcome::Acquired {
                image_index: 2,
                suboptimal: true,
            },
            AcquireOutcome::Acquired {
                image_index: 1,
                suboptimal: false,
            },
        ]);
        let mut frame = frame(gpu);
        render(&present_on_graphics(), &mut frame).unwrap();

        let gpu = frame.gpu();
        assert_eq!(gpu.rebuilds, 1);
        assert_eq!(gpu.discarded_acquires, 1);
        assert_eq!(gpu.presents, vec![(0, 1)]);
    }

    #[test]
    fn later_frames_wait_on_their_slot() {
        let mut frame = frame(ScriptedGpu::unified());
        let timeline = present_on_graphics();
        let setup = timeline.setup(&mut frame).unwrap();
        for _ in 0..3 {
            timeline.render(&setup, &mut frame).unwrap();
        }

        let waits = &frame.gpu().slot_waits;
        assert_eq!(waits.len(), 3);
        assert!(waits[0].1.is_empty());
        assert!(waits[1].1.is_empty());
        // third frame reuses slot 0 and waits for the first frame's completion signal
        assert_eq!(waits[2].0, 0);
        assert_eq!(waits[2].1.len(), 1);
        assert_eq!(waits[2].1[0].1, 1);
    }
}
