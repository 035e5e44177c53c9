//! Backend-neutral command recording.
//!
//! The renderer records a frame into a [`FrameRecorder`] using native ids it
//! resolved through the managers, then hands the finished
//! [`FrameRecording`] to the backend for replay. Passes are split wherever
//! the depth requirement of the bound pipeline changes, so a pipeline without
//! depth testing is always recorded into a pass with no depth attachment.

use crate::backend::NativeHandle;
use crate::types::IndexFormat;

/// One recorded command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderCommand {
    SetPipeline(NativeHandle),
    SetVertexBuffer {
        slot: u32,
        buffer: NativeHandle,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: NativeHandle,
        format: IndexFormat,
    },
    /// Bind a uniform buffer at group 0, binding 0.
    BindUniformBuffer { buffer: NativeHandle },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
    },
}

/// A render pass over the swapchain image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordedPass {
    /// Depth view attached to this pass, if any.
    pub depth_attachment: Option<NativeHandle>,
    pub commands: Vec<RenderCommand>,
}

/// Everything a backend needs to execute one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecording {
    pub image_index: u32,
    /// Applied by the first pass; later passes load.
    pub clear_color: [f32; 4],
    pub passes: Vec<RecordedPass>,
}

impl FrameRecording {
    pub fn draw_count(&self) -> usize {
        self.passes
            .iter()
            .flat_map(|pass| pass.commands.iter())
            .filter(|cmd| matches!(cmd, RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. }))
            .count()
    }
}

/// Records commands for one frame. The target image is only named at
/// [`finish`](Self::finish), so a frame can be recorded before one is acquired.
#[derive(Debug)]
pub struct FrameRecorder {
    clear_color: [f32; 4],
    depth_view: Option<NativeHandle>,
    passes: Vec<RecordedPass>,
    pipeline_bound: bool,
}

impl FrameRecorder {
    /// `depth_view` is used by passes whose pipeline tests depth.
    pub fn new(clear_color: [f32; 4], depth_view: Option<NativeHandle>) -> Self {
        Self {
            clear_color,
            depth_view,
            passes: Vec::new(),
            pipeline_bound: false,
        }
    }

    /// Bind a pipeline, opening a new pass when its depth needs differ from
    /// the current pass.
    pub fn set_pipeline(&mut self, pipeline: NativeHandle, uses_depth: bool) {
        let wanted = if uses_depth { self.depth_view } else { None };
        let reuse = self
            .passes
            .last()
            .is_some_and(|pass| pass.depth_attachment == wanted);
        if !reuse {
            self.passes.push(RecordedPass {
                depth_attachment: wanted,
                commands: Vec::new(),
            });
        }
        self.pipeline_bound = true;
        self.push(RenderCommand::SetPipeline(pipeline));
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: NativeHandle) {
        self.push(RenderCommand::SetVertexBuffer {
            slot,
            buffer,
            offset: 0,
        });
    }

    pub fn set_index_buffer(&mut self, buffer: NativeHandle, format: IndexFormat) {
        self.push(RenderCommand::SetIndexBuffer { buffer, format });
    }

    pub fn bind_uniform_buffer(&mut self, buffer: NativeHandle) {
        self.push(RenderCommand::BindUniformBuffer { buffer });
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.push(RenderCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
        });
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) {
        self.push(RenderCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index: 0,
            base_vertex: 0,
        });
    }

    pub fn has_pipeline(&self) -> bool {
        self.pipeline_bound
    }

    pub fn finish(self, image_index: u32) -> FrameRecording {
        FrameRecording {
            image_index,
            clear_color: self.clear_color,
            passes: self.passes,
        }
    }

    fn push(&mut self, command: RenderCommand) {
        if self.passes.is_empty() {
            self.passes.push(RecordedPass::default());
        }
        if let Some(pass) = self.passes.last_mut() {
            pass.commands.push(command);
        }
    }
}
