//! Record of everything the headless backend executed.

use crate::backend::traits::*;

/// Kind of pass a trace event happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Render,
    Compute,
}

/// How a draw was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawKind {
    Direct,
    Indexed,
    /// Replayed from an indirect buffer; `slot` is the command index in that buffer
    Indirect { buffer: BufferHandle, slot: u32 },
}

/// A draw as the accelerator saw it at execution time
#[derive(Debug, Clone)]
pub struct DrawRecord {
    pub submission: SubmissionId,
    pub pass: String,
    pub program: String,
    pub kind: DrawKind,
    /// Index count for indexed draws, vertex count otherwise
    pub element_count: u32,
    pub first_element: u32,
    pub base_vertex: i32,
    pub instance_count: u32,
    pub first_instance: u32,
    pub vertex_buffer: Option<BufferHandle>,
    pub index_buffer: Option<BufferHandle>,
    /// Index values fetched through the bound offset and format; empty for direct draws
    pub indices: Vec<u32>,
    pub stencil_reference: u32,
    /// Bytes of every bound uniform buffer when the draw executed
    pub uniforms: Vec<(BufferHandle, Vec<u8>)>,
    /// Every sampled texture with the submission that last rendered into it
    pub sampled_textures: Vec<(TextureHandle, Option<SubmissionId>)>,
}

impl DrawRecord {
    /// Triangles rasterized, assuming a triangle list.
    pub fn triangle_count(&self) -> u64 {
        (self.element_count / 3) as u64 * self.instance_count as u64
    }
}

/// One executed command of interest
#[derive(Debug, Clone)]
pub enum TraceEvent {
    BeginPass {
        submission: SubmissionId,
        label: String,
        kind: PassKind,
        color_targets: Vec<TextureHandle>,
        depth_target: Option<TextureHandle>,
    },
    Draw(DrawRecord),
    Dispatch {
        submission: SubmissionId,
        program: String,
        workgroups: [u32; 3],
    },
    CopyBuffer {
        submission: SubmissionId,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    },
    CopyTexture {
        submission: SubmissionId,
        src: TextureHandle,
        dst: TextureHandle,
    },
    Barrier {
        submission: SubmissionId,
        barrier: ResourceBarrier,
    },
}

impl TraceEvent {
    pub fn submission(&self) -> SubmissionId {
        match self {
            TraceEvent::BeginPass { submission, .. }
            | TraceEvent::Dispatch { submission, .. }
            | TraceEvent::CopyBuffer { submission, .. }
            | TraceEvent::CopyTexture { submission, .. }
            | TraceEvent::Barrier { submission, .. } => *submission,
            TraceEvent::Draw(draw) => draw.submission,
        }
    }
}

/// Executed work, in execution order
#[derive(Debug, Default)]
pub struct ExecutionTrace {
    events: Vec<TraceEvent>,
}

impl ExecutionTrace {
    pub(crate) fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawRecord> {
        self.events.iter().filter_map(|e| match e {
            TraceEvent::Draw(draw) => Some(draw),
            _ => None,
        })
    }

    /// Draws executed inside the pass with this label
    pub fn draws_in<'a>(&'a self, pass: &'a str) -> impl Iterator<Item = &'a DrawRecord> {
        self.draws().filter(move |d| d.pass == pass)
    }

    /// Labels of passes in execution order for one submission
    pub fn pass_labels(&self, submission: SubmissionId) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::BeginPass {
                    submission: s,
                    label,
                    ..
                } if *s == submission => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Submissions that executed at least one event, in execution order
    pub fn submissions(&self) -> Vec<SubmissionId> {
        let mut seen: Vec<SubmissionId> = Vec::new();
        for event in &self.events {
            let id = event.submission();
            if seen.last() != Some(&id) && !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }
}
