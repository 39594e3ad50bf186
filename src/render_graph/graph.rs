//! Render graph definition and compilation

use crate::backend::types::*;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Render graph has a dependency cycle through {0:?}")]
    Cycle(Vec<String>),

    #[error("Pass '{pass}' uses unknown resource {resource:?}")]
    UnknownResource { pass: String, resource: ResourceId },
}

/// The main render graph structure
pub struct RenderGraph {
    passes: Vec<Box<dyn RenderPass>>,
    pass_nodes: Vec<PassNode>,
    resources: Vec<VirtualResource>,
    next_pass_id: u32,
    next_resource_id: u32,
    screen_width: u32,
    screen_height: u32,

    /// External resources (like the presentable surface)
    external_resources: HashMap<String, ResourceId>,
}

impl RenderGraph {
    pub fn new(screen_width: u32, screen_height: u32) -> Self {
        Self {
            passes: Vec::new(),
            pass_nodes: Vec::new(),
            resources: Vec::new(),
            next_pass_id: 0,
            next_resource_id: 0,
            screen_width,
            screen_height,
            external_resources: HashMap::new(),
        }
    }

    fn alloc_resource_id(&mut self) -> ResourceId {
        let id = ResourceId(self.next_resource_id);
        self.next_resource_id += 1;
        id
    }

    pub fn screen_size(&self) -> (u32, u32) {
        (self.screen_width, self.screen_height)
    }

    /// Create a texture shared between passes
    pub fn create_texture(
        &mut self,
        name: &str,
        size: TextureSize,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> ResourceId {
        let id = self.alloc_resource_id();
        let (width, height) = size.resolve(self.screen_width, self.screen_height);
        self.resources.push(VirtualResource::Texture(VirtualTexture {
            id,
            desc: TextureDescriptor {
                label: Some(name.to_string()),
                width,
                height,
                format,
                usage,
                ..Default::default()
            },
            size,
            name: name.to_string(),
        }));
        id
    }

    /// Create a transient buffer shared between passes
    pub fn create_buffer(&mut self, name: &str, desc: BufferDescriptor) -> ResourceId {
        let id = self.alloc_resource_id();
        self.resources.push(VirtualResource::Buffer(VirtualBuffer {
            id,
            desc,
            name: name.to_string(),
        }));
        id
    }

    /// Declare a buffer owned outside the graph
    pub fn import_buffer(&mut self, name: &str) -> ResourceId {
        let id = self.alloc_resource_id();
        self.resources.push(VirtualResource::ImportedBuffer {
            id,
            name: name.to_string(),
        });
        id
    }

    /// Declare a texture heap owned outside the graph
    pub fn import_heap(&mut self, name: &str) -> ResourceId {
        let id = self.alloc_resource_id();
        self.resources.push(VirtualResource::Heap {
            id,
            name: name.to_string(),
        });
        id
    }

    /// Register an external resource (like the presentable surface)
    pub fn register_external(&mut self, name: &str) -> ResourceId {
        let id = self.alloc_resource_id();
        self.resources.push(VirtualResource::External {
            id,
            name: name.to_string(),
        });
        self.external_resources.insert(name.to_string(), id);
        id
    }

    /// Get external resource by name
    pub fn get_external(&self, name: &str) -> Option<ResourceId> {
        self.external_resources.get(name).copied()
    }

    /// Add a render pass to the graph
    pub fn add_pass<P: RenderPass + 'static>(&mut self, pass: P, pass_type: PassType) -> PassId {
        let id = PassId(self.next_pass_id);
        self.next_pass_id += 1;

        let name = pass.name().to_string();
        let mut boxed_pass = Box::new(pass);

        // Setup the pass
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        {
            let mut ctx = PassSetupContext {
                resources: &mut self.resources,
                inputs: &mut inputs,
                outputs: &mut outputs,
                next_resource_id: &mut self.next_resource_id,
                screen_width: self.screen_width,
                screen_height: self.screen_height,
            };
            boxed_pass.setup(&mut ctx);
        }

        log::debug!(
            "Render graph: added {:?} pass '{}' ({} reads, {} writes)",
            pass_type,
            name,
            inputs.len(),
            outputs.len()
        );

        self.passes.push(boxed_pass);
        self.pass_nodes.push(PassNode {
            id,
            name,
            pass_type,
            inputs,
            outputs,
        });

        id
    }

    /// Compile the graph: dependency order, resource lifetimes and barriers.
    ///
    /// A pass depends on every pass that writes a resource it reads, and on earlier
    /// passes writing a resource it also writes. Independent passes keep insertion order.
    pub fn compile(&self) -> Result<CompiledGraph, GraphError> {
        let known: std::collections::HashSet<ResourceId> =
            self.resources.iter().map(|r| r.id()).collect();
        for node in &self.pass_nodes {
            if let Some(access) = node.accesses().find(|a| !known.contains(&a.resource)) {
                return Err(GraphError::UnknownResource {
                    pass: node.name.clone(),
                    resource: access.resource,
                });
            }
        }

        let count = self.pass_nodes.len();
        let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        for (reader_index, reader) in self.pass_nodes.iter().enumerate() {
            for (writer_index, writer) in self.pass_nodes.iter().enumerate() {
                if reader_index == writer_index {
                    continue;
                }
                let read_after_write = reader
                    .inputs
                    .iter()
                    .any(|input| writer.writes_resource(input.resource));
                let write_after_write = writer_index < reader_index
                    && reader
                        .outputs
                        .iter()
                        .any(|output| writer.writes_resource(output.resource));
                if read_after_write || write_after_write {
                    dependencies[reader_index].insert(writer_index);
                }
            }
        }

        // Kahn's algorithm, always taking the earliest-inserted ready pass
        let mut in_degree: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(count);

        while let Some(index) = ready.pop_first() {
            sorted.push(index);
            for (dependent, deps) in dependencies.iter().enumerate() {
                if deps.contains(&index) {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if sorted.len() != count {
            let stuck = (0..count)
                .filter(|i| !sorted.contains(i))
                .map(|i| self.pass_nodes[i].name.clone())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }

        // Determine resource lifetimes and barriers
        let mut resource_lifetimes: HashMap<ResourceId, ResourceLifetime> = HashMap::new();
        let mut last_usage: HashMap<ResourceId, ResourceUsage> = HashMap::new();
        let mut barriers: HashMap<PassId, Vec<PlannedBarrier>> = HashMap::new();

        for (order, &index) in sorted.iter().enumerate() {
            let node = &self.pass_nodes[index];
            let mut pass_barriers = Vec::new();

            for access in node.accesses() {
                let lifetime = resource_lifetimes
                    .entry(access.resource)
                    .or_insert(ResourceLifetime {
                        first_use: order,
                        last_use: order,
                    });
                lifetime.last_use = order;

                if let Some(previous) = last_usage.insert(access.resource, access.usage) {
                    if previous != access.usage && (previous.is_write() || access.usage.is_write())
                    {
                        pass_barriers.push(PlannedBarrier {
                            resource: access.resource,
                            before: previous,
                            after: access.usage,
                        });
                    }
                }
            }

            if !pass_barriers.is_empty() {
                barriers.insert(node.id, pass_barriers);
            }
        }

        let pass_order: Vec<PassId> = sorted.iter().map(|&i| self.pass_nodes[i].id).collect();
        log::debug!(
            "Render graph compiled: {:?}",
            sorted
                .iter()
                .map(|&i| self.pass_nodes[i].name.as_str())
                .collect::<Vec<_>>()
        );

        Ok(CompiledGraph {
            pass_order,
            resource_lifetimes,
            barriers,
        })
    }

    /// Get all passes
    pub fn passes(&self) -> &[Box<dyn RenderPass>] {
        &self.passes
    }

    /// Get mutable passes
    pub fn passes_mut(&mut self) -> &mut [Box<dyn RenderPass>] {
        &mut self.passes
    }

    /// Get pass nodes (metadata)
    pub fn pass_nodes(&self) -> &[PassNode] {
        &self.pass_nodes
    }

    /// Get all resources
    pub fn resources(&self) -> &[VirtualResource] {
        &self.resources
    }

    /// Get pass by ID
    pub fn get_pass(&self, id: PassId) -> Option<&dyn RenderPass> {
        let index = self.pass_nodes.iter().position(|n| n.id == id)?;
        Some(self.passes[index].as_ref())
    }

    /// Get pass node by ID
    pub fn get_pass_node(&self, id: PassId) -> Option<&PassNode> {
        self.pass_nodes.iter().find(|n| n.id == id)
    }

    /// Pass names in execution order
    pub fn ordered_names(&self, compiled: &CompiledGraph) -> Vec<String> {
        compiled
            .pass_order
            .iter()
            .filter_map(|&id| self.get_pass_node(id))
            .map(|node| node.name.clone())
            .collect()
    }
}

/// Resource lifetime in terms of pass execution order
#[derive(Debug, Clone, Copy)]
pub struct ResourceLifetime {
    pub first_use: usize,
    pub last_use: usize,
}

/// Usage transition the executor emits before a pass runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedBarrier {
    pub resource: ResourceId,
    pub before: ResourceUsage,
    pub after: ResourceUsage,
}

/// Compiled render graph with execution order, resource lifetimes and barriers
#[derive(Debug)]
pub struct CompiledGraph {
    pub pass_order: Vec<PassId>,
    pub resource_lifetimes: HashMap<ResourceId, ResourceLifetime>,
    pub barriers: HashMap<PassId, Vec<PlannedBarrier>>,
}

impl CompiledGraph {
    /// Check if a resource is alive at a given execution step
    pub fn is_resource_alive(&self, resource: ResourceId, step: usize) -> bool {
        if let Some(lifetime) = self.resource_lifetimes.get(&resource) {
            step >= lifetime.first_use && step <= lifetime.last_use
        } else {
            false
        }
    }

    pub fn barriers_for(&self, pass: PassId) -> &[PlannedBarrier] {
        self.barriers.get(&pass).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    struct TestPass {
        name: &'static str,
        reads: Vec<(ResourceId, ResourceUsage)>,
        writes: Vec<(ResourceId, ResourceUsage)>,
    }

    impl TestPass {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                reads: Vec::new(),
                writes: Vec::new(),
            }
        }

        fn reads(mut self, resource: ResourceId, usage: ResourceUsage) -> Self {
            self.reads.push((resource, usage));
            self
        }

        fn writes(mut self, resource: ResourceId, usage: ResourceUsage) -> Self {
            self.writes.push((resource, usage));
            self
        }
    }

    impl RenderPass for TestPass {
        fn name(&self) -> &str {
            self.name
        }

        fn setup(&mut self, ctx: &mut PassSetupContext) {
            for &(resource, usage) in &self.reads {
                ctx.read(resource, usage);
            }
            for &(resource, usage) in &self.writes {
                ctx.write(resource, usage);
            }
        }

        fn execute(&self, _ctx: &mut PassExecuteContext) {}

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn names(graph: &RenderGraph) -> Vec<String> {
        graph.ordered_names(&graph.compile().unwrap())
    }

    #[test]
    fn readers_run_after_writers_regardless_of_insertion() {
        let mut graph = RenderGraph::new(64, 64);
        let commands = graph.import_buffer("commands");
        let replay = graph.import_buffer("replay");
        graph.add_pass(
            TestPass::new("replay").reads(replay, ResourceUsage::IndirectRead),
            PassType::Graphics,
        );
        graph.add_pass(
            TestPass::new("optimize")
                .reads(commands, ResourceUsage::TransferRead)
                .writes(replay, ResourceUsage::TransferWrite),
            PassType::Transfer,
        );
        graph.add_pass(
            TestPass::new("synthesize").writes(commands, ResourceUsage::StorageBufferWrite),
            PassType::Compute,
        );
        assert_eq!(names(&graph), vec!["synthesize", "optimize", "replay"]);
    }

    #[test]
    fn independent_passes_keep_insertion_order() {
        let mut graph = RenderGraph::new(64, 64);
        for name in ["a", "b", "c", "d"] {
            graph.add_pass(TestPass::new(name), PassType::Graphics);
        }
        assert_eq!(names(&graph), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn cycles_are_reported() {
        let mut graph = RenderGraph::new(64, 64);
        let x = graph.import_buffer("x");
        let y = graph.import_buffer("y");
        graph.add_pass(
            TestPass::new("a")
                .reads(x, ResourceUsage::StorageBufferRead)
                .writes(y, ResourceUsage::StorageBufferWrite),
            PassType::Compute,
        );
        graph.add_pass(
            TestPass::new("b")
                .reads(y, ResourceUsage::StorageBufferRead)
                .writes(x, ResourceUsage::StorageBufferWrite),
            PassType::Compute,
        );
        match graph.compile() {
            Err(GraphError::Cycle(passes)) => assert_eq!(passes, vec!["a", "b"]),
            other => panic!("expected a cycle, got {:?}", other.map(|c| c.pass_order)),
        }
    }

    #[test]
    fn unknown_resources_are_reported() {
        let mut graph = RenderGraph::new(64, 64);
        graph.add_pass(
            TestPass::new("a").reads(ResourceId(42), ResourceUsage::TextureRead),
            PassType::Graphics,
        );
        assert!(matches!(
            graph.compile(),
            Err(GraphError::UnknownResource { .. })
        ));
    }

    #[test]
    fn barriers_follow_usage_changes() {
        let mut graph = RenderGraph::new(64, 64);
        let target = graph.create_texture(
            "albedo",
            TextureSize::default(),
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        );
        let params = graph.import_buffer("params");
        let write = graph.add_pass(
            TestPass::new("write")
                .reads(params, ResourceUsage::UniformBuffer)
                .writes(target, ResourceUsage::RenderTarget),
            PassType::Graphics,
        );
        let read = graph.add_pass(
            TestPass::new("read")
                .reads(params, ResourceUsage::UniformBuffer)
                .reads(target, ResourceUsage::TextureRead),
            PassType::Graphics,
        );
        let compiled = graph.compile().unwrap();

        assert!(compiled.barriers_for(write).is_empty());
        assert_eq!(
            compiled.barriers_for(read),
            &[PlannedBarrier {
                resource: target,
                before: ResourceUsage::RenderTarget,
                after: ResourceUsage::TextureRead,
            }]
        );
        assert!(compiled.is_resource_alive(target, 1));
        assert!(!compiled.is_resource_alive(target, 2));
    }
}
