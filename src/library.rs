//! Program registry: compiled programs are looked up by name and treated as opaque.

use std::collections::BTreeMap;

use crate::error::{RendererError, RendererResult};
use crate::gpu_driven::synthesis::{ENCODE_COMMANDS_PROGRAM, ENCODE_COMMANDS_SHADER};
use crate::pipeline::{
    composite_pass, forward_pass, gbuffer_pass, lighting_pass, shadow_pass, with_common,
};

#[derive(Debug, Clone, Default)]
pub struct ShaderLibrary {
    programs: BTreeMap<String, String>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library holding every program the built-in passes look up.
    pub fn with_builtin_programs() -> Self {
        let mut library = Self::new();
        library.insert(ENCODE_COMMANDS_PROGRAM, ENCODE_COMMANDS_SHADER);
        library.insert(
            shadow_pass::SHADOW_PROGRAM,
            &with_common(shadow_pass::SHADOW_SHADER, false),
        );
        library.insert(
            gbuffer_pass::GBUFFER_PROGRAM,
            &with_common(gbuffer_pass::GBUFFER_SHADER, true),
        );
        library.insert(
            lighting_pass::LIGHTING_PROGRAM,
            &with_common(lighting_pass::LIGHTING_SHADER, false),
        );
        library.insert(
            forward_pass::FORWARD_PROGRAM,
            &with_common(forward_pass::FORWARD_SHADER, true),
        );
        library.insert(composite_pass::COMPOSITE_PROGRAM, composite_pass::COMPOSITE_SHADER);
        library
    }

    /// Add or replace a program
    pub fn insert(&mut self, name: &str, source: &str) {
        if self
            .programs
            .insert(name.to_string(), source.to_string())
            .is_some()
        {
            log::debug!("Shader library: replaced program '{}'", name);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.programs.remove(name)
    }

    pub fn source(&self, name: &str) -> RendererResult<&str> {
        self.programs
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RendererError::MissingProgram(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_programs_are_registered() {
        let library = ShaderLibrary::with_builtin_programs();
        assert_eq!(library.len(), 6);
        assert!(library.source(ENCODE_COMMANDS_PROGRAM).unwrap().contains("@compute"));
        let gbuffer = library.source(gbuffer_pass::GBUFFER_PROGRAM).unwrap();
        assert!(gbuffer.contains("struct FrameUniforms"));
        assert!(gbuffer.contains("heap_textures"));
    }

    #[test]
    fn builtin_programs_parse_and_validate() {
        let library = ShaderLibrary::with_builtin_programs();
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        for name in library.names() {
            let source = library.source(name).unwrap();
            let module = naga::front::wgsl::parse_str(source)
                .unwrap_or_else(|err| panic!("{}: {}", name, err.emit_to_string(source)));
            if let Err(err) = validator.validate(&module) {
                panic!("{}: {}", name, err.emit_to_string(source));
            }
        }
    }

    #[test]
    fn missing_program_is_an_error() {
        let library = ShaderLibrary::new();
        assert!(matches!(
            library.source("gbuffer"),
            Err(RendererError::MissingProgram(name)) if name == "gbuffer"
        ));
    }
}
