//! Texture heap: interning, promotion and residency.

use gpu_driven_renderer::backend::headless::HeadlessBackend;
use gpu_driven_renderer::backend::{GraphicsBackend, TextureSubresource};
use gpu_driven_renderer::resources::{Residency, TextureData, TextureHeap};
use rstest::rstest;

#[test]
fn interning_the_same_name_returns_the_same_handle() {
    let mut backend = HeadlessBackend::new(4, 4);
    let mut heap = TextureHeap::new();
    let first = heap
        .intern(&mut backend, &TextureData::solid_color([255, 0, 0, 255], "brick"))
        .unwrap();
    let second = heap
        .intern(&mut backend, &TextureData::solid_color([0, 255, 0, 255], "brick"))
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(heap.len(), 1);
    assert_eq!(heap.staged_count(), 1);
}

#[test]
fn building_with_nothing_staged_creates_no_heap() {
    let mut backend = HeadlessBackend::new(4, 4);
    let mut heap = TextureHeap::new();
    assert_eq!(heap.build(&mut backend).unwrap(), None);
    assert!(heap.heaps().is_empty());
    assert!(heap.resident_views().is_empty());
}

#[rstest]
#[case::single_level(TextureData::checkerboard("checker", 8, [255, 255, 255, 255], [0, 0, 0, 255]))]
#[case::mip_chain(
    TextureData::checkerboard("checker_mips", 8, [255, 0, 0, 255], [0, 0, 255, 255])
        .with_mips()
        .unwrap()
)]
fn promoted_texture_keeps_every_subresource(#[case] data: TextureData) {
    let mut backend = HeadlessBackend::new(4, 4);
    let mut heap = TextureHeap::new();
    let id = heap.intern(&mut backend, &data).unwrap();
    let handle = heap.build(&mut backend).unwrap().expect("one texture staged");

    assert_eq!(heap.resolve(id), Residency::Resident(0));
    assert!(backend.heap_size(handle).unwrap() >= data.subresources.iter().map(|s| s.len() as u64).sum());

    let resident = heap.resident_texture(id).unwrap().clone();
    heap.release_staging(&mut backend);
    for mip_level in 0..data.mip_levels {
        let subresource = TextureSubresource {
            mip_level,
            array_layer: 0,
        };
        let texels = backend.read_texture(resident.texture, subresource).unwrap();
        assert_eq!(Some(texels.as_slice()), data.subresource(subresource));
    }
}

#[test]
fn residency_indices_continue_across_builds() {
    let mut backend = HeadlessBackend::new(4, 4);
    let mut heap = TextureHeap::new();
    let a = heap
        .intern(&mut backend, &TextureData::solid_color([1, 2, 3, 255], "a"))
        .unwrap();
    heap.build(&mut backend).unwrap();
    let b = heap
        .intern(&mut backend, &TextureData::solid_color([4, 5, 6, 255], "b"))
        .unwrap();
    assert_eq!(heap.resolve(b), Residency::Staged);
    heap.build(&mut backend).unwrap();

    assert_eq!(heap.heaps().len(), 2);
    assert_eq!(heap.material_slot(Some(a)).unwrap(), 0);
    assert_eq!(heap.material_slot(Some(b)).unwrap(), 1);
    assert_eq!(heap.resident_views().len(), 2);
}

#[test]
fn missing_file_resolves_to_no_texture() {
    let mut backend = HeadlessBackend::new(4, 4);
    let mut heap = TextureHeap::new();
    let id = heap
        .intern_file(&mut backend, "does/not/exist.png")
        .unwrap();
    assert_eq!(heap.resolve(id), Residency::Missing);
    assert_eq!(heap.build(&mut backend).unwrap(), None);
    assert_eq!(
        heap.material_slot(Some(id)).unwrap(),
        gpu_driven_renderer::gpu_driven::layout::NO_TEXTURE
    );
    // Not retried
    assert_eq!(heap.intern_file(&mut backend, "does/not/exist.png").unwrap(), id);
}
