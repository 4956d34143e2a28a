use rescache::{CacheError, CacheRegistry, PopulateError, Versioned};
use rescache_kinds::{Image, PixelBufferFactory, PixelFormat};
use rescache_test as test;
use std::prelude::v1::test;

#[test]
fn test_edit_reuploads_buffer() {
    test::setup();
    let registry = CacheRegistry::default();
    let cache = registry.get_or_init(PixelBufferFactory::default);

    let image = Versioned::new("scan", Image::blank(2, 2, PixelFormat::Rgb8)).shared();
    let texture = cache.acquire(&image, "");

    let first = cache.refresh(&texture).unwrap();
    assert!(first.updated);
    assert!(first.loader_result.resized);
    assert_eq!(texture.read().unwrap().rgba.len(), 16);

    // drawing every frame does not upload again
    assert!(!cache.refresh(&texture).unwrap().updated);
    assert_eq!(texture.read().unwrap().uploads, 1);

    image.write().unwrap().modify(|image| image.pixels[0] = 255);
    let second = cache.refresh(&texture).unwrap();
    assert!(second.updated);
    assert!(!second.loader_result.resized);
    {
        let buffer = texture.read().unwrap();
        assert_eq!(&buffer.rgba[..4], &[255, 0, 0, 255]);
        assert_eq!(buffer.uploads, 2);
    }

    cache.release(&texture).unwrap();
    registry.teardown().unwrap();
}

#[test]
fn test_broken_edit_keeps_last_upload() {
    test::setup();
    let cache = rescache::ResourceCache::new(PixelBufferFactory::default());

    let image = Versioned::new("scan", Image::blank(1, 1, PixelFormat::Gray8)).shared();
    let texture = cache.acquire(&image, "");
    cache.refresh(&texture).unwrap();

    image.write().unwrap().modify(|image| image.width = 3);
    let err = cache.refresh(&texture).unwrap_err();
    assert!(matches!(
        err,
        CacheError::PopulateFailed {
            source: PopulateError::Malformed(_),
            ..
        }
    ));
    assert_eq!(texture.read().unwrap().width, 1);

    image.write().unwrap().modify(|image| image.pixels = vec![1, 2, 3]);
    let refreshed = cache.refresh(&texture).unwrap();
    assert_eq!(refreshed.loader_result.width, 3);
    assert!(refreshed.loader_result.resized);

    cache.release(&texture).unwrap();
    cache.check_empty().unwrap();
}
