use rescache::{PopulateError, ResourceFactory, ResourceKey, Versioned};

/// The pixel layout of an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PixelFormat {
    /// One luminance byte per pixel.
    Gray8,
    /// Three bytes per pixel.
    Rgb8,
    /// Four bytes per pixel, with straight alpha.
    Rgba8,
}

impl PixelFormat {
    /// The size of one pixel in bytes.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// A tightly packed, row-major 2D image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// The layout of `pixels`.
    pub format: PixelFormat,
    /// `width * height * format.bytes_per_pixel()` bytes of pixel data.
    pub pixels: Vec<u8>,
}

impl Image {
    /// Creates an image filled with zeroes.
    pub fn blank(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            pixels: vec![0; len],
        }
    }

    /// The number of bytes `pixels` has to contain, or `None` on overflow.
    fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.format.bytes_per_pixel())
    }
}

/// The document type of [`PixelBufferFactory`].
pub type ImageDocument = Versioned<Image>;

/// An RGBA8 texture buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    /// The name of the buffer, taken from its resource key.
    pub label: ResourceKey,
    /// Width in pixels, `0` before the first populate.
    pub width: u32,
    /// Height in pixels, `0` before the first populate.
    pub height: u32,
    /// Four bytes per pixel.
    pub rgba: Vec<u8>,
    /// How often this buffer has been (re)uploaded.
    pub uploads: u64,
}

/// Describes the content of a [`PixelBuffer`] after a populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBufferInfo {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// The format of the source image.
    pub source_format: PixelFormat,
    /// Whether the buffer had to be reallocated because the dimensions changed.
    pub resized: bool,
}

/// Converts [`Image`]s into RGBA8 [`PixelBuffer`]s.
#[derive(Debug, Clone)]
pub struct PixelBufferFactory {
    max_dimension: u32,
}

impl PixelBufferFactory {
    /// The default maximum texture width and height.
    pub const DEFAULT_MAX_DIMENSION: u32 = 16384;

    /// Creates a factory that rejects images larger than `max_dimension` in either direction.
    pub fn new(max_dimension: u32) -> Self {
        Self { max_dimension }
    }
}

impl Default for PixelBufferFactory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_DIMENSION)
    }
}

impl ResourceFactory for PixelBufferFactory {
    const KIND: &'static str = "pixels";
    type Document = ImageDocument;
    type Resource = PixelBuffer;
    type LoaderResult = PixelBufferInfo;

    fn allocate(&self, key: &ResourceKey) -> PixelBuffer {
        PixelBuffer {
            label: key.clone(),
            width: 0,
            height: 0,
            rgba: Vec::new(),
            uploads: 0,
        }
    }

    fn populate(
        &self,
        document: &ImageDocument,
        buffer: &mut PixelBuffer,
    ) -> Result<PixelBufferInfo, PopulateError> {
        let image = document.data();
        if image.width == 0 || image.height == 0 {
            return Err(PopulateError::Unsupported(format!(
                "empty {}x{} image",
                image.width, image.height
            )));
        }
        if image.width > self.max_dimension || image.height > self.max_dimension {
            return Err(PopulateError::Unsupported(format!(
                "{}x{} exceeds the maximum texture size of {}",
                image.width, image.height, self.max_dimension
            )));
        }
        let expected = image
            .expected_len()
            .ok_or_else(|| PopulateError::Malformed("image size overflows".into()))?;
        if image.pixels.len() != expected {
            return Err(PopulateError::Malformed(format!(
                "expected {expected} bytes of {:?} pixels, got {}",
                image.format,
                image.pixels.len()
            )));
        }

        let resized = (buffer.width, buffer.height) != (image.width, image.height);
        buffer.rgba.clear();
        buffer.rgba.reserve(image.width as usize * image.height as usize * 4);
        match image.format {
            PixelFormat::Gray8 => {
                for &l in &image.pixels {
                    buffer.rgba.extend_from_slice(&[l, l, l, u8::MAX]);
                }
            }
            PixelFormat::Rgb8 => {
                for rgb in image.pixels.chunks_exact(3) {
                    buffer.rgba.extend_from_slice(rgb);
                    buffer.rgba.push(u8::MAX);
                }
            }
            PixelFormat::Rgba8 => buffer.rgba.extend_from_slice(&image.pixels),
        }
        buffer.width = image.width;
        buffer.height = image.height;
        buffer.uploads += 1;

        tracing::trace!(
            label = %buffer.label,
            width = image.width,
            height = image.height,
            resized,
            "Uploaded pixel buffer"
        );

        Ok(PixelBufferInfo {
            width: image.width,
            height: image.height,
            source_format: image.format,
            resized,
        })
    }
}
