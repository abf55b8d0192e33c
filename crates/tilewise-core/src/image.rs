//! Host pixel buffers and the borrowed views the engine works on.
//!
//! # Layout
//!
//! Pixels are row-major and interleaved: `channels` bytes per pixel, no row
//! padding. A buffer of `width × height × channels` bytes is the only valid
//! shape; nothing in this module truncates or pads.
//!
//! # Aliasing
//!
//! [`MatView`] and [`MatViewMut`] borrow an [`ImageBuffer`]'s storage
//! directly. The engine reads and writes through them for the duration of
//! one `process` call; the borrow checker guarantees the buffers are neither
//! resized nor dropped while a view is alive, and that input and output do
//! not alias.

use crate::error::{BufferRole, EngineError, Result};

/// Byte length required by a `width × height × channels` image, or `None` on
/// overflow.
#[inline]
pub fn expected_len(width: u32, height: u32, channels: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(channels as usize)
}

fn check_shape(
    role: BufferRole,
    actual: usize,
    width: u32,
    height: u32,
    channels: u32,
) -> Result<()> {
    match expected_len(width, height, channels) {
        Some(expected) if expected == actual => Ok(()),
        expected => Err(EngineError::InvalidBufferShape {
            role,
            width,
            height,
            channels,
            expected: expected.unwrap_or(usize::MAX),
            actual,
        }),
    }
}

// ─── ImageBuffer ─────────────────────────────────────────────────────────────

/// Owned pixel bytes plus their declared geometry.
///
/// Construction does not validate: a caller may build a buffer and fix its
/// bytes later with [`set_data`](Self::set_data). The shape invariant is
/// enforced wherever a buffer crosses into the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u32,
}

impl ImageBuffer {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u32) -> Self {
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    /// Zero-filled buffer of exactly the right length.
    pub fn zeroed(width: u32, height: u32, channels: u32) -> Result<Self> {
        let len = expected_len(width, height, channels).ok_or(EngineError::InvalidBufferShape {
            role: BufferRole::Output,
            width,
            height,
            channels,
            expected: usize::MAX,
            actual: 0,
        })?;
        Ok(Self::new(vec![0; len], width, height, channels))
    }

    /// Zero-filled buffer sized to receive `self` upscaled by `scale`.
    pub fn zeroed_scaled(&self, scale: u32) -> Result<Self> {
        let width = self.width.checked_mul(scale);
        let height = self.height.checked_mul(scale);
        match (width, height) {
            (Some(w), Some(h)) => Self::zeroed(w, h, self.channels),
            _ => Err(EngineError::GeometryMismatch(format!(
                "{}x{} scaled by {scale} overflows",
                self.width, self.height
            ))),
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Current contents.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer, returning its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Replace the contents wholesale. Geometry is unchanged, so the caller
    /// keeps the shape invariant.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Copy `bytes` over the current contents without reallocating.
    ///
    /// Fails, leaving the buffer untouched, if the length differs.
    pub fn copy_from(&mut self, bytes: &[u8]) -> Result<()> {
        check_shape(
            BufferRole::Input,
            bytes.len(),
            self.width,
            self.height,
            self.channels,
        )?;
        self.data.copy_from_slice(bytes);
        Ok(())
    }

    /// Whether `len(data) == width × height × channels`.
    pub fn is_well_formed(&self) -> bool {
        expected_len(self.width, self.height, self.channels) == Some(self.data.len())
    }

    /// Check the shape invariant, naming `role` in the error.
    pub fn validate(&self, role: BufferRole) -> Result<()> {
        check_shape(role, self.data.len(), self.width, self.height, self.channels)
    }

    /// Same geometry (width, height, channels) as `other`.
    pub fn same_geometry(&self, other: &ImageBuffer) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }

    /// Borrow as a read-only view. Validates the shape first.
    pub fn as_mat(&self) -> Result<MatView<'_>> {
        MatView::new(&self.data, self.width, self.height, self.channels)
    }

    /// Borrow as a writable view. Validates the shape first.
    pub fn as_mat_mut(&mut self) -> Result<MatViewMut<'_>> {
        MatViewMut::new(&mut self.data, self.width, self.height, self.channels)
    }
}

// ─── Views ───────────────────────────────────────────────────────────────────

/// Borrowed, read-only, row-major pixel matrix. Element size = channel count.
#[derive(Clone, Copy, Debug)]
pub struct MatView<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    channels: u32,
}

impl<'a> MatView<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32, channels: u32) -> Result<Self> {
        check_shape(BufferRole::Input, data.len(), width, height, channels)?;
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per element (one pixel).
    #[inline]
    pub fn elem_size(&self) -> usize {
        self.channels as usize
    }

    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Row stride in bytes.
    #[inline]
    pub fn stride(&self) -> usize {
        self.width as usize * self.elem_size()
    }

    /// The `channels` bytes of pixel `(x, y)`.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &'a [u8] {
        let start = y * self.stride() + x * self.elem_size();
        &self.data[start..start + self.elem_size()]
    }
}

/// Borrowed, writable, row-major pixel matrix. Element size = channel count.
#[derive(Debug)]
pub struct MatViewMut<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
    channels: u32,
}

impl<'a> MatViewMut<'a> {
    pub fn new(data: &'a mut [u8], width: u32, height: u32, channels: u32) -> Result<Self> {
        check_shape(BufferRole::Output, data.len(), width, height, channels)?;
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.channels as usize
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.width as usize * self.elem_size()
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.data
    }

    #[inline]
    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [u8] {
        let elem = self.elem_size();
        let start = y * self.stride() + x * elem;
        &mut self.data[start..start + elem]
    }
}

// Views cross into `py.allow_threads` and engine worker calls.
#[allow(dead_code)]
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<ImageBuffer>();
        assert_send_sync::<MatView<'static>>();
        assert_send_sync::<MatViewMut<'static>>();
    }
};
