//! Row-major image container for depth and colour measurements.

/// A dense 2D image.
///
/// Row-major storage: index = y * width + x.
#[derive(Debug, Clone)]
pub struct Image<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T: Clone> Image<T> {
    /// Create an image filled with a constant value.
    pub fn new(width: usize, height: usize, fill: T) -> Self {
        Self {
            width,
            height,
            data: vec![fill; width * height],
        }
    }

    /// Wrap existing row-major pixel data.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), width * height, "pixel count mismatch");
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Bounds-checked pixel access with signed coordinates.
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> Option<&T> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(&self.data[y as usize * self.width + x as usize])
    }

    /// Unchecked pixel access.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &T {
        debug_assert!(x < self.width && y < self.height);
        &self.data[y * self.width + x]
    }

    /// Mutable pixel access.
    #[inline]
    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut T {
        debug_assert!(x < self.width && y < self.height);
        &mut self.data[y * self.width + x]
    }

    /// Flat view of the pixel data.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

/// A depth image in meters. Non-positive values mean "no measurement".
pub type DepthImage = Image<f32>;
