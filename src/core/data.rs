//! Per-voxel data: the field variants and the optional payloads.
//!
//! Two field types exist. [`TsdfData`] stores a truncated signed distance
//! in [-1, 1] with a fusion weight. [`OccupancyData`] stores the running
//! mean of the per-integration log-odds together with a weight and an
//! `observed` flag; its field value is `occupancy * weight`, the
//! saturated accumulated log-odds.
//!
//! The field variant is a compile-time choice: allocators, updaters and
//! raycasters are monomorphic per variant, so the fusion kernels compile
//! specialized.

/// Sentinel for the absence of an identifier.
#[cfg(feature = "id")]
pub const NO_ID: u16 = 0;

/// Sentinel distinguishing an unmapped region from a region without an
/// identifier. Underflow is well-defined for unsigned integers.
#[cfg(feature = "id")]
pub const NOT_MAPPED: u16 = u16::MAX;

/// Common access to the per-voxel field, independent of the variant.
pub trait VoxelData: Clone + Copy + Default + Send + Sync + std::fmt::Debug + 'static {
    /// Scalar field value used for surface queries and aggregation.
    fn field(&self) -> f32;

    /// Fusion weight.
    fn weight(&self) -> f32;

    /// Whether the voxel holds data usable for interpolation.
    fn is_valid(&self) -> bool;

    #[cfg(feature = "colour")]
    fn colour(&self) -> ColourData;

    #[cfg(feature = "id")]
    fn id(&self) -> IdData;
}

/// Truncated signed distance with fusion weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TsdfData {
    /// Normalized distance in [-1, 1]; positive in front of the surface.
    pub tsdf: f32,
    /// Fusion weight in [0, max_weight]; 0 means never integrated.
    pub weight: f32,
    #[cfg(feature = "colour")]
    pub colour: ColourData,
    #[cfg(feature = "id")]
    pub id: IdData,
}

impl Default for TsdfData {
    fn default() -> Self {
        Self {
            tsdf: 1.0,
            weight: 0.0,
            #[cfg(feature = "colour")]
            colour: ColourData::default(),
            #[cfg(feature = "id")]
            id: IdData::default(),
        }
    }
}

impl TsdfData {
    /// Fuse a metric SDF sample into the running average.
    ///
    /// Samples behind the truncation band (`sdf <= -tau`) are rejected.
    /// Returns whether the voxel was updated.
    pub fn update(&mut self, sdf: f32, tau: f32, max_weight: f32) -> bool {
        if sdf <= -tau {
            return false;
        }
        let sample = (sdf / tau).min(1.0);
        self.tsdf = ((self.tsdf * self.weight + sample) / (self.weight + 1.0)).clamp(-1.0, 1.0);
        self.weight = (self.weight + 1.0).min(max_weight);
        true
    }
}

impl VoxelData for TsdfData {
    #[inline]
    fn field(&self) -> f32 {
        self.tsdf
    }

    #[inline]
    fn weight(&self) -> f32 {
        self.weight
    }

    #[inline]
    fn is_valid(&self) -> bool {
        self.weight > 0.0
    }

    #[cfg(feature = "colour")]
    #[inline]
    fn colour(&self) -> ColourData {
        self.colour
    }

    #[cfg(feature = "id")]
    #[inline]
    fn id(&self) -> IdData {
        self.id
    }
}

/// Log-odds occupancy with fusion weight and observation flag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OccupancyData {
    /// Running mean of the integrated log-odds samples.
    pub occupancy: f32,
    /// Fusion weight in [0, max_weight]; 0 means never integrated.
    pub weight: f32,
    /// Set once the voxel itself has been measured. Voxels seeded from a
    /// coarser scale carry data but start unobserved.
    pub observed: bool,
    #[cfg(feature = "colour")]
    pub colour: ColourData,
    #[cfg(feature = "id")]
    pub id: IdData,
}

impl Default for OccupancyData {
    fn default() -> Self {
        Self {
            occupancy: 0.0,
            weight: 0.0,
            observed: false,
            #[cfg(feature = "colour")]
            colour: ColourData::default(),
            #[cfg(feature = "id")]
            id: IdData::default(),
        }
    }
}

impl OccupancyData {
    /// Fuse a log-odds sample into the running mean and mark the voxel
    /// observed. Returns whether the voxel was newly observed.
    pub fn integrate(&mut self, sample: f32, max_weight: f32) -> bool {
        let newly_observed = !self.observed;
        self.occupancy = (self.occupancy * self.weight + sample) / (self.weight + 1.0);
        self.weight = (self.weight + 1.0).min(max_weight);
        self.observed = true;
        newly_observed
    }
}

impl VoxelData for OccupancyData {
    /// Saturated accumulated log-odds.
    #[inline]
    fn field(&self) -> f32 {
        self.occupancy * self.weight
    }

    #[inline]
    fn weight(&self) -> f32 {
        self.weight
    }

    #[inline]
    fn is_valid(&self) -> bool {
        self.observed
    }

    #[cfg(feature = "colour")]
    #[inline]
    fn colour(&self) -> ColourData {
        self.colour
    }

    #[cfg(feature = "id")]
    #[inline]
    fn id(&self) -> IdData {
        self.id
    }
}

/// RGB payload with running-average fusion.
#[cfg(feature = "colour")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColourData {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[cfg(feature = "colour")]
impl Default for ColourData {
    fn default() -> Self {
        // White, matching the default of an unobserved surface.
        Self {
            r: 0xFF,
            g: 0xFF,
            b: 0xFF,
        }
    }
}

#[cfg(feature = "colour")]
impl ColourData {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Fuse a colour sample with the same running average as the field.
    ///
    /// `weight` is the field weight before this frame's increment.
    pub fn update(&mut self, sample: ColourData, weight: f32) {
        let blend = |old: u8, new: u8| -> u8 {
            ((old as f32 * weight + new as f32) / (weight + 1.0)).round() as u8
        };
        self.r = blend(self.r, sample.r);
        self.g = blend(self.g, sample.g);
        self.b = blend(self.b, sample.b);
    }
}

/// 16-bit label payload.
#[cfg(feature = "id")]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct IdData(pub u16);

#[cfg(feature = "id")]
impl IdData {
    /// Set the label if `id` is a real identifier. Returns whether the
    /// data changed.
    pub fn update(&mut self, id: u16) -> bool {
        if id != NO_ID && self.0 != id {
            self.0 = id;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsdf_update_in_band() {
        let mut data = TsdfData::default();
        let updated = data.update(0.1, 0.2, 100.0);
        assert!(updated);
        assert_eq!(data.weight, 1.0);
        assert!((data.tsdf - 0.5).abs() < 1e-6, "first sample becomes the mean");
    }

    #[test]
    fn test_tsdf_rejects_behind_band() {
        let mut data = TsdfData::default();
        assert!(!data.update(-0.3, 0.2, 100.0));
        assert_eq!(data.weight, 0.0);
    }

    #[test]
    fn test_tsdf_weight_saturates() {
        let mut data = TsdfData::default();
        for _ in 0..10 {
            data.update(0.0, 0.2, 5.0);
        }
        assert_eq!(data.weight, 5.0);
    }

    #[test]
    fn test_occupancy_field_is_mean_times_weight() {
        let mut data = OccupancyData::default();
        let newly = data.integrate(-5.0, 100.0);
        assert!(newly);
        assert!(!data.integrate(-5.0, 100.0), "already observed");
        assert_eq!(data.weight, 2.0);
        assert!((data.field() - -10.0).abs() < 1e-5);
    }

    #[test]
    fn test_occupancy_field_saturates_at_min_occupancy() {
        let mut data = OccupancyData::default();
        for _ in 0..200 {
            data.integrate(-5.0, 100.0);
        }
        assert_eq!(data.weight, 100.0);
        assert!((data.field() - -500.0).abs() < 1e-3);
    }

    #[cfg(feature = "colour")]
    #[test]
    fn test_colour_running_average() {
        let mut c = ColourData::new(0, 0, 0);
        c.update(ColourData::new(90, 90, 90), 2.0);
        assert_eq!(c.r, 30);
    }
}
