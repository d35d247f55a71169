//! The film: channel set, light groups, and per-target weighting.

use crate::channel::{
    ChannelKind, PixelBuffer, ALPHA_COMPONENTS, IMAGE_PIPELINE_COMPONENTS,
    RADIANCE_PER_PIXEL_COMPONENTS, RADIANCE_PER_SCREEN_COMPONENTS,
};

/// Per-light-group weighting for one output target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupScale {
    pub enabled: bool,
    pub rgb: [f32; 3],
}

impl Default for GroupScale {
    fn default() -> Self {
        Self {
            enabled: true,
            rgb: [1.0, 1.0, 1.0],
        }
    }
}

/// Weighting configuration for one output target, one entry per light group.
#[derive(Debug, Clone)]
pub struct TargetPipeline {
    group_scales: Vec<GroupScale>,
}

impl TargetPipeline {
    /// All groups enabled at unit scale.
    pub fn new(light_groups: usize) -> Self {
        Self {
            group_scales: vec![GroupScale::default(); light_groups],
        }
    }

    pub fn group_scale(&self, group: usize) -> Option<&GroupScale> {
        self.group_scales.get(group)
    }

    pub fn group_scale_mut(&mut self, group: usize) -> Option<&mut GroupScale> {
        self.group_scales.get_mut(group)
    }
}

/// Running sample totals for the two radiance normalization conventions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleCounts {
    pub per_pixel_normalized: f64,
    pub per_screen_normalized: f64,
}

/// Host-side film: every pixel channel a render accumulates into.
pub struct Film {
    width: u32,
    height: u32,
    light_groups: usize,
    image_pipelines: Vec<PixelBuffer>,
    alpha: Option<PixelBuffer>,
    object_id: Option<Vec<u32>>,
    radiance_per_pixel: Vec<PixelBuffer>,
    radiance_per_screen: Vec<PixelBuffer>,
    targets: Vec<TargetPipeline>,
    sample_counts: SampleCounts,
}

impl Film {
    /// A film with one framebuffer and no optional channels.
    pub fn new(width: u32, height: u32, light_groups: usize) -> Self {
        Self {
            width,
            height,
            light_groups,
            image_pipelines: vec![PixelBuffer::new(width, height, IMAGE_PIPELINE_COMPONENTS)],
            alpha: None,
            object_id: None,
            radiance_per_pixel: Vec::new(),
            radiance_per_screen: Vec::new(),
            targets: Vec::new(),
            sample_counts: SampleCounts::default(),
        }
    }

    /// Add per-pixel-normalized radiance channels, one per light group.
    pub fn with_per_pixel_radiance(mut self) -> Self {
        self.radiance_per_pixel = (0..self.light_groups)
            .map(|_| PixelBuffer::new(self.width, self.height, RADIANCE_PER_PIXEL_COMPONENTS))
            .collect();
        self
    }

    /// Add per-screen-normalized radiance channels, one per light group.
    pub fn with_per_screen_radiance(mut self) -> Self {
        self.radiance_per_screen = (0..self.light_groups)
            .map(|_| PixelBuffer::new(self.width, self.height, RADIANCE_PER_SCREEN_COMPONENTS))
            .collect();
        self
    }

    pub fn with_alpha(mut self) -> Self {
        self.alpha = Some(PixelBuffer::new(self.width, self.height, ALPHA_COMPONENTS));
        self
    }

    pub fn with_object_id(mut self) -> Self {
        self.object_id = Some(vec![0; (self.width as usize) * (self.height as usize)]);
        self
    }

    /// Grow the framebuffer set to `count` output targets.
    pub fn with_framebuffers(mut self, count: usize) -> Self {
        while self.image_pipelines.len() < count {
            self.image_pipelines
                .push(PixelBuffer::new(self.width, self.height, IMAGE_PIPELINE_COMPONENTS));
        }
        self
    }

    /// Append a weighting configuration; targets without one behave as
    /// all-enabled, unit scale.
    pub fn add_target(&mut self, target: TargetPipeline) {
        self.targets.push(target);
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    pub fn light_group_count(&self) -> usize {
        self.light_groups
    }

    pub fn has_channel(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::ImagePipeline => !self.image_pipelines.is_empty(),
            ChannelKind::Alpha => self.alpha.is_some(),
            ChannelKind::ObjectId => self.object_id.is_some(),
            ChannelKind::RadiancePerPixel => !self.radiance_per_pixel.is_empty(),
            ChannelKind::RadiancePerScreen => !self.radiance_per_screen.is_empty(),
        }
    }

    pub fn image_pipeline_count(&self) -> usize {
        self.image_pipelines.len()
    }

    pub fn image_pipeline(&self, target: usize) -> Option<&PixelBuffer> {
        self.image_pipelines.get(target)
    }

    pub fn image_pipeline_mut(&mut self, target: usize) -> Option<&mut PixelBuffer> {
        self.image_pipelines.get_mut(target)
    }

    pub fn alpha(&self) -> Option<&PixelBuffer> {
        self.alpha.as_ref()
    }

    pub fn alpha_mut(&mut self) -> Option<&mut PixelBuffer> {
        self.alpha.as_mut()
    }

    pub fn object_id(&self) -> Option<&[u32]> {
        self.object_id.as_deref()
    }

    pub fn object_id_mut(&mut self) -> Option<&mut [u32]> {
        self.object_id.as_deref_mut()
    }

    /// Object-id channel reinterpreted as f32 words for device upload.
    pub fn object_id_words(&self) -> Option<&[f32]> {
        self.object_id.as_deref().map(bytemuck::cast_slice)
    }

    pub fn radiance_per_pixel(&self, group: usize) -> Option<&PixelBuffer> {
        self.radiance_per_pixel.get(group)
    }

    pub fn radiance_per_pixel_mut(&mut self, group: usize) -> Option<&mut PixelBuffer> {
        self.radiance_per_pixel.get_mut(group)
    }

    pub fn radiance_per_screen(&self, group: usize) -> Option<&PixelBuffer> {
        self.radiance_per_screen.get(group)
    }

    pub fn radiance_per_screen_mut(&mut self, group: usize) -> Option<&mut PixelBuffer> {
        self.radiance_per_screen.get_mut(group)
    }

    pub fn target(&self, target: usize) -> Option<&TargetPipeline> {
        self.targets.get(target)
    }

    pub fn target_mut(&mut self, target: usize) -> Option<&mut TargetPipeline> {
        self.targets.get_mut(target)
    }

    pub fn sample_counts(&self) -> &SampleCounts {
        &self.sample_counts
    }

    pub fn sample_counts_mut(&mut self) -> &mut SampleCounts {
        &mut self.sample_counts
    }
}

impl std::fmt::Debug for Film {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Film")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("light_groups", &self.light_groups)
            .field("framebuffers", &self.image_pipelines.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_presence() {
        let film = Film::new(4, 4, 2).with_per_pixel_radiance().with_alpha();
        assert!(film.has_channel(ChannelKind::ImagePipeline));
        assert!(film.has_channel(ChannelKind::Alpha));
        assert!(film.has_channel(ChannelKind::RadiancePerPixel));
        assert!(!film.has_channel(ChannelKind::RadiancePerScreen));
        assert!(!film.has_channel(ChannelKind::ObjectId));
        assert_eq!(film.light_group_count(), 2);
        assert_eq!(film.pixel_count(), 16);
    }

    #[test]
    fn test_missing_target_config() {
        let mut film = Film::new(2, 2, 1);
        assert!(film.target(0).is_none());
        film.add_target(TargetPipeline::new(1));
        assert!(film.target(0).unwrap().group_scale(0).unwrap().enabled);
        assert!(film.target(1).is_none());
    }

    #[test]
    fn test_object_id_words() {
        let mut film = Film::new(2, 1, 1).with_object_id();
        film.object_id_mut().unwrap()[0] = 7;
        let words = film.object_id_words().unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].to_bits(), 7);
    }
}
