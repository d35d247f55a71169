//! End-to-end merge behavior driven through the public engine surface.

use approx::assert_abs_diff_eq;

use ember_film::{Film, TargetPipeline};
use ember_merge::{MergeConfig, MergeEngine, SoftwareDevice};

fn ready_engine(film: &Film) -> MergeEngine {
    let mut engine = MergeEngine::with_device(Box::new(SoftwareDevice::new())).unwrap();
    engine.allocate_buffers(film).unwrap();
    engine.compile_kernels(film).unwrap();
    engine
}

/// Write (r, g, b, weight) into every pixel of one per-pixel radiance group.
fn fill_per_pixel(film: &mut Film, group: usize, rgb: [f32; 3], weight: f32) {
    film.radiance_per_pixel_mut(group)
        .unwrap()
        .fill(&[rgb[0], rgb[1], rgb[2], weight]);
}

fn fill_per_screen(film: &mut Film, group: usize, rgb: [f32; 3]) {
    film.radiance_per_screen_mut(group).unwrap().fill(&rgb);
}

/// Host-side reference for the per-pixel-normalized merge.
fn reference_merge(film: &Film, target: usize) -> Vec<f32> {
    let mut out = film.image_pipeline(target).unwrap().pixels().to_vec();
    for pixel in out.chunks_exact_mut(4) {
        pixel[0] = 0.0;
        pixel[1] = 0.0;
        pixel[2] = 0.0;
    }
    for group in 0..film.light_group_count() {
        let scale = match film.target(target) {
            Some(pipeline) => {
                let gs = pipeline.group_scale(group).unwrap();
                if !gs.enabled {
                    continue;
                }
                gs.rgb
            }
            None => [1.0, 1.0, 1.0],
        };
        let samples = film.radiance_per_pixel(group).unwrap().pixels();
        for (pixel, sample) in out.chunks_exact_mut(4).zip(samples.chunks_exact(4)) {
            let weight = sample[3];
            if weight > 0.0 {
                pixel[0] += scale[0] * sample[0] / weight;
                pixel[1] += scale[1] * sample[1] / weight;
                pixel[2] += scale[2] * sample[2] / weight;
            }
        }
    }
    out
}

#[test]
fn test_merge_matches_host_reference() {
    let mut film = Film::new(4, 4, 2).with_per_pixel_radiance();
    film.add_target(TargetPipeline::new(2));
    {
        let scales = film.target_mut(0).unwrap();
        scales.group_scale_mut(0).unwrap().rgb = [2.0, 1.0, 0.5];
    }

    // Non-uniform values with mixed weights.
    for group in 0..2 {
        let channel = film.radiance_per_pixel_mut(group).unwrap();
        for (i, sample) in channel.pixels_mut().chunks_exact_mut(4).enumerate() {
            sample[0] = 0.1 * i as f32 + group as f32;
            sample[1] = 0.2 * i as f32;
            sample[2] = 1.0 + (i % 3) as f32;
            sample[3] = 1.0 + (i % 2) as f32;
        }
    }

    let expected = reference_merge(&film, 0);

    let mut engine = ready_engine(&film);
    engine.merge(&mut film, 0).unwrap();

    let merged = film.image_pipeline(0).unwrap().pixels();
    for (got, want) in merged.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*got, *want, epsilon = 1e-5);
    }
}

#[test]
fn test_disabled_group_equals_zeroed_group() {
    let build = |zero_group_one: bool, disable_group_one: bool| {
        let mut film = Film::new(4, 4, 2).with_per_pixel_radiance();
        film.add_target(TargetPipeline::new(2));
        fill_per_pixel(&mut film, 0, [0.3, 0.6, 0.9], 1.0);
        if !zero_group_one {
            fill_per_pixel(&mut film, 1, [5.0, 5.0, 5.0], 1.0);
        }
        if disable_group_one {
            film.target_mut(0)
                .unwrap()
                .group_scale_mut(1)
                .unwrap()
                .enabled = false;
        }
        let mut engine = ready_engine(&film);
        engine.merge(&mut film, 0).unwrap();
        film.image_pipeline(0).unwrap().pixels().to_vec()
    };

    let disabled = build(false, true);
    let zeroed = build(true, false);
    assert_eq!(disabled, zeroed);
}

#[test]
fn test_zero_screen_sample_count_defaults_factor_to_one() {
    let mut film = Film::new(4, 4, 1).with_per_screen_radiance();
    fill_per_screen(&mut film, 0, [0.4, 0.5, 0.6]);
    assert_eq!(film.sample_counts().per_screen_normalized, 0.0);

    let mut engine = ready_engine(&film);
    engine.merge(&mut film, 0).unwrap();

    for pixel in film.image_pipeline(0).unwrap().pixels().chunks_exact(4) {
        assert_abs_diff_eq!(pixel[0], 0.4, epsilon = 1e-6);
        assert_abs_diff_eq!(pixel[1], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(pixel[2], 0.6, epsilon = 1e-6);
    }
}

#[test]
fn test_screen_normalization_factor_applied() {
    let mut film = Film::new(4, 4, 1).with_per_screen_radiance();
    fill_per_screen(&mut film, 0, [1.0, 1.0, 1.0]);
    // 16 pixels over 8 samples doubles every contribution.
    film.sample_counts_mut().per_screen_normalized = 8.0;

    let mut engine = ready_engine(&film);
    engine.merge(&mut film, 0).unwrap();

    for pixel in film.image_pipeline(0).unwrap().pixels().chunks_exact(4) {
        assert_abs_diff_eq!(pixel[0], 2.0, epsilon = 1e-6);
    }
}

#[test]
fn test_merge_is_idempotent() {
    let mut film = Film::new(4, 4, 2).with_per_pixel_radiance();
    fill_per_pixel(&mut film, 0, [0.7, 0.1, 0.2], 2.0);
    fill_per_pixel(&mut film, 1, [0.5, 0.5, 0.5], 1.0);

    let mut engine = ready_engine(&film);
    engine.merge(&mut film, 0).unwrap();
    let first: Vec<u32> = film
        .image_pipeline(0)
        .unwrap()
        .pixels()
        .iter()
        .map(|v| v.to_bits())
        .collect();

    engine.merge(&mut film, 0).unwrap();
    let second: Vec<u32> = film
        .image_pipeline(0)
        .unwrap()
        .pixels()
        .iter()
        .map(|v| v.to_bits())
        .collect();

    assert_eq!(first, second);
}

#[test]
fn test_inert_engine_never_touches_host_channels() {
    let mut film = Film::new(4, 4, 1).with_per_pixel_radiance();
    fill_per_pixel(&mut film, 0, [1.0, 1.0, 1.0], 1.0);
    film.image_pipeline_mut(0).unwrap().fill(&[9.0, 9.0, 9.0, 9.0]);

    let mut engine = MergeEngine::inert();
    assert!(!engine.is_active());
    engine.allocate_buffers(&film).unwrap();
    engine.compile_kernels(&film).unwrap();
    engine.merge(&mut film, 0).unwrap();
    engine.sync_static_channels(&film).unwrap();

    for word in film.image_pipeline(0).unwrap().pixels() {
        assert_eq!(*word, 9.0);
    }
}

#[test]
fn test_disabled_config_builds_inert_engine() {
    let config = MergeConfig {
        disabled: true,
        device_index: None,
    };
    let engine = MergeEngine::build(&config).unwrap();
    assert!(!engine.is_active());
}

#[test]
fn test_shutdown_releases_and_is_repeatable() {
    let mut film = Film::new(4, 4, 1).with_per_pixel_radiance();
    fill_per_pixel(&mut film, 0, [1.0, 1.0, 1.0], 1.0);

    let mut engine = ready_engine(&film);
    engine.shutdown();
    assert!(!engine.is_active());
    engine.shutdown();

    // A torn-down engine behaves like a never-built one.
    film.image_pipeline_mut(0).unwrap().fill(&[3.0, 3.0, 3.0, 3.0]);
    engine.merge(&mut film, 0).unwrap();
    for word in film.image_pipeline(0).unwrap().pixels() {
        assert_eq!(*word, 3.0);
    }

    MergeEngine::inert().shutdown();
}

#[test]
fn test_uniform_value_roundtrip() {
    let mut film = Film::new(4, 4, 1).with_per_pixel_radiance();
    film.add_target(TargetPipeline::new(1));
    fill_per_pixel(&mut film, 0, [0.25, 0.25, 0.25], 1.0);

    let mut engine = ready_engine(&film);
    engine.merge(&mut film, 0).unwrap();

    for pixel in film.image_pipeline(0).unwrap().pixels().chunks_exact(4) {
        assert_abs_diff_eq!(pixel[0], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(pixel[1], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(pixel[2], 0.25, epsilon = 1e-6);
    }
}

#[test]
fn test_only_enabled_group_contributes() {
    let mut film = Film::new(4, 4, 2).with_per_pixel_radiance();
    film.add_target(TargetPipeline::new(2));
    film.target_mut(0).unwrap().group_scale_mut(0).unwrap().rgb = [0.5, 0.5, 0.5];
    film.target_mut(0)
        .unwrap()
        .group_scale_mut(1)
        .unwrap()
        .enabled = false;
    fill_per_pixel(&mut film, 0, [1.0, 2.0, 4.0], 1.0);
    fill_per_pixel(&mut film, 1, [100.0, 100.0, 100.0], 1.0);

    let mut engine = ready_engine(&film);
    engine.merge(&mut film, 0).unwrap();

    for pixel in film.image_pipeline(0).unwrap().pixels().chunks_exact(4) {
        assert_abs_diff_eq!(pixel[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(pixel[1], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(pixel[2], 2.0, epsilon = 1e-6);
    }
}

#[test]
fn test_target_without_config_is_neutral() {
    // Two framebuffers, weighting configured for the first only: merging the
    // second behaves as all groups enabled at unit scale.
    let mut film = Film::new(4, 4, 1)
        .with_per_pixel_radiance()
        .with_framebuffers(2);
    let mut scales = TargetPipeline::new(1);
    scales.group_scale_mut(0).unwrap().enabled = false;
    film.add_target(scales);
    fill_per_pixel(&mut film, 0, [0.8, 0.8, 0.8], 1.0);

    let mut engine = ready_engine(&film);
    engine.merge(&mut film, 1).unwrap();

    for pixel in film.image_pipeline(1).unwrap().pixels().chunks_exact(4) {
        assert_abs_diff_eq!(pixel[0], 0.8, epsilon = 1e-6);
    }

    // The configured target still honors its disabled group.
    engine.merge(&mut film, 0).unwrap();
    for pixel in film.image_pipeline(0).unwrap().pixels().chunks_exact(4) {
        assert_eq!(pixel[0], 0.0);
    }
}

#[test]
fn test_missing_framebuffer_is_an_error() {
    let mut film = Film::new(4, 4, 1).with_per_pixel_radiance();
    let mut engine = ready_engine(&film);
    assert!(engine.merge(&mut film, 5).is_err());
}

#[test]
fn test_alpha_word_carried_through() {
    let mut film = Film::new(2, 2, 1).with_per_pixel_radiance();
    film.image_pipeline_mut(0).unwrap().fill(&[9.0, 9.0, 9.0, 0.7]);
    fill_per_pixel(&mut film, 0, [0.2, 0.2, 0.2], 1.0);

    let mut engine = ready_engine(&film);
    engine.merge(&mut film, 0).unwrap();

    for pixel in film.image_pipeline(0).unwrap().pixels().chunks_exact(4) {
        assert_abs_diff_eq!(pixel[0], 0.2, epsilon = 1e-6);
        assert_eq!(pixel[3], 0.7);
    }
}

#[test]
fn test_both_conventions_fold_into_one_framebuffer() {
    let mut film = Film::new(4, 4, 1)
        .with_per_pixel_radiance()
        .with_per_screen_radiance();
    fill_per_pixel(&mut film, 0, [0.25, 0.25, 0.25], 1.0);
    fill_per_screen(&mut film, 0, [0.5, 0.5, 0.5]);
    film.sample_counts_mut().per_screen_normalized = 16.0;

    let mut engine = ready_engine(&film);
    engine.merge(&mut film, 0).unwrap();

    for pixel in film.image_pipeline(0).unwrap().pixels().chunks_exact(4) {
        assert_abs_diff_eq!(pixel[0], 0.75, epsilon = 1e-6);
    }
}
