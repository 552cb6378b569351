mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use assert_matches::assert_matches;
use common::{drain, image_frames, progress_count, Harness, SIZE};
use regex::Regex;
use seedalchemy_core::frames::Frame;
use seedalchemy_core::metadata::{self, METADATA_KEY};
use seedalchemy_core::request::{
    ControlNetCondition, ControlNetParams, FaceParams, HighResParams, Img2ImgParams, InpaintParams, LoraEntry,
    LoraParams, Preview, ProcessRequest, RefinerParams, UpscaleParams,
};
use seedalchemy_core::{GenerationError, ImageRequest};
use seedalchemy_engine::conditioning::ConditioningResolver;
use seedalchemy_engine::Session;
use seedalchemy_runtime_api::PatchTarget;
use uuid::Uuid;

fn basic() -> ImageRequest {
    ImageRequest {
        generator_id: Some(Uuid::new_v4()),
        model: "sd-1.5".into(),
        scheduler: "euler_a".into(),
        prompt: "a red cube".into(),
        negative_prompt: String::new(),
        steps: 20,
        cfg_scale: 7.0,
        width: SIZE,
        height: SIZE,
        seed: 1,
        image_count: 1,
        ..Default::default()
    }
}

fn stored_request(harness: &Harness, path: &str) -> ImageRequest {
    let bytes = std::fs::read(harness.store.image_path("default", path).unwrap()).unwrap();
    let chunks = metadata::read_text_chunks(&bytes).unwrap();
    metadata::parse_metadata(&chunks[METADATA_KEY]).unwrap()
}

fn stored_image(harness: &Harness, path: &str) -> image::RgbImage {
    image::open(harness.store.image_path("default", path).unwrap())
        .unwrap()
        .to_rgb8()
}

#[test]
fn basic_txt2img() {
    let mut harness = Harness::new();
    let (session, mut rx) = Session::new();
    let req = basic();

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.paths.len(), 1);
    let name = Regex::new(r"^outputs/00001\.[0-9a-f]{8}\.png$").unwrap();
    assert!(name.is_match(&outcome.paths[0]), "{}", outcome.paths[0]);

    let frames = drain(&mut rx);
    assert_eq!(progress_count(&frames), 21);
    let last = frames.iter().rev().find(|f| matches!(f, Frame::Progress { .. }));
    assert_matches!(last, Some(Frame::Progress { percent: 100, .. }));
    let images: Vec<_> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Image { generator_id, png } => Some((*generator_id, png)),
            _ => None,
        })
        .collect();
    assert_eq!(images.len(), 1);
    assert_eq!(Some(images[0].0), req.generator_id);

    let stored = stored_request(&harness, &outcome.paths[0]);
    assert_eq!(stored.prompt, "a red cube");
    assert_eq!(stored.seed, 1);
    assert_eq!(stored.generator_id, None);
    assert_eq!(stored_image(&harness, &outcome.paths[0]).dimensions(), (SIZE, SIZE));
    assert_eq!(harness.recorder.denoiser_calls.load(Ordering::SeqCst), 20);
}

#[test]
fn img2img_without_noise_returns_the_source() {
    let mut harness = Harness::new();
    let source = harness.source_image("sources");
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        img2img: Some(Img2ImgParams {
            source: source.clone(),
            noise: 0.0,
        }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 1);
    assert_eq!(progress_count(&drain(&mut rx)), 1);
    assert_eq!(harness.recorder.denoiser_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        stored_image(&harness, &outcome.paths[0]),
        stored_image(&harness, &source)
    );
}

#[test]
fn img2img_runs_part_of_the_schedule() {
    let mut harness = Harness::new();
    let source = harness.source_image("sources");
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        img2img: Some(Img2ImgParams { source, noise: 0.75 }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 1);
    assert_eq!(progress_count(&drain(&mut rx)), 15 + 1);
    assert_eq!(harness.recorder.denoiser_calls.load(Ordering::SeqCst), 15);
}

#[test]
fn sdxl_base_and_refiner_share_one_schedule() {
    let mut harness = Harness::new();
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        model: "sdxl-base".into(),
        steps: 30,
        seed: 42,
        image_count: 2,
        prompt: "a lighthouse at dusk".into(),
        refiner: Some(RefinerParams {
            model: "sdxl-refiner".into(),
            cfg_scale: 4.0,
            high_noise_end: Some(0.8),
            steps: None,
            noise: None,
        }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 2);
    assert!(outcome.errors.is_empty());
    assert_eq!(progress_count(&drain(&mut rx)), 32);
    // One batched call per step across both pipelines
    assert_eq!(harness.recorder.denoiser_calls.load(Ordering::SeqCst), 30);
    assert_eq!(harness.recorder.loads_of("pipeline:sdxl-base"), 1);
    assert_eq!(harness.recorder.loads_of("pipeline:sdxl-refiner"), 1);
    for path in &outcome.paths {
        let stored = stored_request(&harness, path);
        assert_eq!(stored.refiner, req.refiner);
    }
}

fn two_stage(noise: f64, source: String) -> ImageRequest {
    ImageRequest {
        model: "sdxl-base".into(),
        steps: 30,
        img2img: Some(Img2ImgParams { source, noise }),
        refiner: Some(RefinerParams {
            model: "sdxl-refiner".into(),
            cfg_scale: 4.0,
            high_noise_end: Some(0.8),
            steps: None,
            noise: None,
        }),
        ..basic()
    }
}

#[test]
fn low_strength_img2img_with_refiner_stays_in_budget() {
    let mut harness = Harness::new();
    let source = harness.source_image("sources");
    let (session, mut rx) = Session::new();
    let req = two_stage(0.1, source);

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 1);
    assert_eq!(req.total_steps(), 3 + 1);
    assert_eq!(progress_count(&drain(&mut rx)) as u64, req.total_steps());
    assert_eq!(harness.recorder.denoiser_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn half_strength_img2img_splits_the_tail_between_pipelines() {
    let mut harness = Harness::new();
    let source = harness.source_image("sources");
    let (session, mut rx) = Session::new();
    let req = two_stage(0.5, source);

    harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(progress_count(&drain(&mut rx)) as u64, req.total_steps());
    assert_eq!(harness.recorder.denoiser_calls.load(Ordering::SeqCst), 15);
}

#[test]
fn zero_noise_skips_the_two_stage_refiner() {
    let mut harness = Harness::new();
    let source = harness.source_image("sources");
    let (session, mut rx) = Session::new();
    let req = two_stage(0.0, source.clone());

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 1);
    assert_eq!(progress_count(&drain(&mut rx)), 1);
    assert_eq!(harness.recorder.denoiser_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        stored_image(&harness, &outcome.paths[0]),
        stored_image(&harness, &source)
    );
}

#[test]
fn standalone_refiner_runs_per_image() {
    let mut harness = Harness::new();
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        model: "sdxl-base".into(),
        steps: 10,
        image_count: 2,
        refiner: Some(RefinerParams {
            model: "sdxl-refiner".into(),
            cfg_scale: 4.0,
            high_noise_end: None,
            steps: Some(10),
            noise: Some(0.3),
        }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 2);
    assert_eq!(req.total_steps(), 10 + 2 * (3 + 1));
    assert_eq!(progress_count(&drain(&mut rx)) as u64, req.total_steps());
    assert_eq!(harness.recorder.denoiser_calls.load(Ordering::SeqCst), 10 + 2 * 3);
}

#[test]
fn single_controlnet_canny() {
    let mut harness = Harness::new();
    let reference = harness.source_image("sources");
    let (session, mut rx) = Session::new();
    let condition = ControlNetCondition {
        model: "control_v11p_sd15_canny".into(),
        source: reference,
        preprocessor: "canny".into(),
        params: BTreeMap::from([("low".to_string(), 100.0), ("high".to_string(), 200.0)]),
        scale: 1.0,
        guidance_start: 0.0,
        guidance_end: 1.0,
    };
    let req = ImageRequest {
        seed: 7,
        control_net: Some(ControlNetParams {
            conditions: vec![condition.clone()],
        }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 1);
    assert_eq!(progress_count(&drain(&mut rx)), 21);
    assert_eq!(harness.recorder.preprocessor_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.recorder.control_calls.load(Ordering::SeqCst), 20);
    let stored = stored_request(&harness, &outcome.paths[0]);
    assert_eq!(stored.conditions(), &[condition]);
}

#[test]
fn controlnet_span_limits_calls() {
    let mut harness = Harness::new();
    let reference = harness.source_image("sources");
    let req = ImageRequest {
        control_net: Some(ControlNetParams {
            conditions: vec![ControlNetCondition {
                model: "control_v11p_sd15_scribble".into(),
                source: reference,
                preprocessor: "none".into(),
                params: BTreeMap::new(),
                scale: 0.8,
                guidance_start: 0.0,
                guidance_end: 0.5,
            }],
        }),
        ..basic()
    };

    harness.worker.generate(&req, None).unwrap();

    assert_eq!(harness.recorder.control_calls.load(Ordering::SeqCst), 10);
    assert_eq!(harness.recorder.preprocessor_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn empty_condition_list_means_no_controlnet() {
    let mut harness = Harness::new();
    let req = ImageRequest {
        control_net: Some(ControlNetParams { conditions: vec![] }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, None).unwrap();

    assert_eq!(outcome.paths.len(), 1);
    assert_eq!(harness.recorder.loads_of("controlnet:"), 0);
    assert_eq!(harness.recorder.control_calls.load(Ordering::SeqCst), 0);
}

fn condition(model: &str, source: &str, preprocessor: &str) -> ControlNetCondition {
    ControlNetCondition {
        model: model.into(),
        source: source.into(),
        preprocessor: preprocessor.into(),
        params: BTreeMap::new(),
        scale: 1.0,
        guidance_start: 0.0,
        guidance_end: 1.0,
    }
}

fn loaded_control_nets(harness: &Harness) -> Vec<String> {
    harness
        .worker
        .cache()
        .control_nets()
        .iter()
        .map(|(name, _)| name.clone())
        .collect()
}

#[test]
fn multi_controlnet_follows_request_order() {
    let mut harness = Harness::new();
    let reference = harness.source_image("sources");
    let canny = condition("control_v11p_sd15_canny", &reference, "canny");
    let scribble = condition("control_v11p_sd15_scribble", &reference, "none");
    let with = |conditions: Vec<ControlNetCondition>| ImageRequest {
        control_net: Some(ControlNetParams { conditions }),
        ..basic()
    };

    harness.worker.generate(&with(vec![canny.clone(), scribble.clone()]), None).unwrap();
    assert_eq!(loaded_control_nets(&harness), ["control_v11p_sd15_canny", "control_v11p_sd15_scribble"]);
    assert_eq!(harness.recorder.control_calls.load(Ordering::SeqCst), 2 * 20);

    harness.worker.generate(&with(vec![scribble.clone(), canny]), None).unwrap();
    assert_eq!(loaded_control_nets(&harness), ["control_v11p_sd15_scribble", "control_v11p_sd15_canny"]);
    assert_eq!(harness.recorder.control_calls.load(Ordering::SeqCst), 4 * 20);
    assert_eq!(harness.recorder.loads_of("controlnet:"), 2);

    harness.worker.generate(&with(vec![scribble]), None).unwrap();
    assert_eq!(loaded_control_nets(&harness), ["control_v11p_sd15_scribble"]);
    assert_eq!(harness.recorder.control_calls.load(Ordering::SeqCst), 5 * 20);
    assert_eq!(harness.recorder.loads_of("controlnet:"), 2);
    assert_eq!(harness.recorder.loads_of("pipeline:"), 1);
}

#[test]
fn controlnet_load_failure_empties_the_cache() {
    let mut harness = Harness::new();
    let reference = harness.source_image("sources");
    let good = ImageRequest {
        control_net: Some(ControlNetParams {
            conditions: vec![condition("control_v11p_sd15_scribble", &reference, "none")],
        }),
        ..basic()
    };
    harness.worker.generate(&good, None).unwrap();
    assert!(!harness.worker.cache().is_empty());

    let broken = ImageRequest {
        control_net: Some(ControlNetParams {
            conditions: vec![
                condition("control_v11p_sd15_scribble", &reference, "none"),
                condition("broken-controlnet", &reference, "none"),
            ],
        }),
        ..basic()
    };
    assert_matches!(harness.worker.generate(&broken, None), Err(GenerationError::Resource(_)));
    assert!(harness.worker.cache().is_empty());
    assert!(loaded_control_nets(&harness).is_empty());

    harness.worker.generate(&good, None).unwrap();
    assert_eq!(harness.recorder.loads_of("pipeline:sd-1.5"), 2);
    assert_eq!(harness.recorder.loads_of("controlnet:control_v11p_sd15_scribble"), 2);
}

#[test]
fn alpha_channel_mask_ignores_luminance() {
    let mut harness = Harness::new();
    let source = harness.half_transparent_image("sources");
    let loader = harness.loader();
    let mut resolver = ConditioningResolver::new();
    let inpaint = |use_alpha_channel: bool| ImageRequest {
        inpaint: Some(InpaintParams {
            source: source.clone(),
            use_alpha_channel,
            invert_mask: false,
        }),
        ..basic()
    };

    let from_alpha = resolver.resolve(&loader, &harness.store, &inpaint(true)).unwrap();
    let mask = from_alpha.mask.unwrap();
    assert_eq!(mask.dimensions(), (SIZE, SIZE));
    assert!(mask.get_pixel(2, SIZE / 2)[0] >= 250);
    assert!(mask.get_pixel(SIZE - 3, SIZE / 2)[0] <= 5);

    let from_luminance = resolver.resolve(&loader, &harness.store, &inpaint(false)).unwrap();
    let mask = from_luminance.mask.unwrap();
    assert!(mask.get_pixel(SIZE - 3, SIZE / 2)[0] >= 250);

    let outcome = harness.worker.generate(&inpaint(true), None).unwrap();
    assert_eq!(outcome.paths.len(), 1, "{:?}", outcome.errors);
}

#[test]
fn inpainting_checkpoint_takes_mask_channels() {
    let mut harness = Harness::new();
    let source = harness.source_image("sources");
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        model: "sd-1.5-inpainting".into(),
        inpaint: Some(InpaintParams {
            source,
            use_alpha_channel: false,
            invert_mask: true,
        }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 1, "{:?}", outcome.errors);
    assert_eq!(progress_count(&drain(&mut rx)), 21);
}

#[test]
fn upscale_and_face_restoration() {
    let mut harness = Harness::new();
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        upscale: Some(UpscaleParams {
            factor: 2,
            denoising: 0.5,
            blend: 1.0,
        }),
        face: Some(FaceParams { blend: 0.75 }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 1);
    assert_eq!(progress_count(&drain(&mut rx)), 23);
    assert_eq!(stored_image(&harness, &outcome.paths[0]).dimensions(), (2 * SIZE, 2 * SIZE));
    let stored = stored_request(&harness, &outcome.paths[0]);
    assert_eq!(stored.upscale, req.upscale);
    assert_eq!(stored.face, req.face);
    assert_eq!(harness.recorder.loads_of("upscaler:"), 1);
    assert_eq!(harness.recorder.loads_of("face:2"), 1);
}

#[test]
fn high_res_pass_doubles_the_size() {
    let mut harness = Harness::new();
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        high_res: Some(HighResParams {
            factor: 2.0,
            steps: 10,
            cfg_scale: 4.0,
            noise: 0.5,
        }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(progress_count(&drain(&mut rx)), 20 + 5 + 1);
    assert_eq!(stored_image(&harness, &outcome.paths[0]).dimensions(), (2 * SIZE, 2 * SIZE));
    assert_eq!(harness.recorder.denoiser_calls.load(Ordering::SeqCst), 25);
}

#[test]
fn a_failing_post_stage_only_loses_its_image() {
    let mut harness = Harness::new();
    harness.recorder.face_failures.store(1, Ordering::SeqCst);
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        image_count: 2,
        face: Some(FaceParams { blend: 1.0 }),
        ..basic()
    };

    let outcome = harness.worker.generate(&req, Some(&*session)).unwrap();

    assert_eq!(outcome.paths.len(), 1);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].contains("No face detector output"), "{}", outcome.errors[0]);
    let frames = drain(&mut rx);
    let errors: Vec<_> = frames.iter().filter(|f| matches!(f, Frame::Error { .. })).collect();
    assert_eq!(errors.len(), 1);
    // 20 steps, then face + save for the surviving image only
    assert_eq!(progress_count(&frames), 22);
    assert_eq!(harness.files("outputs").len(), 1);
}

#[test]
fn cancellation_stops_without_writing() {
    let mut harness = Harness::new();
    harness.recorder.step_delay_ms.store(5, Ordering::SeqCst);
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        steps: 50,
        image_count: 4,
        ..basic()
    };

    let worker = &mut harness.worker;
    let outcome = std::thread::scope(|scope| {
        let running = scope.spawn(|| worker.generate(&req, Some(&*session)));
        let mut seen = 0;
        while seen < 10 {
            let frame = Frame::decode(&rx.blocking_recv().unwrap()).unwrap();
            if matches!(frame, Frame::Progress { .. }) {
                seen += 1;
            }
        }
        session.request_cancel();
        running.join().unwrap()
    })
    .unwrap();

    assert!(outcome.paths.is_empty());
    assert!(outcome.errors.is_empty());
    assert!(harness.files("outputs").is_empty());
    assert!(!session.take_cancel());
    let remaining = drain(&mut rx);
    assert!(progress_count(&remaining) < 40);
    assert!(image_frames(&remaining).is_empty());

    // The cache survives a cancel and the next request runs normally
    let outcome = harness.worker.generate(&basic(), None).unwrap();
    assert_eq!(outcome.paths.len(), 1);
    assert_eq!(harness.recorder.loads_of("pipeline:"), 1);
}

#[test]
fn configuration_errors_fail_before_loading() {
    let mut harness = Harness::new();

    let unknown_model = ImageRequest {
        model: "sd-9".into(),
        ..basic()
    };
    assert_matches!(harness.worker.generate(&unknown_model, None), Err(GenerationError::Configuration(_)));

    let unknown_scheduler = ImageRequest {
        scheduler: "heun".into(),
        ..basic()
    };
    assert_matches!(
        harness.worker.generate(&unknown_scheduler, None),
        Err(GenerationError::Configuration(_))
    );

    let wrong_family = ImageRequest {
        model: "sd-2.1".into(),
        control_net: Some(ControlNetParams {
            conditions: vec![ControlNetCondition {
                model: "control_v11p_sd15_canny".into(),
                source: "sources/ref.png".into(),
                preprocessor: "canny".into(),
                params: BTreeMap::new(),
                scale: 1.0,
                guidance_start: 0.0,
                guidance_end: 1.0,
            }],
        }),
        ..basic()
    };
    assert_matches!(harness.worker.generate(&wrong_family, None), Err(GenerationError::Configuration(_)));

    let two_xl_loras = ImageRequest {
        model: "sdxl-base".into(),
        lora: Some(LoraParams {
            entries: vec![
                LoraEntry {
                    model: "xl-style".into(),
                    weight: 1.0,
                },
                LoraEntry {
                    model: "xl-detail".into(),
                    weight: 0.5,
                },
            ],
        }),
        ..basic()
    };
    assert_matches!(harness.worker.generate(&two_xl_loras, None), Err(GenerationError::Configuration(_)));

    assert!(harness.recorder.loads.lock().unwrap().is_empty());
    assert!(harness.files("outputs").is_empty());
}

#[test]
fn missing_source_image_is_a_configuration_error() {
    let mut harness = Harness::new();
    let req = ImageRequest {
        img2img: Some(Img2ImgParams {
            source: "sources/missing.png".into(),
            noise: 0.5,
        }),
        ..basic()
    };

    assert_matches!(harness.worker.generate(&req, None), Err(GenerationError::Configuration(_)));
    assert!(harness.files("outputs").is_empty());
}

#[test]
fn resource_errors_empty_the_cache() {
    let mut harness = Harness::new();
    harness.worker.generate(&basic(), None).unwrap();
    assert!(!harness.worker.cache().is_empty());

    let broken = ImageRequest {
        model: "broken-1.5".into(),
        ..basic()
    };
    assert_matches!(harness.worker.generate(&broken, None), Err(GenerationError::Resource(_)));
    assert!(harness.worker.cache().is_empty());

    harness.worker.generate(&basic(), None).unwrap();
    assert_eq!(harness.recorder.loads_of("pipeline:sd-1.5"), 2);
}

#[test]
fn cache_reuses_matching_pipelines() {
    let mut harness = Harness::new();
    harness.worker.generate(&basic(), None).unwrap();
    let other_scheduler = ImageRequest {
        scheduler: "dpm++_2m_k".into(),
        seed: 2,
        ..basic()
    };
    harness.worker.generate(&other_scheduler, None).unwrap();
    assert_eq!(harness.recorder.loads_of("pipeline:"), 1);
    assert_eq!(
        harness.worker.cache().base().and_then(|b| b.scheduler_id()),
        Some("dpm++_2m_k")
    );

    let other_model = ImageRequest {
        model: "sd-2.1".into(),
        ..basic()
    };
    harness.worker.generate(&other_model, None).unwrap();
    assert_eq!(harness.recorder.loads_of("pipeline:"), 2);
    assert_eq!(harness.worker.cache().base().map(|b| b.model_id.as_str()), Some("sd-2.1"));
}

#[test]
fn loras_are_applied_once_and_reverted() {
    let mut harness = Harness::new();
    let with_lora = ImageRequest {
        lora: Some(LoraParams {
            entries: vec![LoraEntry {
                model: "pixel-style".into(),
                weight: 0.8,
            }],
        }),
        ..basic()
    };

    harness.worker.generate(&with_lora, None).unwrap();
    harness.worker.generate(&with_lora, None).unwrap();
    assert_eq!(harness.recorder.loads_of("lora:"), 1);
    assert_eq!(*harness.recorder.patches.lock().unwrap(), vec![(PatchTarget::Unet, 1)]);

    harness.worker.generate(&basic(), None).unwrap();
    assert_eq!(
        *harness.recorder.patches.lock().unwrap(),
        vec![(PatchTarget::Unet, 1), (PatchTarget::Unet, 0)]
    );
    assert!(harness
        .worker
        .cache()
        .base()
        .map(|b| b.applied_loras().is_empty())
        .unwrap_or(false));
    assert_eq!(harness.recorder.loads_of("pipeline:"), 1);
}

#[test]
fn failed_lora_patch_unloads_the_base() {
    let mut harness = Harness::new();
    let with = |model: &str| ImageRequest {
        lora: Some(LoraParams {
            entries: vec![LoraEntry {
                model: model.into(),
                weight: 1.0,
            }],
        }),
        ..basic()
    };
    harness.worker.generate(&with("pixel-style"), None).unwrap();

    *harness.recorder.patches_before_failure.lock().unwrap() = Some(0);
    assert_matches!(
        harness.worker.generate(&with("ink-style"), None),
        Err(GenerationError::Runtime(_))
    );
    assert!(harness.worker.cache().base().is_none());

    *harness.recorder.patches_before_failure.lock().unwrap() = None;
    harness.worker.generate(&basic(), None).unwrap();
    assert_eq!(harness.recorder.loads_of("pipeline:sd-1.5"), 2);
    assert_eq!(*harness.recorder.patches.lock().unwrap(), vec![(PatchTarget::Unet, 1)]);
    assert!(harness
        .worker
        .cache()
        .base()
        .is_some_and(|b| b.applied_loras().is_empty()));
}

#[test]
fn same_seed_gives_identical_images() {
    let mut harness = Harness::new();
    let req = ImageRequest {
        image_count: 2,
        ..basic()
    };
    let first = harness.worker.generate(&req, None).unwrap();
    let second = harness.worker.generate(&req, None).unwrap();

    for (a, b) in first.paths.iter().zip(&second.paths) {
        assert_ne!(a, b);
        assert_eq!(stored_image(&harness, a), stored_image(&harness, b));
    }
}

#[test]
fn previews_are_sent_at_output_size() {
    let mut harness = Harness::new();
    let (session, mut rx) = Session::new();
    let req = ImageRequest {
        preview: Preview::TinyVae,
        steps: 5,
        upscale: Some(UpscaleParams {
            factor: 2,
            denoising: 0.75,
            blend: 0.75,
        }),
        ..basic()
    };

    harness.worker.generate(&req, Some(&*session)).unwrap();

    let frames = drain(&mut rx);
    assert_eq!(progress_count(&frames), 5 + 2);
    let images = image_frames(&frames);
    assert_eq!(images.len(), 5 + 1);
    let preview = image::load_from_memory(images[0]).unwrap();
    assert_eq!((preview.width(), preview.height()), (2 * SIZE, 2 * SIZE));
    assert_eq!(harness.recorder.loads_of("preview:sd-1"), 1);

    // Latent previews need no decoder; the warm one is released
    let latent = ImageRequest {
        preview: Preview::Latent,
        steps: 5,
        ..basic()
    };
    harness.worker.generate(&latent, Some(&*session)).unwrap();
    assert_eq!(image_frames(&drain(&mut rx)).len(), 5 + 1);
    assert!(harness.worker.cache().preview_decoder().is_none());
}

#[test]
fn preprocessor_run_saves_a_plain_image() {
    let mut harness = Harness::new();
    let source = harness.source_image("sources");
    let req = ProcessRequest {
        user: "default".into(),
        collection: "processed".into(),
        source,
        processor: "canny".into(),
        params: BTreeMap::new(),
    };

    let path = harness.worker.process(&req).unwrap();
    let again = harness.worker.process(&req).unwrap();

    assert!(path.starts_with("processed/00001."));
    assert_ne!(path, again);
    assert_eq!(harness.recorder.loads_of("preprocessor:"), 1);
    assert_eq!(harness.recorder.preprocessor_calls.load(Ordering::SeqCst), 2);
    let bytes = std::fs::read(harness.store.image_path("default", &path).unwrap()).unwrap();
    assert!(!metadata::read_text_chunks(&bytes).unwrap().contains_key(METADATA_KEY));

    let unknown = ProcessRequest {
        processor: "depth_zoe".into(),
        ..req
    };
    assert_matches!(harness.worker.process(&unknown), Err(GenerationError::Configuration(_)));
}
