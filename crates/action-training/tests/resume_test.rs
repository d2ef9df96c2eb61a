//! Restoring a checkpoint and saving it again without training must not
//! change what the next optimisation step does.

use action_core::{Architecture, LocalCollective, Role, RunConfig};
use action_dataset::{ClipMeta, VideoBatch};
use action_training::checkpoint::{CheckpointHeader, TrainingCheckpoint};
use action_training::lr_schedule::MultiStepLr;
use action_training::model::{BackboneConfig, VideoClassifier};
use action_training::optim::build_optimizer;
use action_training::trainer::train_one_epoch;
use action_training::StateDict;
use burn::backend::Autodiff;
use burn::tensor::{Int, Tensor, TensorData};
use burn_ndarray::NdArray;
use tempfile::TempDir;

type TestBackend = Autodiff<NdArray<f32>>;

const LR: f64 = 0.05;

fn run_config() -> RunConfig {
    let mut config = RunConfig::default();
    config.data.num_frames = 2;
    config.data.train_jitter_scales = [16, 16];
    config.data.train_crop_size = 16;
    config.data.test_crop_size = 16;
    config.model.num_classes = 3;
    config.model.embed_dim = Some(8);
    config.model.depth = Some(1);
    config.model.num_heads = Some(2);
    // deterministic forward passes
    config.model.drop_path_rate = 0.0;
    config.model.dropout_rate = 0.0;
    config
}

fn new_model(config: &RunConfig) -> VideoClassifier<TestBackend> {
    let backbone = BackboneConfig::for_architecture(Architecture::VitTiny, config, 8).unwrap();
    VideoClassifier::new(&backbone, &Default::default())
}

fn batch() -> VideoBatch<TestBackend> {
    let device = Default::default();
    let n = 2;
    let numel = n * 3 * 2 * 16 * 16;
    let clips: Vec<f32> = (0..numel).map(|i| ((i * 37 % 101) as f32 / 50.0) - 1.0).collect();
    let labels = vec![0usize, 2];

    VideoBatch {
        clips: Tensor::from_data(TensorData::new(clips, [n, 3, 2, 16, 16]), &device),
        targets: Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![0i64, 2], [n]), &device),
        labels,
        sample_indices: vec![0, 1],
        metas: vec![ClipMeta::default(); n],
    }
}

fn header(epoch: usize) -> CheckpointHeader {
    let mut scheduler = MultiStepLr::new(LR, vec![10, 13], 0.1).unwrap();
    scheduler.set_epoch(epoch);
    CheckpointHeader::new(epoch, 12.5, scheduler, Architecture::VitTiny, 3)
}

fn assert_close(a: &StateDict, b: &StateDict) {
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    for (name, left) in a.iter() {
        let right = b.get(name).unwrap();
        assert_eq!(left.shape, right.shape, "{name}");
        for (x, y) in left.values.iter().zip(&right.values) {
            assert!((x - y).abs() < 1e-6, "{name}: {x} vs {y}");
        }
    }
}

#[test]
fn restore_then_save_keeps_training_identical() {
    let config = run_config();
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();

    // one step so the momentum buffers are populated
    let mut optimizer = build_optimizer::<TestBackend, VideoClassifier<TestBackend>>(&config.solver);
    let (model, _) = train_one_epoch(
        new_model(&config),
        &mut optimizer,
        vec![batch()],
        1,
        0,
        LR,
        &LocalCollective,
    )
    .unwrap();
    TrainingCheckpoint::new(first.path())
        .save::<TestBackend, _, _>(Role::Coordinator, &model, &optimizer, &header(1))
        .unwrap();

    // restore, then save again with zero steps
    let restored = TrainingCheckpoint::new(first.path())
        .restore::<TestBackend, _, _>(
            new_model(&config),
            build_optimizer::<TestBackend, VideoClassifier<TestBackend>>(&config.solver),
            &Default::default(),
        )
        .unwrap();
    let restored_header = restored.header.unwrap();
    assert_eq!(restored_header.epoch, 1);
    assert_eq!(restored_header.scheduler.last_epoch(), 1);
    TrainingCheckpoint::new(second.path())
        .save::<TestBackend, _, _>(Role::Coordinator, &restored.model, &restored.optimizer, &restored_header)
        .unwrap();

    let copy = TrainingCheckpoint::new(second.path())
        .restore::<TestBackend, _, _>(
            new_model(&config),
            build_optimizer::<TestBackend, VideoClassifier<TestBackend>>(&config.solver),
            &Default::default(),
        )
        .unwrap();
    assert_eq!(copy.header.unwrap().scheduler, restored_header.scheduler);
    assert_close(&copy.model.state_dict().unwrap(), &model.state_dict().unwrap());

    // continue one step from both copies
    let mut optimizer_a = restored.optimizer;
    let (continued_a, _) = train_one_epoch(
        restored.model,
        &mut optimizer_a,
        vec![batch()],
        1,
        1,
        LR,
        &LocalCollective,
    )
    .unwrap();
    let mut optimizer_b = copy.optimizer;
    let (continued_b, _) =
        train_one_epoch(copy.model, &mut optimizer_b, vec![batch()], 1, 1, LR, &LocalCollective).unwrap();

    let after_a = continued_a.state_dict().unwrap();
    assert_close(&after_a, &continued_b.state_dict().unwrap());
    // and the step actually moved the weights
    assert_ne!(after_a, model.state_dict().unwrap());
}

#[test]
fn momentum_survives_restore() {
    let config = run_config();
    let dir = TempDir::new().unwrap();

    let mut optimizer = build_optimizer::<TestBackend, VideoClassifier<TestBackend>>(&config.solver);
    let (model, _) = train_one_epoch(
        new_model(&config),
        &mut optimizer,
        vec![batch()],
        1,
        0,
        LR,
        &LocalCollective,
    )
    .unwrap();
    TrainingCheckpoint::new(dir.path())
        .save::<TestBackend, _, _>(Role::Coordinator, &model, &optimizer, &header(1))
        .unwrap();

    let restored = TrainingCheckpoint::new(dir.path())
        .restore::<TestBackend, _, _>(
            new_model(&config),
            build_optimizer::<TestBackend, VideoClassifier<TestBackend>>(&config.solver),
            &Default::default(),
        )
        .unwrap();
    assert!(restored.header.is_some());

    // same weights, but a fresh optimizer has no velocity to carry over
    let mut fresh = build_optimizer::<TestBackend, VideoClassifier<TestBackend>>(&config.solver);
    let (without_momentum, _) =
        train_one_epoch(restored.model.clone(), &mut fresh, vec![batch()], 1, 1, LR, &LocalCollective).unwrap();
    let mut resumed = restored.optimizer;
    let (with_momentum, _) =
        train_one_epoch(restored.model, &mut resumed, vec![batch()], 1, 1, LR, &LocalCollective).unwrap();

    assert_ne!(
        with_momentum.state_dict().unwrap(),
        without_momentum.state_dict().unwrap()
    );
}
