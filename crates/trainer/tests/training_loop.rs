use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use tch::{Device, Kind, Tensor};
use vqa_core::{Batch, ModelConfig, ModelKind};
use vqa_trainer::metrics::{MetricsSink, ScalarRecord};
use vqa_trainer::optim::{group_parameters, no_decay, BertAdam, Optimizer};
use vqa_trainer::replica::{
    BackwardSpec, Collective, DistributedCoordinator, LocalGroup, ReplicatedCoordinator,
    SingleDevice,
};
use vqa_trainer::{
    evaluate, load_checkpoint, DataLoader, DataSource, FeatureDataset, ModelHandle,
    Phase, PrecisionMode, PrecisionPolicy, ReplicaCoordinator, TrainError, Trainer,
    TrainingConfig,
};

const LABELS: i64 = 5;

fn tiny_model() -> ModelConfig {
    ModelConfig {
        hidden_size: 8,
        num_heads: 2,
        text_layers: 1,
        visual_layers: 1,
        vocab_size: 50,
        max_position_embeddings: 8,
        v_feature_size: 4,
        dropout: 0.0,
        ..ModelConfig::default()
    }
}

fn synthetic_batch(n: i64, seed: i64) -> Batch {
    batch_with_labels(n, seed, LABELS)
}

fn batch_with_labels(n: i64, seed: i64, labels: i64) -> Batch {
    tch::manual_seed(seed);
    let opts = (Kind::Float, Device::Cpu);
    let ints = (Kind::Int64, Device::Cpu);
    let answers = Tensor::randint(labels, [n, 1], ints);
    let target = Tensor::zeros([n, labels], opts).scatter_value(1, &answers, 1.0);
    Batch::from_fields([
        Tensor::randn([n, 3, 4], opts),
        Tensor::rand([n, 3, 5], opts),
        Tensor::ones([n, 3], ints),
        Tensor::randint(50, [n, 4], ints),
        target,
        Tensor::ones([n, 4], ints),
        Tensor::zeros([n, 4], ints),
        Tensor::arange(n, ints),
    ])
}

fn source(n: i64, seed: i64) -> Arc<dyn DataSource> {
    Arc::new(FeatureDataset::from_batch(synthetic_batch(n, seed)).unwrap())
}

fn config(root: &Path) -> TrainingConfig {
    TrainingConfig {
        run_name: "loop".to_string(),
        output_dir: root.join("save"),
        log_dir: root.join("logs"),
        batch_size: 4,
        gradient_accumulation_steps: 2,
        epochs: 2,
        learning_rate: 1e-3,
        log_every: 1,
        num_workers: 0,
        ..TrainingConfig::default()
    }
}

fn single(seed: i64) -> Box<dyn ReplicaCoordinator> {
    tch::manual_seed(seed);
    let model = ModelHandle::new(Device::Cpu, ModelKind::TwoStream, &tiny_model(), LABELS);
    Box::new(SingleDevice::new(model))
}

fn snapshot(vs: &tch::nn::VarStore) -> HashMap<String, Tensor> {
    vs.variables()
        .into_iter()
        .map(|(name, t)| (name, t.detach().copy()))
        .collect()
}

fn gradients(vs: &tch::nn::VarStore) -> HashMap<String, Tensor> {
    vs.variables()
        .into_iter()
        .filter(|(_, t)| t.grad().defined())
        .map(|(name, t)| (name, t.grad().copy()))
        .collect()
}

/// Two single-device coordinators starting from the same parameters.
fn twins(seed: i64) -> (Box<dyn ReplicaCoordinator>, Box<dyn ReplicaCoordinator>) {
    tch::manual_seed(seed);
    let a = ModelHandle::new(Device::Cpu, ModelKind::TwoStream, &tiny_model(), LABELS);
    let mut b = ModelHandle::new(Device::Cpu, ModelKind::TwoStream, &tiny_model(), LABELS);
    b.vs.copy(&a.vs).unwrap();
    (Box::new(SingleDevice::new(a)), Box::new(SingleDevice::new(b)))
}

/// Keeps every scalar the loop emits.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<ScalarRecord>>>);

impl Recorder {
    fn series(&self, name: &str) -> Vec<ScalarRecord> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.series == name)
            .cloned()
            .collect()
    }
}

impl MetricsSink for Recorder {
    fn line_plot(&mut self, step: u64, value: f64, series: &str, split: &str) {
        self.0.lock().unwrap().push(ScalarRecord {
            step,
            value,
            series: series.to_string(),
            split: split.to_string(),
        });
    }
}

#[test]
fn loop_writes_one_checkpoint_per_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let mut trainer = Trainer::new(
        config(dir.path()),
        tiny_model(),
        single(0),
        source(10, 1),
        source(6, 2),
    )
    .unwrap()
    .with_sink(Box::new(recorder.clone()));

    let summaries = trainer.run().unwrap();
    assert_eq!(summaries.len(), 2);

    // 10 examples in micro-batches of 2 is 5 micro-batches; two fire per epoch.
    assert!(summaries.iter().all(|s| s.steps == 2));
    assert_eq!(trainer.state().global_step, 4);
    assert_eq!(trainer.total_steps(), 4);
    assert_eq!(trainer.phase(), Phase::Done);

    let run_dir = dir.path().join("save").join("loop");
    assert!(run_dir.join("command.txt").exists());
    assert!(run_dir.join("model_epoch_0.safetensors").exists());
    assert!(run_dir.join("model_epoch_1.safetensors").exists());
    assert_eq!(
        summaries[1].checkpoint.as_deref(),
        Some(trainer.checkpoints().path_for(1).as_path())
    );

    // Micro-batch losses are keyed by iteration, not by optimizer step.
    let losses = recorder.series("loss");
    let iterations: Vec<u64> = losses.iter().map(|r| r.step).collect();
    assert_eq!(iterations, (0..10).collect::<Vec<u64>>());
    for (s, epoch_losses) in summaries.iter().zip(losses.chunks(5)) {
        let expected: f64 = epoch_losses.iter().map(|r| r.value * 2.0).sum();
        assert!((s.total_loss - expected).abs() < 1e-9);
    }

    for s in &summaries {
        assert!(s.total_loss.is_finite());
        assert!((0.0..=100.0).contains(&s.train_score));
        assert!((0.0..=1.0).contains(&s.eval.score));
        assert!((s.eval.upper_bound - 1.0).abs() < 1e-6);
    }
}

#[test]
fn checkpoint_round_trip_reproduces_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::new(
        TrainingConfig {
            epochs: 1,
            ..config(dir.path())
        },
        tiny_model(),
        single(3),
        source(8, 4),
        source(4, 5),
    )
    .unwrap();
    let summaries = trainer.run().unwrap();
    let path = summaries[0].checkpoint.clone().unwrap();

    tch::manual_seed(99);
    let mut restored = ModelHandle::new(Device::Cpu, ModelKind::TwoStream, &tiny_model(), LABELS);
    let report = load_checkpoint(&mut restored.vs, &path).unwrap();
    assert!(report.missing.is_empty());
    assert!(report.unexpected.is_empty());

    let batch = synthetic_batch(3, 6);
    let expected = tch::no_grad(|| trainer.coordinator().forward(&batch).unwrap());
    let actual = tch::no_grad(|| restored.logits(&batch, false, false));
    assert!(expected.allclose(&actual, 1e-6, 1e-6, false));
}

#[test]
fn evaluation_is_idempotent_and_leaves_parameters_alone() {
    let mut coordinator = single(7);
    coordinator.set_training(false);
    let loader = DataLoader::new(source(9, 8), 4);
    let before = snapshot(coordinator.var_store());

    let first = evaluate(coordinator.as_ref(), &loader).unwrap();
    let second = evaluate(coordinator.as_ref(), &loader).unwrap();
    assert_eq!(first, second);

    for (name, value) in coordinator.var_store().variables() {
        assert!(value.equal(&before[&name]), "{} changed", name);
    }
}

#[test]
fn replicated_and_chunked_gradients_match_single_device() {
    let batch = synthetic_batch(7, 10);
    let spec = BackwardSpec::default();

    let mut reference = single(11);
    reference.forward_backward(&batch, &spec).unwrap();
    reference.synchronize_gradients().unwrap();
    let expected = gradients(reference.var_store());

    for chunk_size in [None, Some(2)] {
        let mut replicas = (0..3)
            .map(|i| {
                tch::manual_seed(100 + i);
                ModelHandle::new(Device::Cpu, ModelKind::TwoStream, &tiny_model(), LABELS)
            })
            .collect::<Vec<_>>();
        replicas[0].vs.copy(reference.var_store()).unwrap();

        let mut coordinator = ReplicatedCoordinator::new(replicas, chunk_size).unwrap();
        let out = coordinator.forward_backward(&batch, &spec).unwrap();
        coordinator.synchronize_gradients().unwrap();
        assert_eq!(out.examples, 7);

        let actual = gradients(coordinator.var_store());
        assert_eq!(actual.len(), expected.len());
        for (name, grad) in actual {
            assert!(
                grad.allclose(&expected[&name], 1e-5, 1e-6, false),
                "gradient of {} differs with chunk size {:?}",
                name,
                chunk_size
            );
        }
    }
}

#[test]
fn distributed_replicas_stay_identical_after_a_step() {
    let handles: Vec<_> = LocalGroup::new(2)
        .into_iter()
        .map(|group| {
            thread::spawn(move || {
                let rank = group.rank();
                tch::manual_seed(rank as i64 + 20);
                let model = ModelHandle::new(Device::Cpu, ModelKind::TwoStream, &tiny_model(), LABELS);
                let mut coordinator = DistributedCoordinator::new(model, Box::new(group)).unwrap();
                let mut optimizer = BertAdam::new(group_parameters(
                    coordinator.var_store(),
                    no_decay,
                    |_| 1e-2,
                    0.01,
                ));

                let batch = synthetic_batch(4, 30 + rank as i64);
                coordinator
                    .forward_backward(&batch, &BackwardSpec::default())
                    .unwrap();
                coordinator.synchronize_gradients().unwrap();
                optimizer.step().unwrap();
                coordinator.discard_gradients();

                let mut params: Vec<(String, Vec<f32>)> = coordinator
                    .var_store()
                    .variables()
                    .into_iter()
                    .map(|(name, t)| (name, Vec::<f32>::try_from(&t.flatten(0, -1)).unwrap()))
                    .collect();
                params.sort_by(|a, b| a.0.cmp(&b.0));
                params
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results[0], results[1]);
}

#[test]
fn overflowing_steps_leave_parameters_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = single(40);
    let before = snapshot(coordinator.var_store());

    let mut trainer = Trainer::new(
        TrainingConfig {
            epochs: 1,
            ..config(dir.path())
        },
        tiny_model(),
        coordinator,
        source(8, 41),
        source(4, 42),
    )
    .unwrap()
    .with_precision(PrecisionPolicy::dynamic(f64::MAX, 2.0, 1000));

    let summaries = trainer.run().unwrap();
    assert_eq!(summaries[0].steps, 2);
    assert_eq!(summaries[0].skipped_steps, 2);
    assert!(trainer.precision().loss_scale() < f64::MAX);

    for (name, value) in trainer.coordinator().var_store().variables() {
        assert!(value.equal(&before[&name]), "{} changed on a skipped step", name);
    }
}

#[test]
fn zero_accumulation_steps_are_rejected_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let result = Trainer::new(
        TrainingConfig {
            gradient_accumulation_steps: 0,
            ..config(dir.path())
        },
        tiny_model(),
        single(0),
        source(4, 0),
        source(4, 0),
    );
    assert!(matches!(result, Err(TrainError::Config(_))));
    assert!(!dir.path().join("save").exists());
}

#[test]
fn accumulated_micro_batches_match_one_large_batch() {
    let batch = synthetic_batch(6, 50);
    let mut coordinator = single(51);

    coordinator.forward_backward(&batch, &BackwardSpec::default()).unwrap();
    let expected = gradients(coordinator.var_store());
    coordinator.discard_gradients();

    let spec = BackwardSpec {
        loss_divisor: 2.0,
        ..BackwardSpec::default()
    };
    for piece in batch.chunks(3) {
        coordinator.forward_backward(&piece, &spec).unwrap();
    }

    let actual = gradients(coordinator.var_store());
    assert_eq!(actual.len(), expected.len());
    for (name, grad) in actual {
        assert!(
            grad.allclose(&expected[&name], 1e-5, 1e-6, false),
            "accumulated gradient of {} differs",
            name
        );
    }
}

#[test]
fn learning_rate_changes_only_when_a_step_fires() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let mut trainer = Trainer::new(
        config(dir.path()),
        tiny_model(),
        single(55),
        source(10, 56),
        source(4, 57),
    )
    .unwrap()
    .with_sink(Box::new(recorder.clone()));
    trainer.run().unwrap();

    // One rate per logical step; the trailing accumulate-only micro-batch of
    // the last epoch would have pushed the decayed rate to zero.
    let rates = recorder.series("learning_rate");
    assert_eq!(rates.len() as u64, trainer.state().global_step);
    let steps: Vec<u64> = rates.iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![0, 1, 2, 3]);

    let last = rates.last().unwrap().value;
    assert!(last > 0.0);
    for group in trainer.optimizer().groups() {
        assert_eq!(group.lr, last);
    }
}

#[test]
fn static_loss_scale_is_removed_before_the_update() {
    let dir = tempfile::tempdir().unwrap();
    let (full, scaled) = twins(60);
    let train = source(8, 61);
    let eval = source(4, 62);

    let run = |name: &str, coordinator: Box<dyn ReplicaCoordinator>, precision: Option<PrecisionPolicy>| {
        let recorder = Recorder::default();
        let mut trainer = Trainer::new(
            TrainingConfig {
                run_name: name.to_string(),
                epochs: 1,
                ..config(dir.path())
            },
            tiny_model(),
            coordinator,
            Arc::clone(&train),
            Arc::clone(&eval),
        )
        .unwrap()
        .with_sink(Box::new(recorder.clone()));
        if let Some(precision) = precision {
            trainer = trainer.with_precision(precision);
        }
        trainer.run().unwrap();
        (snapshot(trainer.coordinator().var_store()), recorder.series("grad_norm"))
    };

    let (full_params, full_norms) = run("full", full, None);
    let (scaled_params, scaled_norms) = run(
        "scaled",
        scaled,
        Some(PrecisionPolicy::new(PrecisionMode::ReducedStatic { scale: 1024.0 })),
    );

    assert_eq!(full_norms.len(), 2);
    assert_eq!(scaled_norms.len(), 2);
    for (a, b) in full_norms.iter().zip(&scaled_norms) {
        assert!((a.value - b.value).abs() <= 1e-4 * a.value.max(1e-12));
    }
    for (name, value) in &full_params {
        assert!(
            value.allclose(&scaled_params[name], 1e-4, 1e-6, false),
            "{} diverged under a static loss scale",
            name
        );
    }
}

#[test]
fn splits_with_different_label_counts_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let narrow: Arc<dyn DataSource> =
        Arc::new(FeatureDataset::from_batch(batch_with_labels(4, 70, 4)).unwrap());
    let result = Trainer::new(config(dir.path()), tiny_model(), single(0), source(4, 71), narrow);
    assert!(matches!(result, Err(TrainError::Data(_))));
}

#[test]
fn mismatched_batches_fail_with_step_context() {
    let dir = tempfile::tempdir().unwrap();
    let narrow = |seed| -> Arc<dyn DataSource> {
        Arc::new(FeatureDataset::from_batch(batch_with_labels(4, seed, 4)).unwrap())
    };
    let mut trainer = Trainer::new(config(dir.path()), tiny_model(), single(72), narrow(73), narrow(74)).unwrap();

    match trainer.run() {
        Err(TrainError::Step { epoch, step, source }) => {
            assert_eq!((epoch, step), (0, 0));
            assert!(matches!(*source, TrainError::Data(_)), "{}", source);
        }
        other => panic!("expected a step error, got {:?}", other),
    }

    let coordinator = single(75);
    let mut wide = synthetic_batch(2, 76);
    wide.features = Tensor::randn([2, 3, 6], (Kind::Float, Device::Cpu));
    assert!(matches!(coordinator.forward(&wide), Err(TrainError::Data(_))));
}

#[test]
fn ranks_without_gradients_still_join_the_reduction() {
    let handles: Vec<_> = LocalGroup::new(2)
        .into_iter()
        .map(|group| {
            thread::spawn(move || {
                let rank = group.rank();
                tch::manual_seed(80);
                let model = ModelHandle::new(Device::Cpu, ModelKind::TwoStream, &tiny_model(), LABELS);
                let mut coordinator = DistributedCoordinator::new(model, Box::new(group)).unwrap();
                if rank == 0 {
                    coordinator
                        .forward_backward(&synthetic_batch(4, 81), &BackwardSpec::default())
                        .unwrap();
                }
                coordinator.synchronize_gradients().unwrap();

                let mut grads: Vec<(String, Vec<f32>)> = gradients(coordinator.var_store())
                    .into_iter()
                    .map(|(name, g)| (name, Vec::<f32>::try_from(&g.flatten(0, -1)).unwrap()))
                    .collect();
                grads.sort_by(|a, b| a.0.cmp(&b.0));
                grads
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(!results[0].is_empty());
    assert_eq!(results[0], results[1]);
    assert!(results[1].iter().any(|(_, g)| g.iter().any(|v| *v != 0.0)));
}
