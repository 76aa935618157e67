use std::num::NonZeroUsize;

use comms::{Hub, HubBackend};
use futures::future;
use ndarray::{ArrayD, arr1};
use onebit_lamb::{LambConfig, OnebitLamb, Parameter, Phase};

const STEPS: usize = 12;

fn config(rank: usize) -> LambConfig {
    LambConfig {
        lr: 0.01,
        freeze_step: 5,
        coeff_beta: 0.5,
        weight_decay: 0.001,
        local_rank: rank,
        ..Default::default()
    }
}

fn optimizer(backend: HubBackend) -> OnebitLamb<HubBackend> {
    let config = config(backend.rank());
    let groups = vec![
        config.group(vec![
            Parameter::new(arr1(&[0.5, -0.25, 1., 0.75, -1.5]).into_dyn()),
            Parameter::new(arr1(&[2., -2., 0.1]).into_dyn()),
        ]),
        config.group(vec![Parameter::new(arr1(&[0.3, 0.3]).into_dyn())]),
    ];

    OnebitLamb::new(groups, config, backend).unwrap()
}

fn gradient(len: usize, rank: usize, t: usize) -> ArrayD<f32> {
    ArrayD::from_shape_fn(ndarray::IxDyn(&[len]), |i| {
        let x = (t * 7 + rank * 3 + i[0]) as f32;
        0.1 * x.sin()
    })
}

/// Trains one rank, averaging raw gradients while the training loop's all-reduce is on.
async fn train(mut opt: OnebitLamb<HubBackend>, world_size: usize) -> (OnebitLamb<HubBackend>, Vec<Phase>) {
    let rank = opt.backend().rank();
    let switch = opt.backward_allreduce();
    let mut phases = Vec::with_capacity(STEPS);

    for t in 0..STEPS {
        for (i, j, len) in [(0, 0, 5), (0, 1, 3), (1, 0, 2)] {
            let grad = if switch.enabled() {
                (0..world_size)
                    .map(|r| gradient(len, r, t))
                    .reduce(|a, b| a + b)
                    .map(|sum| sum / world_size as f32)
            } else {
                Some(gradient(len, rank, t))
            };

            if let Some(grad) = grad {
                opt.param_mut(i, j).set_grad(grad);
            }
        }

        opt.step(None).await.unwrap();
        phases.push(opt.phase());
    }

    (opt, phases)
}

async fn run(world_size: usize) -> Vec<(OnebitLamb<HubBackend>, Vec<Phase>)> {
    let backends = Hub::new(NonZeroUsize::new(world_size).unwrap());
    let handles = backends
        .into_iter()
        .map(|backend| tokio::spawn(train(optimizer(backend), world_size)));

    future::join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect()
}

#[tokio::test]
async fn ranks_stay_in_lockstep() {
    for world_size in [2, 3] {
        let ranks = run(world_size).await;
        let (first, first_phases) = &ranks[0];

        assert_eq!(first.phase(), Phase::Compression);
        assert_eq!(first_phases.iter().filter(|p| **p == Phase::Warmup).count(), 4);

        for (opt, phases) in &ranks[1..] {
            assert_eq!(phases, first_phases);
            assert_eq!(opt.scaling_coeffs(), first.scaling_coeffs());

            for (a, b) in opt.groups().iter().zip(first.groups()) {
                for (p, q) in a.params.iter().zip(&b.params) {
                    assert_eq!(p.data, q.data);
                }
            }
        }
    }
}

#[tokio::test]
async fn fused_layout_follows_the_world_size() {
    let ranks = run(3).await;

    for (opt, _) in &ranks {
        // 10 elements padded to a multiple of 3 * 24.
        assert_eq!(opt.worker_error().len(), 72);
        assert_eq!(opt.server_error().len(), 24);
        assert!(opt.worker_error().iter().any(|e| *e != 0.));
    }
}

#[tokio::test]
async fn compression_checkpoint_carries_the_residuals() {
    let ranks = run(2).await;
    let (source, _) = &ranks[1];

    let mut buf = Vec::new();
    source.save(&mut buf).unwrap();

    let backend = Hub::new(NonZeroUsize::new(2).unwrap()).remove(1);
    let mut restored = optimizer(backend);
    restored.load(buf.as_slice()).unwrap();

    assert_eq!(restored.phase(), Phase::Compression);
    assert!(!restored.backward_allreduce().enabled());
    assert_eq!(restored.worker_error(), source.worker_error());
    assert_eq!(restored.server_error(), source.server_error());
    assert_eq!(restored.scaling_coeffs(), source.scaling_coeffs());
}
