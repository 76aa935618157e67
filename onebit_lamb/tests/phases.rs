use comms::SoloBackend;
use ndarray::{ArrayD, arr1};
use onebit_lamb::{Gradient, LambConfig, OnebitLamb, Parameter, Phase};

fn optimizer(data: ArrayD<f32>, config: LambConfig) -> OnebitLamb<SoloBackend> {
    let group = config.group(vec![Parameter::new(data)]);
    OnebitLamb::new(vec![group], config, SoloBackend::new()).unwrap()
}

fn scenario_config() -> LambConfig {
    LambConfig {
        lr: 0.01,
        freeze_step: 3,
        betas: (0.9, 0.999),
        ..Default::default()
    }
}

#[tokio::test]
async fn phase_changes_once_after_the_freeze_step() {
    let initial = arr1(&[1., 2., 3., 4.]).into_dyn();
    let grad = arr1(&[0.1, -0.2, 0.3, -0.4]).into_dyn();
    let mut opt = optimizer(initial.clone(), scenario_config());
    let switch = opt.backward_allreduce();

    let mut phases = Vec::new();
    for step in 1..=5 {
        opt.param_mut(0, 0).set_grad(grad.clone());
        opt.step(None).await.unwrap();

        if step == 1 {
            assert!(opt.is_initialized());
            assert_eq!(opt.groups()[0].params[0].data, initial);
            assert!(opt.lamb_coeffs().is_empty());
        }

        phases.push(opt.phase());
    }

    assert_eq!(
        phases,
        [
            Phase::Warmup,
            Phase::Warmup,
            Phase::Compression,
            Phase::Compression,
            Phase::Compression
        ]
    );
    assert!(!switch.enabled());
    assert_eq!(opt.state(0, 0).unwrap().step, 5);
    assert_ne!(opt.groups()[0].params[0].data, initial);
}

#[tokio::test]
async fn warmup_steps_move_the_parameter_against_the_gradient() {
    let initial = arr1(&[1., 1.]).into_dyn();
    let mut opt = optimizer(initial, scenario_config());

    for _ in 0..2 {
        opt.param_mut(0, 0).set_grad(arr1(&[1., -1.]).into_dyn());
        opt.step(None).await.unwrap();
    }

    let data = &opt.groups()[0].params[0].data;
    assert!(data[[0]] < 1.);
    assert!(data[[1]] > 1.);
    assert_eq!(opt.lamb_coeffs().len(), 1);
}

#[tokio::test]
async fn second_moment_is_snapshotted_at_the_freeze_step() {
    let mut opt = optimizer(arr1(&[0.5, -0.5, 2.]).into_dyn(), scenario_config());

    for _ in 0..3 {
        opt.param_mut(0, 0).set_grad(arr1(&[0.3, 0.1, -0.2]).into_dyn());
        opt.step(None).await.unwrap();
    }

    let state = opt.state(0, 0).unwrap();
    assert_eq!(state.step, 3);
    assert_eq!(state.exp_avg_sq_back, state.exp_avg_sq);
    assert!(state.lamb_coeff_freeze > 0.);
    assert_eq!(state.last_factor, 1.);
}

#[tokio::test]
async fn compression_calibrates_once_and_keeps_the_error_buffers() {
    let mut opt = optimizer(arr1(&[1., 2., 3., 4., 5.]).into_dyn(), scenario_config());

    for _ in 0..4 {
        opt.param_mut(0, 0)
            .set_grad(arr1(&[0.1, 0.2, -0.1, 0.3, -0.2]).into_dyn());
        opt.step(None).await.unwrap();
    }

    assert_eq!(opt.phase(), Phase::Compression);
    let coeffs = opt.scaling_coeffs().unwrap().clone();
    assert!((coeffs.get(0, 0) - 1.).abs() < 1e-6);
    assert_eq!(opt.worker_error().len(), 8);
    assert_eq!(opt.server_error().len(), 8);

    for _ in 0..3 {
        opt.param_mut(0, 0)
            .set_grad(arr1(&[-0.4, 0.2, 0.1, 0.3, 0.5]).into_dyn());
        opt.step(None).await.unwrap();
        assert_eq!(opt.scaling_coeffs(), Some(&coeffs));
    }
}

#[tokio::test]
async fn parameters_without_gradients_are_left_alone() {
    let config = scenario_config();
    let groups = vec![config.group(vec![
        Parameter::new(arr1(&[1., 2.]).into_dyn()),
        Parameter::new(arr1(&[3., 4.]).into_dyn()),
    ])];
    let mut opt = OnebitLamb::new(groups, config, SoloBackend::new()).unwrap();

    for _ in 0..3 {
        opt.param_mut(0, 0).set_grad(arr1(&[0.5, 0.5]).into_dyn());
        opt.step(None).await.unwrap();
    }

    assert_eq!(opt.state(0, 0).unwrap().step, 3);
    assert!(opt.state(0, 1).is_none());
    assert_eq!(opt.groups()[0].params[1].data, arr1(&[3., 4.]).into_dyn());
    assert_eq!(opt.phase(), Phase::Compression);
}

#[tokio::test]
async fn warmup_trust_ratios_stay_within_their_bounds() {
    let config = LambConfig {
        freeze_step: 50,
        min_coeff: 0.5,
        max_coeff: 2.,
        coeff_beta: 0.9,
        ..Default::default()
    };
    let groups = vec![
        config.group(vec![
            Parameter::new(arr1(&[100., -100., 50.]).into_dyn()),
            Parameter::new(arr1(&[1e-3, 2e-3]).into_dyn()),
        ]),
        config.group(vec![Parameter::new(ArrayD::zeros(ndarray::IxDyn(&[4])))]),
    ];
    let mut opt = OnebitLamb::new(groups, config, SoloBackend::new()).unwrap();

    for t in 0..20 {
        let t = t as f32;
        opt.param_mut(0, 0)
            .set_grad(arr1(&[t.sin(), t.cos(), 0.5]).into_dyn());
        opt.param_mut(0, 1).set_grad(arr1(&[-t.cos(), 1.]).into_dyn());
        opt.param_mut(1, 0)
            .set_grad(arr1(&[0.1, 0.2, t.sin(), -0.3]).into_dyn());
        opt.step(None).await.unwrap();

        for &coeff in opt.lamb_coeffs() {
            assert!(coeff == 1. || (0.5..=2.).contains(&coeff), "{coeff}");
        }
    }
}

#[tokio::test]
async fn compression_factor_respects_bounds_and_rate() {
    let config = LambConfig {
        lr: 0.05,
        freeze_step: 4,
        weight_decay: 0.01,
        coeff_beta: 0.5,
        factor_min: 0.8,
        factor_max: 1.5,
        factor_threshold: 0.05,
        ..Default::default()
    };
    let groups = vec![config.group(vec![
        Parameter::new(arr1(&[0.3, -0.7, 1.1, 0.2, -0.5, 0.9]).into_dyn()),
        Parameter::new(arr1(&[2., -1.]).into_dyn()),
    ])];
    let mut opt = OnebitLamb::new(groups, config, SoloBackend::new()).unwrap();

    let mut last = [1f32; 2];
    for t in 0..40 {
        let t = t as f32;
        let scale = if t < 20. { 1. } else { 10. };
        opt.param_mut(0, 0).set_grad(
            arr1(&[
                t.sin(),
                (2. * t).cos(),
                0.1,
                -(t.sin()),
                0.5 * t.cos(),
                -0.2,
            ])
            .mapv(|g| g * scale)
            .into_dyn(),
        );
        opt.param_mut(0, 1)
            .set_grad(arr1(&[(0.5 * t).sin(), 1.]).mapv(|g| g * scale).into_dyn());
        opt.step(None).await.unwrap();

        if opt.phase() != Phase::Compression {
            continue;
        }

        for (j, last) in last.iter_mut().enumerate() {
            let factor = opt.state(0, j).unwrap().last_factor;
            assert!((0.8..=1.5).contains(&factor), "{factor}");
            assert!(factor <= *last * 1.05 + 1e-6, "{factor} after {last}");
            assert!(factor >= *last * 0.95 - 1e-6, "{factor} after {last}");
            *last = factor;
        }
    }
}

#[tokio::test]
async fn masked_momentum_leaves_only_weight_decay() {
    let config = LambConfig {
        lr: 0.1,
        freeze_step: 2,
        weight_decay: 0.1,
        coeff_beta: 0.5,
        ..Default::default()
    };
    let group = config
        .group(vec![Parameter::new(arr1(&[1., 2., 3.]).into_dyn())])
        .with_exp_avg_mask(arr1(&[1., 0., 1.]).into_dyn());
    let mut opt = OnebitLamb::new(vec![group], config, SoloBackend::new()).unwrap();

    for _ in 0..2 {
        opt.param_mut(0, 0).set_grad(arr1(&[0.1, 0.2, 0.3]).into_dyn());
        opt.step(None).await.unwrap();
    }
    assert_eq!(opt.phase(), Phase::Compression);

    for _ in 0..2 {
        let before = opt.groups()[0].params[0].data[[1]];
        opt.param_mut(0, 0).set_grad(arr1(&[0.1, 0.2, 0.3]).into_dyn());
        opt.step(None).await.unwrap();

        let momentum = opt.momentum(0, 0).unwrap();
        assert_eq!(momentum[[1]], 0.);
        assert!(momentum[[0]] != 0. && momentum[[2]] != 0.);

        let coeff = opt.lamb_coeffs()[0];
        let expected = before - 0.1 * coeff * 0.1 * before;
        let after = opt.groups()[0].params[0].data[[1]];
        assert!(after < before);
        assert!((after - expected).abs() < 1e-5, "{after} != {expected}");
    }
}

fn two_params(config: &LambConfig) -> OnebitLamb<SoloBackend> {
    let groups = vec![config.group(vec![
        Parameter::new(arr1(&[1., 2.]).into_dyn()),
        Parameter::new(arr1(&[-1., 0.5, 2.]).into_dyn()),
    ])];
    OnebitLamb::new(groups, config.clone(), SoloBackend::new()).unwrap()
}

#[tokio::test]
async fn gradient_overrides_take_precedence_over_stored_gradients() {
    let config = LambConfig {
        lr: 0.01,
        freeze_step: 2,
        weight_decay: 0.01,
        ..Default::default()
    };
    let mut overridden = two_params(&config);
    let mut reference = two_params(&config);

    let grad = arr1(&[0.1, -0.2]).into_dyn();
    let own = arr1(&[0.3, 0.1, -0.2]).into_dyn();
    let overrides = vec![vec![Some(Gradient::Dense(grad.clone())), None]];

    for _ in 0..5 {
        overridden.param_mut(0, 0).set_grad(arr1(&[9., 9.]).into_dyn());
        overridden.param_mut(0, 1).set_grad(own.clone());
        overridden.step(Some(overrides.as_slice())).await.unwrap();

        reference.param_mut(0, 0).set_grad(grad.clone());
        reference.param_mut(0, 1).set_grad(own.clone());
        reference.step(None).await.unwrap();
    }

    assert_eq!(overridden.phase(), Phase::Compression);
    for j in 0..2 {
        assert_eq!(
            overridden.groups()[0].params[j].data,
            reference.groups()[0].params[j].data
        );
        assert_eq!(overridden.state(0, j), reference.state(0, j));
    }
}
