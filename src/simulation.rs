use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use comms::{Hub, HubBackend};
use log::info;
use ndarray::{Array1, Array2, ArrayD, Ix1};
use onebit_lamb::{Checkpoint, OnebitLamb, Parameter, Phase};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;

use crate::config::RunConfig;

/// The outcome of a single rank's training.
#[derive(Debug, Clone)]
pub struct Report {
    pub rank: usize,
    pub phase: Phase,
    pub initial_loss: f32,
    pub final_loss: f32,
}

/// Everything a rank needs to resume: the model and its optimizer.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub weights: ArrayD<f32>,
    pub bias: ArrayD<f32>,
    pub optimizer: Checkpoint,
}

/// The uncompressed gradient all-reduce the training loop runs during warm-up.
struct Averager {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

impl Averager {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        }
    }

    /// Replaces `values` with their mean across every rank.
    async fn average(&self, rank: usize, values: &mut [f32]) {
        self.slots.lock()[rank] = values.to_vec();
        self.barrier.wait().await;

        {
            let slots = self.slots.lock();
            for (i, value) in values.iter_mut().enumerate() {
                *value = slots.iter().map(|slot| slot[i]).sum::<f32>() / self.world_size as f32;
            }
        }

        self.barrier.wait().await;
    }
}

/// A rank's shard of a linear regression problem.
struct Dataset {
    x: Array2<f32>,
    y: Array1<f32>,
}

impl Dataset {
    fn generate(truth: &Array1<f32>, bias: f32, samples: usize, noise: f32, rng: &mut StdRng) -> Self {
        let x = Array2::from_shape_fn((samples, truth.len()), |_| rng.random_range(-1f32..1.));
        let y = x.dot(truth).mapv(|y| y + bias + noise * rng.random_range(-1f32..1.));

        Self { x, y }
    }

    /// Computes the mean squared error and its gradients.
    ///
    /// # Returns
    /// The loss, the gradient of the weights and the gradient of the bias.
    fn gradients(&self, weights: &ArrayD<f32>, bias: &ArrayD<f32>) -> anyhow::Result<(f32, Array1<f32>, f32)> {
        let weights = weights.view().into_dimensionality::<Ix1>()?;
        let bias = bias.iter().copied().next().context("the bias is empty")?;

        let n = self.y.len() as f32;
        let residual = self.x.dot(&weights) + bias - &self.y;

        let loss = residual.mapv(|r| r * r).sum() / n;
        let grad_w = self.x.t().dot(&residual) * (2. / n);
        let grad_b = residual.sum() * 2. / n;

        Ok((loss, grad_w, grad_b))
    }
}

fn snapshot_path(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("rank-{rank}.json"))
}

fn build_optimizer(config: &RunConfig, backend: HubBackend) -> anyhow::Result<OnebitLamb<HubBackend>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let weights = Array1::from_shape_fn(config.features, |_| rng.random_range(-0.5f32..0.5)).into_dyn();
    let bias = ArrayD::zeros(ndarray::IxDyn(&[1]));

    let mut optimizer = config.optimizer.clone();
    optimizer.local_rank = backend.rank();

    let groups = vec![
        optimizer.group(vec![Parameter::new(weights)]),
        optimizer
            .group(vec![Parameter::new(bias)])
            .with_weight_decay(0.),
    ];

    Ok(OnebitLamb::new(groups, optimizer, backend)?)
}

fn resume(opt: &mut OnebitLamb<HubBackend>, path: &Path) -> anyhow::Result<()> {
    let file = File::open(path).with_context(|| format!("cannot open '{}'", path.display()))?;
    let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))?;

    opt.param_mut(0, 0).data = snapshot.weights;
    opt.param_mut(1, 0).data = snapshot.bias;
    opt.load_state_dict(snapshot.optimizer)?;

    Ok(())
}

fn write_snapshot(opt: &OnebitLamb<HubBackend>, path: &Path) -> anyhow::Result<()> {
    let snapshot = Snapshot {
        weights: opt.groups()[0].params[0].data.clone(),
        bias: opt.groups()[1].params[0].data.clone(),
        optimizer: opt.state_dict()?,
    };

    let file = File::create(path).with_context(|| format!("cannot create '{}'", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), &snapshot)?;

    Ok(())
}

async fn train(
    mut opt: OnebitLamb<HubBackend>,
    data: Dataset,
    averager: Arc<Averager>,
    config: Arc<RunConfig>,
) -> anyhow::Result<Report> {
    let rank = opt.backend().rank();
    let switch = opt.backward_allreduce();
    let mut phase = opt.phase();
    let mut initial_loss = None;
    let mut loss = 0.;

    for step in 1..=config.steps {
        let params = opt.groups();
        let (step_loss, grad_w, grad_b) = data.gradients(&params[0].params[0].data, &params[1].params[0].data)?;
        loss = step_loss;
        initial_loss.get_or_insert(loss);

        let mut grads: Vec<f32> = grad_w.iter().copied().chain([grad_b]).collect();
        if switch.enabled() {
            averager.average(rank, &mut grads).await;
        }

        let bias_grad = grads.split_off(config.features);
        opt.param_mut(0, 0).set_grad(Array1::from(grads).into_dyn());
        opt.param_mut(1, 0).set_grad(Array1::from(bias_grad).into_dyn());

        opt.step(None).await?;

        if opt.phase() != phase {
            phase = opt.phase();
            info!(rank = rank, step = step; "entered the {phase:?} phase");
        }

        if rank == 0 && step % config.log_every == 0 {
            info!(step = step, loss = loss; "training");
        }
    }

    if let Some(dir) = &config.checkpoint_dir {
        write_snapshot(&opt, &snapshot_path(dir, rank))?;
    }

    Ok(Report {
        rank,
        phase,
        initial_loss: initial_loss.unwrap_or(loss),
        final_loss: loss,
    })
}

/// Trains a linear model on every rank, each rank on its own task.
///
/// # Arguments
/// * `config` - The run's description.
///
/// # Returns
/// One report per rank, ordered by rank.
pub async fn run(config: RunConfig) -> anyhow::Result<Vec<Report>> {
    config.validate()?;

    let world_size = NonZeroUsize::new(config.workers).context("workers must be greater than 0")?;
    if let Some(dir) = &config.checkpoint_dir {
        fs::create_dir_all(dir)?;
    }

    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let truth = Array1::from_shape_fn(config.features, |_| rng.random_range(-1f32..1.));
    let truth_bias = rng.random_range(-1f32..1.);

    let config = Arc::new(config);
    let averager = Arc::new(Averager::new(world_size.get()));

    let mut handles = Vec::with_capacity(world_size.get());
    for backend in Hub::new(world_size) {
        let rank = backend.rank();
        let mut opt = build_optimizer(&config, backend)?;

        if config.resume {
            let dir = config.checkpoint_dir.as_deref().context("resume requires a checkpoint_dir")?;
            resume(&mut opt, &snapshot_path(dir, rank))?;
            info!(rank = rank; "resumed from snapshot in the {:?} phase", opt.phase());
        }

        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(2 + rank as u64));
        let data = Dataset::generate(&truth, truth_bias, config.samples_per_worker, config.noise, &mut rng);

        handles.push(tokio::spawn(train(opt, data, Arc::clone(&averager), Arc::clone(&config))));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        reports.push(handle.await??);
    }

    Ok(reports)
}
