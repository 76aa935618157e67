use std::num::NonZeroUsize;

use comms::{CompressedBackend, Hub, HubBackend};
use futures::future;

const LEN: usize = 32;

struct Rank {
    backend: HubBackend,
    input: Vec<f32>,
    worker_error: Vec<f32>,
    server_error: Vec<f32>,
    sum: Vec<f32>,
}

async fn run_rounds(mut rank: Rank, rounds: usize) -> Rank {
    for _ in 0..rounds {
        let mut buffer = rank.input.clone();
        rank.backend
            .compressed_allreduce(&mut buffer, &mut rank.worker_error, &mut rank.server_error, 0)
            .await
            .unwrap();

        rank.sum.iter_mut().zip(&buffer).for_each(|(s, b)| *s += b);
    }

    rank
}

fn ranks(inputs: Vec<Vec<f32>>) -> Vec<Rank> {
    let world_size = NonZeroUsize::new(inputs.len()).unwrap();
    let chunk = LEN / world_size.get();

    Hub::new(world_size)
        .into_iter()
        .zip(inputs)
        .map(|(backend, input)| Rank {
            backend,
            input,
            worker_error: vec![0.; LEN],
            server_error: vec![0.; chunk],
            sum: vec![0.; LEN],
        })
        .collect()
}

async fn spawn_all(ranks: Vec<Rank>, rounds: usize) -> Vec<Rank> {
    let handles = ranks
        .into_iter()
        .map(|rank| tokio::spawn(run_rounds(rank, rounds)));

    future::join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect()
}

#[tokio::test]
async fn uniform_buffers_are_averaged_exactly() {
    let ranks = ranks(vec![vec![1.; LEN], vec![3.; LEN]]);
    let ranks = spawn_all(ranks, 1).await;

    for rank in ranks {
        assert_eq!(rank.sum, vec![2.; LEN], "rank {}", rank.backend.rank());
        assert!(rank.worker_error.iter().all(|e| *e == 0.));
        assert!(rank.server_error.iter().all(|e| *e == 0.));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_feedback_keeps_the_long_run_average_unbiased() {
    const ROUNDS: usize = 400;

    let a: Vec<f32> = (0..LEN).map(|i| if i % 2 == 0 { 4. } else { 1. }).collect();
    let b: Vec<f32> = (0..LEN).map(|i| if i % 3 == 0 { 2. } else { -1. }).collect();
    let expected: Vec<f32> = a.iter().zip(&b).map(|(x, y)| (x + y) / 2.).collect();

    let ranks = spawn_all(ranks(vec![a, b]), ROUNDS).await;

    for rank in ranks {
        for (i, (s, e)) in rank.sum.iter().zip(&expected).enumerate() {
            let mean = s / ROUNDS as f32;
            assert!((mean - e).abs() < 0.05, "element {i}: {mean} vs {e}");
        }
    }
}

#[tokio::test]
async fn every_rank_ends_with_the_same_buffer() {
    let inputs = (0..4)
        .map(|r| (0..LEN).map(|i| (i as f32 - r as f32) * 0.25).collect())
        .collect();

    let ranks = spawn_all(ranks(inputs), 3).await;
    let first = ranks[0].sum.clone();

    assert!(ranks.iter().all(|rank| rank.sum == first));
}
