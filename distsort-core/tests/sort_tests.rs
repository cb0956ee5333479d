use distsort_core::comm::tcp::TcpMesh;
use distsort_core::config::{SortConfig, TcpConfig};
use distsort_core::partition::{concat, split_by_sizes};
use distsort_core::{LocalCluster, SortError, bitonic_sort, is_sorted};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

fn random_partitions(rng: &mut StdRng, workers: usize, max_len: usize, span: i64) -> Vec<Vec<i64>> {
    (0..workers)
        .map(|_| {
            let len = rng.random_range(1..=max_len);
            (0..len).map(|_| rng.random_range(-span..span)).collect()
        })
        .collect()
}

fn assert_sorted_result(input: &[Vec<i64>], output: &[Vec<i64>]) {
    let mut expected = concat(input);
    expected.sort();
    assert_eq!(output.len(), input.len());
    assert!(output.iter().all(|p| !p.is_empty()));
    assert_eq!(concat(output), expected);
}

#[tokio::test]
async fn test_partition_sizes_follow_the_data() {
    // The low worker absorbs everything provably below its partner's minimum.
    let output = LocalCluster::new(2)
        .sort(vec![vec![5i64], vec![1, 2, 3, 4, 6, 7, 8, 9]])
        .await
        .unwrap();
    assert_eq!(output, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8, 9]]);
}

#[tokio::test]
async fn test_two_workers_example() {
    let sorted = LocalCluster::new(2)
        .sort(vec![vec![5, 1, 3], vec![6, 2, 4]])
        .await
        .unwrap();
    assert_eq!(sorted, vec![vec![1, 2, 3], vec![4, 5, 6]]);
}

#[tokio::test]
async fn test_three_workers_example() {
    let sorted = LocalCluster::new(3)
        .sort(vec![vec![9], vec![3], vec![6]])
        .await
        .unwrap();
    assert_eq!(sorted, vec![vec![3], vec![6], vec![9]]);
}

#[tokio::test]
async fn test_single_worker() {
    let sorted = LocalCluster::new(1)
        .sort(vec![vec![2, 9, -4, 2]])
        .await
        .unwrap();
    assert_eq!(sorted, vec![vec![-4, 2, 2, 9]]);
}

#[tokio::test]
async fn test_power_of_two_sizes_equal_partitions() {
    let mut rng = StdRng::seed_from_u64(1);
    for workers in [2, 4, 8, 16] {
        let input: Vec<Vec<i64>> = (0..workers)
            .map(|_| (0..16).map(|_| rng.random_range(-1000..1000)).collect())
            .collect();
        let output = LocalCluster::new(workers).sort(input.clone()).await.unwrap();
        assert_sorted_result(&input, &output);
    }
}

#[tokio::test]
async fn test_any_size_with_skewed_partitions() {
    let mut rng = StdRng::seed_from_u64(2024);
    for workers in 1..=12 {
        for _ in 0..4 {
            let input = random_partitions(&mut rng, workers, 20, 30);
            let output = LocalCluster::new(workers).sort(input.clone()).await.unwrap();
            assert_sorted_result(&input, &output);
        }
    }
}

#[tokio::test]
async fn test_one_large_partition_among_singletons() {
    let mut input: Vec<Vec<i64>> = vec![vec![50]; 5];
    input[2] = (0..200).rev().collect();
    let output = LocalCluster::new(5).sort(input.clone()).await.unwrap();
    assert_sorted_result(&input, &output);
}

#[tokio::test]
async fn test_already_sorted_input_is_unchanged() {
    let mut rng = StdRng::seed_from_u64(99);
    for workers in [3, 6, 7] {
        let mut values: Vec<i64> = (0..120).collect();
        values.shuffle(&mut rng);
        let sizes: Vec<usize> = {
            let mut sizes = vec![1; workers];
            for _ in workers..values.len() {
                sizes[rng.random_range(0..workers)] += 1;
            }
            sizes
        };
        let input = split_by_sizes(values, &sizes).unwrap();
        let cluster = LocalCluster::new(workers);
        let once = cluster.sort(input).await.unwrap();
        let twice = cluster.sort(once.clone()).await.unwrap();
        assert_eq!(once, twice);
    }
}

#[tokio::test]
async fn test_descending_comparator() {
    let mut rng = StdRng::seed_from_u64(5);
    let input = random_partitions(&mut rng, 6, 10, 100);
    let output = LocalCluster::new(6)
        .sort_by(input.clone(), |a: &i64, b: &i64| b.cmp(a))
        .await
        .unwrap();
    let mut expected = concat(&input);
    expected.sort_by(|a, b| b.cmp(a));
    assert_eq!(concat(&output), expected);
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Record {
    key: u32,
    name: String,
}

#[tokio::test]
async fn test_records_sorted_by_key() {
    let input = vec![
        vec![
            Record { key: 7, name: "g".into() },
            Record { key: 1, name: "a".into() },
        ],
        vec![Record { key: 4, name: "d".into() }],
        vec![
            Record { key: 9, name: "i".into() },
            Record { key: 2, name: "b".into() },
            Record { key: 5, name: "e".into() },
        ],
    ];
    let output = LocalCluster::new(3)
        .sort_by(input, |a: &Record, b: &Record| a.key.cmp(&b.key))
        .await
        .unwrap();
    assert!(output.iter().all(|p| !p.is_empty()));
    let records = concat(&output);
    let keys: Vec<u32> = records.iter().map(|r| r.key).collect();
    assert_eq!(keys, vec![1, 2, 4, 5, 7, 9]);
    assert_eq!(records[5].name, "i");
}

#[tokio::test]
async fn test_floats_with_total_order() {
    let input = vec![vec![2.5f64, -1.0], vec![0.0], vec![3.25, -7.5, 1.0]];
    let output = LocalCluster::new(3)
        .sort_by(input, |a: &f64, b: &f64| a.total_cmp(b))
        .await
        .unwrap();
    assert!(output.iter().all(|p| !p.is_empty()));
    assert_eq!(concat(&output), vec![-7.5, -1.0, 0.0, 1.0, 2.5, 3.25]);
}

#[tokio::test]
async fn test_compressed_exchanges() {
    let mut rng = StdRng::seed_from_u64(8);
    let input = random_partitions(&mut rng, 7, 300, 50);
    let config = SortConfig::default()
        .with_compression(true)
        .with_timeout_ms(30_000);
    let output = LocalCluster::new(7)
        .with_config(config)
        .sort(input.clone())
        .await
        .unwrap();
    assert_sorted_result(&input, &output);
}

#[tokio::test]
async fn test_empty_partition_is_rejected_on_every_rank() {
    let cluster = LocalCluster::new(4);
    let results = cluster
        .run_with(
            vec![vec![3i64], vec![], vec![1], vec![]],
            |comm, mut data| async move { bitonic_sort(&comm, &mut data).await },
        )
        .await
        .unwrap();
    for result in results {
        match result {
            Err(SortError::EmptyPartition { ranks }) => assert_eq!(ranks, vec![1, 3]),
            other => panic!("unexpected result {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_sorted_output_passes_collective_check() {
    let mut rng = StdRng::seed_from_u64(3);
    let input = random_partitions(&mut rng, 5, 8, 20);
    let verdicts = LocalCluster::new(5)
        .run_with(input, |comm, mut data| async move {
            let before = is_sorted(&comm, &data, None).await.unwrap();
            bitonic_sort(&comm, &mut data).await.unwrap();
            let after = is_sorted(&comm, &data, None).await.unwrap();
            (before, after)
        })
        .await
        .unwrap();
    assert!(verdicts.iter().all(|(_, after)| *after));
}

#[tokio::test]
async fn test_sort_over_tcp_loopback() {
    let inputs: Vec<Vec<i64>> = vec![vec![8, 3], vec![11], vec![-2, 6, 0], vec![5], vec![1, 1]];
    let mut listeners = Vec::new();
    let mut peers = Vec::new();
    for _ in 0..inputs.len() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        peers.push(listener.local_addr().unwrap().to_string());
        listeners.push(listener);
    }
    let config = TcpConfig::new(peers);

    let handles: Vec<_> = listeners
        .into_iter()
        .zip(inputs.clone())
        .enumerate()
        .map(|(rank, (listener, mut data))| {
            let config = config.clone();
            tokio::spawn(async move {
                let mesh = TcpMesh::with_listener(rank, listener, &config).await.unwrap();
                let comm = mesh.world();
                bitonic_sort(&comm, &mut data).await.unwrap();
                data
            })
        })
        .collect();
    let mut output = Vec::new();
    for handle in handles {
        output.push(handle.await.unwrap());
    }
    assert_sorted_result(&inputs, &output);
}
