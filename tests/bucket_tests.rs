mod common;

use candle_core::{DType, Tensor};
use common::{grid, recording_single_device, run_ranks, tensor, values};
use spmd_grads::distributed::{allreduce_sequence_parallel_gradients, bucket_allreduce_gradients};
use spmd_grads::{BucketConfig, ParamGroup, Parameter};

fn filled(elems: usize, dtype: DType) -> Tensor {
    Tensor::ones(elems, dtype, &candle_core::Device::Cpu).expect("Failed to create tensor")
}

/// 100/300/200/600 byte grads against a 512 byte cap: the 600 byte grad
/// goes alone, then [g3, g2], then [g1].
#[test]
fn test_flush_order_matches_reverse_bucketing() {
    let (ctx, log) = recording_single_device();
    let mut grads: Vec<Tensor> = [25, 75, 50, 150].iter().map(|&n| filled(n, DType::F32)).collect();

    let flushes = bucket_allreduce_gradients(&mut grads, &ctx, &BucketConfig { cap_bytes: 512 })
        .expect("bucket all-reduce failed");
    assert_eq!(flushes, 3);

    let sizes: Vec<Vec<usize>> = log.calls().into_iter().map(|c| c.elem_counts).collect();
    assert_eq!(sizes, vec![vec![150], vec![50, 75], vec![25]]);
}

#[test]
fn test_buckets_never_mix_dtypes() {
    let (ctx, log) = recording_single_device();
    let mut grads = vec![
        filled(4, DType::F32),
        filled(4, DType::BF16),
        filled(4, DType::F32),
        filled(4, DType::BF16),
    ];

    let flushes = bucket_allreduce_gradients(&mut grads, &ctx, &BucketConfig::default())
        .expect("bucket all-reduce failed");
    assert_eq!(flushes, 2);

    for call in log.calls() {
        assert_eq!(call.elem_counts.len(), 2);
        assert!(call.dtypes.windows(2).all(|w| w[0] == w[1]));
    }
    assert_eq!(grads[1].dtype(), DType::BF16);
}

#[test]
fn test_empty_gradient_list_issues_nothing() {
    let (ctx, log) = recording_single_device();
    let mut grads: Vec<Tensor> = Vec::new();

    let flushes = bucket_allreduce_gradients(&mut grads, &ctx, &BucketConfig::default())
        .expect("bucket all-reduce failed");
    assert_eq!(flushes, 0);
    assert_eq!(log.count(), 0);
}

#[test]
fn test_data_parallel_average() {
    let results = run_ranks(grid(2, 2, 1, 1), |ctx| {
        let mut grads = if ctx.dp_rank() == 0 {
            vec![tensor(&[2.0, 4.0]), tensor(&[10.0])]
        } else {
            vec![tensor(&[6.0, 8.0]), tensor(&[20.0])]
        };
        // a tiny cap forces one bucket per grad
        bucket_allreduce_gradients(&mut grads, &ctx, &BucketConfig { cap_bytes: 8 })
            .expect("bucket all-reduce failed");
        (values(Some(&grads[0])), values(Some(&grads[1])))
    });

    for (a, b) in results {
        assert_eq!(a, vec![4.0, 6.0]);
        assert_eq!(b, vec![15.0]);
    }
}

#[test]
fn test_sequence_parallel_sum_across_tp() {
    let results = run_ranks(grid(2, 1, 2, 1), |ctx| {
        let (ln, w) = if ctx.tp_rank() == 0 { ([1.0, 2.0], 5.0) } else { ([3.0, 4.0], 7.0) };
        let mut groups = vec![ParamGroup::new(vec![
            Parameter::new("ln").sequence_parallel().with_grad(tensor(&ln)),
            Parameter::new("w").tensor_model_parallel().with_grad(tensor(&[w])),
            Parameter::new("frozen").sequence_parallel(),
        ])];

        let reduced = allreduce_sequence_parallel_gradients(&mut groups, &ctx)
            .expect("sequence parallel reduce failed");
        let params = &groups[0].params;
        (reduced, values(params[0].grad.as_ref()), values(params[1].grad.as_ref()))
    });

    assert_eq!(results[0].0, 1);
    assert_eq!(results[0].1, vec![4.0, 6.0]);
    assert_eq!(results[1].1, vec![4.0, 6.0]);
    // non sequence-parallel grads are untouched
    assert_eq!(results[0].2, vec![5.0]);
    assert_eq!(results[1].2, vec![7.0]);
}

#[test]
fn test_sequence_parallel_noop_issues_nothing() {
    let (ctx, log) = recording_single_device();
    let mut groups = vec![ParamGroup::new(vec![
        Parameter::new("ln").sequence_parallel().with_grad(tensor(&[1.0])),
    ])];

    let reduced = allreduce_sequence_parallel_gradients(&mut groups, &ctx)
        .expect("sequence parallel reduce failed");
    assert_eq!(reduced, 0);
    assert_eq!(log.count(), 0);
}
