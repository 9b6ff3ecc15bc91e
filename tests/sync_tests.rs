mod common;

use common::{assert_close, grid, run_ranks, tensor, values};
use spmd_grads::utils::config::{GradSyncConfig, SpmdConfig};
use spmd_grads::{prepare_gradients, ParamGroup, Parameter};

/// DP average, then clip to the configured norm on every rank.
#[test]
fn test_prepare_gradients_data_parallel() {
    let config = GradSyncConfig { max_grad_norm: Some(1.0), ..Default::default() };

    let results = run_ranks(grid(2, 2, 1, 1), |ctx| {
        let w = if ctx.dp_rank() == 0 { 2.0 } else { 4.0 };
        let mut groups = vec![ParamGroup::new(vec![
            Parameter::new("w").tensor_model_parallel().with_grad(tensor(&[w])),
            Parameter::new("b").with_grad(tensor(&[4.0])),
        ])];
        let report = prepare_gradients(&mut groups, &ctx, &config).expect("grad sync failed");
        let params = &groups[0].params;
        (report, values(params[0].grad.as_ref())[0], values(params[1].grad.as_ref())[0])
    });

    for (report, w, b) in results {
        assert_eq!(report.buckets_flushed, 1);
        assert_eq!(report.sequence_parallel_reduced, 0);
        assert_close(report.total_norm.expect("norm missing"), 5.0);
        assert!((w - 0.6).abs() < 1e-4);
        assert!((b - 0.8).abs() < 1e-4);
    }
}

#[test]
fn test_prepare_gradients_with_sequence_parallel() {
    let config = GradSyncConfig {
        sequence_parallel: true,
        max_grad_norm: Some(10.0),
        ..Default::default()
    };

    let results = run_ranks(grid(2, 1, 2, 1), |ctx| {
        let (ln, w) = if ctx.tp_rank() == 0 { (1.0, 4.0) } else { (2.0, 0.0) };
        let mut groups = vec![
            ParamGroup::new(vec![Parameter::new("ln").sequence_parallel().with_grad(tensor(&[ln]))]),
            ParamGroup::new(vec![Parameter::new("w").tensor_model_parallel().with_grad(tensor(&[w]))]),
        ];
        let report = prepare_gradients(&mut groups, &ctx, &config).expect("grad sync failed");
        (report, values(groups[0].params[0].grad.as_ref())[0])
    });

    for (report, ln) in results {
        assert_eq!(report.sequence_parallel_reduced, 1);
        // ln = 3 on both ranks, w = 4 on rank 0 only
        assert_close(report.total_norm.expect("norm missing"), 5.0);
        assert_eq!(report.clip_coefficient, Some(1.0));
        assert_eq!(ln, 3.0);
    }
}

#[test]
fn test_config_drives_local_grid() {
    let mut config = SpmdConfig::default();
    config.apply_overrides(vec![
        ("SPMD_DISTRIBUTED__WORLD_SIZE".to_string(), "2".to_string()),
        ("SPMD_DISTRIBUTED__DP_SIZE".to_string(), "2".to_string()),
        ("SPMD_GRAD_SYNC__MAX_GRAD_NORM".to_string(), "none".to_string()),
    ]);
    config.validate().expect("config should be valid");

    let contexts = config.distributed.build_local_grid(candle_core::Device::Cpu).expect("grid failed");
    let grad_sync = config.grad_sync.clone();
    let results = run_ranks(contexts, |ctx| {
        let mut groups = vec![ParamGroup::new(vec![
            Parameter::new("w").with_grad(tensor(&[ctx.rank() as f32 * 2.0])),
        ])];
        let report = prepare_gradients(&mut groups, &ctx, &grad_sync).expect("grad sync failed");
        (report.total_norm, values(groups[0].params[0].grad.as_ref())[0])
    });

    for (norm, w) in results {
        assert_eq!(norm, None);
        assert_eq!(w, 1.0);
    }
}
