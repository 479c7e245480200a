use cobalt_types::*;

#[test]
fn kv_cache_config_rejects_zero_dimensions() {
    assert!(KvCacheConfig::default().validate().is_ok());

    let mutators: [fn(&mut KvCacheConfig); 5] = [
        |c| c.max_batch_size = 0,
        |c| c.max_sequence_length = 0,
        |c| c.num_heads = 0,
        |c| c.head_dim = 0,
        |c| c.num_layers = 0,
    ];
    for mutate in mutators {
        let mut cfg = KvCacheConfig::default();
        mutate(&mut cfg);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, CobaltError::Config { .. }));
        assert!(!err.is_retryable());
    }
}

#[test]
fn kv_cache_sizing_rule() {
    let cfg = KvCacheConfig {
        num_heads: 4,
        head_dim: 16,
        num_layers: 3,
        dtype: DataType::FP16,
        ..Default::default()
    };
    // 2 x 10 x 4 x 16 x 2 bytes, doubled for key + value
    assert_eq!(cfg.layer_bytes(2, 10), 2 * 10 * 4 * 16 * 2 * 2);
    assert_eq!(cfg.model_bytes(2, 10), cfg.layer_bytes(2, 10) * 3);

    let fp32 = KvCacheConfig {
        dtype: DataType::FP32,
        ..cfg.clone()
    };
    assert_eq!(fp32.layer_bytes(2, 10), cfg.layer_bytes(2, 10) * 2);
}

#[test]
fn node_config_validation() {
    let cfg = VirtualNodeConfig::new("gpu-a", 0);
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.memory_limit_mb, 8192);
    assert_eq!(cfg.kv_dtype(), DataType::FP16);

    assert!(cfg.clone().with_max_concurrent_models(0).validate().is_err());
    assert!(cfg.clone().with_memory_limit_mb(0).validate().is_err());
    assert!(cfg.with_num_streams(0).validate().is_err());
}

#[test]
fn scheduler_config_weights_must_be_non_negative() {
    let mut cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    cfg.weights.load = -0.1;
    assert!(cfg.validate().is_err());
}

#[test]
fn engine_stats_running_mean() {
    let mut stats = EngineStats::default();
    let m = ModelId::new("m1");
    stats.record_completion(&m, true, 10.0);
    stats.record_completion(&m, true, 20.0);
    stats.record_completion(&m, false, 30.0);

    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.successful_requests, 2);
    assert_eq!(stats.failed_requests, 1);
    assert!((stats.average_latency_ms - 20.0).abs() < 1e-9);

    let per_model = &stats.per_model[&m];
    assert_eq!(per_model.requests, 3);
    assert!((per_model.average_latency_ms - 20.0).abs() < 1e-9);
    assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn errors_classify() {
    assert!(CobaltError::allocation("oom").is_retryable());
    assert!(CobaltError::resource_exhausted("full").is_retryable());
    assert!(!CobaltError::not_found("layer 3").is_retryable());
    assert!(CobaltError::not_found("layer 3").is_client_error());
    assert!(CobaltError::execution("kernel").is_server_error());
    assert_eq!(
        CobaltError::not_found("layer 3").to_string(),
        "Not found: layer 3"
    );
}
