// Batch-norm executor tests: contract checks, mode choice and numerics
//
// Everything runs against `EmulatedPrimitives`, which follows the library's
// semantics in host memory and records each call it executes.

#[cfg(test)]
mod tests {
    use normkit_core::{BatchNormMode, DType, Error, LibraryVersion, Status, Tensor, Violation};
    use normkit_cudnn::{
        BatchNormExecutor, EmulatedBackend, EmulatedDevice, EmulatedPrimitives, ExecutorConfig,
        PrimitiveOp,
    };
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    type T = Tensor<EmulatedBackend>;

    const GPU: EmulatedDevice = EmulatedDevice::Gpu(0);
    const EPS: f64 = 1e-5;

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    fn assert_approx_vec(actual: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(
            actual.len(),
            expected.len(),
            "length mismatch: {} vs {}",
            actual.len(),
            expected.len()
        );
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!(approx(*a, *e, tol), "index {i}: {a} != {e} (tol={tol})");
        }
    }

    fn random(dims: &[usize], dtype: DType, seed: u64) -> T {
        let mut rng = StdRng::seed_from_u64(seed);
        let n: usize = dims.iter().product();
        let data: Vec<f64> = (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect();
        T::from_f64_slice(&data, dims, dtype, &GPU).unwrap()
    }

    fn vec1(data: &[f64], dtype: DType) -> T {
        T::from_f64_slice(data, [data.len()], dtype, &GPU).unwrap()
    }

    /// Per-channel mean and biased variance of an [N, C, ...] buffer.
    fn channel_moments(x: &[f64], dims: &[usize]) -> (Vec<f64>, Vec<f64>) {
        let c = dims[1];
        let inner: usize = dims[2..].iter().product();
        let m = (x.len() / c) as f64;
        let mut mean = vec![0.0; c];
        for (i, v) in x.iter().enumerate() {
            mean[(i / inner) % c] += v;
        }
        mean.iter_mut().for_each(|s| *s /= m);
        let mut var = vec![0.0; c];
        for (i, v) in x.iter().enumerate() {
            let ch = (i / inner) % c;
            var[ch] += (v - mean[ch]).powi(2);
        }
        var.iter_mut().for_each(|s| *s /= m);
        (mean, var)
    }

    struct Params {
        weight: T,
        bias: T,
        running_mean: T,
        running_var: T,
        save_mean: T,
        save_var: T,
    }

    fn params(c: usize, dtype: DType) -> Params {
        Params {
            weight: T::ones([c], dtype, &GPU).unwrap(),
            bias: T::zeros([c], dtype, &GPU).unwrap(),
            running_mean: T::zeros([c], dtype, &GPU).unwrap(),
            running_var: T::ones([c], dtype, &GPU).unwrap(),
            save_mean: T::zeros([c], dtype, &GPU).unwrap(),
            save_var: T::zeros([c], dtype, &GPU).unwrap(),
        }
    }

    fn executor() -> BatchNormExecutor<EmulatedPrimitives> {
        BatchNormExecutor::new(EmulatedPrimitives::new())
    }

    fn train(
        ex: &BatchNormExecutor<EmulatedPrimitives>,
        x: &T,
        p: &mut Params,
        factor: f64,
    ) -> normkit_core::Result<T> {
        ex.forward(
            x,
            &p.weight,
            &p.bias,
            &mut p.running_mean,
            &mut p.running_var,
            Some(&mut p.save_mean),
            Some(&mut p.save_var),
            true,
            factor,
            EPS,
        )
    }

    fn violation(err: &Error) -> Violation {
        match err.violation() {
            Some(v) => v.clone(),
            None => panic!("expected a contract violation, got {err}"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Forward, training
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_training_image_batch() {
        let dims = [8, 3, 32, 32];
        let x = random(&dims, DType::F32, 1);
        let mut p = params(3, DType::F32);
        let ex = executor();

        let y = train(&ex, &x, &mut p, 0.1).unwrap();
        assert_eq!(y.dims(), &dims);
        assert_eq!(y.dtype(), DType::F32);

        let xs = x.to_f64_vec().unwrap();
        let (mean, var) = channel_moments(&xs, &dims);
        let m = (8 * 32 * 32) as f64;

        // normalized output: zero mean, unit variance per channel
        let (y_mean, y_var) = channel_moments(&y.to_f64_vec().unwrap(), &dims);
        assert_approx_vec(&y_mean, &[0.0; 3], 1e-4);
        assert_approx_vec(&y_var, &[1.0; 3], 1e-3);

        let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v + EPS).sqrt()).collect();
        assert_approx_vec(&p.save_mean.to_f64_vec().unwrap(), &mean, 1e-4);
        assert_approx_vec(&p.save_var.to_f64_vec().unwrap(), &inv_std, 1e-3);

        let rm: Vec<f64> = mean.iter().map(|b| 0.1 * b).collect();
        let rv: Vec<f64> = var.iter().map(|v| 0.9 + 0.1 * v * m / (m - 1.0)).collect();
        assert_approx_vec(&p.running_mean.to_f64_vec().unwrap(), &rm, 1e-4);
        assert_approx_vec(&p.running_var.to_f64_vec().unwrap(), &rv, 1e-4);

        let d = ex.library().last_dispatch().unwrap();
        assert_eq!(d.op, PrimitiveOp::ForwardTraining);
        assert_eq!(d.mode, BatchNormMode::SpatialPersistent);
        assert_eq!(d.data_dims, vec![8, 3, 32, 32]);
        assert_eq!(d.param_dims, vec![1, 3, 1, 1]);
    }

    #[test]
    fn test_training_applies_weight_and_bias() {
        let dims = [4, 2, 3];
        let x = random(&dims, DType::F64, 2);
        let mut p = params(2, DType::F64);
        p.weight = vec1(&[2.0, 0.5], DType::F64);
        p.bias = vec1(&[1.0, -1.0], DType::F64);

        let y = train(&executor(), &x, &mut p, 0.5).unwrap();
        let (y_mean, y_var) = channel_moments(&y.to_f64_vec().unwrap(), &dims);
        assert_approx_vec(&y_mean, &[1.0, -1.0], 1e-9);
        assert_approx_vec(&y_var, &[4.0, 0.25], 1e-3);
    }

    #[test]
    fn test_factor_one_replaces_running_stats() {
        let dims = [6, 4];
        let x = random(&dims, DType::F64, 3);
        let mut p = params(4, DType::F64);
        p.running_mean = vec1(&[9.0; 4], DType::F64);

        train(&executor(), &x, &mut p, 1.0).unwrap();
        let (mean, _) = channel_moments(&x.to_f64_vec().unwrap(), &dims);
        assert_approx_vec(&p.running_mean.to_f64_vec().unwrap(), &mean, 1e-12);
    }

    #[test]
    fn test_rank_two_training_is_per_activation() {
        let x = random(&[16, 10], DType::F32, 4);
        let mut p = params(10, DType::F32);
        let ex = executor();
        train(&ex, &x, &mut p, 0.1).unwrap();
        let d = ex.library().last_dispatch().unwrap();
        assert_eq!(d.mode, BatchNormMode::PerActivation);
        assert_eq!(d.data_dims, vec![16, 10, 1, 1]);
        assert_eq!(d.param_dims, vec![1, 10, 1, 1]);
    }

    #[test]
    fn test_rank_five_descriptor_not_truncated() {
        let x = random(&[2, 3, 2, 2, 2], DType::F32, 5);
        let mut p = params(3, DType::F32);
        let ex = executor();
        train(&ex, &x, &mut p, 0.1).unwrap();
        let d = ex.library().last_dispatch().unwrap();
        assert_eq!(d.data_dims, vec![2, 3, 2, 2, 2]);
        assert_eq!(d.param_dims, vec![1, 3, 1, 1, 1]);
    }

    #[test]
    fn test_half_input_with_f32_params() {
        let dims = [4, 3, 2, 2];
        let x = random(&dims, DType::F16, 6);
        let mut p = params(3, DType::F32);
        let y = train(&executor(), &x, &mut p, 0.1).unwrap();
        assert_eq!(y.dtype(), DType::F16);
        let (y_mean, _) = channel_moments(&y.to_f64_vec().unwrap(), &dims);
        assert_approx_vec(&y_mean, &[0.0; 3], 1e-2);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Forward, inference
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_inference_uses_running_stats() {
        let x = random(&[16, 10], DType::F32, 7);
        let mut rm = vec1(&[0.5; 10], DType::F32);
        let mut rv = vec1(&[4.0; 10], DType::F32);
        let w = T::ones([10], DType::F32, &GPU).unwrap();
        let b = T::full([10], 1.0, DType::F32, &GPU).unwrap();
        let ex = executor();

        let y = ex
            .forward(&x, &w, &b, &mut rm, &mut rv, None, None, false, 0.0, EPS)
            .unwrap();

        let expected: Vec<f64> = x
            .to_f64_vec()
            .unwrap()
            .iter()
            .map(|v| (v - 0.5) / (4.0 + EPS).sqrt() + 1.0)
            .collect();
        assert_approx_vec(&y.to_f64_vec().unwrap(), &expected, 1e-5);
        assert_eq!(rm.to_f64_vec().unwrap(), vec![0.5; 10]);
        assert_eq!(rv.to_f64_vec().unwrap(), vec![4.0; 10]);

        let d = ex.library().last_dispatch().unwrap();
        assert_eq!(d.op, PrimitiveOp::ForwardInference);
        assert_eq!(d.mode, BatchNormMode::PerActivation);
    }

    #[test]
    fn test_inference_never_touches_statistics() {
        let x = random(&[4, 3, 5, 5], DType::F64, 8);
        let mut p = params(3, DType::F64);
        p.save_mean = vec1(&[7.0; 3], DType::F64);
        let ex = executor();
        ex.forward(
            &x,
            &p.weight,
            &p.bias,
            &mut p.running_mean,
            &mut p.running_var,
            Some(&mut p.save_mean),
            Some(&mut p.save_var),
            false,
            0.1,
            EPS,
        )
        .unwrap();
        assert_eq!(p.running_mean.to_f64_vec().unwrap(), vec![0.0; 3]);
        assert_eq!(p.running_var.to_f64_vec().unwrap(), vec![1.0; 3]);
        assert_eq!(p.save_mean.to_f64_vec().unwrap(), vec![7.0; 3]);
        // inference of rank 4 stays in plain spatial mode
        assert_eq!(ex.library().last_dispatch().unwrap().mode, BatchNormMode::Spatial);
    }

    #[test]
    fn test_inference_ignores_factor() {
        let x = random(&[4, 3], DType::F32, 9);
        let mut p = params(3, DType::F32);
        let r = executor().forward(
            &x,
            &p.weight,
            &p.bias,
            &mut p.running_mean,
            &mut p.running_var,
            None,
            None,
            false,
            7.5,
            EPS,
        );
        assert!(r.is_ok());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mode selection
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_old_library_falls_back_to_spatial() {
        let ex = BatchNormExecutor::new(EmulatedPrimitives::with_version(LibraryVersion(7002)));
        let x = random(&[2, 3, 4, 4], DType::F32, 10);
        let mut p = params(3, DType::F32);
        train(&ex, &x, &mut p, 0.1).unwrap();
        assert_eq!(ex.library().last_dispatch().unwrap().mode, BatchNormMode::Spatial);
    }

    #[test]
    fn test_config_disables_persistent_mode() {
        let config = ExecutorConfig::default().with_persistent_spatial(false);
        let ex = BatchNormExecutor::with_config(EmulatedPrimitives::new(), config);
        let x = random(&[2, 3, 4, 4], DType::F32, 11);
        let mut p = params(3, DType::F32);
        train(&ex, &x, &mut p, 0.1).unwrap();
        assert_eq!(ex.library().last_dispatch().unwrap().mode, BatchNormMode::Spatial);
        assert_eq!(
            ex.mode::<EmulatedBackend>(4, normkit_core::Phase::Training),
            BatchNormMode::Spatial
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Argument contract
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_device_checked_before_rank() {
        let x = T::zeros([5], DType::F32, &GPU).unwrap();
        let mut p = params(5, DType::F32);
        p.weight = T::ones([5], DType::F32, &EmulatedDevice::Gpu(1)).unwrap();
        let ex = executor();
        let err = train(&ex, &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(violation(&err), Violation::DeviceMismatch { .. }));
        assert!(err.to_string().contains("batch_norm_forward"));
        assert_eq!(ex.library().handle_queries(), 0);
        assert!(ex.library().dispatches().is_empty());
    }

    #[test]
    fn test_undefined_checked_before_device() {
        let x = random(&[4, 3], DType::F32, 40);
        let mut p = params(3, DType::F32);
        p.weight = T::ones([3], DType::F32, &EmulatedDevice::Gpu(1)).unwrap();
        let err = executor()
            .forward(
                &x,
                &p.weight,
                &p.bias,
                &mut p.running_mean,
                &mut p.running_var,
                None,
                Some(&mut p.save_var),
                true,
                0.1,
                EPS,
            )
            .unwrap_err();
        assert!(matches!(violation(&err), Violation::Undefined { arg } if arg.name == "save_mean"));
    }

    #[test]
    fn test_type_checked_before_contiguity() {
        let x = random(&[3, 4], DType::F32, 41).transpose(0, 1).unwrap();
        let mut p = params(3, DType::F64);
        let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(violation(&err), Violation::TypeMismatch { .. }));
    }

    #[test]
    fn test_contiguity_checked_before_rank() {
        // rank 6 and transposed
        let x = random(&[2, 3, 1, 1, 1, 4], DType::F32, 42).transpose(0, 5).unwrap();
        let mut p = params(3, DType::F32);
        let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(violation(&err), Violation::NotContiguous { arg } if arg.name == "input"));
    }

    #[test]
    fn test_rank_checked_before_numel() {
        let x = T::zeros([5], DType::F32, &GPU).unwrap();
        let mut p = params(3, DType::F32);
        let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(violation(&err), Violation::DimRange { .. }));
    }

    #[test]
    fn test_backward_numel_checked_before_shape() {
        let x = random(&[4, 3, 2, 2], DType::F32, 43);
        let dy = random(&[4, 3, 2, 1], DType::F32, 44);
        let p = params(3, DType::F32);
        let weight = T::ones([4], DType::F32, &GPU).unwrap();
        let err = executor()
            .backward(&x, &dy, &weight, Some(&p.save_mean), Some(&p.save_var), true, EPS)
            .unwrap_err();
        assert!(matches!(
            violation(&err),
            Violation::Numel { arg, expected: 3, got: 4 } if arg.name == "weight"
        ));
    }

    #[test]
    fn test_host_tensor_rejected() {
        let x = T::zeros([2, 3], DType::F32, &EmulatedDevice::Host).unwrap();
        let mut p = params(3, DType::F32);
        let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(violation(&err), Violation::NotOnGpu { arg, .. } if arg.name == "input"));
    }

    #[test]
    fn test_rank_bounds() {
        for dims in [vec![5], vec![1, 2, 1, 1, 1, 1]] {
            let x = T::zeros(dims, DType::F32, &GPU).unwrap();
            let c = if x.rank() > 1 { x.dims()[1] } else { 5 };
            let mut p = params(c, DType::F32);
            let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
            match violation(&err) {
                Violation::DimRange { min, max, .. } => assert_eq!((min, max), (2, 5)),
                v => panic!("unexpected violation {v}"),
            }
        }
    }

    #[test]
    fn test_half_params_for_half_input_rejected() {
        let x = random(&[4, 3, 2, 2], DType::F16, 12);
        let mut p = params(3, DType::F16);
        let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
        assert_eq!(
            violation(&err),
            Violation::ScalarType {
                arg: normkit_core::ArgName { name: "weight", pos: 2 },
                expected: DType::F32,
                got: DType::F16,
            }
        );
    }

    #[test]
    fn test_mixed_param_types_rejected() {
        let x = random(&[4, 3], DType::F64, 13);
        let mut p = params(3, DType::F64);
        p.running_var = T::ones([3], DType::F32, &GPU).unwrap();
        let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(violation(&err), Violation::TypeMismatch { other, .. } if other.name == "running_var"));
    }

    #[test]
    fn test_non_contiguous_input_rejected() {
        let x = random(&[3, 4], DType::F32, 14).transpose(0, 1).unwrap();
        let mut p = params(3, DType::F32);
        let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(violation(&err), Violation::NotContiguous { arg } if arg.name == "input"));
    }

    #[test]
    fn test_param_length_must_match_channels() {
        let x = random(&[4, 3, 2, 2], DType::F32, 15);
        let mut p = params(3, DType::F32);
        p.bias = T::zeros([4], DType::F32, &GPU).unwrap();
        let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(
            violation(&err),
            Violation::Numel { arg, expected: 3, got: 4 } if arg.name == "bias"
        ));
    }

    #[test]
    fn test_training_requires_save_buffers() {
        let x = random(&[4, 3], DType::F32, 16);
        let mut p = params(3, DType::F32);
        let err = executor()
            .forward(
                &x,
                &p.weight,
                &p.bias,
                &mut p.running_mean,
                &mut p.running_var,
                None,
                Some(&mut p.save_var),
                true,
                0.1,
                EPS,
            )
            .unwrap_err();
        assert!(matches!(violation(&err), Violation::Undefined { arg } if arg.name == "save_mean"));
    }

    #[test]
    fn test_invalid_scalars() {
        let x = random(&[4, 3], DType::F32, 17);
        let mut p = params(3, DType::F32);
        let ex = executor();
        let err = ex
            .forward(
                &x,
                &p.weight,
                &p.bias,
                &mut p.running_mean,
                &mut p.running_var,
                None,
                None,
                false,
                0.1,
                0.0,
            )
            .unwrap_err();
        assert!(matches!(violation(&err), Violation::InvalidScalar { name: "epsilon", .. }));

        for factor in [0.0, -0.5, 1.5, f64::NAN] {
            let err = train(&ex, &x, &mut p, factor).unwrap_err();
            assert!(matches!(
                violation(&err),
                Violation::InvalidScalar { name: "exponential_average_factor", .. }
            ));
        }
        assert!(ex.library().dispatches().is_empty());
    }

    #[test]
    fn test_failed_check_leaves_statistics_alone() {
        let x = random(&[4, 3], DType::F32, 18);
        let mut p = params(3, DType::F32);
        p.weight = T::ones([2], DType::F32, &GPU).unwrap();
        assert!(train(&executor(), &x, &mut p, 0.1).is_err());
        assert_eq!(p.running_mean.to_f64_vec().unwrap(), vec![0.0; 3]);
        assert_eq!(p.running_var.to_f64_vec().unwrap(), vec![1.0; 3]);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Library interaction
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_handle_queried_once_per_call() {
        let x = random(&[4, 3, 2, 2], DType::F32, 19);
        let mut p = params(3, DType::F32);
        let ex = executor();
        let y = train(&ex, &x, &mut p, 0.1).unwrap();
        assert_eq!(ex.library().handle_queries(), 1);
        assert_eq!(ex.library().dispatches().len(), 1);

        ex.backward(&x, &y, &p.weight, Some(&p.save_mean), Some(&p.save_var), true, EPS)
            .unwrap();
        assert_eq!(ex.library().handle_queries(), 2);
        assert_eq!(ex.library().dispatches().len(), 2);
    }

    #[test]
    fn test_library_failure_surfaces_status() {
        let lib = EmulatedPrimitives::new().with_failure(PrimitiveOp::ForwardTraining, Status::ExecutionFailed);
        let ex = BatchNormExecutor::new(lib);
        let x = random(&[4, 3], DType::F32, 20);
        let mut p = params(3, DType::F32);
        match train(&ex, &x, &mut p, 0.1) {
            Err(Error::PrimitiveFailure { op, status }) => {
                assert_eq!(op, "batch_norm_forward_training");
                assert_eq!(status, Status::ExecutionFailed);
            }
            other => panic!("expected a primitive failure, got {other:?}"),
        }
        assert_eq!(p.running_mean.to_f64_vec().unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn test_handle_failure_surfaces_status() {
        let lib = EmulatedPrimitives::new().with_failure(PrimitiveOp::Handle, Status::NotInitialized);
        let ex = BatchNormExecutor::new(lib);
        let x = random(&[4, 3], DType::F32, 21);
        let mut p = params(3, DType::F32);
        let err = train(&ex, &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(
            err,
            Error::PrimitiveFailure { op: "get_handle", status: Status::NotInitialized }
        ));
        assert!(ex.library().dispatches().is_empty());
    }

    #[test]
    fn test_zero_channels_is_primitive_failure() {
        let x = T::zeros([2, 0], DType::F32, &GPU).unwrap();
        let mut p = params(0, DType::F32);
        let ex = executor();
        for training in [true, false] {
            let err = ex
                .forward(
                    &x,
                    &p.weight,
                    &p.bias,
                    &mut p.running_mean,
                    &mut p.running_var,
                    Some(&mut p.save_mean),
                    Some(&mut p.save_var),
                    training,
                    0.1,
                    EPS,
                )
                .unwrap_err();
            assert!(matches!(err, Error::PrimitiveFailure { status: Status::BadParam, .. }));
        }
        let err = ex
            .backward(&x, &x, &p.weight, Some(&p.save_mean), Some(&p.save_var), true, EPS)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PrimitiveFailure { op: "batch_norm_backward", status: Status::BadParam }
        ));
    }

    #[test]
    fn test_empty_spatial_extent_keeps_running_stats() {
        let x = T::zeros([2, 3, 0, 4], DType::F32, &GPU).unwrap();
        let mut p = params(3, DType::F32);
        let err = train(&executor(), &x, &mut p, 0.1).unwrap_err();
        assert!(matches!(err, Error::PrimitiveFailure { status: Status::BadParam, .. }));
        assert_eq!(p.running_mean.to_f64_vec().unwrap(), vec![0.0; 3]);
        assert_eq!(p.running_var.to_f64_vec().unwrap(), vec![1.0; 3]);
        assert_eq!(p.save_mean.to_f64_vec().unwrap(), vec![0.0; 3]);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Backward
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_backward_gradients() {
        let dims = [4, 3, 2, 2];
        let x = random(&dims, DType::F64, 22);
        let dy = random(&dims, DType::F64, 23);
        let mut p = params(3, DType::F64);
        p.weight = vec1(&[1.0, 2.0, 0.5], DType::F64);
        let ex = executor();
        train(&ex, &x, &mut p, 0.1).unwrap();

        let (gi, gw, gb) = ex
            .backward(&x, &dy, &p.weight, Some(&p.save_mean), Some(&p.save_var), true, EPS)
            .unwrap();
        assert_eq!(gi.dims(), &dims);
        assert_eq!(gw.dims(), &[3]);
        assert_eq!(gb.dims(), &[3]);

        let xs = x.to_f64_vec().unwrap();
        let dys = dy.to_f64_vec().unwrap();
        let (mean, var) = channel_moments(&xs, &dims);
        let mut sum_dy = [0.0; 3];
        let mut sum_dy_xhat = [0.0; 3];
        for (i, (xv, dv)) in xs.iter().zip(&dys).enumerate() {
            let c = (i / 4) % 3;
            sum_dy[c] += dv;
            sum_dy_xhat[c] += dv * (xv - mean[c]) / (var[c] + EPS).sqrt();
        }
        assert_approx_vec(&gb.to_f64_vec().unwrap(), &sum_dy, 1e-9);
        assert_approx_vec(&gw.to_f64_vec().unwrap(), &sum_dy_xhat, 1e-9);

        // grad_input is orthogonal to constants within each channel
        let (gi_mean, _) = channel_moments(&gi.to_f64_vec().unwrap(), &dims);
        assert_approx_vec(&gi_mean, &[0.0; 3], 1e-9);

        let d = ex.library().last_dispatch().unwrap();
        assert_eq!(d.op, PrimitiveOp::Backward);
        assert_eq!(d.mode, BatchNormMode::SpatialPersistent);
    }

    #[test]
    fn test_backward_mode_ignores_training_flag() {
        let x = random(&[4, 3, 2, 2], DType::F32, 24);
        let mut p = params(3, DType::F32);
        let ex = executor();
        let y = train(&ex, &x, &mut p, 0.1).unwrap();
        ex.backward(&x, &y, &p.weight, Some(&p.save_mean), Some(&p.save_var), false, EPS)
            .unwrap();
        assert_eq!(
            ex.library().last_dispatch().unwrap().mode,
            BatchNormMode::SpatialPersistent
        );
    }

    #[test]
    fn test_backward_shape_mismatch() {
        let x = random(&[4, 3, 2, 2], DType::F32, 25);
        let dy = random(&[4, 3, 2, 1], DType::F32, 26);
        let p = params(3, DType::F32);
        let err = executor()
            .backward(&x, &dy, &p.weight, Some(&p.save_mean), Some(&p.save_var), true, EPS)
            .unwrap_err();
        assert!(matches!(violation(&err), Violation::SizeMismatch { .. }));
        assert!(err.to_string().contains("batch_norm_backward"));
    }

    #[test]
    fn test_backward_requires_saved_stats() {
        let x = random(&[4, 3], DType::F32, 27);
        let p = params(3, DType::F32);
        let err = executor()
            .backward(&x, &x, &p.weight, None, Some(&p.save_var), true, EPS)
            .unwrap_err();
        assert!(matches!(violation(&err), Violation::Undefined { arg } if arg.pos == 4));
    }

    #[test]
    fn test_backward_grad_output_type_must_match_input() {
        let x = random(&[4, 3], DType::F32, 28);
        let dy = random(&[4, 3], DType::F64, 29);
        let p = params(3, DType::F32);
        let err = executor()
            .backward(&x, &dy, &p.weight, Some(&p.save_mean), Some(&p.save_var), true, EPS)
            .unwrap_err();
        assert!(matches!(violation(&err), Violation::TypeMismatch { .. }));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Properties
    // ─────────────────────────────────────────────────────────────────────

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_running_mean_is_exponential_average(
            n in 2usize..6,
            c in 1usize..5,
            hw in 1usize..4,
            factor in 0.01f64..1.0,
            seed in any::<u64>(),
        ) {
            let dims = [n, c, hw, hw];
            let x = random(&dims, DType::F64, seed);
            let mut p = params(c, DType::F64);
            let old: Vec<f64> = (0..c).map(|i| i as f64).collect();
            p.running_mean = vec1(&old, DType::F64);

            let y = train(&executor(), &x, &mut p, factor).unwrap();
            prop_assert_eq!(y.dims(), &dims[..]);

            let (mean, _) = channel_moments(&x.to_f64_vec().unwrap(), &dims);
            let rm = p.running_mean.to_f64_vec().unwrap();
            for i in 0..c {
                let expected = old[i] * (1.0 - factor) + mean[i] * factor;
                prop_assert!(approx(rm[i], expected, 1e-9));
            }
        }

        #[test]
        fn prop_inference_is_pure(rank in 2usize..6, seed in any::<u64>()) {
            let mut dims = vec![2, 3];
            dims.resize(rank, 2);
            let x = random(&dims, DType::F32, seed);
            let mut p = params(3, DType::F32);
            let ex = executor();
            let y = ex
                .forward(&x, &p.weight, &p.bias, &mut p.running_mean, &mut p.running_var, None, None, false, 0.1, EPS)
                .unwrap();
            prop_assert_eq!(y.dims(), &dims[..]);
            prop_assert_eq!(p.running_mean.to_f64_vec().unwrap(), vec![0.0; 3]);
            prop_assert_eq!(p.running_var.to_f64_vec().unwrap(), vec![1.0; 3]);
            prop_assert_eq!(ex.library().last_dispatch().unwrap().op, PrimitiveOp::ForwardInference);
        }
    }
}
