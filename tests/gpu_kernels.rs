#![cfg(feature = "gpu")]

use deconv::gpu::{self, GpuBuffer, GpuKernels};
use deconv::ops::cpu;
use deconv::{DeconvAlgo, DeconvGeometry, Pair, assert_allclose};

fn ramp(len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|i| ((i as f32) * scale).sin()).collect()
}

fn geometry() -> DeconvGeometry {
    DeconvGeometry::new(&[2, 3, 3, 2], &[3, 2, 3, 3], Pair::from(2), Pair::from(1)).unwrap()
}

#[test]
fn test_gpu_available() {
    // Initialization must not panic either way
    let available = gpu::is_gpu_available();
    println!("GPU available: {}", available);
}

#[test]
fn test_gpu_buffer_roundtrip() {
    if !gpu::is_gpu_available() {
        println!("Skipping GPU test - no GPU available");
        return;
    }

    let data = vec![1.0, 2.0, 3.0, 4.0];
    let buffer = GpuBuffer::from_slice(&data).unwrap();
    assert_eq!(buffer.try_to_vec().unwrap(), data);
}

#[test]
fn test_gpu_add() {
    if !gpu::is_gpu_available() {
        println!("Skipping GPU test - no GPU available");
        return;
    }

    let a = GpuBuffer::from_slice(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    let b = GpuBuffer::from_slice(&[5.0, 6.0, 7.0, 8.0]).unwrap();
    let c = GpuKernels::add(&a, &b).unwrap();
    assert_eq!(c.to_vec(), vec![6.0, 8.0, 10.0, 12.0]);

    let short = GpuBuffer::from_slice(&[1.0]).unwrap();
    assert!(GpuKernels::add(&a, &short).is_none());
}

#[test]
fn test_gpu_forward_matches_cpu() {
    if !gpu::is_gpu_available() {
        println!("Skipping GPU test - no GPU available");
        return;
    }

    let g = geometry();
    let x = ramp(g.x_len(), 0.37);
    let w = ramp(g.w_len(), 0.11);
    let b = vec![0.5, -0.25];
    let expected = cpu::deconv_forward_fused(&x, &w, Some(b.as_slice()), &g);

    let xg = GpuBuffer::from_slice(&x).unwrap();
    let wg = GpuBuffer::from_slice(&w).unwrap();
    let bg = GpuBuffer::from_slice(&b).unwrap();
    for algo in [DeconvAlgo::Fused, DeconvAlgo::Col2im] {
        let y = GpuKernels::deconv_forward(&xg, &wg, Some(&bg), &g, algo).unwrap();
        assert_allclose(&y.to_vec(), &expected);
    }

    let expected_nobias = cpu::deconv_forward_fused(&x, &w, None, &g);
    let y = GpuKernels::deconv_forward(&xg, &wg, None, &g, DeconvAlgo::Col2im).unwrap();
    assert_allclose(&y.to_vec(), &expected_nobias);
}

#[test]
fn test_gpu_backward_matches_cpu() {
    if !gpu::is_gpu_available() {
        println!("Skipping GPU test - no GPU available");
        return;
    }

    let g = geometry();
    let x = ramp(g.x_len(), 0.37);
    let w = ramp(g.w_len(), 0.11);
    let gy = ramp(g.y_len(), 0.23);

    let xg = GpuBuffer::from_slice(&x).unwrap();
    let wg = GpuBuffer::from_slice(&w).unwrap();
    let gyg = GpuBuffer::from_slice(&gy).unwrap();

    let gx = GpuKernels::conv_backward_input(&gyg, &wg, &g).unwrap();
    assert_allclose(&gx.to_vec(), &cpu::conv2d_backward_input(&gy, &w, &g));

    let gw = GpuKernels::weight_grad(&xg, &gyg, &g).unwrap();
    assert_allclose(&gw.to_vec(), &cpu::weight_grad(&x, &gy, &g));

    let gb = GpuKernels::bias_grad(&gyg, &g).unwrap();
    assert_allclose(&gb.to_vec(), &cpu::bias_grad(&gy, &g));
}

#[test]
fn test_gpu_non_square_matches_cpu() {
    if !gpu::is_gpu_available() {
        println!("Skipping GPU test - no GPU available");
        return;
    }

    let g = DeconvGeometry::new(&[2, 3, 3, 5], &[3, 2, 3, 2], Pair::from((2, 1)), Pair::from((1, 0))).unwrap();
    let x = ramp(g.x_len(), 0.37);
    let w = ramp(g.w_len(), 0.11);
    let gy = ramp(g.y_len(), 0.23);
    let expected = cpu::deconv_forward_fused(&x, &w, None, &g);

    let xg = GpuBuffer::from_slice(&x).unwrap();
    let wg = GpuBuffer::from_slice(&w).unwrap();
    let gyg = GpuBuffer::from_slice(&gy).unwrap();
    for algo in [DeconvAlgo::Fused, DeconvAlgo::Col2im] {
        let y = GpuKernels::deconv_forward(&xg, &wg, None, &g, algo).unwrap();
        assert_allclose(&y.to_vec(), &expected);
    }
    let gx = GpuKernels::conv_backward_input(&gyg, &wg, &g).unwrap();
    assert_allclose(&gx.to_vec(), &cpu::conv2d_backward_input(&gy, &w, &g));
    let gw = GpuKernels::weight_grad(&xg, &gyg, &g).unwrap();
    assert_allclose(&gw.to_vec(), &cpu::weight_grad(&x, &gy, &g));
}
