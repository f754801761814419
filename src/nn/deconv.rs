use crate::config::DeconvConfig;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::{DeconvError, Result};
use crate::init::seeded_rng;
use crate::io::{StateDict, TensorData, diff_state_dict};
use crate::nn::Module;
use crate::ops::{DeconvAlgo, DeconvBackend, DeconvGeometry, Executor, Pair};
use crate::storage::Storage;
use crate::tensor::{RawTensor, Tensor, TensorOps};
use std::cell::Cell;

/// Gradients produced by one backward call
#[derive(Debug)]
pub struct DeconvGrads {
    /// Input gradient, shape of x
    pub gx: Tensor,
    /// Weight gradient of this call alone
    pub gw: Tensor,
    /// Bias gradient of this call alone; `None` without bias
    pub gb: Option<Tensor>,
}

/// 2-D transposed convolution (deconvolution)
///
/// The adjoint of `Conv2d` with the same kernel, stride and padding: every
/// input pixel is scattered through the kernel into the output, and the
/// `pad` border is cropped away.
///
/// Output size: `H_out = stride * (H_in - 1) + kernel - 2 * pad`
///
/// The weight and bias tensors carry their accumulated gradients (`gW`,
/// `gb`) in their `grad` slot. Both start at zero and grow with every
/// backward call until `zero_grads`.
#[derive(Debug)]
pub struct Deconvolution2D {
    in_channels: usize,
    out_channels: usize,
    ksize: Pair,
    stride: Pair,
    pad: Pair,
    weight: Tensor,       // [in_channels, out_channels, kernel_h, kernel_w]
    bias: Option<Tensor>, // [out_channels]
    algo: Cell<DeconvAlgo>,
    device: Device,
}

fn accumulate_grad(t: &Tensor, g: &Storage) -> Result<()> {
    let mut raw = t.borrow_mut();
    match raw.grad.as_mut() {
        Some(acc) => acc.accumulate(g),
        None => {
            raw.grad = Some(g.clone());
            Ok(())
        }
    }
}

impl Deconvolution2D {
    /// Layer with bias, the fused algorithm and the default initializers
    ///
    /// # Errors
    /// `InvalidParameter` for zero channels, kernel or stride.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        ksize: impl Into<Pair>,
        stride: impl Into<Pair>,
        pad: impl Into<Pair>,
    ) -> Result<Self> {
        Self::from_config(&DeconvConfig::new(
            in_channels,
            out_channels,
            ksize,
            stride,
            pad,
        ))
    }

    /// Build a CPU layer from a validated configuration
    pub fn from_config(config: &DeconvConfig) -> Result<Self> {
        config.validate()?;
        let w_shape = [
            config.in_channels,
            config.out_channels,
            config.ksize.h,
            config.ksize.w,
        ];
        let mut rng = seeded_rng(config.seed);
        let weight = Self::parameter(config.initializer.sample(&w_shape, &mut rng)?, &w_shape);
        let bias = if config.nobias {
            None
        } else {
            let b_shape = [config.out_channels];
            let data = config.bias_initializer.sample(&b_shape, &mut rng)?;
            Some(Self::parameter(data, &b_shape))
        };
        log::debug!(
            "Deconvolution2D {}->{} k={:?} s={:?} p={:?} bias={} algo={}",
            config.in_channels,
            config.out_channels,
            config.ksize,
            config.stride,
            config.pad,
            !config.nobias,
            config.algo
        );
        Ok(Deconvolution2D {
            in_channels: config.in_channels,
            out_channels: config.out_channels,
            ksize: config.ksize,
            stride: config.stride,
            pad: config.pad,
            weight,
            bias,
            algo: Cell::new(config.algo),
            device: Device::CPU,
        })
    }

    fn parameter(data: Vec<f32>, shape: &[usize]) -> Tensor {
        let grad = Storage::cpu(vec![0.0; data.len()]);
        let t = RawTensor::new(data, shape, true);
        t.borrow_mut().grad = Some(grad);
        t
    }

    fn weight_shape(&self) -> [usize; 4] {
        [self.in_channels, self.out_channels, self.ksize.h, self.ksize.w]
    }

    /// Dtype and device checks shared by every tensor argument
    fn check_operand(&self, t: &Tensor) -> Result<()> {
        let raw = t.borrow();
        DType::ensure_f32(raw.dtype())?;
        if !raw.device.same_space(&self.device) {
            return Err(DeconvError::DeviceMismatch {
                expected: self.device.clone(),
                actual: raw.device.clone(),
            });
        }
        Ok(())
    }

    fn geometry(&self, x_shape: &[usize]) -> Result<DeconvGeometry> {
        DeconvGeometry::new(x_shape, &self.weight_shape(), self.stride, self.pad)
    }

    // ===== FORWARD / BACKWARD =====

    /// `y = deconv(x, W) + b`
    ///
    /// # Errors
    /// `UnsupportedDtype` for non-f32 input, `DeviceMismatch` when `x` lives
    /// elsewhere than the parameters, `ShapeMismatch` for a non-4-D input or
    /// wrong channel count.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_operand(x)?;
        let xb = x.borrow();
        let g = self.geometry(&xb.shape)?;
        let exec = Executor::for_device(&self.device)?;

        let y = {
            let w = self.weight.borrow();
            let b = self.bias.as_ref().map(|b| b.borrow());
            exec.deconv_forward(
                &xb.data,
                &w.data,
                b.as_ref().map(|b| &b.data),
                &g,
                self.algo.get(),
            )?
        };
        RawTensor::from_storage(y, &g.y_shape(), xb.requires_grad, self.device.clone())
    }

    /// Gradients for upstream gradient `gy`, accumulating `gW` and `gb`
    ///
    /// # Errors
    /// Those of `forward`, plus `ShapeMismatch` when `gy` is not shaped like
    /// the output.
    pub fn backward(&self, x: &Tensor, gy: &Tensor) -> Result<DeconvGrads> {
        self.check_operand(x)?;
        self.check_operand(gy)?;

        let (g, gx, gw, gb) = {
            let xb = x.borrow();
            let gyb = gy.borrow();
            let g = self.geometry(&xb.shape)?;
            g.check_output_grad(&gyb.shape)?;
            let exec = Executor::for_device(&self.device)?;

            let w = self.weight.borrow();
            let gx = exec.conv2d_backward_input(&gyb.data, &w.data, &g)?;
            let gw = exec.weight_grad(&xb.data, &gyb.data, &g)?;
            let gb = match self.bias {
                Some(_) => Some(exec.bias_grad(&gyb.data, &g)?),
                None => None,
            };
            (g, gx, gw, gb)
        };

        accumulate_grad(&self.weight, &gw)?;
        if let (Some(bias), Some(gb)) = (&self.bias, &gb) {
            accumulate_grad(bias, gb)?;
        }

        Ok(DeconvGrads {
            gx: RawTensor::from_storage(gx, &g.x_shape(), false, self.device.clone())?,
            gw: RawTensor::from_storage(gw, &g.w_shape(), false, self.device.clone())?,
            gb: gb
                .map(|gb| {
                    RawTensor::from_storage(gb, &[self.out_channels], false, self.device.clone())
                })
                .transpose()?,
        })
    }

    /// Backward driven by the gradient stored on the output `y`
    ///
    /// Reads `y.grad`, accumulates `gW`/`gb`, and accumulates into `x.grad`
    /// when `x.requires_grad`.
    ///
    /// # Errors
    /// `InvalidParameter` when `y` carries no gradient, otherwise as `backward`.
    pub fn backward_from_output(&self, x: &Tensor, y: &Tensor) -> Result<DeconvGrads> {
        let gy = {
            let yb = y.borrow();
            let grad = yb.grad.clone().ok_or_else(|| {
                DeconvError::InvalidParameter("output has no gradient to propagate".to_string())
            })?;
            RawTensor::from_storage(grad, &yb.shape, false, yb.device.clone())?
        };
        let grads = self.backward(x, &gy)?;
        if x.borrow().requires_grad {
            accumulate_grad(x, &grads.gx.borrow().data)?;
        }
        Ok(grads)
    }

    // ===== PARAMETER ACCESS =====

    /// Shared handle to the weight `[C_in, C_out, kH, kW]`
    pub fn weight(&self) -> Tensor {
        self.weight.clone()
    }

    /// Shared handle to the bias `[C_out]`, if any
    pub fn bias(&self) -> Option<Tensor> {
        self.bias.clone()
    }

    /// Accumulated weight gradient
    pub fn grad_weight(&self) -> Vec<f32> {
        self.weight
            .grad()
            .unwrap_or_else(|| vec![0.0; self.weight.borrow().numel()])
    }

    /// Accumulated bias gradient; `None` without bias
    pub fn grad_bias(&self) -> Option<Vec<f32>> {
        self.bias
            .as_ref()
            .map(|b| b.grad().unwrap_or_else(|| vec![0.0; self.out_channels]))
    }

    /// Overwrite the weight values, keeping them on the layer's device
    ///
    /// # Errors
    /// `ShapeMismatch` unless `w` is `[C_in, C_out, kH, kW]`,
    /// `UnsupportedDtype` for non-f32 data.
    pub fn set_weight(&self, w: &Tensor) -> Result<()> {
        let (shape, dtype, data) = {
            let wb = w.borrow();
            (wb.shape.clone(), wb.dtype(), wb.data.to_vec())
        };
        DType::ensure_f32(dtype)?;
        let expected = self.weight_shape();
        if shape != expected {
            return Err(DeconvError::shape("set_weight", &expected, &shape));
        }
        self.weight.set_data(data)
    }

    /// Overwrite the bias values, keeping them on the layer's device
    ///
    /// # Errors
    /// `InvalidParameter` when the layer has no bias, `ShapeMismatch` unless
    /// `b` is `[C_out]`, `UnsupportedDtype` for non-f32 data.
    pub fn set_bias(&self, b: &Tensor) -> Result<()> {
        let Some(bias) = &self.bias else {
            return Err(DeconvError::InvalidParameter(
                "layer has no bias (nobias mode)".to_string(),
            ));
        };
        let (shape, dtype, data) = {
            let bb = b.borrow();
            (bb.shape.clone(), bb.dtype(), bb.data.to_vec())
        };
        DType::ensure_f32(dtype)?;
        if shape != [self.out_channels] {
            return Err(DeconvError::shape("set_bias", &[self.out_channels], &shape));
        }
        bias.set_data(data)
    }

    /// Drop the bias term and its gradient for good
    pub fn remove_bias(&mut self) {
        self.bias = None;
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Reset `gW` and `gb` to zeros
    pub fn zero_grads(&self) -> Result<()> {
        for p in std::iter::once(&self.weight).chain(self.bias.as_ref()) {
            let mut raw = p.borrow_mut();
            raw.grad = Some(raw.data.zeros_like()?);
        }
        Ok(())
    }

    // ===== CONFIGURATION =====

    pub fn algo(&self) -> DeconvAlgo {
        self.algo.get()
    }

    /// Switch the forward algorithm; takes effect on the next call
    pub fn set_algo(&self, algo: DeconvAlgo) {
        log::debug!("Deconvolution2D algorithm {} -> {algo}", self.algo.get());
        self.algo.set(algo);
    }

    /// `true` selects `Fused`, `false` selects `Col2im`
    pub fn use_fused(&self, fused: bool) {
        self.set_algo(if fused {
            DeconvAlgo::Fused
        } else {
            DeconvAlgo::Col2im
        });
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn ksize(&self) -> Pair {
        self.ksize
    }

    pub fn stride(&self) -> Pair {
        self.stride
    }

    pub fn pad(&self) -> Pair {
        self.pad
    }

    /// Copy weight, bias and both gradients to `device`
    ///
    /// Handles obtained from `weight()`/`bias()` before the move keep pointing
    /// at the old copies.
    ///
    /// # Errors
    /// `DeviceError` when `device` has no executor.
    pub fn to_device(&mut self, device: Device) -> Result<()> {
        Executor::for_device(&device)?;
        let weight = self.weight.to_device(device.clone())?;
        let bias = self
            .bias
            .as_ref()
            .map(|b| b.to_device(device.clone()))
            .transpose()?;
        log::info!("Deconvolution2D moved {} -> {device}", self.device);
        self.weight = weight;
        self.bias = bias;
        self.device = device;
        Ok(())
    }
}

impl Module for Deconvolution2D {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Deconvolution2D::forward(self, x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            params.push(b.clone());
        }
        params
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("weight".to_string(), TensorData::from_tensor(&self.weight));
        if let Some(ref b) = self.bias {
            state.insert("bias".to_string(), TensorData::from_tensor(b));
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let diff = diff_state_dict(&self.state_dict(), state);
        if !diff.is_empty() {
            return Err(DeconvError::Config(format!(
                "state dict does not match layer: {diff:?}"
            )));
        }
        for td in state.values() {
            let expected: usize = td.shape.iter().product();
            if td.data.len() != expected {
                return Err(DeconvError::shape("state dict entry", &[expected], &[td.data.len()]));
            }
        }
        for (key, param) in [("weight", Some(&self.weight)), ("bias", self.bias.as_ref())] {
            if let (Some(td), Some(param)) = (state.get(key), param) {
                param.set_data(td.data.clone())?;
            }
        }
        Ok(())
    }

    fn zero_grad(&mut self) -> Result<()> {
        self.zero_grads()
    }

    fn to_device(&mut self, device: Device) -> Result<()> {
        Deconvolution2D::to_device(self, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::Initializer;

    #[test]
    fn test_shapes_and_zero_grads_at_construction() {
        let layer = Deconvolution2D::new(3, 2, 3, 2, 1).unwrap();
        assert_eq!(layer.weight().shape(), vec![3, 2, 3, 3]);
        assert_eq!(layer.bias().unwrap().shape(), vec![2]);
        assert_eq!(layer.grad_weight(), vec![0.0; 54]);
        assert_eq!(layer.grad_bias(), Some(vec![0.0; 2]));
        assert_eq!(layer.algo(), DeconvAlgo::Fused);
        assert!(layer.device().is_cpu());
    }

    #[test]
    fn test_invalid_construction() {
        for result in [
            Deconvolution2D::new(0, 2, 3, 1, 0),
            Deconvolution2D::new(3, 0, 3, 1, 0),
            Deconvolution2D::new(3, 2, 0, 1, 0),
            Deconvolution2D::new(3, 2, 3, 0, 0),
        ] {
            assert!(matches!(result, Err(DeconvError::InvalidParameter(_))));
        }
    }

    #[test]
    fn test_pad_wider_than_kernel() {
        let layer = Deconvolution2D::new(2, 2, 1, 1, 1).unwrap();
        let y = layer.forward(&RawTensor::zeros(&[1, 2, 5, 5])).unwrap();
        assert_eq!(y.shape(), vec![1, 2, 3, 3]);

        let layer = Deconvolution2D::new(2, 2, 3, 2, 3).unwrap();
        let x = RawTensor::uniform(&[1, 2, 5, 5], -1.0, 1.0);
        let fused = layer.forward(&x).unwrap();
        assert_eq!(fused.shape(), vec![1, 2, 5, 5]);
        layer.use_fused(false);
        crate::gradcheck::assert_allclose(&layer.forward(&x).unwrap().to_vec(), &fused.to_vec());

        // Padding that crops everything fails per call, not at construction
        let err = layer.forward(&RawTensor::zeros(&[1, 2, 1, 1])).unwrap_err();
        assert!(matches!(err, DeconvError::InvalidParameter(_)));
    }

    #[test]
    fn test_hand_computed_forward_with_bias() {
        let config = DeconvConfig::new(1, 1, 2, 2, 0).with_initializer(Initializer::Constant { value: 1.0 });
        let layer = Deconvolution2D::from_config(&config).unwrap();
        layer.set_bias(&RawTensor::new(vec![0.5], &[1], false)).unwrap();
        let x = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2], false);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), vec![1, 1, 4, 4]);
        assert_eq!(
            y.to_vec(),
            vec![
                1.5, 1.5, 2.5, 2.5, //
                1.5, 1.5, 2.5, 2.5, //
                3.5, 3.5, 4.5, 4.5, //
                3.5, 3.5, 4.5, 4.5,
            ]
        );
    }

    #[test]
    fn test_algo_toggle_through_shared_reference() {
        let layer = Deconvolution2D::new(1, 1, 2, 1, 0).unwrap();
        let shared = &layer;
        shared.use_fused(false);
        assert_eq!(layer.algo(), DeconvAlgo::Col2im);
        shared.set_algo(DeconvAlgo::Fused);
        assert_eq!(layer.algo(), DeconvAlgo::Fused);
    }

    #[test]
    fn test_set_bias_without_bias_fails() {
        let config = DeconvConfig::new(3, 2, 3, 1, 0).with_nobias(true);
        let layer = Deconvolution2D::from_config(&config).unwrap();
        assert!(!layer.has_bias());
        assert!(layer.grad_bias().is_none());
        let err = layer.set_bias(&RawTensor::zeros(&[2])).unwrap_err();
        assert!(matches!(err, DeconvError::InvalidParameter(_)));
    }

    #[test]
    fn test_set_weight_shape_checked() {
        let layer = Deconvolution2D::new(3, 2, 3, 1, 0).unwrap();
        let err = layer.set_weight(&RawTensor::zeros(&[2, 3, 3, 3])).unwrap_err();
        assert!(matches!(err, DeconvError::ShapeMismatch { .. }));
        layer.set_weight(&RawTensor::zeros(&[3, 2, 3, 3])).unwrap();
        assert_eq!(layer.weight().to_vec(), vec![0.0; 54]);
    }

    #[test]
    fn test_backward_from_output_requires_gradient() {
        let layer = Deconvolution2D::new(1, 1, 2, 1, 0).unwrap();
        let x = RawTensor::new(vec![1.0; 4], &[1, 1, 2, 2], true);
        let y = layer.forward(&x).unwrap();
        let err = layer.backward_from_output(&x, &y).unwrap_err();
        assert!(matches!(err, DeconvError::InvalidParameter(_)));
    }

    #[test]
    fn test_backward_from_output_accumulates_input_grad() {
        let config = DeconvConfig::new(1, 1, 2, 1, 0).with_initializer(Initializer::Constant { value: 1.0 });
        let layer = Deconvolution2D::from_config(&config).unwrap();
        let x = RawTensor::new(vec![1.0; 4], &[1, 1, 2, 2], true);
        let y = layer.forward(&x).unwrap();
        y.borrow_mut().grad = Some(Storage::cpu(vec![1.0; 9]));

        layer.backward_from_output(&x, &y).unwrap();
        // Each input pixel feeds 4 outputs through an all-ones kernel
        assert_eq!(x.grad(), Some(vec![4.0; 4]));
        layer.backward_from_output(&x, &y).unwrap();
        assert_eq!(x.grad(), Some(vec![8.0; 4]));
        // gb = sum of gy, twice
        assert_eq!(layer.grad_bias(), Some(vec![18.0]));
    }
}
