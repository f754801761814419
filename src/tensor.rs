use crate::device::Device;
use crate::dtype::DType;
use crate::error::{DeconvError, Result};
use crate::storage::Storage;
use rand::Rng;
use rand_distr::StandardNormal;
use std::cell::RefCell;
use std::rc::Rc;

/// Type alias for a reference-counted, interior-mutable tensor.
///
/// Multiple handles can point at the same tensor (the operator's weight is
/// shared with gradient checkers that perturb it in place), and gradient
/// accumulation mutates through a shared handle.
///
/// Single-threaded only.
pub type Tensor = Rc<RefCell<RawTensor>>;

// ===== RAW TENSOR STRUCTURE =====

/// The core tensor structure: data plus an optional gradient buffer
///
/// Fields:
/// - `data`: flat storage (row-major order)
/// - `shape`: dimensions, e.g. [batch, channels, height, width]
/// - `grad`: accumulated gradient, same length and device as `data`
/// - `requires_grad`: whether a backward pass should write `grad`
/// - `device`: where the data lives
pub struct RawTensor {
    pub data: Storage,
    pub shape: Vec<usize>,
    pub grad: Option<Storage>,
    pub requires_grad: bool,
    pub device: Device,
}

impl Clone for RawTensor {
    fn clone(&self) -> Self {
        RawTensor {
            data: self.data.clone(),
            shape: self.shape.clone(),
            grad: self.grad.clone(),
            requires_grad: self.requires_grad,
            device: self.device.clone(),
        }
    }
}

impl std::fmt::Debug for RawTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.data.dtype())
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.is_some())
            .field("device", &self.device)
            .finish()
    }
}

// ===== TENSOR CONSTRUCTORS =====
impl RawTensor {
    /// Create a new f32 CPU tensor from data and shape
    ///
    /// # Panics
    /// Panics if data.len() != shape.product()
    pub fn new(data: Vec<f32>, shape: &[usize], requires_grad: bool) -> Tensor {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Data length must match shape"
        );
        Self::wrap(Storage::cpu(data), shape, requires_grad, Device::CPU)
    }

    /// Create a new f64 CPU tensor. The operator rejects these.
    ///
    /// # Panics
    /// Panics if data.len() != shape.product()
    pub fn new_f64(data: Vec<f64>, shape: &[usize], requires_grad: bool) -> Tensor {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Data length must match shape"
        );
        Self::wrap(Storage::cpu_f64(data), shape, requires_grad, Device::CPU)
    }

    /// Create a tensor from existing storage, checking the element count
    pub fn from_storage(
        data: Storage,
        shape: &[usize],
        requires_grad: bool,
        device: Device,
    ) -> Result<Tensor> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(DeconvError::shape("tensor storage", &[expected], &[data.len()]));
        }
        Ok(Self::wrap(data, shape, requires_grad, device))
    }

    fn wrap(data: Storage, shape: &[usize], requires_grad: bool, device: Device) -> Tensor {
        Rc::new(RefCell::new(RawTensor {
            data,
            shape: shape.to_vec(),
            grad: None,
            requires_grad,
            device,
        }))
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        Self::new(vec![0.0; size], shape, false)
    }

    /// Create a tensor with values uniformly distributed in [low, high)
    pub fn uniform(shape: &[usize], low: f32, high: f32) -> Tensor {
        let size = shape.iter().product();
        let mut rng = rand::rng();
        let data: Vec<f32> = (0..size).map(|_| rng.random_range(low..high)).collect();
        Self::new(data, shape, false)
    }

    /// Create a tensor with values from standard normal distribution N(0, 1)
    pub fn randn(shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        let mut rng = rand::rng();
        let data: Vec<f32> = (0..size).map(|_| rng.sample(StandardNormal)).collect();
        Self::new(data, shape, false)
    }

    /// Element type of the data
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

// ===== TRAIT-BASED API =====

/// Convenience methods on the shared `Tensor` handle
pub trait TensorOps {
    fn shape(&self) -> Vec<usize>;
    fn dtype(&self) -> DType;
    fn device(&self) -> Device;
    /// Data as a host vector (reads back from the GPU when needed)
    fn to_vec(&self) -> Vec<f32>;
    /// Gradient as a host vector
    fn grad(&self) -> Option<Vec<f32>>;
    /// Copy this tensor (data and gradient) onto `device`
    fn to_device(&self, device: Device) -> Result<Tensor>;
    /// Overwrite the data with host values, keeping shape and device
    fn set_data(&self, data: Vec<f32>) -> Result<()>;
}

impl TensorOps for Tensor {
    fn shape(&self) -> Vec<usize> {
        self.borrow().shape.clone()
    }
    fn dtype(&self) -> DType {
        self.borrow().dtype()
    }
    fn device(&self) -> Device {
        self.borrow().device.clone()
    }
    fn to_vec(&self) -> Vec<f32> {
        self.borrow().data.to_vec()
    }
    fn grad(&self) -> Option<Vec<f32>> {
        self.borrow().grad.as_ref().map(Storage::to_vec)
    }

    fn to_device(&self, device: Device) -> Result<Tensor> {
        let t = self.borrow();
        let data = t.data.to_device(&device)?;
        let grad = t.grad.as_ref().map(|g| g.to_device(&device)).transpose()?;
        Ok(Rc::new(RefCell::new(RawTensor {
            data,
            shape: t.shape.clone(),
            grad,
            requires_grad: t.requires_grad,
            device,
        })))
    }

    fn set_data(&self, data: Vec<f32>) -> Result<()> {
        let mut t = self.borrow_mut();
        let expected = t.numel();
        if data.len() != expected {
            return Err(DeconvError::shape("set_data", &[expected], &[data.len()]));
        }
        t.data = Storage::cpu(data).to_device(&t.device)?;
        Ok(())
    }
}
