use crate::device::Device;
use crate::error::Result;
use crate::io::StateDict;
use crate::tensor::Tensor;

pub mod deconv;

pub use deconv::{DeconvGrads, Deconvolution2D};

pub trait Module {
    fn forward(&self, x: &Tensor) -> Result<Tensor>;
    fn parameters(&self) -> Vec<Tensor>;

    // State dict methods
    fn state_dict(&self) -> StateDict;
    /// Replace parameter values. Fails without modifying anything when the
    /// keys or shapes differ from `state_dict()`.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    /// Reset every parameter gradient to zeros on the parameter's device
    fn zero_grad(&mut self) -> Result<()> {
        for p in self.parameters() {
            let mut raw = p.borrow_mut();
            raw.grad = Some(raw.data.zeros_like()?);
        }
        Ok(())
    }

    /// Copy all module parameters (and their gradients) to `device`
    ///
    /// # Example
    /// ```no_run
    /// # use deconv::{Deconvolution2D, Module, Device};
    /// let mut layer = Deconvolution2D::new(3, 2, 3, 2, 1).unwrap();
    /// if let Some(device) = Device::gpu() {
    ///     layer.to_device(device).unwrap();
    /// }
    /// ```
    fn to_device(&mut self, device: Device) -> Result<()>;
}
