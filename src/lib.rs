//! 2-D transposed convolution (deconvolution) for f32 tensors
//!
//! `Deconvolution2D` scatters every input pixel through a learnable kernel
//! into an upsampled output, and computes the matching gradients for the
//! input, weight and bias. Two interchangeable forward algorithms are
//! available (`DeconvAlgo::Fused` and `DeconvAlgo::Col2im`), and the same
//! operator runs on the CPU or, with the `gpu` feature, on a wgpu device.
//!
//! ```
//! use deconv::{Deconvolution2D, RawTensor, TensorOps};
//!
//! let layer = Deconvolution2D::new(3, 2, 3, 2, 1).unwrap();
//! let x = RawTensor::randn(&[2, 3, 3, 2]);
//! let y = layer.forward(&x).unwrap();
//! assert_eq!(y.shape(), vec![2, 2, 5, 3]);
//! ```

pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod gradcheck;
pub mod init;
pub mod io;
pub mod nn;
pub mod ops;
pub mod storage;
pub mod tensor;

pub use config::DeconvConfig;
pub use device::Device;
pub use dtype::DType;
pub use error::{DeconvError, Result};
pub use gradcheck::{
    allclose, assert_allclose, assert_allclose_tol, check_gradients, numerical_grad, retry,
};
pub use init::Initializer;
pub use io::{
    StateDict, StateDictDiff, TensorData, diff_state_dict, load_state_dict,
    load_state_dict_checked, save_state_dict,
};
pub use nn::{DeconvGrads, Deconvolution2D, Module};
pub use ops::{
    DeconvAlgo, DeconvBackend, DeconvGeometry, Executor, Pair, get_conv_outsize,
    get_deconv_outsize,
};
pub use storage::Storage;
pub use tensor::{RawTensor, Tensor, TensorOps};
