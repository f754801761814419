use crate::error::{DeconvError, Result};
use crate::nn::Module;
use crate::tensor::{RawTensor, Tensor};
use bincode::{Decode, Encode, config};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

pub type StateDict = BTreeMap<String, TensorData>;

// Serializable representation of tensor data
#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct TensorData {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

/// Summary of differences between two state dicts.
///
/// `expected` is usually taken from `module.state_dict()`, and `loaded` is
/// what was deserialized or passed in.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateDictDiff {
    /// Keys that exist in `expected` but are missing from `loaded`.
    pub missing_keys: Vec<String>,
    /// Keys that exist in `loaded` but not in `expected`.
    pub unexpected_keys: Vec<String>,
    /// `(key, expected_shape, loaded_shape)` for keys present in both
    pub shape_mismatches: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl StateDictDiff {
    /// Returns true if there are no missing, unexpected, or shape-mismatched keys.
    pub fn is_empty(&self) -> bool {
        self.missing_keys.is_empty()
            && self.unexpected_keys.is_empty()
            && self.shape_mismatches.is_empty()
    }
}

impl TensorData {
    /// Host snapshot of a tensor (reads back from the GPU when needed)
    pub fn from_tensor(t: &Tensor) -> Self {
        let borrowed = t.borrow();
        TensorData {
            data: borrowed.data.to_vec(),
            shape: borrowed.shape.clone(),
        }
    }

    /// A new CPU tensor holding this data
    pub fn to_tensor(&self, requires_grad: bool) -> Result<Tensor> {
        let expected: usize = self.shape.iter().product();
        if self.data.len() != expected {
            return Err(DeconvError::shape(
                "tensor data",
                &[expected],
                &[self.data.len()],
            ));
        }
        Ok(RawTensor::new(self.data.clone(), &self.shape, requires_grad))
    }
}

/// Compute a diff between an "expected" and a "loaded" state dict.
///
/// Does not mutate any tensors.
pub fn diff_state_dict(expected: &StateDict, loaded: &StateDict) -> StateDictDiff {
    let mut diff = StateDictDiff::default();

    for (key, expected_td) in expected {
        match loaded.get(key) {
            None => diff.missing_keys.push(key.clone()),
            Some(actual_td) => {
                if expected_td.shape != actual_td.shape {
                    diff.shape_mismatches.push((
                        key.clone(),
                        expected_td.shape.clone(),
                        actual_td.shape.clone(),
                    ));
                }
            }
        }
    }

    for key in loaded.keys() {
        if !expected.contains_key(key) {
            diff.unexpected_keys.push(key.clone());
        }
    }

    diff
}

/// Load a state dict into `module` and report what differed.
///
/// The diff is computed before delegating to `module.load_state_dict`, which
/// rejects any non-empty diff.
pub fn load_state_dict_checked<M: Module + ?Sized>(
    module: &mut M,
    state: &StateDict,
) -> (StateDictDiff, Result<()>) {
    let expected = module.state_dict();
    let diff = diff_state_dict(&expected, state);
    let result = module.load_state_dict(state);
    (diff, result)
}

pub fn save_state_dict(state: &StateDict, path: impl AsRef<Path>) -> Result<()> {
    let mut file = File::create(path)?;
    let encoded = bincode::encode_to_vec(state, config::standard())
        .map_err(|e| DeconvError::Config(format!("state dict encode: {e}")))?;
    file.write_all(&encoded)?;
    Ok(())
}

pub fn load_state_dict(path: impl AsRef<Path>) -> Result<StateDict> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let (state, _): (StateDict, _) = bincode::decode_from_slice(&buffer, config::standard())
        .map_err(|e| DeconvError::Config(format!("state dict decode: {e}")))?;
    Ok(state)
}

#[cfg(test)]
mod io_tests {
    use super::*;
    use crate::config::DeconvConfig;
    use crate::nn::Deconvolution2D;
    use crate::tensor::TensorOps;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("deconv_{}_{name}.bin", std::process::id()))
    }

    #[test]
    fn test_save_load_deconvolution() {
        let layer = Deconvolution2D::from_config(&DeconvConfig::new(3, 2, 3, 2, 1).with_seed(1))
            .unwrap();
        layer.set_bias(&RawTensor::new(vec![0.25, -0.5], &[2], false)).unwrap();
        let path = temp_path("roundtrip");

        save_state_dict(&layer.state_dict(), &path).unwrap();

        let mut layer2 =
            Deconvolution2D::from_config(&DeconvConfig::new(3, 2, 3, 2, 1).with_seed(2)).unwrap();
        assert_ne!(layer.weight().to_vec(), layer2.weight().to_vec());

        let loaded_state = load_state_dict(&path).unwrap();
        layer2.load_state_dict(&loaded_state).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(layer.weight().to_vec(), layer2.weight().to_vec());
        assert_eq!(layer2.bias().map(|b| b.to_vec()), Some(vec![0.25, -0.5]));
    }

    #[test]
    fn test_state_dict_diff_reports_mismatches() {
        let layer = Deconvolution2D::new(3, 2, 3, 1, 0).unwrap();
        let expected = layer.state_dict();

        // One missing key, one unexpected key, one shape mismatch
        let mut loaded = expected.clone();
        loaded.remove("bias");
        loaded.insert(
            "extra".to_string(),
            TensorData {
                data: vec![0.0],
                shape: vec![1],
            },
        );
        if let Some(td) = loaded.get_mut("weight") {
            td.shape = vec![999];
        }

        let diff = diff_state_dict(&expected, &loaded);
        assert!(!diff.is_empty());
        assert!(diff.missing_keys.contains(&"bias".to_string()));
        assert!(diff.unexpected_keys.contains(&"extra".to_string()));
        assert!(
            diff.shape_mismatches
                .iter()
                .any(|(k, _exp, _act)| k == "weight")
        );
    }

    #[test]
    fn test_checked_load_rejects_mismatch() {
        let mut layer = Deconvolution2D::new(3, 2, 3, 1, 0).unwrap();
        let before = layer.weight().to_vec();
        let mut state = layer.state_dict();
        state.remove("bias");
        let (diff, result) = load_state_dict_checked(&mut layer, &state);
        assert_eq!(diff.missing_keys, vec!["bias".to_string()]);
        assert!(result.is_err());
        assert_eq!(layer.weight().to_vec(), before);
    }

    #[test]
    fn test_garbage_file_is_config_error() {
        let path = temp_path("garbage");
        std::fs::write(&path, [0xff, 0xff, 0xff]).unwrap();
        let err = load_state_dict(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, DeconvError::Config(_)));
    }

    #[test]
    fn test_to_tensor_checks_count() {
        let td = TensorData {
            data: vec![1.0; 3],
            shape: vec![2, 2],
        };
        assert!(td.to_tensor(false).is_err());
    }
}
