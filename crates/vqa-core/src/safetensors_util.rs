use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use log::{debug, warn};
use memmap2::MmapOptions;
use safetensors::tensor::{Dtype, SafeTensors, TensorView, View};
use tch::{nn, Device, Kind, Tensor};

use crate::error::{ModelError, Result};

/// Host copy of a tensor in safetensors layout. Floating kinds are stored as
/// `F32`, integral kinds as `I64`.
struct HostTensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl View for HostTensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

impl HostTensor {
    fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let tensor = tensor.detach().to_device(Device::Cpu).contiguous();
        let shape = tensor.size().iter().map(|&d| d as usize).collect();
        let numel = tensor.numel();

        let (dtype, data) = match tensor.kind() {
            Kind::Float | Kind::Double | Kind::Half | Kind::BFloat16 => {
                let mut buf = vec![0f32; numel];
                tensor.to_kind(Kind::Float).f_copy_data(&mut buf, numel)?;
                (Dtype::F32, buf.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
            Kind::Int64 | Kind::Int | Kind::Int16 | Kind::Int8 | Kind::Uint8 | Kind::Bool => {
                let mut buf = vec![0i64; numel];
                tensor.to_kind(Kind::Int64).f_copy_data(&mut buf, numel)?;
                (Dtype::I64, buf.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
            other => return Err(ModelError::UnsupportedDtype(format!("{:?}", other))),
        };

        Ok(Self { dtype, shape, data })
    }
}

fn kind_of(dtype: Dtype) -> Result<Kind> {
    match dtype {
        Dtype::F32 => Ok(Kind::Float),
        Dtype::F64 => Ok(Kind::Double),
        Dtype::F16 => Ok(Kind::Half),
        Dtype::BF16 => Ok(Kind::BFloat16),
        Dtype::I64 => Ok(Kind::Int64),
        Dtype::I32 => Ok(Kind::Int),
        Dtype::U8 => Ok(Kind::Uint8),
        Dtype::BOOL => Ok(Kind::Bool),
        other => Err(ModelError::UnsupportedDtype(format!("{:?}", other))),
    }
}

fn view_to_tensor(view: &TensorView<'_>, device: Device) -> Result<Tensor> {
    let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
    let kind = kind_of(view.dtype())?;
    Ok(Tensor::f_from_data_size(view.data(), &shape, kind)?.to_device(device))
}

/// Serializes named tensors into an in-memory safetensors blob.
pub fn encode_tensors(named: &[(String, Tensor)]) -> Result<Vec<u8>> {
    let views = named
        .iter()
        .map(|(name, tensor)| Ok((name.clone(), HostTensor::from_tensor(tensor)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(safetensors::serialize(views, &None)?)
}

/// Inverse of [`encode_tensors`]; tensors are placed on `device`.
pub fn decode_tensors(bytes: &[u8], device: Device) -> Result<HashMap<String, Tensor>> {
    let tensors = SafeTensors::deserialize(bytes)?;
    tensors
        .tensors()
        .iter()
        .map(|(name, view)| Ok((name.clone(), view_to_tensor(view, device)?)))
        .collect()
}

/// Writes named tensors to a safetensors file.
pub fn write_tensors<P: AsRef<Path>>(named: &[(String, Tensor)], path: P) -> Result<()> {
    let views = named
        .iter()
        .map(|(name, tensor)| Ok((name.clone(), HostTensor::from_tensor(tensor)?)))
        .collect::<Result<Vec<_>>>()?;
    safetensors::serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

/// Memory-maps a safetensors file and materializes every tensor on `device`.
pub fn read_tensors<P: AsRef<Path>>(path: P, device: Device) -> Result<HashMap<String, Tensor>> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    decode_tensors(&buffer, device)
}

/// Writes every variable of `vs` to `path`, keyed by variable name.
pub fn save_var_store<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    let mut named: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    write_tensors(&named, path)
}

/// Outcome of [`load_var_store`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Variables of the store that the file did not provide.
    pub missing: Vec<String>,
    /// Tensors in the file that the store does not know.
    pub unexpected: Vec<String>,
}

/// Copies tensors from a safetensors file into the matching variables of `vs`.
pub fn load_var_store<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<LoadReport> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();
    let mut report = LoadReport::default();

    for (name, view) in tensors.tensors() {
        if let Some(var) = variables.get_mut(&name) {
            let value = view_to_tensor(&view, device)?.to_kind(var.kind());
            tch::no_grad(|| var.f_copy_(&value))?;
            debug!("loaded tensor {}", name);
            report.loaded += 1;
            variables.remove(&name);
        } else {
            warn!("tensor {} found in safetensors but not in model", name);
            report.unexpected.push(name);
        }
    }

    report.missing = variables.into_keys().collect();
    report.missing.sort();
    Ok(report)
}
