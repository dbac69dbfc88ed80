//! Inference runner: preprocess, bind, execute, copy back

use gpu_device::{DeviceBuffer, DeviceImage, DevicePtr, Normalization, CHANNELS};
use half::f16;
use tracing::debug;

use crate::backend::{Binding, DataType};
use crate::engine::{Engine, FeatureVectors};
use crate::EngineError;

impl<'a> Engine<'a> {
    /// Run one batch of device-resident images through the loaded network.
    ///
    /// Images are resized to the engine input if needed, scaled to `[0, 1]`,
    /// then normalized per channel as `(x - subtract) / divide`. The result
    /// holds, for each image, one flattened vector per output binding. Blocks
    /// until the device work has finished.
    pub fn run_inference(
        &mut self,
        inputs: &[DeviceImage],
        normalization: &Normalization,
    ) -> Result<FeatureVectors, EngineError> {
        self.try_run(inputs, normalization).map_err(|e| self.report(e))
    }

    fn try_run(
        &mut self,
        inputs: &[DeviceImage],
        normalization: &Normalization,
    ) -> Result<FeatureVectors, EngineError> {
        let max_batch_size = self.options.max_batch_size as usize;
        let network = self.network.as_mut().ok_or_else(|| {
            EngineError::Artifact("network is not loaded, call load_network() first".to_string())
        })?;

        let batch = inputs.len();
        if batch == 0 {
            return Err(EngineError::Configuration("input batch is empty".to_string()));
        }
        if batch > max_batch_size {
            return Err(EngineError::Configuration(format!(
                "batch size {} exceeds max_batch_size {}",
                batch, max_batch_size
            )));
        }
        let dims = inputs[0].dimensions();
        if let Some(odd) = inputs.iter().find(|i| i.dimensions() != dims) {
            return Err(EngineError::Configuration(format!(
                "all images in a batch must share dimensions, got {}x{} and {}x{}",
                dims.0,
                dims.1,
                odd.width(),
                odd.height()
            )));
        }
        normalization.validate()?;
        if let Some(fixed) = network.fixed_batch {
            if batch != fixed {
                return Err(EngineError::Configuration(format!(
                    "engine was built for a fixed batch of {}, got {}",
                    fixed, batch
                )));
            }
        }

        network.context.set_batch_size(batch)?;

        let (width, height) = (network.input_width, network.input_height);
        let item_bytes = CHANNELS * width as usize * height as usize * std::mem::size_of::<f32>();
        let mut input = DeviceBuffer::alloc(item_bytes * batch)?;
        gpu_device::blob_from_images(
            inputs,
            &mut input,
            width,
            height,
            normalization,
            &network.stream,
        )?;

        let mut addresses = vec![DevicePtr::null(); network.bindings.len()];
        let mut outputs: Vec<(&Binding, DeviceBuffer)> = Vec::new();
        for binding in &network.bindings {
            let slot = addresses.get_mut(binding.index).ok_or_else(|| {
                EngineError::Runtime(format!("binding index {} out of range", binding.index))
            })?;
            if binding.is_input() {
                *slot = input.as_ptr();
            } else {
                let bytes = binding.elements_per_item * batch * binding.data_type.size_bytes();
                let buffer = DeviceBuffer::alloc(bytes)?;
                *slot = buffer.as_ptr();
                outputs.push((binding, buffer));
            }
        }

        network.context.enqueue(&addresses, &network.stream)?;
        network.stream.synchronize()?;

        let mut features: FeatureVectors =
            (0..batch).map(|_| Vec::with_capacity(outputs.len())).collect();
        for (binding, buffer) in &outputs {
            let values = download_as_f32(binding, buffer)?;
            for (item, chunk) in features.iter_mut().zip(values.chunks(binding.elements_per_item)) {
                item.push(chunk.to_vec());
            }
        }
        debug!("Ran batch of {} through {} output(s)", batch, outputs.len());
        Ok(features)
    }
}

fn download_as_f32(binding: &Binding, buffer: &DeviceBuffer) -> Result<Vec<f32>, EngineError> {
    match binding.data_type {
        DataType::Float => Ok(buffer.download::<f32>()?),
        DataType::Half => Ok(buffer
            .download::<u16>()?
            .into_iter()
            .map(|bits| f16::from_bits(bits).to_f32())
            .collect()),
        other => Err(EngineError::Runtime(format!(
            "output {} has unsupported element type {:?}",
            binding.name, other
        ))),
    }
}
