use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tracing::info;

use crate::{device::DeviceSelection, error::ServiceError};

use super::local::{GeneratorLoader, TextGenerator};

// GPT-2 family end-of-text id, used when the tokenizer does not name one.
const DEFAULT_EOS_TOKEN: i64 = 50256;

/// Loads traced TorchScript models from `<model_dir>/<model id>/`.
///
/// Each directory holds `model.pt` and `tokenizer.json`; `/` in the model
/// id becomes `__` on disk.
pub struct TorchLoader {
    model_dir: PathBuf,
    dtype: String,
}

impl TorchLoader {
    pub fn new(model_dir: PathBuf, dtype: String) -> Self {
        Self { model_dir, dtype }
    }

    fn artifact_dir(&self, model_id: &str) -> PathBuf {
        self.model_dir.join(model_id.replace('/', "__"))
    }
}

impl GeneratorLoader for TorchLoader {
    fn load(
        &self,
        model_id: &str,
        device: &DeviceSelection,
    ) -> Result<Arc<dyn TextGenerator>, ServiceError> {
        let dir = self.artifact_dir(model_id);
        let device = device.ordinal.map(Device::Cuda).unwrap_or(Device::Cpu);
        let kind = match (self.dtype.as_str(), device) {
            ("float16" | "half", Device::Cuda(_)) => Kind::Half,
            ("bfloat16", Device::Cuda(_)) => Kind::BFloat16,
            _ => Kind::Float,
        };
        let generator = TorchGenerator::load(&dir, device, kind)?;
        info!(model = model_id, path = %dir.display(), ?device, ?kind, "torchscript model loaded");
        Ok(Arc::new(generator))
    }
}

pub struct TorchGenerator {
    tokenizer: Tokenizer,
    device: Device,
    eos_token: i64,
    module: Mutex<tch::CModule>,
}

impl TorchGenerator {
    pub fn load(dir: &Path, device: Device, kind: Kind) -> Result<Self, ServiceError> {
        let module_path = dir.join("model.pt");
        let tokenizer_path = dir.join("tokenizer.json");
        for path in [&module_path, &tokenizer_path] {
            if !path.exists() {
                return Err(ServiceError::ModelInit(format!(
                    "model artifact missing: {}",
                    path.display()
                )));
            }
        }

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let eos_token = tokenizer
            .token_to_id("<|endoftext|>")
            .map(i64::from)
            .unwrap_or(DEFAULT_EOS_TOKEN);

        let mut module = tch::CModule::load_on_device(&module_path, device)
            .map_err(|e| ServiceError::ModelInit(e.to_string()))?;
        module.set_eval();
        if kind != Kind::Float {
            module.to(device, kind, false);
        }

        Ok(Self {
            tokenizer,
            device,
            eos_token,
            module: Mutex::new(module),
        })
    }

    fn next_token(&self, logits: &Tensor, temperature: f64) -> i64 {
        if temperature <= 0.0 {
            return logits.argmax(0, false).int64_value(&[]);
        }
        (logits / temperature)
            .softmax(-1, Kind::Float)
            .multinomial(1, false)
            .int64_value(&[0])
    }
}

impl TextGenerator for TorchGenerator {
    fn generate(
        &self,
        input: &str,
        max_new_tokens: usize,
        temperature: f64,
    ) -> Result<String, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(input, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
        if ids.is_empty() {
            ids.push(0);
        }

        no_grad(|| {
            let module = self.module.lock();

            for _ in 0..max_new_tokens {
                let input_tensor = Tensor::from_slice(&ids)
                    .reshape([1, ids.len() as i64])
                    .to(self.device);

                let output = module
                    .forward_is(&[tch::IValue::Tensor(input_tensor)])
                    .map_err(|e| ServiceError::Inference(e.to_string()))?;

                // Traced causal LMs return either bare logits or (logits, past).
                let logits = match output {
                    tch::IValue::Tensor(t) => t,
                    tch::IValue::Tuple(ref items) if !items.is_empty() => match &items[0] {
                        tch::IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(ServiceError::Inference(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(ServiceError::Inference(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                let last = logits.select(1, -1).squeeze().to_kind(Kind::Float);
                let next = self.next_token(&last, temperature);
                ids.push(next);
                if next == self.eos_token {
                    break;
                }
            }

            Ok::<(), ServiceError>(())
        })?;

        // Decoding the whole sequence echoes the input, like a pipeline would.
        let all: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        self.tokenizer
            .decode(&all, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }
}
