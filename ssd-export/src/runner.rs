//! Running exported detectors.

use crate::{
    common::*,
    config::Config,
    decoder::{decode_image, RecordDecoder, TfExampleDecoder},
    exporter::{Signature, PIPELINE_FILE, SIGNATURE_FILE, WEIGHTS_FILE},
    input::{check_input_shape, InputType},
};
use ssd_dl::SsdMetaArch;

/// A batch of inputs in one of the exported input modes.
pub enum RunnerInput<'a> {
    /// `[B, H, W, 3]` pixels with an optional `[B, h, w, 1]` secondary input.
    ImageTensor {
        images: &'a Tensor,
        secondary: Option<&'a Tensor>,
    },
    /// Encoded images with optional encoded grayscale secondary inputs.
    EncodedImages {
        images: &'a [Vec<u8>],
        secondary: Option<&'a [Vec<u8>]>,
    },
    TfExamples(Vec<Example>),
}

impl RunnerInput<'_> {
    pub fn input_type(&self) -> InputType {
        match self {
            Self::ImageTensor { .. } => InputType::ImageTensor,
            Self::EncodedImages { .. } => InputType::EncodedImageStringTensor,
            Self::TfExamples(_) => InputType::TfExample,
        }
    }
}

/// Runs `preprocess`, `predict` and `postprocess` of an exported detector.
#[derive(Debug)]
pub struct InferenceRunner {
    vs: nn::VarStore,
    model: SsdMetaArch,
    signature: Signature,
    decoder: TfExampleDecoder,
}

impl InferenceRunner {
    pub fn load<P>(export_dir: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let export_dir = export_dir.as_ref();
        let config = Config::open(export_dir.join(PIPELINE_FILE))?;
        let signature = Signature::open(export_dir.join(SIGNATURE_FILE))?;
        let decoder = config.input_reader.build_decoder()?;

        let mut vs = nn::VarStore::new(config.device);
        let model = config.model.build(&vs.root())?;
        let weights_file = export_dir.join(WEIGHTS_FILE);
        vs.load(&weights_file)
            .with_context(|| format!("failed to load weights '{}'", weights_file.display()))?;
        vs.freeze();

        Ok(Self {
            vs,
            model,
            signature,
            decoder,
        })
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Run a batch and return the named outputs of the signature on CPU.
    pub fn run(&self, input: RunnerInput<'_>) -> Result<IndexMap<String, Tensor>> {
        ensure!(
            input.input_type() == self.signature.input_type,
            "the detector takes '{}' inputs, but get '{}'",
            self.signature.input_type,
            input.input_type()
        );

        let (images, secondary) = match input {
            RunnerInput::ImageTensor { images, secondary } => {
                let size = images.f_size_of_rank(4, "images")?;
                ensure!(
                    size[3] == 3,
                    "images must have shape [batch, height, width, 3], but get {:?}",
                    size
                );
                if let Some(input_shape) = &self.signature.input_shape {
                    check_input_shape(input_shape, &size)?;
                }
                let images = images.to_kind(Kind::Float).permute(&[0, 3, 1, 2]);
                let secondary = secondary
                    .map(|secondary| -> Result<_> {
                        secondary.f_size_of_rank(4, "secondary inputs")?;
                        Ok(secondary.to_kind(Kind::Float).permute(&[0, 3, 1, 2]))
                    })
                    .transpose()?;
                (images, secondary)
            }
            RunnerInput::EncodedImages { images, secondary } => {
                let images: Vec<_> = images
                    .iter()
                    .map(|encoded| decode_image(encoded))
                    .try_collect()?;
                let secondary: Option<Vec<_>> = secondary
                    .map(|secondary| {
                        secondary
                            .iter()
                            .map(|encoded| decode_grayscale(encoded))
                            .try_collect()
                    })
                    .transpose()?;
                self.batch(images, secondary)?
            }
            RunnerInput::TfExamples(examples) => {
                let records: Vec<_> = examples
                    .into_iter()
                    .map(|example| self.decoder.decode(example))
                    .try_collect()?;
                let has_audio = records.iter().all(|record| record.audio.is_some());
                let (images, secondary): (Vec<_>, Vec<_>) = records
                    .into_iter()
                    .map(|record| (record.image, record.audio))
                    .unzip();
                let secondary = if has_audio {
                    Some(secondary.into_iter().flatten().collect())
                } else {
                    None
                };
                self.batch(images, secondary)?
            }
        };

        let device = self.device();
        let outputs = tch::no_grad(|| -> Result<_> {
            let (preprocessed, secondary) = self.model.preprocess(
                &images.to_device(device),
                secondary.map(|secondary| secondary.to_device(device)).as_ref(),
            )?;
            let prediction = self.model.predict(&preprocessed, secondary.as_ref(), false)?;
            self.model.postprocess(&prediction)
        })?;

        let mut outputs = outputs.into_named_tensors();
        let outputs: IndexMap<_, _> = self
            .signature
            .outputs
            .iter()
            .map(|name| -> Result<_> {
                let tensor = outputs
                    .remove(name)
                    .ok_or_else(|| format_err!("the detector does not produce '{}'", name))?;
                Ok((name.clone(), tensor.to_device(Device::Cpu)))
            })
            .try_collect()?;
        Ok(outputs)
    }

    /// Resize `[H, W, C]` images and `[1, h, w]` secondary inputs of
    /// varying sizes and stack them into `[B, C, H, W]` batches.
    fn batch(
        &self,
        images: Vec<Tensor>,
        secondary: Option<Vec<Tensor>>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        ensure!(!images.is_empty(), "the input batch must not be empty");
        let [height, width] = self.model.image_size();
        let images: Vec<_> = images
            .iter()
            .map(|image| {
                image
                    .to_kind(Kind::Float)
                    .permute(&[2, 0, 1])
                    .unsqueeze(0)
                    .f_resize_bilinear(height, width)
            })
            .try_collect()?;
        let images = Tensor::f_cat(&images, 0)?;

        let secondary = secondary
            .map(|secondary| -> Result<_> {
                let [height, width] = match self.signature.secondary_input_size {
                    Some(size) => size,
                    None => {
                        let size = secondary[0].size();
                        [size[1], size[2]]
                    }
                };
                let secondary: Vec<_> = secondary
                    .iter()
                    .map(|input| input.unsqueeze(0).f_resize_bilinear(height, width))
                    .try_collect()?;
                Ok(Tensor::f_cat(&secondary, 0)?)
            })
            .transpose()?;

        Ok((images, secondary))
    }
}

/// Decode an encoded image into `[1, H, W]` float luma.
fn decode_grayscale(encoded: &[u8]) -> Result<Tensor> {
    let image = image::load_from_memory(encoded)
        .context("failed to decode secondary input")?
        .to_luma8();
    let (width, height) = image.dimensions();
    Ok(Tensor::of_slice(&image.into_raw())
        .view([1, height as i64, width as i64])
        .to_kind(Kind::Float))
}
