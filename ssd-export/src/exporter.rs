//! Writing trained detectors into deployable bundles.

use crate::{
    common::*,
    config::Config,
    input::{validate_input_shape, InputType},
};
use ssd_dl::{box_coder::BoxCoderConfig, model as ssd_model};

pub const WEIGHTS_FILE: &str = "model.ot";
pub const PIPELINE_FILE: &str = "pipeline.json";
pub const SIGNATURE_FILE: &str = "signature.json";
/// The suffix of the moving average shadow of a variable in a checkpoint.
pub const MOVING_AVERAGE_SUFFIX: &str = "/ExponentialMovingAverage";

/// The inputs and outputs of an exported detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub input_type: InputType,
    /// `[B, H, W, 3]` with `-1` for open dimensions.
    pub input_shape: Option<Vec<i64>>,
    /// `[height, width]` of the secondary input, if the detector takes one.
    pub secondary_input_size: Option<[i64; 2]>,
    pub outputs: Vec<String>,
}

impl Signature {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read signature file '{}'", path.display()))?;
        let signature = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse signature file '{}'", path.display()))?;
        Ok(signature)
    }
}

/// Build the detector, load the trained weights and write the bundle to
/// `output_dir`.
pub fn export_inference_graph(
    input_type: InputType,
    config: &Config,
    trained_checkpoint: &Path,
    output_dir: &Path,
    input_shape: Option<&[i64]>,
    use_moving_averages: bool,
) -> Result<Signature> {
    validate_input_shape(input_type, input_shape)?;

    let mut vs = nn::VarStore::new(config.device);
    let model = config.model.build(&vs.root())?;
    load_checkpoint(&mut vs, trained_checkpoint, use_moving_averages)?;

    let mut outputs: Vec<String> = [
        ssd_model::DETECTION_BOXES,
        ssd_model::DETECTION_SCORES,
        ssd_model::DETECTION_CLASSES,
        ssd_model::NUM_DETECTIONS,
        ssd_model::DETECTION_SCORES_IN_IMAGE_LEVEL,
        ssd_model::DETECTION_CLASSES_IN_IMAGE_LEVEL,
    ]
    .iter()
    .map(|name| name.to_string())
    .collect();
    if let BoxCoderConfig::Keypoint { .. } = config.model.box_coder {
        outputs.push(ssd_model::DETECTION_KEYPOINTS.to_string());
    }

    let signature = Signature {
        input_type,
        input_shape: input_shape.map(|shape| shape.to_vec()),
        secondary_input_size: model.feature_extractor().secondary_input_size(),
        outputs,
    };

    fs::create_dir_all(output_dir).with_context(|| {
        format!(
            "failed to create output directory '{}'",
            output_dir.display()
        )
    })?;
    vs.save(output_dir.join(WEIGHTS_FILE))?;
    fs::write(
        output_dir.join(PIPELINE_FILE),
        serde_json::to_string_pretty(config)?,
    )?;
    fs::write(
        output_dir.join(SIGNATURE_FILE),
        serde_json::to_string_pretty(&signature)?,
    )?;

    info!(
        "exported '{}' detector with '{}' input to '{}'",
        model.feature_extractor().name(),
        input_type,
        output_dir.display()
    );
    Ok(signature)
}

/// Copy the checkpoint tensors into the variables. With
/// `use_moving_averages`, a variable takes the value of its moving average
/// shadow when the checkpoint has one.
pub fn load_checkpoint(
    vs: &mut nn::VarStore,
    checkpoint: &Path,
    use_moving_averages: bool,
) -> Result<()> {
    let mut tensors: HashMap<String, Tensor> = Tensor::load_multi(checkpoint)
        .with_context(|| format!("failed to load checkpoint '{}'", checkpoint.display()))?
        .into_iter()
        .collect();
    let device = vs.device();
    let mut num_averaged = 0;

    tch::no_grad(|| -> Result<()> {
        for (name, mut var) in vs.variables() {
            let shadow = if use_moving_averages {
                tensors.remove(&format!("{}{}", name, MOVING_AVERAGE_SUFFIX))
            } else {
                None
            };
            let source = match shadow {
                Some(shadow) => {
                    num_averaged += 1;
                    shadow
                }
                None => tensors.remove(&name).ok_or_else(|| {
                    format_err!(
                        "the variable '{}' is missing in checkpoint '{}'",
                        name,
                        checkpoint.display()
                    )
                })?,
            };
            ensure!(
                source.size() == var.size(),
                "the variable '{}' has shape {:?}, but the checkpoint has {:?}",
                name,
                var.size(),
                source.size()
            );
            var.f_copy_(&source.to_device(device))?;
        }
        Ok(())
    })?;

    if use_moving_averages {
        info!("restored {} variables from moving averages", num_averaged);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ssd_dl::{model::FeatureExtractorConfig, model::ImageResizerConfig, SsdConfig};

    pub fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ssd-export-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn small_config() -> Config {
        Config {
            version: Version::parse("0.1.0").unwrap(),
            device: Device::Cpu,
            model: SsdConfig {
                num_classes: 2,
                feature_extractor: FeatureExtractorConfig {
                    depth_multiplier: noisy_float::prelude::r64(0.125),
                    min_depth: 8,
                    ..Default::default()
                },
                image_resizer: ImageResizerConfig {
                    height: 64,
                    width: 64,
                },
                ..Default::default()
            },
            input_reader: Default::default(),
        }
    }

    /// Save the weights of a freshly built detector as a checkpoint.
    pub fn write_checkpoint(config: &Config, path: &Path) {
        let vs = nn::VarStore::new(Device::Cpu);
        config.model.build(&vs.root()).unwrap();
        vs.save(path).unwrap();
    }

    #[test]
    fn export_bundle() {
        let dir = temp_dir("export");
        let config = small_config();
        let checkpoint = dir.join("trained.ot");
        write_checkpoint(&config, &checkpoint);

        let output_dir = dir.join("exported");
        let signature = export_inference_graph(
            InputType::ImageTensor,
            &config,
            &checkpoint,
            &output_dir,
            Some(&[1, 64, 64, 3]),
            false,
        )
        .unwrap();

        assert_eq!(signature.outputs[2], "detection_classes");
        assert!(!signature.outputs.contains(&"detection_keypoints".to_string()));
        assert_eq!(Signature::open(output_dir.join(SIGNATURE_FILE)).unwrap(), signature);
        let pipeline = fs::read_to_string(output_dir.join(PIPELINE_FILE)).unwrap();
        let pipeline: Config = serde_json::from_str(&pipeline).unwrap();
        assert_eq!(pipeline.model, config.model);

        let exported: HashMap<_, _> = Tensor::load_multi(output_dir.join(WEIGHTS_FILE))
            .unwrap()
            .into_iter()
            .collect();
        let trained: HashMap<_, _> = Tensor::load_multi(&checkpoint).unwrap().into_iter().collect();
        assert_eq!(exported.len(), trained.len());
        for (name, tensor) in &trained {
            assert!(bool::from(tensor.eq_tensor(&exported[name]).all()), "{}", name);
        }
    }

    #[test]
    fn reject_input_shape_for_records() {
        let dir = temp_dir("reject");
        let config = small_config();
        let result = export_inference_graph(
            InputType::TfExample,
            &config,
            &dir.join("missing.ot"),
            &dir.join("exported"),
            Some(&[1, 64, 64, 3]),
            false,
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("image_tensor"));
        assert!(!dir.join("exported").exists());
    }

    #[test]
    fn moving_averages_replace_variables() {
        let dir = temp_dir("ema");
        let mut vs = nn::VarStore::new(Device::Cpu);
        let weight = vs.root().zeros("weight", &[2]);
        let bias = vs.root().zeros("bias", &[1]);

        let checkpoint = dir.join("ema.ot");
        let shadow = Tensor::of_slice(&[3f32, 4.0]);
        Tensor::save_multi(
            &[
                ("weight", &Tensor::of_slice(&[1f32, 2.0])),
                ("weight/ExponentialMovingAverage", &shadow),
                ("bias", &Tensor::of_slice(&[5f32])),
            ],
            &checkpoint,
        )
        .unwrap();

        load_checkpoint(&mut vs, &checkpoint, false).unwrap();
        assert_eq!(Vec::<f32>::from(&weight), vec![1.0, 2.0]);
        load_checkpoint(&mut vs, &checkpoint, true).unwrap();
        assert_eq!(Vec::<f32>::from(&weight), vec![3.0, 4.0]);
        assert_eq!(Vec::<f32>::from(&bias), vec![5.0]);
    }

    #[test]
    fn reject_missing_variables() {
        let dir = temp_dir("missing");
        let mut vs = nn::VarStore::new(Device::Cpu);
        let _weight = vs.root().zeros("weight", &[2]);
        let checkpoint = dir.join("partial.ot");
        Tensor::save_multi(&[("other", &Tensor::of_slice(&[1f32]))], &checkpoint).unwrap();
        let err = load_checkpoint(&mut vs, &checkpoint, false).unwrap_err();
        assert!(err.to_string().contains("weight"));
    }
}
