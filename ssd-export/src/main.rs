use anyhow::{Context, Result};
use ssd_export::{
    decoder::decode_image, export_inference_graph, input::parse_input_shape, Config,
    InferenceRunner, InputType, RunnerInput,
};
use std::{fs, path::PathBuf};
use structopt::StructOpt;
use tch::{Kind, Tensor};
use tfrecord::{ExampleIter, RecordReaderConfig};

#[derive(Debug, Clone, StructOpt)]
/// Export and run single-shot detectors
enum Args {
    /// Export a trained checkpoint into a deployable bundle
    Export {
        #[structopt(long)]
        /// configuration file
        config_file: PathBuf,
        #[structopt(long, default_value = "image_tensor")]
        /// one of image_tensor, encoded_image_string_tensor and tf_example
        input_type: InputType,
        #[structopt(long)]
        /// trained weights file
        trained_checkpoint: PathBuf,
        #[structopt(long)]
        /// output directory
        output_dir: PathBuf,
        #[structopt(long)]
        /// fixed B,H,W,C shape of image_tensor inputs, e.g. 1,300,300,3
        input_shape: Option<String>,
        #[structopt(long)]
        /// restore variables from their moving averages
        use_moving_averages: bool,
    },
    /// Run an exported bundle on images or record files
    Infer {
        #[structopt(long)]
        /// directory of the exported bundle
        export_dir: PathBuf,
        #[structopt(long, required = true)]
        /// image files, or record files for tf_example bundles
        input: Vec<PathBuf>,
    },
}

pub fn main() -> Result<()> {
    pretty_env_logger::init();

    match Args::from_args() {
        Args::Export {
            config_file,
            input_type,
            trained_checkpoint,
            output_dir,
            input_shape,
            use_moving_averages,
        } => {
            let input_shape = input_shape
                .as_deref()
                .map(parse_input_shape)
                .transpose()?;
            let config = Config::open(&config_file)?;
            export_inference_graph(
                input_type,
                &config,
                &trained_checkpoint,
                &output_dir,
                input_shape.as_deref(),
                use_moving_averages,
            )?;
        }
        Args::Infer { export_dir, input } => {
            let runner = InferenceRunner::load(&export_dir)?;
            let input_type = runner.signature().input_type;

            match input_type {
                InputType::ImageTensor => {
                    for path in &input {
                        let encoded = fs::read(path)
                            .with_context(|| format!("failed to read '{}'", path.display()))?;
                        let images = decode_image(&encoded)?.unsqueeze(0);
                        let outputs = runner.run(RunnerInput::ImageTensor {
                            images: &images,
                            secondary: None,
                        })?;
                        print_outputs(&path.display().to_string(), outputs)?;
                    }
                }
                InputType::EncodedImageStringTensor => {
                    for path in &input {
                        let encoded = fs::read(path)
                            .with_context(|| format!("failed to read '{}'", path.display()))?;
                        let outputs = runner.run(RunnerInput::EncodedImages {
                            images: &[encoded],
                            secondary: None,
                        })?;
                        print_outputs(&path.display().to_string(), outputs)?;
                    }
                }
                InputType::TfExample => {
                    for path in &input {
                        let examples = ExampleIter::open(path, RecordReaderConfig::default())
                            .with_context(|| format!("failed to open '{}'", path.display()))?;
                        for (index, example) in examples.enumerate() {
                            let outputs = runner.run(RunnerInput::TfExamples(vec![example?]))?;
                            print_outputs(&format!("{}#{}", path.display(), index), outputs)?;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_outputs(source: &str, outputs: indexmap::IndexMap<String, Tensor>) -> Result<()> {
    let outputs: serde_json::Map<_, _> = outputs
        .into_iter()
        .map(|(name, tensor)| {
            let values = Vec::<f64>::from(&tensor.to_kind(Kind::Double).reshape(&[-1]));
            let value = serde_json::json!({
                "shape": tensor.size(),
                "values": values,
            });
            (name, value)
        })
        .collect();
    let line = serde_json::json!({ "source": source, "outputs": outputs });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}
