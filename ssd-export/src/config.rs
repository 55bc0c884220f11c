//! The export configuration format.

use crate::{common::*, decoder::TfExampleDecoder, label_map::LabelMap};
use ssd_dl::SsdConfig;

pub static CONFIG_VERSION: Lazy<VersionReq> = Lazy::new(|| VersionReq::parse("0.1.0").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,
    /// The device where the model is built.
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    pub model: SsdConfig,
    #[serde(default)]
    pub input_reader: InputReaderConfig,
}

/// How serialized records are decoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputReaderConfig {
    pub load_instance_masks: bool,
    /// Label map for `image/object/class/text`.
    pub label_map_path: Option<PathBuf>,
    /// Label map for `image/image_level/class/text`.
    pub image_level_label_map_path: Option<PathBuf>,
    /// Key the label maps by display name instead of name.
    pub use_display_name: bool,
}

impl InputReaderConfig {
    pub fn build_decoder(&self) -> Result<TfExampleDecoder> {
        let Self {
            load_instance_masks,
            ref label_map_path,
            ref image_level_label_map_path,
            use_display_name,
        } = *self;
        let open = |path: &Option<PathBuf>| {
            path.as_ref()
                .map(|path| LabelMap::open(path, use_display_name))
                .transpose()
        };

        Ok(TfExampleDecoder {
            load_instance_masks,
            label_map: open(label_map_path)?,
            image_level_label_map: open(image_level_label_map_path)?,
        })
    }
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config = json5::from_str(&text)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        Ok(config)
    }
}

pub fn deserialize_version<'de, D>(deserializer: D) -> Result<Version, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let version = Version::parse(&text).map_err(|err| {
        D::Error::custom(format!(
            "failed to parse version number '{}': {:?}",
            text, err
        ))
    })?;

    if !CONFIG_VERSION.matches(&version) {
        return Err(D::Error::custom(format!(
            "incompatible version: get '{}', but it is incompatible with requirement '{}'",
            version, &*CONFIG_VERSION,
        )));
    }

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config() {
        let config: Config = json5::from_str(
            r#"{
                version: "0.1.0",
                device: "cpu",
                model: { num_classes: 4 },
            }"#,
        )
        .unwrap();
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.model.num_classes, 4);
    }

    #[test]
    fn build_decoder_with_label_map() {
        let path = std::env::temp_dir().join(format!("input_reader_{}.json5", std::process::id()));
        fs::write(&path, r#"{ item: [{ name: "n02084071", id: 3, display_name: "dog" }] }"#)
            .unwrap();
        let config: Config = json5::from_str(&format!(
            r#"{{
                version: "0.1.0",
                device: "cpu",
                model: {{ num_classes: 4 }},
                input_reader: {{
                    label_map_path: {:?},
                    use_display_name: true,
                }},
            }}"#,
            path.display().to_string()
        ))
        .unwrap();
        let decoder = config.input_reader.build_decoder();
        fs::remove_file(&path).unwrap();
        let decoder = decoder.unwrap();

        assert_eq!(decoder.label_map.unwrap().get("dog"), Some(3));
        assert!(decoder.image_level_label_map.is_none());
        assert!(!decoder.load_instance_masks);
    }

    #[test]
    fn input_reader_defaults() {
        let config: Config =
            json5::from_str(r#"{ version: "0.1.0", device: "cpu", model: {} }"#).unwrap();
        let decoder = config.input_reader.build_decoder().unwrap();
        assert!(decoder.label_map.is_none());
    }

    #[test]
    fn reject_incompatible_version() {
        let result: Result<Config, _> = json5::from_str(
            r#"{ version: "2.0.0", device: "cpu", model: {} }"#,
        );
        assert!(result.is_err());
    }
}
