//! Decoding of serialized training and inference records.

use crate::{common::*, label_map::LabelMap};

/// Image-level class keys in order of preference.
const IMAGE_LEVEL_LABEL_KEYS: [&str; 2] = ["image/image_level/class/label", "image/class/label"];
const BBOX_KEYS: [&str; 4] = [
    "image/object/bbox/ymin",
    "image/object/bbox/xmin",
    "image/object/bbox/ymax",
    "image/object/bbox/xmax",
];

/// The tensors of one record.
#[derive(Debug, TensorLike)]
pub struct DecodedRecord {
    /// `[H, W, 3]` uint8
    pub image: Tensor,
    /// `[1, h, w]` float
    pub audio: Option<Tensor>,
    #[tensor_like(clone)]
    pub source_id: String,
    #[tensor_like(clone)]
    pub key: String,
    #[tensor_like(clone)]
    pub filename: String,
    /// `[N, 4]` normalized `[ymin, xmin, ymax, xmax]`
    pub groundtruth_boxes: Tensor,
    /// `[N]` int64
    pub groundtruth_classes: Tensor,
    /// `[L]` int64
    pub groundtruth_image_level_classes: Tensor,
    /// `[N, H, W]` bool
    pub groundtruth_instance_masks: Option<Tensor>,
    /// `[N]` float
    pub groundtruth_area: Tensor,
    /// `[N]` bool
    pub groundtruth_is_crowd: Tensor,
    /// `[N]` int64
    pub groundtruth_difficult: Tensor,
    /// `[N]` int64
    pub groundtruth_group_of: Tensor,
}

pub trait RecordDecoder {
    fn decode(&self, example: Example) -> Result<DecodedRecord>;
}

/// Decodes records in the object detection example layout.
#[derive(Debug, Clone, Default)]
pub struct TfExampleDecoder {
    pub load_instance_masks: bool,
    /// When set, box classes are looked up from `image/object/class/text`
    /// in preference to `image/object/class/label`.
    pub label_map: Option<LabelMap>,
    /// When set, image-level classes are looked up from
    /// `image/image_level/class/text` in preference to the label ids.
    pub image_level_label_map: Option<LabelMap>,
}

impl RecordDecoder for TfExampleDecoder {
    fn decode(&self, example: Example) -> Result<DecodedRecord> {
        let features: HashMap<_, _> = example
            .into_iter()
            .filter_map(|(name, feature)| Some((name, feature.into_kinds()?)))
            .collect();
        self.decode_features(&Features(features))
    }
}

impl TfExampleDecoder {
    fn decode_features(&self, features: &Features) -> Result<DecodedRecord> {
        let encoded = features
            .bytes("image/encoded")?
            .first()
            .ok_or_else(|| format_err!("the record has no 'image/encoded' entry"))?;
        let image = decode_image(encoded)?;
        let (image_height, image_width, _) = image.size3()?;
        let audio = self.decode_audio(features)?;

        let coordinates: Vec<_> = BBOX_KEYS
            .iter()
            .map(|key| features.floats(key))
            .try_collect()?;
        let num_boxes = coordinates[0].len();
        ensure!(
            coordinates.iter().all(|values| values.len() == num_boxes),
            "box coordinate lists have different lengths: {:?}",
            coordinates.iter().map(|values| values.len()).collect::<Vec<_>>()
        );
        let groundtruth_boxes = if num_boxes == 0 {
            Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu))
        } else {
            let coordinates: Vec<_> = coordinates
                .iter()
                .map(|values| Tensor::of_slice(values))
                .collect();
            Tensor::f_stack(&coordinates, 1)?
        };

        let groundtruth_classes = features.classes(
            self.label_map.as_ref(),
            "image/object/class/text",
            "image/object/class/label",
        )?;
        let image_level_key = IMAGE_LEVEL_LABEL_KEYS
            .iter()
            .copied()
            .find(|key| features.contains(key))
            .unwrap_or(IMAGE_LEVEL_LABEL_KEYS[0]);
        let groundtruth_image_level_classes = features.classes(
            self.image_level_label_map.as_ref(),
            "image/image_level/class/text",
            image_level_key,
        )?;

        let groundtruth_instance_masks = if self.load_instance_masks {
            let masks = Tensor::of_slice(features.floats("image/object/mask")?);
            let height = features.int_or("image/height", image_height)?;
            let width = features.int_or("image/width", image_width)?;
            Some(masks.f_reshape(&[-1, height, width])?.gt(0.0))
        } else {
            None
        };

        Ok(DecodedRecord {
            image,
            audio,
            source_id: features.string("image/source_id")?,
            key: features.string("image/key/sha256")?,
            filename: features.string("image/filename")?,
            groundtruth_boxes,
            groundtruth_classes: Tensor::of_slice(&groundtruth_classes),
            groundtruth_image_level_classes: Tensor::of_slice(&groundtruth_image_level_classes),
            groundtruth_instance_masks,
            groundtruth_area: Tensor::of_slice(features.floats("image/object/area")?),
            groundtruth_is_crowd: Tensor::of_slice(features.ints("image/object/is_crowd")?)
                .ne(0),
            groundtruth_difficult: Tensor::of_slice(features.ints("image/object/difficult")?),
            groundtruth_group_of: Tensor::of_slice(features.ints("image/object/group_of")?),
        })
    }

    /// The secondary input is either an encoded grayscale image or a raw
    /// float list with an optional shape.
    fn decode_audio(&self, features: &Features) -> Result<Option<Tensor>> {
        let audio = match features.0.get("audio/encoded") {
            None => return Ok(None),
            Some(FeatureKind::Bytes(bytes)) => match bytes.first() {
                Some(encoded) if !encoded.is_empty() => {
                    let audio = image::load_from_memory(encoded)
                        .context("failed to decode 'audio/encoded'")?
                        .to_luma8();
                    let (width, height) = audio.dimensions();
                    Tensor::of_slice(&audio.into_raw())
                        .view([1, height as i64, width as i64])
                        .to_kind(Kind::Float)
                }
                _ => return Ok(None),
            },
            Some(FeatureKind::F32(values)) => {
                let values = Tensor::of_slice(values);
                let shape = features.ints("audio/shape")?;
                if shape.is_empty() {
                    values
                } else {
                    values.f_reshape(shape)?
                }
            }
            Some(FeatureKind::I64(_)) => bail!("'audio/encoded' must be bytes or floats"),
        };

        let audio = match audio.dim() {
            2 => audio.unsqueeze(0),
            _ => audio,
        };
        Ok(Some(audio))
    }
}

/// Decode a PNG or JPEG image to `[H, W, 3]` uint8 pixels.
pub fn decode_image(encoded: &[u8]) -> Result<Tensor> {
    let image = image::load_from_memory(encoded)
        .context("failed to decode image")?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Ok(Tensor::of_slice(&image.into_raw()).view([height as i64, width as i64, 3]))
}

/// Typed access to the features of a record. Missing keys read as empty.
struct Features(HashMap<String, FeatureKind>);

impl Features {
    fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    fn bytes(&self, key: &str) -> Result<&[Vec<u8>]> {
        match self.0.get(key) {
            None => Ok(&[]),
            Some(FeatureKind::Bytes(values)) => Ok(values),
            Some(_) => bail!("'{}' must be a bytes list", key),
        }
    }

    fn floats(&self, key: &str) -> Result<&[f32]> {
        match self.0.get(key) {
            None => Ok(&[]),
            Some(FeatureKind::F32(values)) => Ok(values),
            Some(_) => bail!("'{}' must be a float list", key),
        }
    }

    fn ints(&self, key: &str) -> Result<&[i64]> {
        match self.0.get(key) {
            None => Ok(&[]),
            Some(FeatureKind::I64(values)) => Ok(values),
            Some(_) => bail!("'{}' must be an int64 list", key),
        }
    }

    /// Class ids mapped from the names under `text_key` if a label map is
    /// given and the record has names, or else read from `label_key`.
    fn classes(
        &self,
        label_map: Option<&LabelMap>,
        text_key: &str,
        label_key: &str,
    ) -> Result<Vec<i64>> {
        if let Some(label_map) = label_map {
            let names = self.bytes(text_key)?;
            if !names.is_empty() {
                return label_map
                    .lookup(names)
                    .with_context(|| format!("failed to map '{}'", text_key));
            }
        }
        Ok(self.ints(label_key)?.to_vec())
    }

    fn int_or(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self.ints(key)?.first().copied().unwrap_or(default))
    }

    fn string(&self, key: &str) -> Result<String> {
        let text = match self.bytes(key)?.first() {
            Some(bytes) => String::from_utf8(bytes.clone())
                .with_context(|| format!("'{}' is not valid UTF-8", key))?,
            None => String::new(),
        };
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label_map::LabelMapItem;
    use image::{GrayImage, ImageOutputFormat, RgbImage};

    fn encode(image: DynamicImage) -> Vec<u8> {
        let mut buf = vec![];
        image.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
        buf
    }

    fn features(entries: Vec<(&str, FeatureKind)>) -> Features {
        Features(
            entries
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }

    fn base_entries() -> Vec<(&'static str, FeatureKind)> {
        let image = encode(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            5,
            4,
            image::Rgb([10, 20, 30]),
        )));
        vec![
            ("image/encoded", FeatureKind::Bytes(vec![image])),
            ("image/source_id", FeatureKind::Bytes(vec![b"42".to_vec()])),
            ("image/object/bbox/ymin", FeatureKind::F32(vec![0.1, 0.2])),
            ("image/object/bbox/xmin", FeatureKind::F32(vec![0.1, 0.3])),
            ("image/object/bbox/ymax", FeatureKind::F32(vec![0.5, 0.6])),
            ("image/object/bbox/xmax", FeatureKind::F32(vec![0.5, 0.7])),
            ("image/object/class/label", FeatureKind::I64(vec![1, 3])),
            ("image/object/is_crowd", FeatureKind::I64(vec![0, 1])),
            ("image/image_level/class/label", FeatureKind::I64(vec![1, 3])),
        ]
    }

    #[test]
    fn decode_record() {
        let record = TfExampleDecoder::default()
            .decode_features(&features(base_entries()))
            .unwrap();

        assert_eq!(record.image.size(), vec![4, 5, 3]);
        assert_eq!(record.image.kind(), Kind::Uint8);
        assert_eq!(
            Vec::<u8>::from(&record.image.i((0, 0))),
            vec![10, 20, 30]
        );
        assert_eq!(record.source_id, "42");
        assert_eq!(record.key, "");
        assert_eq!(
            Vec::<f32>::from(&record.groundtruth_boxes.view([-1])),
            vec![0.1, 0.1, 0.5, 0.5, 0.2, 0.3, 0.6, 0.7]
        );
        assert_eq!(Vec::<i64>::from(&record.groundtruth_classes), vec![1, 3]);
        assert_eq!(
            Vec::<i64>::from(&record.groundtruth_image_level_classes),
            vec![1, 3]
        );
        assert_eq!(
            Vec::<bool>::from(&record.groundtruth_is_crowd),
            vec![false, true]
        );
        assert_eq!(record.groundtruth_area.size(), vec![0]);
        assert_eq!(record.groundtruth_difficult.size(), vec![0]);
        assert!(record.audio.is_none());
        assert!(record.groundtruth_instance_masks.is_none());
    }

    #[test]
    fn decode_audio_and_masks() {
        let mut entries = base_entries();
        entries.retain(|(key, _)| *key != "image/image_level/class/label");
        entries.extend([
            ("image/class/label", FeatureKind::I64(vec![2])),
            ("audio/encoded", FeatureKind::F32(vec![0.5; 6])),
            ("audio/shape", FeatureKind::I64(vec![3, 2])),
            ("image/height", FeatureKind::I64(vec![2])),
            ("image/width", FeatureKind::I64(vec![2])),
            (
                "image/object/mask",
                FeatureKind::F32(vec![0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.5]),
            ),
        ]);
        let record = TfExampleDecoder {
            load_instance_masks: true,
            ..Default::default()
        }
        .decode_features(&features(entries))
        .unwrap();

        assert_eq!(record.audio.unwrap().size(), vec![1, 3, 2]);
        assert_eq!(
            Vec::<i64>::from(&record.groundtruth_image_level_classes),
            vec![2]
        );
        let masks = record.groundtruth_instance_masks.unwrap();
        assert_eq!(masks.size(), vec![2, 2, 2]);
        assert_eq!(
            Vec::<bool>::from(&masks.view([-1])),
            vec![false, true, false, false, true, true, false, true]
        );
    }

    #[test]
    fn decode_encoded_audio() {
        let mut entries = base_entries();
        let audio = encode(DynamicImage::ImageLuma8(GrayImage::new(9, 20)));
        entries.push(("audio/encoded", FeatureKind::Bytes(vec![audio])));
        let record = TfExampleDecoder::default()
            .decode_features(&features(entries))
            .unwrap();
        assert_eq!(record.audio.unwrap().size(), vec![1, 20, 9]);
    }

    fn label_map() -> LabelMap {
        LabelMap::from_items(
            vec![
                LabelMapItem {
                    name: "dog".into(),
                    id: 5,
                    display_name: None,
                },
                LabelMapItem {
                    name: "cat".into(),
                    id: 7,
                    display_name: None,
                },
            ],
            false,
        )
        .unwrap()
    }

    #[test]
    fn class_names_take_precedence_with_label_map() {
        let mut entries = base_entries();
        entries.extend([
            (
                "image/object/class/text",
                FeatureKind::Bytes(vec![b"cat".to_vec(), b"dog".to_vec()]),
            ),
            (
                "image/image_level/class/text",
                FeatureKind::Bytes(vec![b"dog".to_vec()]),
            ),
        ]);
        let features = features(entries);

        let record = TfExampleDecoder {
            label_map: Some(label_map()),
            image_level_label_map: Some(label_map()),
            ..Default::default()
        }
        .decode_features(&features)
        .unwrap();
        assert_eq!(Vec::<i64>::from(&record.groundtruth_classes), vec![7, 5]);
        assert_eq!(
            Vec::<i64>::from(&record.groundtruth_image_level_classes),
            vec![5]
        );

        // names are ignored without a label map
        let record = TfExampleDecoder::default()
            .decode_features(&features)
            .unwrap();
        assert_eq!(Vec::<i64>::from(&record.groundtruth_classes), vec![1, 3]);
    }

    #[test]
    fn label_ids_are_used_without_class_names() {
        let record = TfExampleDecoder {
            label_map: Some(label_map()),
            ..Default::default()
        }
        .decode_features(&features(base_entries()))
        .unwrap();
        assert_eq!(Vec::<i64>::from(&record.groundtruth_classes), vec![1, 3]);
    }

    #[test]
    fn reject_unknown_class_name() {
        let mut entries = base_entries();
        entries.push((
            "image/object/class/text",
            FeatureKind::Bytes(vec![b"cat".to_vec(), b"bird".to_vec()]),
        ));
        let result = TfExampleDecoder {
            label_map: Some(label_map()),
            ..Default::default()
        }
        .decode_features(&features(entries));
        assert!(result.is_err());
    }

    #[test]
    fn reject_mismatched_boxes() {
        let mut entries = base_entries();
        // later entries replace earlier ones
        entries.push(("image/object/bbox/xmax", FeatureKind::F32(vec![0.5])));
        assert!(TfExampleDecoder::default()
            .decode_features(&features(entries))
            .is_err());
    }

    #[test]
    fn reject_missing_image() {
        let entries = vec![("image/source_id", FeatureKind::Bytes(vec![b"1".to_vec()]))];
        assert!(TfExampleDecoder::default()
            .decode_features(&features(entries))
            .is_err());
    }
}
