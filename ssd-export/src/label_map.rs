//! Class name to class id lookup.

use crate::common::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapItem {
    pub name: String,
    pub id: i64,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LabelMapFile {
    item: Vec<LabelMapItem>,
}

/// Maps class names to class ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
    ids: IndexMap<String, i64>,
}

impl LabelMap {
    /// Load a label map file of the form `{ item: [{ name, id, display_name }] }`.
    pub fn open<P>(path: P, use_display_name: bool) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read label map '{}'", path.display()))?;
        let LabelMapFile { item } = json5::from_str(&text)
            .with_context(|| format!("failed to parse label map '{}'", path.display()))?;
        Self::from_items(item, use_display_name)
    }

    /// Key the items by name, or by display name if `use_display_name` is
    /// set and the item has one.
    pub fn from_items<I>(items: I, use_display_name: bool) -> Result<Self>
    where
        I: IntoIterator<Item = LabelMapItem>,
    {
        let mut ids = IndexMap::new();
        for LabelMapItem {
            name,
            id,
            display_name,
        } in items
        {
            ensure!(id >= 0, "class id of '{}' must be non-negative, but get {}", name, id);
            let key = match display_name {
                Some(display_name) if use_display_name => display_name,
                _ => name,
            };
            if let Some(prev) = ids.insert(key.clone(), id) {
                ensure!(
                    prev == id,
                    "class '{}' is mapped to both {} and {}",
                    key,
                    prev,
                    id
                );
            }
        }
        Ok(Self { ids })
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.ids.get(name).copied()
    }

    /// Look up the ids of UTF-8 encoded class names.
    pub fn lookup(&self, names: &[Vec<u8>]) -> Result<Vec<i64>> {
        names
            .iter()
            .map(|name| {
                let name = std::str::from_utf8(name).context("class name is not valid UTF-8")?;
                self.get(name)
                    .ok_or_else(|| format_err!("class '{}' is not in the label map", name))
            })
            .try_collect()
    }
}
