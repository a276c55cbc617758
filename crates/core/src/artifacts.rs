//! Loading of trained model artifacts from an artifact directory.
//!
//! Three files are recognized:
//! - parameters (safetensors, `F32`/`F64`): `<layer>.weight`, `<layer>.bias`,
//!   and batch-norm statistics `{weight,bias,running_mean,running_var}`
//!   either nested as `<layer>.bn.*` or in the next sibling module of a
//!   numbered `nn.Sequential` (`layers.3.*` after the conv `layers.2`)
//! - layer list (JSON array of layer names in forward order)
//! - index tables (safetensors, `I64`): `<layer>.geometry`,
//!   `<layer>.columns`, `<layer>.rows`
//!
//! The layer list and index tables are required by the portable backend
//! only. Everything is read once per [`ArtifactStore::load`] call and owned
//! by the returned [`ModelArtifacts`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info};

use crate::backend::ModelSelector;
use crate::config::ModelConfig;
use crate::error::DenoiseError;
use crate::im2col::{IndexTable, TableGeometry};
use crate::network::Network;

/// Trained tensors keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ParameterSet {
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&ArrayD<f32>, DenoiseError> {
        self.get(name)
            .ok_or_else(|| DenoiseError::config(format!("parameter '{name}' is missing")))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    fn is_conv(&self, module: &str) -> bool {
        self.get(&format!("{module}.weight")).is_some_and(|w| w.ndim() == 4)
    }

    /// Convolution layer names in natural order (`dncnn.2` before
    /// `dncnn.10`), derived from rank-4 `<layer>.weight` keys.
    pub fn derive_layer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .names()
            .filter_map(|key| key.strip_suffix(".weight"))
            .filter(|module| self.is_conv(module))
            .map(str::to_string)
            .collect();
        names.sort_by(|a, b| natural_cmp(a, b));
        names
    }

    /// Module holding the batch-norm statistics of conv layer `conv`:
    /// `<conv>.bn` when present, otherwise the first numbered sibling after
    /// `conv` that carries `running_mean` with no other conv in between.
    pub fn batch_norm_prefix(&self, conv: &str) -> Option<String> {
        let nested = format!("{conv}.bn");
        if self.get(&format!("{nested}.running_mean")).is_some() {
            return Some(nested);
        }

        let (parent, index) = conv.rsplit_once('.')?;
        let index: u64 = index.parse().ok()?;
        let sibling = |key: &str| -> Option<u64> {
            let (module, _) = key.rsplit_once('.')?;
            let (p, i) = module.rsplit_once('.')?;
            if p != parent {
                return None;
            }
            i.parse().ok().filter(|&i| i > index)
        };

        let next_conv = self
            .names()
            .filter(|key| key.ends_with(".weight"))
            .filter(|key| self.is_conv(key.trim_end_matches(".weight")))
            .filter_map(sibling)
            .min();
        self.names()
            .filter(|key| key.ends_with(".running_mean"))
            .filter_map(sibling)
            .filter(|&i| next_conv.map_or(true, |c| i < c))
            .min()
            .map(|i| format!("{parent}.{i}"))
    }

    pub fn from_safetensors(bytes: &[u8]) -> Result<Self> {
        let file = SafeTensors::deserialize(bytes).context("failed to decode safetensors header")?;
        let mut tensors = BTreeMap::new();
        for (name, view) in file.tensors() {
            let values = decode_floats(&view).with_context(|| format!("tensor '{name}'"))?;
            let array = ArrayD::from_shape_vec(IxDyn(view.shape()), values)
                .with_context(|| format!("tensor '{name}' has inconsistent shape"))?;
            tensors.insert(name, array);
        }
        Ok(Self { tensors })
    }

    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = self
            .tensors
            .iter()
            .map(|(name, tensor)| {
                let bytes = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.clone(), tensor.shape().to_vec(), bytes)
            })
            .collect();
        serialize_tensors(&encoded, Dtype::F32)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_safetensors()?;
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Precomputed im2col tables keyed by layer name.
#[derive(Debug, Clone, Default)]
pub struct IndexTables {
    tables: HashMap<String, IndexTable>,
}

impl IndexTables {
    pub fn insert(&mut self, layer: impl Into<String>, table: IndexTable) {
        self.tables.insert(layer.into(), table);
    }

    pub fn get(&self, layer: &str) -> Option<&IndexTable> {
        self.tables.get(layer)
    }

    pub fn take(&mut self, layer: &str) -> Option<IndexTable> {
        self.tables.remove(layer)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Build tables for every layer of `network` at a fixed tile size.
    pub fn build_for(network: &Network, height: usize, width: usize) -> Result<Self> {
        let mut tables = Self::default();
        for layer in network.layers() {
            let geometry = TableGeometry {
                channels: layer.in_channels(),
                height,
                width,
                kernel: layer.kernel_size(),
                pad: layer.pad(),
            };
            tables.insert(layer.name.clone(), IndexTable::build(geometry)?);
        }
        Ok(tables)
    }

    pub fn from_safetensors(bytes: &[u8]) -> Result<Self> {
        let file = SafeTensors::deserialize(bytes).context("failed to decode safetensors header")?;
        let mut layers: Vec<String> = file
            .names()
            .into_iter()
            .filter_map(|name| name.strip_suffix(".geometry").map(str::to_string))
            .collect();
        layers.sort();

        let mut tables = Self::default();
        for layer in layers {
            let read = |suffix: &str| -> Result<Vec<i64>> {
                let key = format!("{layer}.{suffix}");
                let view = file
                    .tensor(&key)
                    .with_context(|| format!("index table '{key}' is missing"))?;
                decode_i64(&view).with_context(|| format!("index table '{key}'"))
            };
            let geometry = TableGeometry::from_slice(&read("geometry")?)
                .with_context(|| format!("layer '{layer}' geometry"))?;
            let table = IndexTable::from_raw(geometry, &read("columns")?, &read("rows")?)
                .with_context(|| format!("layer '{layer}' index table"))?;
            tables.insert(layer, table);
        }
        Ok(tables)
    }

    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let mut encoded = Vec::with_capacity(self.tables.len() * 3);
        for (layer, table) in &self.tables {
            let entries = [
                ("geometry", table.geometry().to_array().to_vec()),
                ("columns", table.columns_i64()),
                ("rows", table.rows_i64()),
            ];
            for (suffix, values) in entries {
                let shape = vec![values.len()];
                let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                encoded.push((format!("{layer}.{suffix}"), shape, bytes));
            }
        }
        serialize_tensors(&encoded, Dtype::I64)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_safetensors()?;
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Everything one denoising run needs from disk.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub parameters: ParameterSet,
    pub layer_names: Vec<String>,
    pub index_tables: Option<IndexTables>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFiles {
    pub parameters: String,
    pub layer_list: String,
    pub index_tables: String,
}

impl From<&ModelConfig> for ArtifactFiles {
    fn from(model: &ModelConfig) -> Self {
        Self {
            parameters: model.parameters.clone(),
            layer_list: model.layer_list.clone(),
            index_tables: model.index_tables.clone(),
        }
    }
}

impl Default for ArtifactFiles {
    fn default() -> Self {
        Self::from(&ModelConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    files: ArtifactFiles,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, files: ArtifactFiles) -> Self {
        Self {
            dir: dir.into(),
            files,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn parameters_path(&self) -> PathBuf {
        self.dir.join(&self.files.parameters)
    }

    pub fn layer_list_path(&self) -> PathBuf {
        self.dir.join(&self.files.layer_list)
    }

    pub fn index_tables_path(&self) -> PathBuf {
        self.dir.join(&self.files.index_tables)
    }

    /// Files that must exist for `selector`.
    pub fn required_paths(&self, selector: ModelSelector) -> Vec<PathBuf> {
        match selector {
            ModelSelector::Accelerated => vec![self.parameters_path()],
            ModelSelector::Portable => vec![
                self.parameters_path(),
                self.layer_list_path(),
                self.index_tables_path(),
            ],
        }
    }

    /// Fail fast on the first missing directory or file.
    pub fn verify(&self, selector: ModelSelector) -> Result<(), DenoiseError> {
        if !self.dir.is_dir() {
            return Err(DenoiseError::MissingArtifact {
                path: self.dir.clone(),
            });
        }
        for path in self.required_paths(selector) {
            if !path.is_file() {
                return Err(DenoiseError::MissingArtifact { path });
            }
        }
        Ok(())
    }

    pub fn load(&self, selector: ModelSelector) -> Result<ModelArtifacts, DenoiseError> {
        self.verify(selector)?;

        let parameters_path = self.parameters_path();
        let parameters = read_artifact(&parameters_path, ParameterSet::from_safetensors)?;
        if parameters.is_empty() {
            return Err(DenoiseError::malformed(&parameters_path, "no tensors"));
        }

        let layer_list_path = self.layer_list_path();
        let layer_names = if layer_list_path.is_file() {
            read_artifact(&layer_list_path, parse_layer_list)?
        } else {
            debug!(
                path = %layer_list_path.display(),
                "Layer list not found; deriving layer order from parameter names"
            );
            parameters.derive_layer_names()
        };

        let index_tables = match selector {
            ModelSelector::Portable => {
                Some(read_artifact(&self.index_tables_path(), IndexTables::from_safetensors)?)
            }
            ModelSelector::Accelerated => None,
        };

        info!(
            dir = %self.dir.display(),
            %selector,
            tensors = parameters.len(),
            layers = layer_names.len(),
            index_tables = index_tables.as_ref().map_or(0, IndexTables::len),
            "Loaded model artifacts"
        );

        Ok(ModelArtifacts {
            parameters,
            layer_names,
            index_tables,
        })
    }
}

pub fn parse_layer_list(bytes: &[u8]) -> Result<Vec<String>> {
    let names: Vec<String> =
        serde_json::from_slice(bytes).context("layer list must be a JSON array of strings")?;
    if names.iter().any(|n| n.trim().is_empty()) {
        bail!("layer list contains an empty name");
    }
    Ok(names)
}

pub fn save_layer_list(path: &Path, names: &[String]) -> Result<()> {
    let encoded = serde_json::to_vec_pretty(names).context("failed to encode layer list")?;
    fs::write(path, encoded).with_context(|| format!("failed to write {}", path.display()))
}

fn read_artifact<T>(path: &Path, parse: impl FnOnce(&[u8]) -> Result<T>) -> Result<T, DenoiseError> {
    let bytes = fs::read(path).map_err(|e| DenoiseError::malformed(path, e.to_string()))?;
    parse(&bytes).map_err(|e| DenoiseError::malformed(path, format!("{e:#}")))
}

fn decode_floats(view: &TensorView<'_>) -> Result<Vec<f32>> {
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => Ok(data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        Dtype::F64 => Ok(data
            .chunks_exact(8)
            .map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                f64::from_le_bytes(raw) as f32
            })
            .collect()),
        other => bail!("unsupported parameter dtype {other:?}"),
    }
}

fn decode_i64(view: &TensorView<'_>) -> Result<Vec<i64>> {
    let data = view.data();
    match view.dtype() {
        Dtype::I64 => Ok(data
            .chunks_exact(8)
            .map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                i64::from_le_bytes(raw)
            })
            .collect()),
        Dtype::I32 => Ok(data
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
            .collect()),
        other => bail!("unsupported index dtype {other:?}"),
    }
}

fn serialize_tensors(encoded: &[(String, Vec<usize>, Vec<u8>)], dtype: Dtype) -> Result<Vec<u8>> {
    let mut views = Vec::with_capacity(encoded.len());
    for (name, shape, bytes) in encoded {
        let view = TensorView::new(dtype, shape.clone(), bytes)
            .with_context(|| format!("invalid tensor '{name}'"))?;
        views.push((name.as_str(), view));
    }
    safetensors::serialize(views, &None).context("failed to encode safetensors")
}

/// Segment-wise comparison treating all-digit segments as numbers.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParameterSet {
        let mut set = ParameterSet::default();
        for name in ["dncnn.0", "dncnn.2", "dncnn.10"] {
            set.insert(format!("{name}.weight"), ArrayD::zeros(IxDyn(&[1, 1, 3, 3])));
        }
        set.insert("dncnn.2.bn.weight", ArrayD::ones(IxDyn(&[1])));
        set.insert("dncnn.2.bn.num_batches_tracked", ArrayD::zeros(IxDyn(&[])));
        set
    }

    #[test]
    fn derive_layer_names_uses_natural_order() {
        assert_eq!(
            params().derive_layer_names(),
            vec!["dncnn.0", "dncnn.2", "dncnn.10"]
        );
    }

    #[test]
    fn batch_norm_prefix_prefers_nested_then_next_sibling() {
        let mut set = ParameterSet::default();
        set.insert("net.0.weight", ArrayD::zeros(IxDyn(&[2, 1, 3, 3])));
        set.insert("net.0.bn.running_mean", ArrayD::zeros(IxDyn(&[2])));
        set.insert("net.2.weight", ArrayD::zeros(IxDyn(&[2, 2, 3, 3])));
        set.insert("net.3.running_mean", ArrayD::zeros(IxDyn(&[2])));
        set.insert("net.5.weight", ArrayD::zeros(IxDyn(&[1, 2, 3, 3])));
        set.insert("net.7.running_mean", ArrayD::zeros(IxDyn(&[1])));
        set.insert("other.6.running_mean", ArrayD::zeros(IxDyn(&[2])));

        assert_eq!(set.batch_norm_prefix("net.0").as_deref(), Some("net.0.bn"));
        assert_eq!(set.batch_norm_prefix("net.2").as_deref(), Some("net.3"));
        assert_eq!(set.batch_norm_prefix("net.5").as_deref(), Some("net.7"));
        assert_eq!(set.batch_norm_prefix("conv"), None);

        set.insert("net.4.weight", ArrayD::zeros(IxDyn(&[2, 2, 3, 3])));
        set.remove("net.3.running_mean");
        assert_eq!(set.batch_norm_prefix("net.2"), None);
    }

    #[test]
    fn parameters_roundtrip_through_safetensors() {
        let mut set = ParameterSet::default();
        let weight = ArrayD::from_shape_vec(IxDyn(&[2, 1, 1, 1]), vec![0.25, -1.5]).expect("shape");
        set.insert("conv.weight", weight.clone());
        let bytes = set.to_safetensors().expect("encode");
        let restored = ParameterSet::from_safetensors(&bytes).expect("decode");
        assert_eq!(restored.get("conv.weight"), Some(&weight));
    }

    #[test]
    fn layer_list_rejects_non_string_entries() {
        assert!(parse_layer_list(br#"["a", "b"]"#).is_ok());
        assert!(parse_layer_list(br#"[1, 2]"#).is_err());
        assert!(parse_layer_list(br#"["a", " "]"#).is_err());
    }

    #[test]
    fn verify_names_the_missing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path(), ArtifactFiles::default());
        let err = store.verify(ModelSelector::Accelerated).unwrap_err();
        match err {
            DenoiseError::MissingArtifact { path } => assert_eq!(path, store.parameters_path()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_missing_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("nope");
        let store = ArtifactStore::new(&missing, ArtifactFiles::default());
        assert!(matches!(
            store.verify(ModelSelector::Portable),
            Err(DenoiseError::MissingArtifact { path }) if path == missing
        ));
    }

    #[test]
    fn portable_requires_tables_and_layer_list() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path(), ArtifactFiles::default());
        params().save(&store.parameters_path()).expect("save params");

        assert!(store.verify(ModelSelector::Accelerated).is_ok());
        let err = store.verify(ModelSelector::Portable).unwrap_err();
        assert!(err.to_string().contains("dncnn_2k_layers.json"));
    }

    #[test]
    fn corrupt_parameter_file_is_malformed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path(), ArtifactFiles::default());
        fs::write(store.parameters_path(), b"definitely not safetensors").expect("write");
        let err = store.load(ModelSelector::Accelerated).unwrap_err();
        assert!(matches!(err, DenoiseError::MalformedArtifact { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn accelerated_load_derives_layer_order_without_list() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path(), ArtifactFiles::default());
        params().save(&store.parameters_path()).expect("save params");

        let artifacts = store.load(ModelSelector::Accelerated).expect("load");
        assert_eq!(artifacts.layer_names, vec!["dncnn.0", "dncnn.2", "dncnn.10"]);
        assert!(artifacts.index_tables.is_none());
    }

    #[test]
    fn index_tables_roundtrip_through_safetensors() {
        let geometry = TableGeometry {
            channels: 2,
            height: 4,
            width: 5,
            kernel: 3,
            pad: 1,
        };
        let mut tables = IndexTables::default();
        tables.insert("dncnn.0", IndexTable::build(geometry).expect("table"));
        let bytes = tables.to_safetensors().expect("encode");
        let restored = IndexTables::from_safetensors(&bytes).expect("decode");
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get("dncnn.0"), tables.get("dncnn.0"));
    }

    #[test]
    fn natural_cmp_orders_numeric_segments() {
        assert_eq!(natural_cmp("a.2", "a.10"), Ordering::Less);
        assert_eq!(natural_cmp("a.b", "a.a"), Ordering::Greater);
        assert_eq!(natural_cmp("a", "a.0"), Ordering::Less);
    }
}
