use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use ndarray::{s, Array1, Array2, ArrayD, ArrayViewD, IxDyn};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::neumf::{Flt, NeuMF};
use crate::neumf_fast::{Dense, FastNeuMF};

static MAGIC: &[u8; 4] = b"NMF1";

impl FastNeuMF {
    fn named_tensors(&self) -> Vec<(String, ArrayViewD<Flt>)> {
        let mut tensors = vec![
            ("mf_embedding_user".to_string(), self.mf_user.view().into_dyn()),
            ("mf_embedding_item".to_string(), self.mf_item.view().into_dyn()),
            ("mlp_embedding_user".to_string(), self.mlp_user.view().into_dyn()),
            ("mlp_embedding_item".to_string(), self.mlp_item.view().into_dyn()),
        ];
        for (idx, layer) in self.layers.iter().enumerate() {
            tensors.push((format!("layer{}.kernel", idx + 1), layer.kernel.view().into_dyn()));
            tensors.push((format!("layer{}.bias", idx + 1), layer.bias.view().into_dyn()));
        }
        tensors.push(("prediction.kernel".to_string(), self.prediction.kernel.view().into_dyn()));
        tensors.push(("prediction.bias".to_string(), self.prediction.bias.view().into_dyn()));
        tensors
    }

    fn expected_shapes(user_rows: usize, item_rows: usize, config: &ModelConfig) -> BTreeMap<String, Vec<usize>> {
        let mlp_dim = config.mlp_embedding_dim();
        let mut shapes = BTreeMap::new();
        shapes.insert("mf_embedding_user".to_string(), vec![user_rows, config.mf_dim]);
        shapes.insert("mf_embedding_item".to_string(), vec![item_rows, config.mf_dim]);
        shapes.insert("mlp_embedding_user".to_string(), vec![user_rows, mlp_dim]);
        shapes.insert("mlp_embedding_item".to_string(), vec![item_rows, mlp_dim]);
        for (idx, w) in config.layers.windows(2).enumerate() {
            shapes.insert(format!("layer{}.kernel", idx + 1), vec![w[0], w[1]]);
            shapes.insert(format!("layer{}.bias", idx + 1), vec![w[1]]);
        }
        shapes.insert("prediction.kernel".to_string(), vec![config.predictive_factors(), 1]);
        shapes.insert("prediction.bias".to_string(), vec![1]);
        shapes
    }

    fn from_tensors(mut tensors: BTreeMap<String, ArrayD<Flt>>, num_layers: usize) -> Result<FastNeuMF> {
        let mut take2 = |name: &str| -> Result<Array2<Flt>> {
            let tensor = tensors
                .remove(name)
                .ok_or_else(|| Error::Format(format!("missing tensor {}", name)))?;
            tensor
                .into_dimensionality()
                .map_err(|err| Error::Format(format!("{}: {}", name, err)))
        };
        let mf_user = take2("mf_embedding_user")?;
        let mf_item = take2("mf_embedding_item")?;
        let mlp_user = take2("mlp_embedding_user")?;
        let mlp_item = take2("mlp_embedding_item")?;
        let prediction_kernel = take2("prediction.kernel")?;
        let mut layer_kernels = Vec::with_capacity(num_layers);
        for idx in 1..=num_layers {
            layer_kernels.push(take2(&format!("layer{}.kernel", idx))?);
        }

        let mut take1 = |name: &str| -> Result<Array1<Flt>> {
            let tensor = tensors
                .remove(name)
                .ok_or_else(|| Error::Format(format!("missing tensor {}", name)))?;
            tensor
                .into_dimensionality()
                .map_err(|err| Error::Format(format!("{}: {}", name, err)))
        };
        let prediction_bias = take1("prediction.bias")?;
        let mut layers = Vec::with_capacity(num_layers);
        for (idx, kernel) in layer_kernels.into_iter().enumerate() {
            let bias = take1(&format!("layer{}.bias", idx + 1))?;
            layers.push(Dense { kernel, bias });
        }

        Ok(FastNeuMF {
            mf_user,
            mf_item,
            mlp_user,
            mlp_item,
            layers,
            prediction: Dense {
                kernel: prediction_kernel,
                bias: prediction_bias,
            },
        })
    }
}

impl NeuMF {
    /// Writes the weights in the little-endian `NMF1` format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f_out = BufWriter::new(File::create(path)?);
        let config = self.config();
        f_out.write_all(MAGIC)?;
        write_len(&mut f_out, self.num_users())?;
        write_len(&mut f_out, self.num_items())?;
        write_len(&mut f_out, self.id_headroom())?;
        write_len(&mut f_out, config.mf_dim)?;
        write_len(&mut f_out, config.layers.len())?;
        for &width in &config.layers {
            write_len(&mut f_out, width)?;
        }
        for &reg in &config.reg_layers {
            f_out.write_f32::<LittleEndian>(reg)?;
        }
        f_out.write_f32::<LittleEndian>(config.reg_mf)?;

        let tensors = self.data.named_tensors();
        write_len(&mut f_out, tensors.len())?;
        for (name, tensor) in tensors {
            f_out.write_u16::<LittleEndian>(name.len() as u16)?;
            f_out.write_all(name.as_bytes())?;
            f_out.write_u8(tensor.ndim() as u8)?;
            for &dim in tensor.shape() {
                write_len(&mut f_out, dim)?;
            }
            for &value in tensor.iter() {
                f_out.write_f32::<LittleEndian>(value)?;
            }
        }
        f_out.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<NeuMF> {
        let mut f_in = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        f_in.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::Format("bad magic".into()));
        }
        let num_users = read_len(&mut f_in)?;
        let num_items = read_len(&mut f_in)?;
        let id_headroom = read_len(&mut f_in)?;
        let mf_dim = read_len(&mut f_in)?;
        let num_layers = read_len(&mut f_in)?;
        if num_layers == 0 || num_layers > 64 {
            return Err(Error::Format(format!("implausible layer count {}", num_layers)));
        }
        let layers = (0..num_layers).map(|_| read_len(&mut f_in)).collect::<Result<Vec<_>>>()?;
        let mut reg_layers = vec![0.0; num_layers];
        f_in.read_f32_into::<LittleEndian>(&mut reg_layers)?;
        let reg_mf = f_in.read_f32::<LittleEndian>()?;
        let config = ModelConfig {
            mf_dim,
            layers,
            reg_layers,
            reg_mf,
        };
        config.validate().map_err(|err| Error::Format(err.to_string()))?;

        let mut expected = FastNeuMF::expected_shapes(num_users + id_headroom, num_items + id_headroom, &config);
        let count = read_len(&mut f_in)?;
        if count != expected.len() {
            return Err(Error::Format(format!("expected {} tensors, found {}", expected.len(), count)));
        }
        let mut tensors = BTreeMap::new();
        for _ in 0..count {
            let name_len = f_in.read_u16::<LittleEndian>()? as usize;
            let mut name = vec![0u8; name_len];
            f_in.read_exact(&mut name)?;
            let name = String::from_utf8(name).map_err(|_| Error::Format("tensor name is not UTF-8".into()))?;
            let ndim = f_in.read_u8()? as usize;
            let shape = (0..ndim).map(|_| read_len(&mut f_in)).collect::<Result<Vec<_>>>()?;
            match expected.remove(&name) {
                Some(want) if want == shape => {}
                Some(want) => {
                    return Err(Error::Format(format!("{} has shape {:?}, expected {:?}", name, shape, want)));
                }
                None => return Err(Error::Format(format!("unexpected tensor {}", name))),
            }
            let mut data = vec![0.0; shape.iter().product()];
            f_in.read_f32_into::<LittleEndian>(&mut data)?;
            let tensor = ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|err| Error::Format(err.to_string()))?;
            tensors.insert(name, tensor);
        }

        let data = FastNeuMF::from_tensors(tensors, num_layers - 1)?;
        Ok(NeuMF::from_parts(num_users, num_items, id_headroom, config, data))
    }

    /// Initialises branches from earlier weight files. The MF file supplies
    /// the MF embeddings and its slice of the prediction kernel, the MLP file
    /// the MLP embeddings, the dense layers and the rest of the kernel. The
    /// prediction bias is the mean of the supplied biases.
    pub fn load_pretrain(&mut self, mf_pretrain: Option<&Path>, mlp_pretrain: Option<&Path>) -> Result<()> {
        let mf_dim = self.config().mf_dim;
        let mut biases = Vec::new();

        if let Some(path) = mf_pretrain {
            let pretrained = NeuMF::load(path)?;
            let src = &pretrained.data;
            copy_into(&mut self.data.mf_user, &src.mf_user, "mf_embedding_user")?;
            copy_into(&mut self.data.mf_item, &src.mf_item, "mf_embedding_item")?;
            self.data
                .prediction
                .kernel
                .slice_mut(s![..mf_dim, ..])
                .assign(&src.prediction.kernel.slice(s![..mf_dim, ..]));
            biases.push(src.prediction.bias[0]);
            info!("loaded MF pretrain from {}", path.display());
        }

        if let Some(path) = mlp_pretrain {
            let pretrained = NeuMF::load(path)?;
            let src = &pretrained.data;
            copy_into(&mut self.data.mlp_user, &src.mlp_user, "mlp_embedding_user")?;
            copy_into(&mut self.data.mlp_item, &src.mlp_item, "mlp_embedding_item")?;
            if src.layers.len() != self.data.layers.len() {
                return Err(Error::Shape(format!(
                    "MLP pretrain has {} dense layers, expected {}",
                    src.layers.len(),
                    self.data.layers.len()
                )));
            }
            for (idx, (dst, from)) in self.data.layers.iter_mut().zip(src.layers.iter()).enumerate() {
                copy_into(&mut dst.kernel, &from.kernel, &format!("layer{}.kernel", idx + 1))?;
                if dst.bias.len() != from.bias.len() {
                    return Err(Error::Shape(format!("layer{}.bias", idx + 1)));
                }
                dst.bias.assign(&from.bias);
            }
            let src_mf_dim = src.mf_dim();
            let mlp_width = self.data.prediction.kernel.nrows() - mf_dim;
            if src.prediction.kernel.nrows() - src_mf_dim != mlp_width {
                return Err(Error::Shape("prediction.kernel MLP slice".into()));
            }
            self.data
                .prediction
                .kernel
                .slice_mut(s![mf_dim.., ..])
                .assign(&src.prediction.kernel.slice(s![src_mf_dim.., ..]));
            biases.push(src.prediction.bias[0]);
            info!("loaded MLP pretrain from {}", path.display());
        }

        if !biases.is_empty() {
            self.data.prediction.bias[0] = biases.iter().sum::<Flt>() / biases.len() as Flt;
        }
        Ok(())
    }
}

fn copy_into(dst: &mut Array2<Flt>, src: &Array2<Flt>, name: &str) -> Result<()> {
    if dst.dim() != src.dim() {
        return Err(Error::Shape(format!(
            "{}: pretrain shape {:?}, model shape {:?}",
            name,
            src.dim(),
            dst.dim()
        )));
    }
    dst.assign(src);
    Ok(())
}

fn write_len<W: Write>(w: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value).map_err(|_| Error::Format(format!("{} does not fit in 32 bits", value)))?;
    w.write_u32::<LittleEndian>(value)?;
    Ok(())
}

fn read_len<R: Read>(r: &mut R) -> Result<usize> {
    Ok(r.read_u32::<LittleEndian>()? as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neumf::RandomState;
    use std::fs;

    fn config() -> ModelConfig {
        ModelConfig {
            mf_dim: 3,
            layers: vec![6, 4, 2],
            reg_layers: vec![0.0, 0.01, 0.0],
            reg_mf: 0.001,
        }
    }

    fn model(seed: u64) -> NeuMF {
        NeuMF::new(5, 7, 2, config(), &mut RandomState::new(Some(seed))).unwrap()
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.weights");
        let original = model(1);
        original.save(&path).unwrap();

        let loaded = NeuMF::load(&path).unwrap();
        assert_eq!(loaded.num_users(), 5);
        assert_eq!(loaded.num_items(), 7);
        assert_eq!(loaded.id_headroom(), 2);
        assert_eq!(loaded.config(), original.config());
        assert_eq!(loaded.data.mlp_item, original.data.mlp_item);
        assert_eq!(loaded.data.layers[1].bias, original.data.layers[1].bias);
        let users = [0, 4, 6];
        let items = [8, 2, 0];
        assert_eq!(
            loaded.predict(&users, &items).unwrap(),
            original.predict(&users, &items).unwrap()
        );
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.weights");
        fs::write(&path, b"HDF5....").unwrap();
        assert!(matches!(NeuMF::load(&path), Err(Error::Format(_))));

        let good = dir.path().join("good.weights");
        model(2).save(&good).unwrap();
        let bytes = fs::read(&good).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(NeuMF::load(&path), Err(Error::Io(_))));
    }

    #[test]
    fn test_load_pretrain() {
        let dir = tempfile::tempdir().unwrap();
        let mf_path = dir.path().join("mf.weights");
        let mlp_path = dir.path().join("mlp.weights");
        let mf_source = model(10);
        let mlp_source = model(20);
        mf_source.save(&mf_path).unwrap();
        mlp_source.save(&mlp_path).unwrap();

        let mut target = model(30);
        target.load_pretrain(Some(&mf_path), None).unwrap();
        assert_eq!(target.data.mf_user, mf_source.data.mf_user);
        assert_ne!(target.data.mlp_user, mlp_source.data.mlp_user);
        assert_eq!(
            target.data.prediction.kernel.slice(s![..3, ..]),
            mf_source.data.prediction.kernel.slice(s![..3, ..])
        );

        target.load_pretrain(None, Some(&mlp_path)).unwrap();
        assert_eq!(target.data.mlp_item, mlp_source.data.mlp_item);
        assert_eq!(target.data.layers[0].kernel, mlp_source.data.layers[0].kernel);
        assert_eq!(
            target.data.prediction.kernel.slice(s![3.., ..]),
            mlp_source.data.prediction.kernel.slice(s![3.., ..])
        );
        // MF part untouched by the MLP file
        assert_eq!(target.data.mf_item, mf_source.data.mf_item);
    }

    #[test]
    fn test_load_pretrain_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.weights");
        let other = NeuMF::new(9, 7, 2, config(), &mut RandomState::new(Some(1))).unwrap();
        other.save(&path).unwrap();
        let mut target = model(3);
        assert!(matches!(target.load_pretrain(Some(&path), None), Err(Error::Shape(_))));
    }
}
