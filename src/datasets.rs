use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::info;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use polars::prelude::{CsvReader, DataType, SerReader};

use crate::error::{Error, Result};
use crate::neumf::Flt;

static NCF_DATA_URL: &str = "https://raw.githubusercontent.com/hexiangnan/neural_collaborative_filtering/master/Data";
static DATA_FILES: [&str; 3] = ["train.rating", "test.rating", "test.negative"];

/// A leave-one-out recommendation dataset: the train matrix plus one held-out
/// positive per test case and the negatives it is ranked against.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// `num_users x num_items`, value = rating.
    pub train: CsrMatrix<Flt>,
    pub test_ratings: Vec<(usize, usize)>,
    /// Lines up index-wise with `test_ratings`.
    pub test_negatives: Vec<Vec<usize>>,
}

impl Dataset {
    /// Duplicate `(user, item)` pairs keep the last rating.
    pub fn new(
        num_users: usize,
        num_items: usize,
        train: Vec<(usize, usize, Flt)>,
        test_ratings: Vec<(usize, usize)>,
        test_negatives: Vec<Vec<usize>>,
    ) -> Result<Dataset> {
        if test_ratings.len() != test_negatives.len() {
            return Err(Error::Shape(format!(
                "{} test ratings but {} negative lists",
                test_ratings.len(),
                test_negatives.len()
            )));
        }
        let out_of_range = |u: usize, i: usize| u >= num_users || i >= num_items;
        if let Some((u, i, _)) = train.iter().find(|(u, i, _)| out_of_range(*u, *i)) {
            return Err(Error::Shape(format!(
                "train pair ({}, {}) outside {} x {}",
                u, i, num_users, num_items
            )));
        }
        if let Some((u, i)) = test_ratings.iter().find(|(u, i)| out_of_range(*u, *i)) {
            return Err(Error::Shape(format!(
                "test pair ({}, {}) outside {} x {}",
                u, i, num_users, num_items
            )));
        }
        if let Some(i) = test_negatives.iter().flatten().find(|&&i| i >= num_items) {
            return Err(Error::Shape(format!("negative item {} outside {} items", i, num_items)));
        }

        let entries = train
            .into_iter()
            .map(|(u, i, r)| ((u, i), r))
            .collect::<BTreeMap<_, _>>();
        let mut coo = CooMatrix::new(num_users, num_items);
        for ((u, i), r) in entries {
            coo.push(u, i, r);
        }
        Ok(Dataset {
            train: CsrMatrix::from(&coo),
            test_ratings,
            test_negatives,
        })
    }

    /// Reads `<name>.train.rating`, `<name>.test.rating` and
    /// `<name>.test.negative` from `path`.
    pub fn load<P: AsRef<Path>>(path: P, name: &str) -> Result<Dataset> {
        let start = Instant::now();
        let dir = path.as_ref();
        let train = read_ratings(&dir.join(format!("{}.train.rating", name)))?;
        let test = read_ratings(&dir.join(format!("{}.test.rating", name)))?;
        let negative_file = dir.join(format!("{}.test.negative", name));
        let negatives = read_negatives(&negative_file)?;

        if negatives.len() != test.len() {
            return Err(Error::Shape(format!(
                "{} has {} lines but there are {} test ratings",
                negative_file.display(),
                negatives.len(),
                test.len()
            )));
        }
        for (line, ((key, _), (u, i, _))) in negatives.iter().zip(test.iter()).enumerate() {
            if *key != (*u, *i) {
                return Err(Error::line(
                    &negative_file,
                    line,
                    format!("key {:?} does not match test rating ({}, {})", key, u, i),
                ));
            }
        }

        let num_users = train.iter().chain(test.iter()).map(|(u, _, _)| u + 1).max().unwrap_or(0);
        let num_items = train
            .iter()
            .chain(test.iter())
            .map(|(_, i, _)| i + 1)
            .chain(negatives.iter().flat_map(|(_, items)| items.iter().map(|i| i + 1)))
            .max()
            .unwrap_or(0);

        let dataset = Dataset::new(
            num_users,
            num_items,
            train,
            test.into_iter().map(|(u, i, _)| (u, i)).collect(),
            negatives.into_iter().map(|(_, items)| items).collect(),
        )?;
        info!(
            "Load data done [{:.1} s]. #user={}, #item={}, #train={}, #test={}",
            start.elapsed().as_secs_f32(),
            dataset.num_users(),
            dataset.num_items(),
            dataset.num_train(),
            dataset.num_test()
        );
        Ok(dataset)
    }

    pub fn num_users(&self) -> usize {
        self.train.nrows()
    }

    pub fn num_items(&self) -> usize {
        self.train.ncols()
    }

    pub fn num_train(&self) -> usize {
        self.train.nnz()
    }

    pub fn num_test(&self) -> usize {
        self.test_ratings.len()
    }
}

/// Reads only `<name>.train.rating`, sized by the largest ids it contains.
pub fn load_train_matrix<P: AsRef<Path>>(path: P, name: &str) -> Result<CsrMatrix<Flt>> {
    let train = read_ratings(&path.as_ref().join(format!("{}.train.rating", name)))?;
    let num_users = train.iter().map(|(u, _, _)| u + 1).max().unwrap_or(0);
    let num_items = train.iter().map(|(_, i, _)| i + 1).max().unwrap_or(0);
    Ok(Dataset::new(num_users, num_items, train, Vec::new(), Vec::new())?.train)
}

/// Loads `name` from `data_home` (default `~/neumf/data`), downloading the
/// published NCF files first when they are missing and downloads are allowed.
pub fn fetch_dataset(data_home: Option<&str>, name: &str, download_if_missing: bool) -> Result<Dataset> {
    let data_home = String::from(shellexpand::tilde(data_home.unwrap_or("~/neumf/data")));
    std::fs::create_dir_all(&data_home)?;
    for suffix in DATA_FILES {
        get_data(
            &data_home,
            &format!("{}/{}.{}", NCF_DATA_URL, name, suffix),
            &format!("{}.{}", name, suffix),
            download_if_missing,
        )?;
    }
    Dataset::load(&data_home, name)
}

fn get_data(data_home: &str, url: &str, dest_filename: &str, download_if_missing: bool) -> Result<PathBuf> {
    let dest_path = Path::new(data_home).join(dest_filename);
    if !dest_path.is_file() {
        if download_if_missing {
            info!("downloading {}", url);
            download(url, &dest_path)?;
        } else {
            return Err(Error::Io(io::Error::new(
                ErrorKind::NotFound,
                format!("dataset file missing: {}", dest_path.display()),
            )));
        }
    }
    Ok(dest_path)
}

fn download(url: &str, dest_path: &Path) -> Result<()> {
    let partial = dest_path.with_extension("part");
    let mut response = reqwest::blocking::get(url)?.error_for_status()?;
    let mut file = File::create(&partial)?;
    io::copy(&mut response, &mut file)?;
    std::fs::rename(&partial, dest_path)?;
    Ok(())
}

/// Tab-separated `user item rating [timestamp]`, no header.
pub(crate) fn read_ratings(file: &Path) -> Result<Vec<(usize, usize, Flt)>> {
    let data_type = vec![DataType::UInt32, DataType::UInt32, DataType::Float32];
    let df = CsvReader::from_path(file)?
        .with_separator(b'\t')
        .has_header(false)
        .with_projection(Some(vec![0, 1, 2]))
        .with_dtypes_slice(Some(&data_type))
        .finish()?;
    let users = df[0].u32()?;
    let items = df[1].u32()?;
    let ratings = df[2].f32()?;
    users
        .into_iter()
        .zip(items.into_iter())
        .zip(ratings.into_iter())
        .enumerate()
        .map(|(line, ((u, i), r))| match (u, i, r) {
            (Some(u), Some(i), Some(r)) => Ok((u as usize, i as usize, r)),
            _ => Err(Error::line(file, line, "missing user, item or rating")),
        })
        .collect()
}

/// Each line: `(user,item)` then the sampled negative items, tab-separated.
pub(crate) fn read_negatives(file: &Path) -> Result<Vec<((usize, usize), Vec<usize>)>> {
    let reader = BufReader::new(File::open(file)?);
    let mut negatives = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut tokens = line.split('\t');
        let key = tokens.next().unwrap_or_default();
        let key = parse_key(key).ok_or_else(|| Error::line(file, line_no, format!("invalid key {:?}", key)))?;
        let items = tokens
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<usize>()
                    .map_err(|err| Error::line(file, line_no, format!("invalid item {:?}: {}", t, err)))
            })
            .collect::<Result<Vec<_>>>()?;
        negatives.push((key, items));
    }
    Ok(negatives)
}

fn parse_key(token: &str) -> Option<(usize, usize)> {
    let inner = token.trim().strip_prefix('(')?.strip_suffix(')')?;
    let (user, item) = inner.split_once(',')?;
    Some((user.trim().parse().ok()?, item.trim().parse().ok()?))
}
