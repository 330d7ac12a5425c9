use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Bidirectional mapping between external ids and dense model indices.
///
/// On disk: a header line, then one `original_id index` pair per line. The
/// index is the last whitespace-separated token, so ids may contain spaces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdMapping {
    ids: Vec<String>,
    index: HashMap<String, usize>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of `id`, assigning the next free one if unseen.
    pub fn get_or_insert(&mut self, id: &str) -> usize {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id.to_string());
        self.index.insert(id.to_string(), idx);
        idx
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn id_of(&self, index: usize) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<IdMapping> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let lines = reader.lines().collect::<std::io::Result<Vec<_>>>()?;
        let max_rows = lines.len().saturating_sub(1);
        let mut slots: Vec<Option<String>> = Vec::new();
        let mut index = HashMap::new();
        for (line_no, line) in lines.iter().enumerate().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // the index is the last token; ids may contain whitespace
            let (id, idx) = match line.rsplit_once(char::is_whitespace) {
                Some((id, idx)) if !id.trim().is_empty() => (id.trim(), idx),
                _ => return Err(Error::line(path, line_no, "expected `original_id index`")),
            };
            let idx = idx
                .parse::<usize>()
                .map_err(|err| Error::line(path, line_no, format!("invalid index {:?}: {}", idx, err)))?;
            if idx >= max_rows {
                return Err(Error::line(
                    path,
                    line_no,
                    format!("index {} out of range for {} rows", idx, max_rows),
                ));
            }
            if index.insert(id.to_string(), idx).is_some() {
                return Err(Error::line(path, line_no, format!("duplicate id {}", id)));
            }
            if slots.len() <= idx {
                slots.resize(idx + 1, None);
            }
            if slots[idx].replace(id.to_string()).is_some() {
                return Err(Error::line(path, line_no, format!("index {} assigned twice", idx)));
            }
        }
        let ids = slots
            .into_iter()
            .enumerate()
            .map(|(idx, id)| id.ok_or_else(|| Error::Format(format!("{}: index {} is unassigned", path.display(), idx))))
            .collect::<Result<Vec<_>>>()?;
        Ok(IdMapping { ids, index })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P, id_column: &str) -> Result<()> {
        let mut f_out = BufWriter::new(File::create(path)?);
        writeln!(f_out, "{} index", id_column)?;
        for (idx, id) in self.ids.iter().enumerate() {
            writeln!(f_out, "{} {}", id, idx)?;
        }
        f_out.flush()?;
        Ok(())
    }
}
