use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::info;
use polars::prelude::{CsvReader, DataType, SerReader};
use rand::Rng;

use crate::error::{Error, Result};
use crate::mapping::IdMapping;
use crate::neumf::{Flt, RandomState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interaction {
    pub user: usize,
    pub item: usize,
    pub rating: Flt,
    pub timestamp: i64,
}

/// A raw interaction log with its external ids mapped to dense indices.
#[derive(Debug, Clone)]
pub struct RawInteractions {
    pub users: IdMapping,
    pub items: IdMapping,
    pub interactions: Vec<Interaction>,
}

/// Reads `user item rating timestamp` rows; ids may be arbitrary strings and
/// are numbered in order of first appearance.
pub fn read_interactions(file: &Path, separator: u8, has_header: bool) -> Result<RawInteractions> {
    let data_type = vec![DataType::String, DataType::String, DataType::Float32, DataType::Int64];
    let df = CsvReader::from_path(file)?
        .with_separator(separator)
        .has_header(has_header)
        .with_projection(Some(vec![0, 1, 2, 3]))
        .with_dtypes_slice(Some(&data_type))
        .finish()?;
    let user_col = df[0].str()?;
    let item_col = df[1].str()?;
    let rating_col = df[2].f32()?;
    let time_col = df[3].i64()?;

    let mut users = IdMapping::new();
    let mut items = IdMapping::new();
    let mut interactions = Vec::with_capacity(df.height());
    let offset = if has_header { 1 } else { 0 };
    for (line, (((user, item), rating), timestamp)) in user_col
        .into_iter()
        .zip(item_col.into_iter())
        .zip(rating_col.into_iter())
        .zip(time_col.into_iter())
        .enumerate()
    {
        match (user, item, rating, timestamp) {
            (Some(user), Some(item), Some(rating), Some(timestamp)) => interactions.push(Interaction {
                user: users.get_or_insert(user),
                item: items.get_or_insert(item),
                rating,
                timestamp,
            }),
            _ => return Err(Error::line(file, line + offset, "missing user, item, rating or timestamp")),
        }
    }
    Ok(RawInteractions {
        users,
        items,
        interactions,
    })
}

/// Holds out each user's latest interaction (the later row wins a timestamp
/// tie). Earlier rows repeating the held-out pair are dropped from train.
/// Users with a single distinct item keep their rows for training. The test
/// side is ordered by user.
pub fn leave_one_out_split(interactions: &[Interaction]) -> (Vec<Interaction>, Vec<Interaction>) {
    let mut latest: HashMap<usize, usize> = HashMap::new();
    let mut items: HashMap<usize, HashSet<usize>> = HashMap::new();
    for (pos, interaction) in interactions.iter().enumerate() {
        items.entry(interaction.user).or_default().insert(interaction.item);
        latest
            .entry(interaction.user)
            .and_modify(|best| {
                if interaction.timestamp >= interactions[*best].timestamp {
                    *best = pos;
                }
            })
            .or_insert(pos);
    }
    let held_out = latest
        .iter()
        .filter(|(user, _)| items[*user].len() > 1)
        .map(|(_, &pos)| pos)
        .collect::<Vec<_>>();
    let held_out_pairs = held_out
        .iter()
        .map(|&pos| (interactions[pos].user, interactions[pos].item))
        .collect::<HashSet<_>>();

    let train = interactions
        .iter()
        .filter(|interaction| !held_out_pairs.contains(&(interaction.user, interaction.item)))
        .copied()
        .collect();
    let mut test = held_out.iter().map(|&pos| interactions[pos]).collect::<Vec<_>>();
    test.sort_by_key(|interaction| interaction.user);
    (train, test)
}

/// For each test case, up to `num_negatives` distinct items the user never
/// interacted with.
pub fn sample_test_negatives(
    train: &[Interaction],
    test: &[Interaction],
    num_items: usize,
    num_negatives: usize,
    random_state: &mut RandomState,
) -> Result<Vec<Vec<usize>>> {
    let mut positives: HashMap<usize, HashSet<usize>> = HashMap::new();
    for interaction in train.iter().chain(test.iter()) {
        positives.entry(interaction.user).or_default().insert(interaction.item);
    }

    let mut negatives = Vec::with_capacity(test.len());
    for case in test {
        let seen = &positives[&case.user];
        let available = num_items.saturating_sub(seen.len());
        let sampled = if available <= num_negatives {
            let mut all = (0..num_items).filter(|i| !seen.contains(i)).collect::<Vec<_>>();
            random_state.shuffle(&mut all)?;
            all
        } else {
            let mut chosen = HashSet::with_capacity(num_negatives);
            let mut sampled = Vec::with_capacity(num_negatives);
            while sampled.len() < num_negatives {
                let item = random_state.rng.gen_range(0..num_items);
                if !seen.contains(&item) && chosen.insert(item) {
                    sampled.push(item);
                }
            }
            sampled
        };
        negatives.push(sampled);
    }
    Ok(negatives)
}

/// Writes `<name>.train.rating`, `<name>.test.rating` and `<name>.test.negative`.
pub fn write_dataset(
    dir: &Path,
    name: &str,
    train: &[Interaction],
    test: &[Interaction],
    negatives: &[Vec<usize>],
) -> Result<()> {
    write_ratings(&dir.join(format!("{}.train.rating", name)), train)?;
    write_ratings(&dir.join(format!("{}.test.rating", name)), test)?;
    let mut f_out = BufWriter::new(File::create(dir.join(format!("{}.test.negative", name)))?);
    for (case, items) in test.iter().zip(negatives.iter()) {
        write!(f_out, "({},{})", case.user, case.item)?;
        for item in items {
            write!(f_out, "\t{}", item)?;
        }
        writeln!(f_out)?;
    }
    f_out.flush()?;
    Ok(())
}

fn write_ratings(file: &Path, interactions: &[Interaction]) -> Result<()> {
    let mut f_out = BufWriter::new(File::create(file)?);
    for interaction in interactions {
        writeln!(
            f_out,
            "{}\t{}\t{}\t{}",
            interaction.user, interaction.item, interaction.rating, interaction.timestamp
        )?;
    }
    f_out.flush()?;
    Ok(())
}

/// Turns a raw log into a leave-one-out dataset plus `user_mapping.csv` and
/// `room_mapping.csv` in `out_dir`.
pub fn prepare_dataset(
    raw_file: &Path,
    separator: u8,
    has_header: bool,
    out_dir: &Path,
    name: &str,
    num_negatives: usize,
    random_state: &mut RandomState,
) -> Result<()> {
    let raw = read_interactions(raw_file, separator, has_header)?;
    let (train, test) = leave_one_out_split(&raw.interactions);
    let negatives = sample_test_negatives(&train, &test, raw.items.len(), num_negatives, random_state)?;

    std::fs::create_dir_all(out_dir)?;
    write_dataset(out_dir, name, &train, &test, &negatives)?;
    raw.users.save(out_dir.join("user_mapping.csv"), "user_id")?;
    raw.items.save(out_dir.join("room_mapping.csv"), "room_id")?;
    info!(
        "prepared {}: #user={}, #item={}, #train={}, #test={}",
        name,
        raw.users.len(),
        raw.items.len(),
        train.len(),
        test.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::Dataset;
    use std::fs;

    fn interaction(user: usize, item: usize, timestamp: i64) -> Interaction {
        Interaction {
            user,
            item,
            rating: 1.0,
            timestamp,
        }
    }

    #[test]
    fn test_leave_one_out_split() {
        let log = vec![
            interaction(1, 0, 10),
            interaction(0, 1, 30),
            interaction(0, 2, 20),
            interaction(1, 3, 50),
            interaction(2, 4, 5),
            interaction(1, 1, 50),
        ];
        let (train, test) = leave_one_out_split(&log);
        assert_eq!(test, vec![interaction(0, 1, 30), interaction(1, 1, 50)]);
        assert_eq!(
            train,
            vec![interaction(1, 0, 10), interaction(0, 2, 20), interaction(1, 3, 50), interaction(2, 4, 5)]
        );
    }

    #[test]
    fn test_leave_one_out_drops_repeats_of_held_out_item() {
        let log = vec![
            interaction(0, 0, 100),
            interaction(0, 1, 200),
            interaction(0, 0, 300),
            interaction(1, 2, 10),
            interaction(1, 2, 20),
        ];
        let (train, test) = leave_one_out_split(&log);
        assert_eq!(test, vec![interaction(0, 0, 300)]);
        // user 1 only ever saw item 2, so nothing is held out for it
        assert_eq!(train, vec![interaction(0, 1, 200), interaction(1, 2, 10), interaction(1, 2, 20)]);
        assert!(!train.iter().any(|i| i.user == 0 && i.item == 0));
    }

    #[test]
    fn test_sample_test_negatives() {
        let train = vec![interaction(0, 0, 1), interaction(0, 1, 2), interaction(1, 0, 1)];
        let test = vec![interaction(0, 2, 3), interaction(1, 1, 2)];
        let mut random_state = RandomState::new(Some(5));
        let negatives = sample_test_negatives(&train, &test, 10, 4, &mut random_state).unwrap();
        assert_eq!(negatives.len(), 2);
        for (case, items) in test.iter().zip(negatives.iter()) {
            assert_eq!(items.len(), 4);
            let unique = items.iter().collect::<HashSet<_>>();
            assert_eq!(unique.len(), 4);
            for item in items {
                assert!(*item < 10);
                assert!(!train.iter().chain(test.iter()).any(|i| i.user == case.user && i.item == *item));
            }
        }

        // fewer admissible items than requested: take them all
        let negatives = sample_test_negatives(&train, &test, 5, 10, &mut random_state).unwrap();
        let mut first = negatives[0].clone();
        first.sort_unstable();
        assert_eq!(first, vec![3, 4]);
    }

    #[test]
    fn test_prepare_dataset_roundtrips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("ratings.csv");
        fs::write(
            &raw,
            "user,room,rating,ts\nalice,r1,5,100\nalice,r2,3,200\nbob,r2,4,100\nbob,r3,2,300\ncarol,r1,1,50\ncarol,r4,4,60\n",
        )
        .unwrap();
        let out = dir.path().join("Data");
        let mut random_state = RandomState::new(Some(8));
        prepare_dataset(&raw, b',', true, &out, "lux", 2, &mut random_state).unwrap();

        let data = Dataset::load(&out, "lux").unwrap();
        assert_eq!(data.num_users(), 3);
        assert_eq!(data.num_items(), 4);
        assert_eq!(data.num_train(), 3);
        assert_eq!(data.test_ratings, vec![(0, 1), (1, 2), (2, 3)]);
        assert!(data.test_negatives.iter().all(|n| n.len() == 2));

        let users = IdMapping::load(out.join("user_mapping.csv")).unwrap();
        assert_eq!(users.index_of("bob"), Some(1));
        let rooms = IdMapping::load(out.join("room_mapping.csv")).unwrap();
        assert_eq!(rooms.id_of(3), Some("r4"));
    }

    #[test]
    fn test_prepare_dataset_with_repeats_and_spaced_ids() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("ratings.csv");
        fs::write(&raw, "ann lee,r1,4,100\nann lee,r2,3,200\nann lee,r1,5,300\nbob,r2,1,10\nbob,r3,2,20\n").unwrap();
        let out = dir.path().join("Data");
        prepare_dataset(&raw, b',', false, &out, "dup", 1, &mut RandomState::new(Some(3))).unwrap();

        let data = Dataset::load(&out, "dup").unwrap();
        assert_eq!(data.test_ratings, vec![(0, 0), (1, 2)]);
        for &(user, item) in &data.test_ratings {
            assert!(!data.train.row(user).col_indices().contains(&item));
        }
        let users = IdMapping::load(out.join("user_mapping.csv")).unwrap();
        assert_eq!(users.index_of("ann lee"), Some(0));
    }

    #[test]
    fn test_read_interactions_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("ratings.tsv");
        fs::write(&raw, "a\tx\t1\t1\nb\ty\t\t2\n").unwrap();
        match read_interactions(&raw, b'\t', false) {
            Err(Error::Line { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other.map(|r| r.interactions.len())),
        }
    }
}
