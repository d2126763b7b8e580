use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tch::{Device, Tensor};
use vqa_core::batch::FIELD_NAMES;
use vqa_core::safetensors_util::{read_tensors, write_tensors};
use vqa_core::Batch;

use crate::error::{Result, TrainError};

/// A finite, indexable collection of examples.
pub trait DataSource: Send + Sync {
    fn num_examples(&self) -> usize;

    fn num_labels(&self) -> i64;

    /// Assembles the examples at `indices`, in that order, on the CPU.
    fn batch(&self, indices: &[i64]) -> Result<Batch>;
}

/// Every example of a split held in memory as one large [`Batch`]. On disk
/// this is a safetensors file with one tensor per batch field.
#[derive(Debug)]
pub struct FeatureDataset {
    all: Batch,
}

impl FeatureDataset {
    pub fn from_batch(all: Batch) -> Result<Self> {
        all.validate()?;
        Ok(Self {
            all: all.to_device(Device::Cpu),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = read_tensors(path, Device::Cpu)?;
        let mut take = |name: &str| {
            tensors
                .remove(name)
                .ok_or_else(|| TrainError::Data(format!("{:?} has no tensor named {}", path, name)))
        };
        let fields = [
            take(FIELD_NAMES[0])?,
            take(FIELD_NAMES[1])?,
            take(FIELD_NAMES[2])?,
            take(FIELD_NAMES[3])?,
            take(FIELD_NAMES[4])?,
            take(FIELD_NAMES[5])?,
            take(FIELD_NAMES[6])?,
            take(FIELD_NAMES[7])?,
        ];
        let dataset = Self::from_batch(Batch::from_fields(fields))?;
        debug!("loaded {} examples from {:?}", dataset.num_examples(), path);
        Ok(dataset)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let named: Vec<(String, Tensor)> = FIELD_NAMES
            .iter()
            .zip(self.all.fields())
            .map(|(name, t)| (name.to_string(), t.shallow_clone()))
            .collect();
        write_tensors(&named, path)?;
        Ok(())
    }
}

impl DataSource for FeatureDataset {
    fn num_examples(&self) -> usize {
        self.all.len() as usize
    }

    fn num_labels(&self) -> i64 {
        self.all.num_labels()
    }

    fn batch(&self, indices: &[i64]) -> Result<Batch> {
        let n = self.all.len();
        if let Some(bad) = indices.iter().find(|&&i| i < 0 || i >= n) {
            return Err(TrainError::Data(format!(
                "example index {} out of range for {} examples",
                bad, n
            )));
        }
        let index = Tensor::from_slice(indices);
        Ok(Batch::from_fields(
            self.all.fields().map(|t| t.index_select(0, &index)),
        ))
    }
}

/// Cuts a data source into batches, optionally shuffled per epoch and
/// partitioned across ranks, with an optional pool of prefetch workers.
#[derive(Clone)]
pub struct DataLoader {
    source: Arc<dyn DataSource>,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    rank: usize,
    world_size: usize,
    num_workers: usize,
}

impl DataLoader {
    pub fn new(source: Arc<dyn DataSource>, batch_size: usize) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            shuffle_seed: None,
            rank: 0,
            world_size: 1,
            num_workers: 0,
        }
    }

    /// Reshuffle every epoch from `seed + epoch`.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Keep only this rank's share. Every rank sees the same number of
    /// examples; the order is padded by wrapping around when needed.
    pub fn partition(mut self, rank: usize, world_size: usize) -> Self {
        self.rank = rank;
        self.world_size = world_size.max(1);
        self
    }

    pub fn workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    /// Examples in the underlying source.
    pub fn num_examples(&self) -> usize {
        self.source.num_examples()
    }

    /// Examples this rank visits per epoch.
    pub fn epoch_examples(&self) -> usize {
        let n = self.source.num_examples();
        if self.world_size > 1 {
            (n + self.world_size - 1) / self.world_size
        } else {
            n
        }
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        (self.epoch_examples() + self.batch_size - 1) / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn epoch_indices(&self, epoch: usize) -> Vec<i64> {
        let n = self.source.num_examples();
        let mut order: Vec<i64> = (0..n as i64).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        if self.world_size > 1 && n > 0 {
            let padded = self.epoch_examples() * self.world_size;
            let mut i = 0;
            while order.len() < padded {
                order.push(order[i]);
                i += 1;
            }
            order = order
                .into_iter()
                .skip(self.rank)
                .step_by(self.world_size)
                .collect();
        }
        order
    }

    pub fn iter(&self, epoch: usize) -> BatchIter {
        let plan: Vec<Vec<i64>> = self
            .epoch_indices(epoch)
            .chunks(self.batch_size)
            .map(<[i64]>::to_vec)
            .collect();
        if self.num_workers == 0 {
            BatchIter::Inline {
                source: Arc::clone(&self.source),
                plan: plan.into_iter(),
            }
        } else {
            BatchIter::prefetch(Arc::clone(&self.source), plan, self.num_workers)
        }
    }
}

/// Batches of one epoch, in plan order.
pub enum BatchIter {
    Inline {
        source: Arc<dyn DataSource>,
        plan: std::vec::IntoIter<Vec<i64>>,
    },
    Prefetch {
        rx: Receiver<(usize, Result<Batch>)>,
        pending: BTreeMap<usize, Result<Batch>>,
        next: usize,
        total: usize,
    },
}

impl BatchIter {
    /// Worker `w` builds batches `w, w + n, w + 2n, ...`; the consumer
    /// reorders them by index.
    fn prefetch(source: Arc<dyn DataSource>, plan: Vec<Vec<i64>>, num_workers: usize) -> Self {
        let total = plan.len();
        let plan = Arc::new(plan);
        let (tx, rx) = mpsc::sync_channel(2 * num_workers);
        for worker in 0..num_workers {
            let tx = tx.clone();
            let source = Arc::clone(&source);
            let plan = Arc::clone(&plan);
            thread::spawn(move || {
                for i in (worker..plan.len()).step_by(num_workers) {
                    if tx.send((i, source.batch(&plan[i]))).is_err() {
                        break;
                    }
                }
            });
        }
        BatchIter::Prefetch {
            rx,
            pending: BTreeMap::new(),
            next: 0,
            total,
        }
    }
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            BatchIter::Inline { source, plan } => plan.next().map(|indices| source.batch(&indices)),
            BatchIter::Prefetch {
                rx,
                pending,
                next,
                total,
            } => {
                if *next >= *total {
                    return None;
                }
                loop {
                    if let Some(batch) = pending.remove(&*next) {
                        *next += 1;
                        return Some(batch);
                    }
                    match rx.recv() {
                        Ok((i, batch)) => {
                            pending.insert(i, batch);
                        }
                        Err(_) => {
                            *next = *total;
                            return Some(Err(TrainError::Data(
                                "prefetch workers stopped early".to_string(),
                            )));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn dataset(n: i64) -> FeatureDataset {
        let opts = (Kind::Float, Device::Cpu);
        let ints = (Kind::Int64, Device::Cpu);
        FeatureDataset::from_batch(Batch::from_fields([
            Tensor::randn([n, 2, 3], opts),
            Tensor::rand([n, 2, 5], opts),
            Tensor::ones([n, 2], ints),
            Tensor::randint(10, [n, 4], ints),
            Tensor::rand([n, 3], opts),
            Tensor::ones([n, 4], ints),
            Tensor::zeros([n, 4], ints),
            Tensor::arange(n, ints),
        ]))
        .unwrap()
    }

    fn ids(batch: &Batch) -> Vec<i64> {
        Vec::<i64>::try_from(&batch.question_id).unwrap()
    }

    #[test]
    fn batches_cover_every_example_once() {
        let loader = DataLoader::new(Arc::new(dataset(10)), 4).shuffle(7);
        assert_eq!(loader.len(), 3);
        let mut seen: Vec<i64> = loader.iter(0).flat_map(|b| ids(&b.unwrap())).collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_depends_on_epoch_and_is_reproducible() {
        let loader = DataLoader::new(Arc::new(dataset(32)), 8).shuffle(3);
        assert_eq!(loader.epoch_indices(1), loader.epoch_indices(1));
        assert_ne!(loader.epoch_indices(0), loader.epoch_indices(1));
    }

    #[test]
    fn partitions_are_disjoint_and_padded() {
        let source: Arc<dyn DataSource> = Arc::new(dataset(5));
        let a = DataLoader::new(Arc::clone(&source), 2).partition(0, 2);
        let b = DataLoader::new(source, 2).partition(1, 2);
        assert_eq!(a.epoch_indices(0), vec![0, 2, 4]);
        assert_eq!(b.epoch_indices(0), vec![1, 3, 0]);
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn prefetch_preserves_inline_order() {
        let source: Arc<dyn DataSource> = Arc::new(dataset(23));
        let inline = DataLoader::new(Arc::clone(&source), 3).shuffle(11);
        let prefetched = inline.clone().workers(3);

        let a: Vec<Vec<i64>> = inline.iter(2).map(|b| ids(&b.unwrap())).collect();
        let b: Vec<Vec<i64>> = prefetched.iter(2).map(|b| ids(&b.unwrap())).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.safetensors");
        let original = dataset(6);
        original.save(&path).unwrap();

        let loaded = FeatureDataset::load(&path).unwrap();
        assert_eq!(loaded.num_examples(), 6);
        assert_eq!(loaded.num_labels(), 3);
        let a = original.batch(&[5, 0]).unwrap();
        let b = loaded.batch(&[5, 0]).unwrap();
        assert!(a.features.equal(&b.features));
        assert_eq!(ids(&b), vec![5, 0]);
    }

    #[test]
    fn out_of_range_index_is_a_data_error() {
        assert!(matches!(dataset(2).batch(&[2]), Err(TrainError::Data(_))));
    }
}
