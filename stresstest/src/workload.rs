use std::io::{self, Read};
use std::thread::available_parallelism;

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, LogNormal, Zipf};

const MUTATION_LEN: usize = 4096;

pub struct WorkloadBuilder {
    name: &'static str,
    concurrency: usize,
    seed: u64,

    p50_size: u64,
    p99_size: u64,
    files_per_backup: usize,
    mutation_rate: f64,

    new_weight: u8,
    incremental_weight: u8,
}

impl WorkloadBuilder {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.p50_size = p50;
        self.p99_size = p99;
        self
    }

    pub fn files_per_backup(mut self, files: usize) -> Self {
        self.files_per_backup = files;
        self
    }

    /// Chance that a file changes between two generations of a dataset.
    pub fn mutation_rate(mut self, rate: f64) -> Self {
        self.mutation_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn action_weights(mut self, new_backups: u8, incremental_backups: u8) -> Self {
        self.new_weight = new_backups;
        self.incremental_weight = incremental_backups;
        self
    }

    pub fn build(self) -> anyhow::Result<Workload> {
        let rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_size as f64;
        let p99 = self.p99_size as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;

        let size_distribution = LogNormal::new(mu, sigma)?;
        let action_distribution = WeightedIndex::new([self.new_weight, self.incremental_weight])?;

        Ok(Workload {
            name: self.name,
            concurrency: self.concurrency,
            p50_size: self.p50_size,
            p99_size: self.p99_size,
            files_per_backup: self.files_per_backup,
            mutation_rate: self.mutation_rate,

            rng,
            size_distribution,
            action_distribution,

            datasets: Default::default(),
        })
    }
}

pub struct Workload {
    pub name: &'static str,
    pub concurrency: usize,
    pub p50_size: u64,
    pub p99_size: u64,
    pub files_per_backup: usize,
    pub mutation_rate: f64,

    /// The RNG driving all our distributions.
    rng: SmallRng,
    /// Sizes of the files in a dataset.
    size_distribution: LogNormal<f64>,
    /// Picks between backing up a new dataset and a new generation of an old one.
    action_distribution: WeightedIndex<u8>,

    /// Datasets backed up so far, ready for another generation.
    datasets: Vec<Dataset>,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            concurrency: available_parallelism().map(|n| n.get()).unwrap_or(4),
            seed: rand::random(),

            p50_size: 16 * 1024,
            p99_size: 1024 * 1024,
            files_per_backup: 16,
            mutation_rate: 0.1,

            new_weight: 20,
            incremental_weight: 80,
        }
    }

    fn get_payload(&self, seed: u64) -> Payload {
        let mut rng = SmallRng::seed_from_u64(seed);
        let len = self.size_distribution.sample(&mut rng) as u64;

        Payload { len, rng }
    }

    /// Takes a previous dataset out, favouring recent ones.
    fn sample_previous(&mut self) -> Option<Dataset> {
        if self.datasets.is_empty() {
            return None;
        }
        let len = self.datasets.len();
        let zipf = Zipf::new(len as f64, 2.0).ok()?;
        let idx = len - self.rng.sample(zipf) as usize;

        Some(self.datasets.remove(idx))
    }

    pub fn next_action(&mut self) -> Action {
        if self.action_distribution.sample(&mut self.rng) == 1 {
            if let Some(previous) = self.sample_previous() {
                return Action::Incremental(Dataset {
                    seed: previous.seed,
                    generation: previous.generation + 1,
                });
            }
        }
        Action::New(Dataset {
            seed: self.rng.next_u64(),
            generation: 0,
        })
    }

    /// The files of `dataset`. Every generation mutates some of the files of
    /// the one before it, the same way each time.
    pub fn render(&self, dataset: &Dataset) -> io::Result<Vec<(String, Vec<u8>)>> {
        (0..self.files_per_backup)
            .map(|file| {
                let file_seed = dataset.seed ^ (file as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                let mut data = Vec::new();
                self.get_payload(file_seed).read_to_end(&mut data)?;

                for generation in 1..=dataset.generation {
                    let mut rng = SmallRng::seed_from_u64(file_seed ^ u64::from(generation));
                    if data.is_empty() || !rng.random_bool(self.mutation_rate) {
                        continue;
                    }
                    let start = rng.random_range(0..data.len());
                    let end = (start + MUTATION_LEN).min(data.len());
                    rng.fill_bytes(&mut data[start..end]);
                }
                Ok((format!("{:016x}/{file:04}", dataset.seed), data))
            })
            .collect()
    }

    /// Adds a dataset once its backup completed, so a later generation can be
    /// backed up.
    pub fn push_dataset(&mut self, dataset: Dataset) {
        self.datasets.push(dataset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dataset {
    pub seed: u64,
    pub generation: u32,
}

pub enum Action {
    New(Dataset),
    Incremental(Dataset),
}

impl Action {
    pub fn dataset(&self) -> Dataset {
        match self {
            Self::New(dataset) | Self::Incremental(dataset) => *dataset,
        }
    }
}

pub struct Payload {
    pub len: u64,
    pub rng: SmallRng,
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len_to_fill = (buf.len() as u64).min(self.len) as usize;

        let fill_buf = &mut buf[..len_to_fill];
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        Ok(len_to_fill)
    }
}
