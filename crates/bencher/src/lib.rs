use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// A payload size the chunk benches run against.
#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    group: TestGroup,
    len: usize,
    fill: Fill,
}

impl TestCase {
    pub const fn new(name: &'static str, group: TestGroup, len: usize, fill: Fill) -> Self {
        Self { name, group, len, fill }
    }

    pub const fn small(name: &'static str, len: usize, fill: Fill) -> Self {
        Self::new(name, TestGroup::Small, len, fill)
    }

    pub const fn normal(name: &'static str, len: usize, fill: Fill) -> Self {
        Self::new(name, TestGroup::Normal, len, fill)
    }

    pub const fn large(name: &'static str, len: usize, fill: Fill) -> Self {
        Self::new(name, TestGroup::Large, len, fill)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn group(&self) -> TestGroup {
        self.group
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Builds the payload, deterministic for a given case.
    pub fn payload(&self) -> Vec<u8> {
        match self.fill {
            Fill::Noise => {
                let mut bytes = vec![0; self.len];
                StdRng::seed_from_u64(self.len as u64).fill_bytes(&mut bytes);
                bytes
            }
            Fill::Json => {
                let record = br#"{"id":1024,"name":"widget","tags":["blue","round"],"price":12.5},"#;
                record.iter().copied().cycle().take(self.len).collect()
            }
        }
    }
}

/// What a payload looks like to the compressor.
#[derive(Clone, Copy, Debug)]
pub enum Fill {
    Noise,
    Json,
}

#[derive(Clone, Copy, Debug)]
pub enum TestGroup {
    Small,
    Normal,
    Large,
}
