use std::collections::HashMap;
use std::hash::Hash;

fn update_ewma(current: f64, new_value: f64, alpha: f64) -> f64 {
    current * (1.0 - alpha) + new_value * alpha
}

/// Scalar exponential moving average. The first sample is taken as is.
#[derive(Debug, Clone)]
pub struct ScalarEma {
    alpha: f64,
    value: Option<f64>,
}

impl ScalarEma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(current) => update_ewma(current, sample, self.alpha),
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Per-key exponential moving average over fixed-width samples.
///
/// State lives for the owner's lifetime; keys that stop appearing keep their
/// last accumulator and resume from it when they reappear.
#[derive(Debug, Clone)]
pub struct KeyedEma<K, const N: usize> {
    alpha: f64,
    state: HashMap<K, [f64; N]>,
}

impl<K: Eq + Hash, const N: usize> KeyedEma<K, N> {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            state: HashMap::new(),
        }
    }

    pub fn update(&mut self, key: K, sample: [f64; N]) -> [f64; N] {
        let alpha = self.alpha;
        let entry = self.state.entry(key).or_insert(sample);
        for (current, new_value) in entry.iter_mut().zip(sample) {
            *current = update_ewma(*current, new_value, alpha);
        }
        *entry
    }

    pub fn get(&self, key: &K) -> Option<&[f64; N]> {
        self.state.get(key)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}
