use crate::custom::value_mutator::mutate_auto;
use crate::generator::Generator;
use crate::invocation::{ArityMismatch, Invocation};
use crate::value::Value;

/// Mutates between 1 and `n` distinct positions of a parameter list.
///
/// A list with at most one value is returned unchanged and no draws are made.
/// Otherwise `k = below(n) + 1` positions are drawn without replacement and
/// each is mutated in the order it was drawn.
pub fn mutate_param_list(rng: &mut Generator, params: &[Value]) -> Vec<Value> {
    let n = params.len();
    let mut out = params.to_vec();
    if n <= 1 {
        return out;
    }

    let k = rng.below_usize(n) + 1;
    let mut picked = Vec::with_capacity(k);
    while picked.len() < k {
        let pos = rng.below_usize(n);
        if !picked.contains(&pos) {
            picked.push(pos);
        }
    }
    for pos in picked {
        out[pos] = mutate_auto(rng, &params[pos]);
    }
    out
}

/// Flattens the invocation, mutates its parameter list and puts it back together.
pub fn mutate_invocation(
    rng: &mut Generator,
    invocation: &Invocation,
) -> Result<Invocation, ArityMismatch> {
    let params = mutate_param_list(rng, &invocation.param_list());
    invocation.with_params(params)
}

/// Triage variant: walks the positions in order and for each one yields
/// `per_position` chained single-position mutations, everything else fixed.
///
/// An empty list yields itself once.
pub fn mutate_param_list_deterministic<'a>(
    rng: &'a mut Generator,
    params: &'a [Value],
    per_position: usize,
) -> DeterministicMutations<'a> {
    DeterministicMutations {
        rng,
        params,
        per_position,
        position: 0,
        step: 0,
        current: params.to_vec(),
        emitted_empty: false,
    }
}

pub struct DeterministicMutations<'a> {
    rng: &'a mut Generator,
    params: &'a [Value],
    per_position: usize,
    position: usize,
    step: usize,
    current: Vec<Value>,
    emitted_empty: bool,
}

impl Iterator for DeterministicMutations<'_> {
    type Item = Vec<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.params.is_empty() {
            if self.emitted_empty {
                return None;
            }
            self.emitted_empty = true;
            return Some(Vec::new());
        }

        while self.step >= self.per_position {
            self.position += 1;
            self.step = 0;
            if self.position >= self.params.len() {
                return None;
            }
            self.current = self.params.to_vec();
        }
        if self.position >= self.params.len() {
            return None;
        }

        let pos = self.position;
        self.current[pos] = mutate_auto(self.rng, &self.current[pos]);
        self.step += 1;
        Some(self.current.clone())
    }
}
