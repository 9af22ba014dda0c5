use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::value::{Value, ValueKind};

/// One intercepted call: which target was invoked and with what arguments.
///
/// Positional values followed by keyword values, in declaration order, form the
/// canonical parameter list the mutators operate on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub target: String,
    pub positional: Vec<Value>,
    pub keyword: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parameter list has {found} values, invocation of `{target}` takes {expected}")]
pub struct ArityMismatch {
    pub target: String,
    pub expected: usize,
    pub found: usize,
}

impl Invocation {
    pub fn new(target: &str, positional: Vec<Value>, keyword: Vec<(String, Value)>) -> Self {
        Self {
            target: target.to_string(),
            positional,
            keyword,
        }
    }

    /// An invocation with positional arguments only.
    pub fn positional(target: &str, positional: Vec<Value>) -> Self {
        Self::new(target, positional, Vec::new())
    }

    pub fn arity(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    pub fn param_list(&self) -> Vec<Value> {
        self.positional
            .iter()
            .cloned()
            .chain(self.keyword.iter().map(|(_, v)| v.clone()))
            .collect()
    }

    /// Rebuilds an invocation of the same target from a parameter list, splitting
    /// it at the original positional count and re-attaching the keyword names.
    pub fn with_params(&self, params: Vec<Value>) -> Result<Invocation, ArityMismatch> {
        if params.len() != self.arity() {
            return Err(ArityMismatch {
                target: self.target.clone(),
                expected: self.arity(),
                found: params.len(),
            });
        }
        let mut params = params.into_iter();
        let positional = params.by_ref().take(self.positional.len()).collect();
        let keyword = self
            .keyword
            .iter()
            .map(|(name, _)| name.clone())
            .zip(params)
            .collect();
        Ok(Invocation {
            target: self.target.clone(),
            positional,
            keyword,
        })
    }

    /// The kinds of the parameter list, which must match for a replay to be valid.
    pub fn shape(&self) -> Vec<ValueKind> {
        self.positional
            .iter()
            .chain(self.keyword.iter().map(|(_, v)| v))
            .map(Value::kind)
            .collect()
    }

    /// Stable digest of the whole call, target and values, over its CBOR form.
    /// Tells apart calls that share a target and shape.
    pub fn fingerprint(&self) -> Result<u64, serde_cbor::Error> {
        Ok(libafl_bolts::hash_std(&serde_cbor::to_vec(self)?))
    }
}

/// Decides which intercepted calls get fuzzed: each target identity only on its
/// first interception, and never a blacklisted one.
#[derive(Debug, Default)]
pub struct InterceptionGate {
    seen: HashSet<String>,
    blacklist: HashSet<String>,
}

impl InterceptionGate {
    pub fn new<I: IntoIterator<Item = String>>(blacklist: I) -> Self {
        Self {
            seen: HashSet::new(),
            blacklist: blacklist.into_iter().collect(),
        }
    }

    /// Returns true when this call should be fuzzed.
    pub fn admit(&mut self, invocation: &Invocation) -> bool {
        if self.blacklist.contains(&invocation.target) {
            return false;
        }
        self.seen.insert(invocation.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Invocation {
        Invocation::new(
            "lib.f",
            vec![Value::Int(1), Value::Text("ab".into())],
            vec![("flag".to_string(), Value::Bool(true))],
        )
    }

    #[test]
    fn param_list_flattens_positional_then_keyword() {
        assert_eq!(
            sample().param_list(),
            vec![Value::Int(1), Value::Text("ab".into()), Value::Bool(true)]
        );
    }

    #[test]
    fn with_params_reassembles_keyword_names() {
        let rebuilt = sample()
            .with_params(vec![Value::Int(2), Value::Text("c".into()), Value::Bool(false)])
            .unwrap();
        assert_eq!(rebuilt.positional, vec![Value::Int(2), Value::Text("c".into())]);
        assert_eq!(rebuilt.keyword, vec![("flag".to_string(), Value::Bool(false))]);
    }

    #[test]
    fn with_params_rejects_wrong_arity() {
        let err = sample().with_params(vec![Value::Int(2)]).unwrap_err();
        assert_eq!(err.expected, 3);
        assert_eq!(err.found, 1);
    }

    #[test]
    fn fingerprint_follows_the_values() {
        let same = sample();
        let mut changed = sample();
        changed.positional[0] = Value::Int(9);
        assert_eq!(sample().fingerprint().unwrap(), same.fingerprint().unwrap());
        assert_ne!(sample().fingerprint().unwrap(), changed.fingerprint().unwrap());
    }

    #[test]
    fn gate_admits_each_target_once() {
        let mut gate = InterceptionGate::new(vec!["lib.skip".to_string()]);
        assert!(gate.admit(&sample()));
        assert!(!gate.admit(&sample()));
        assert!(!gate.admit(&Invocation::positional("lib.skip", vec![])));
    }
}
