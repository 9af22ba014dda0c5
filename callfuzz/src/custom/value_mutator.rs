use slog::{Logger, o, trace};

use crate::constants::{MAX_DUPLICATED_LEN, MAX_MUTATION_DEPTH};
use crate::generator::Generator;
use crate::havoc::{mutate_bytes, mutate_float, mutate_int, mutate_text};
use crate::value::{MutationFailure, ObjectValue, Value, dedup};

/// Mutates a value into another value of the same kind.
pub fn mutate_auto(rng: &mut Generator, value: &Value) -> Value {
    ValueMutator::new(rng).mutate(value)
}

/// Type-directed recursive mutator over [`Value`].
///
/// Each branch consumes generator draws in a fixed order, so the result is a
/// pure function of the input value and the generator state. Recursion stops at
/// [`MAX_MUTATION_DEPTH`]; deeper values come back unchanged without drawing.
pub struct ValueMutator<'a> {
    rng: &'a mut Generator,
    logger: Logger,
    failures: usize,
}

impl<'a> ValueMutator<'a> {
    pub fn new(rng: &'a mut Generator) -> Self {
        Self {
            rng,
            logger: Logger::root(slog::Discard, o!()),
            failures: 0,
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Number of object mutations that failed and were rolled back.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn mutate(&mut self, value: &Value) -> Value {
        self.mutate_value(value, 0)
    }

    fn mutate_value(&mut self, val: &Value, depth: usize) -> Value {
        if depth > MAX_MUTATION_DEPTH {
            return val.clone();
        }

        match val {
            Value::Bool(b) => Value::Bool(!*b),
            Value::Int(i) => Value::Int(mutate_int(self.rng, *i)),
            Value::Float(f) => Value::Float(mutate_float(self.rng, *f)),
            Value::Complex { re, im } => {
                let re = mutate_float(self.rng, *re);
                let im = mutate_float(self.rng, *im);
                Value::Complex { re, im }
            }
            Value::Text(s) => Value::Text(mutate_text(self.rng, s)),
            Value::Bytes(b) => Value::Bytes(mutate_bytes(self.rng, b)),
            Value::List(items) => Value::List(self.mutate_list(items, depth)),
            Value::Tuple(items) => Value::Tuple(self.mutate_list(items, depth)),
            Value::Set(members) => Value::Set(self.mutate_set(members, depth)),
            Value::FrozenSet(members) => Value::FrozenSet(self.mutate_set(members, depth)),
            Value::Map(entries) => Value::Map(self.mutate_map(entries, depth)),
            Value::Object(object) => match self.try_mutate_object(object, depth) {
                Ok(mutated) => mutated,
                Err(failure) => {
                    self.failures += 1;
                    trace!(self.logger, "object left unchanged";
                        "type" => object.as_object().type_name(), "reason" => %failure);
                    val.clone()
                }
            },
            Value::None | Value::Unsupported(_) => val.clone(),
        }
    }

    fn mutate_list(&mut self, items: &[Value], depth: usize) -> Vec<Value> {
        match self.rng.below(4) {
            0 => self.list_duplicate(items),
            1 => self.list_mutate_one(items, depth),
            2 => self.list_append_mutated(items, depth),
            _ => self.list_clip(items),
        }
    }

    /// Repeats the whole sequence 2 to 9 times, truncated to [`MAX_DUPLICATED_LEN`].
    fn list_duplicate(&mut self, items: &[Value]) -> Vec<Value> {
        let times = 2 + self.rng.below_usize(8);
        items
            .iter()
            .cycle()
            .take((items.len() * times).min(MAX_DUPLICATED_LEN))
            .cloned()
            .collect()
    }

    fn list_mutate_one(&mut self, items: &[Value], depth: usize) -> Vec<Value> {
        if items.is_empty() {
            return Vec::new();
        }
        let idx = self.rng.below_usize(items.len());
        let mut out = items.to_vec();
        out[idx] = self.mutate_value(&items[idx], depth + 1);
        out
    }

    fn list_append_mutated(&mut self, items: &[Value], depth: usize) -> Vec<Value> {
        if items.is_empty() {
            return Vec::new();
        }
        let idx = self.rng.below_usize(items.len());
        let extra = self.mutate_value(&items[idx], depth + 1);
        let mut out = items.to_vec();
        out.push(extra);
        out
    }

    /// Returns `items[begin..end]` for two distinct random bounds.
    fn list_clip(&mut self, items: &[Value]) -> Vec<Value> {
        let len = items.len();
        if len <= 1 {
            return items.to_vec();
        }
        let mut begin = self.rng.below_usize(len);
        let mut end = self.rng.below_usize(len);
        while begin == end {
            end = self.rng.below_usize(len);
        }
        if begin > end {
            std::mem::swap(&mut begin, &mut end);
        }
        items[begin..end].to_vec()
    }

    fn mutate_set(&mut self, members: &[Value], depth: usize) -> Vec<Value> {
        let projected = match self.rng.below(2) {
            0 => self.list_mutate_one(members, depth),
            _ => self.list_append_mutated(members, depth),
        };
        dedup(projected)
    }

    fn mutate_map(&mut self, entries: &[(Value, Value)], depth: usize) -> Vec<(Value, Value)> {
        if entries.is_empty() {
            return Vec::new();
        }
        let idx = self.rng.below_usize(entries.len());
        let mut out = entries.to_vec();
        out[idx].1 = self.mutate_value(&entries[idx].1, depth + 1);
        out
    }

    /// Replaces one field of a copy of the object. Any failure leaves the
    /// original untouched; the caller decides what to do with the error.
    fn try_mutate_object(
        &mut self,
        object: &ObjectValue,
        depth: usize,
    ) -> Result<Value, MutationFailure> {
        let fields = object.as_object().list_fields();
        if fields.is_empty() {
            return Ok(Value::Object(object.clone()));
        }
        let name = &fields[self.rng.below_usize(fields.len())];
        let current = object.as_object().get_field(name)?;
        let replacement = self.mutate_value(&current, depth + 1);

        let mut copy = object.clone();
        copy.as_object_mut().set_field(name, replacement)?;
        Ok(Value::Object(copy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Object, Record};

    fn nested(depth: usize) -> Value {
        let mut value = Value::Int(7);
        for _ in 0..depth {
            value = Value::List(vec![value]);
        }
        value
    }

    #[test]
    fn kinds_are_preserved() {
        let samples = vec![
            Value::Bool(true),
            Value::Int(3),
            Value::Float(2.5),
            Value::Complex { re: 1.0, im: -1.0 },
            Value::Text("abc".into()),
            Value::Bytes(vec![1, 2, 3]),
            Value::List(vec![1.into(), 2.into()]),
            Value::Tuple(vec![1.into(), "x".into()]),
            Value::set_from(vec![1.into(), 2.into()]),
            Value::frozen_set_from(vec![1.into()]),
            Value::Map(vec![("k".into(), 1.into())]),
            Value::object(Record::new("R").with_field("a", 1)),
            Value::None,
            Value::Unsupported("<socket>".into()),
        ];
        let mut rng = Generator::new(11);
        for _ in 0..50 {
            for sample in &samples {
                assert_eq!(mutate_auto(&mut rng, sample).kind(), sample.kind());
            }
        }
    }

    #[test]
    fn booleans_are_negated_without_drawing() {
        let mut rng = Generator::new(5);
        assert_eq!(mutate_auto(&mut rng, &Value::Bool(false)), Value::Bool(true));
        assert_eq!(rng.state(), 5);
    }

    #[test]
    fn unrecognized_values_pass_through() {
        let mut rng = Generator::new(5);
        let value = Value::Unsupported("<module>".into());
        assert_eq!(mutate_auto(&mut rng, &value), value);
        assert_eq!(mutate_auto(&mut rng, &Value::None), Value::None);
    }

    #[test]
    fn empty_containers_stay_empty() {
        let mut rng = Generator::new(8);
        for _ in 0..20 {
            assert_eq!(mutate_auto(&mut rng, &Value::Map(vec![])), Value::Map(vec![]));
            assert_eq!(mutate_auto(&mut rng, &Value::List(vec![])), Value::List(vec![]));
        }
    }

    #[test]
    fn sets_stay_duplicate_free() {
        let set = Value::set_from(vec![1.into(), 2.into(), 3.into()]);
        let mut rng = Generator::new(77);
        for _ in 0..200 {
            if let Value::Set(members) = mutate_auto(&mut rng, &set) {
                assert_eq!(dedup(members.clone()), members);
            } else {
                panic!("set changed kind");
            }
        }
    }

    #[test]
    fn clipped_lists_are_non_empty_sub_slices() {
        let items: Vec<Value> = (0..10).map(Value::from).collect();
        let mut rng = Generator::new(3);
        let mut mutator = ValueMutator::new(&mut rng);
        for _ in 0..100 {
            let clipped = mutator.list_clip(&items);
            assert!(!clipped.is_empty() && clipped.len() < items.len());
            let start = items.iter().position(|v| *v == clipped[0]).unwrap();
            assert_eq!(&items[start..start + clipped.len()], clipped.as_slice());
        }
    }

    #[test]
    fn duplication_is_capped() {
        let items: Vec<Value> = vec![Value::Int(0); 60_000];
        let mut rng = Generator::new(1);
        let mut mutator = ValueMutator::new(&mut rng);
        let out = mutator.list_duplicate(&items);
        assert_eq!(out.len(), MAX_DUPLICATED_LEN);
    }

    #[test]
    fn depth_guard_stops_recursion() {
        let deep = nested(MAX_MUTATION_DEPTH + 50);
        let mut rng = Generator::new(21);
        for _ in 0..20 {
            let _ = mutate_auto(&mut rng, &deep);
        }
    }

    struct Sealed;

    impl Object for Sealed {
        fn type_name(&self) -> &str {
            "Sealed"
        }

        fn list_fields(&self) -> Vec<String> {
            vec!["secret".to_string()]
        }

        fn get_field(&self, _name: &str) -> Result<Value, MutationFailure> {
            Ok(Value::Int(1))
        }

        fn set_field(&mut self, name: &str, _value: Value) -> Result<(), MutationFailure> {
            Err(MutationFailure::ReadOnly(name.to_string()))
        }

        fn clone_object(&self) -> Box<dyn Object> {
            Box::new(Sealed)
        }
    }

    #[test]
    fn failed_object_mutation_leaves_the_object_unchanged() {
        let value = Value::object(Sealed);
        let mut rng = Generator::new(9);
        let mut mutator = ValueMutator::new(&mut rng);
        let out = mutator.mutate(&value);
        assert_eq!(out, value);
        assert_eq!(mutator.failures(), 1);
    }

    #[test]
    fn object_fields_are_mutated_through_the_capability() {
        let value = Value::object(Record::new("Cfg").with_field("name", "abc"));
        let mut rng = Generator::new(4);
        let changed = (0..50)
            .filter(|_| mutate_auto(&mut rng, &value) != value)
            .count();
        assert!(changed > 25);
    }
}
