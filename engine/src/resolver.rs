//! Conflict Resolver - a registry of merge strategies.
//!
//! Strategies are registered with a [`Applies`] predicate. The first rule
//! whose predicate matches a conflicting value picks the strategy; when no
//! rule matches, last-write-wins decides. Whole-record conflicts between two
//! objects are merged field by field, so only fields changed on both sides
//! ever reach a strategy.

use crate::{
    conflict::{ConflictRecord, ResolutionKind},
    error::Result,
    Error, Timestamp,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::warn;

/// The values a strategy merges.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    /// Field being merged; `None` for a whole value
    pub field: Option<&'a str>,
    pub local: &'a Value,
    pub remote: &'a Value,
    pub base: Option<&'a Value>,
    pub local_timestamp: Timestamp,
    pub remote_timestamp: Timestamp,
    resolver: &'a ConflictResolver,
}

impl<'a> MergeInput<'a> {
    /// Same timestamps and registry, different values.
    fn nested<'b>(
        &self,
        field: &'b str,
        local: &'b Value,
        remote: &'b Value,
        base: Option<&'b Value>,
    ) -> MergeInput<'b>
    where
        'a: 'b,
    {
        MergeInput {
            field: Some(field),
            local,
            remote,
            base,
            local_timestamp: self.local_timestamp,
            remote_timestamp: self.remote_timestamp,
            resolver: self.resolver,
        }
    }
}

/// A merge strategy.
pub trait MergeStrategy: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Produce the merged value, or an error if the inputs do not suit
    /// this strategy.
    fn merge(&self, input: &MergeInput<'_>) -> Result<Value>;
}

fn unsuitable(strategy: &str, reason: &str) -> Error {
    Error::Strategy {
        strategy: strategy.to_string(),
        reason: reason.to_string(),
    }
}

/// Later timestamp wins; ties go to the remote.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl LastWriteWins {
    pub const NAME: &'static str = "last-write-wins";

    fn pick(input: &MergeInput<'_>) -> Value {
        if input.local_timestamp > input.remote_timestamp {
            input.local.clone()
        } else {
            input.remote.clone()
        }
    }
}

impl MergeStrategy for LastWriteWins {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn merge(&self, input: &MergeInput<'_>) -> Result<Value> {
        Ok(Self::pick(input))
    }
}

/// Line-based three-way merge of two strings against their base.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextMerge;

impl TextMerge {
    pub const NAME: &'static str = "text-merge";
}

/// Conflict markers wrapping both sides.
pub fn conflict_markers(local: &str, remote: &str) -> String {
    format!("<<<<<<< LOCAL\n{local}\n=======\n{remote}\n>>>>>>> REMOTE")
}

impl MergeStrategy for TextMerge {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn merge(&self, input: &MergeInput<'_>) -> Result<Value> {
        let (Some(local), Some(remote)) = (input.local.as_str(), input.remote.as_str()) else {
            return Err(unsuitable(Self::NAME, "both sides must be strings"));
        };
        let base = input.base.and_then(Value::as_str).unwrap_or("");
        let merged = merge3(base, local, remote).unwrap_or_else(|| conflict_markers(local, remote));
        Ok(Value::String(merged))
    }
}

/// Set union of two arrays, local order first, duplicates removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayUnion;

impl ArrayUnion {
    pub const NAME: &'static str = "array-union";
}

fn union(local: &[Value], remote: &[Value]) -> Value {
    let mut out: Vec<Value> = Vec::with_capacity(local.len() + remote.len());
    for item in local.iter().chain(remote) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    Value::Array(out)
}

impl MergeStrategy for ArrayUnion {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn merge(&self, input: &MergeInput<'_>) -> Result<Value> {
        match (input.local.as_array(), input.remote.as_array()) {
            (Some(l), Some(r)) => Ok(union(l, r)),
            _ => Err(unsuitable(Self::NAME, "both sides must be arrays")),
        }
    }
}

/// The larger of two numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericMax;

impl NumericMax {
    pub const NAME: &'static str = "numeric-max";
}

impl MergeStrategy for NumericMax {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn merge(&self, input: &MergeInput<'_>) -> Result<Value> {
        match (input.local.as_f64(), input.remote.as_f64()) {
            (Some(l), Some(r)) if l > r => Ok(input.local.clone()),
            (Some(_), Some(_)) => Ok(input.remote.clone()),
            _ => Err(unsuitable(Self::NAME, "both sides must be numbers")),
        }
    }
}

/// Recursive object merge: nested objects recurse, any other remote value
/// overwrites the local one. Arrays are replaced by the remote side unless
/// the key has an [`ArrayUnion`] rule registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepMerge;

impl DeepMerge {
    pub const NAME: &'static str = "deep-merge";

    fn merge_objects(input: &MergeInput<'_>, local: &Map<String, Value>, remote: &Map<String, Value>) -> Map<String, Value> {
        let mut out = local.clone();
        for (key, rv) in remote {
            let merged = match (local.get(key), rv) {
                (Some(Value::Object(lo)), Value::Object(ro)) => Value::Object(Self::merge_objects(input, lo, ro)),
                (Some(Value::Array(la)), Value::Array(ra)) if input.resolver.unions_arrays(key) => union(la, ra),
                _ => rv.clone(),
            };
            out.insert(key.clone(), merged);
        }
        out
    }
}

impl MergeStrategy for DeepMerge {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn merge(&self, input: &MergeInput<'_>) -> Result<Value> {
        match (input.local.as_object(), input.remote.as_object()) {
            (Some(l), Some(r)) => Ok(Value::Object(Self::merge_objects(input, l, r))),
            _ => Err(unsuitable(Self::NAME, "both sides must be objects")),
        }
    }
}

/// JSON value kinds a rule can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Number,
    Bool,
    Array,
    Object,
}

impl ValueKind {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) => Some(ValueKind::String),
            Value::Number(_) => Some(ValueKind::Number),
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Array(_) => Some(ValueKind::Array),
            Value::Object(_) => Some(ValueKind::Object),
            Value::Null => None,
        }
    }
}

/// When a registered strategy applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applies {
    /// The conflicting field has this name
    Field(String),
    /// Both sides are of this kind
    Kind(ValueKind),
}

impl Applies {
    fn matches(&self, input: &MergeInput<'_>) -> bool {
        match self {
            Applies::Field(name) => input.field == Some(name.as_str()),
            Applies::Kind(kind) => {
                ValueKind::of(input.local) == Some(*kind) && ValueKind::of(input.remote) == Some(*kind)
            }
        }
    }
}

/// A value proposed for a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub kind: ResolutionKind,
    pub strategy_name: String,
}

/// Registry of merge strategies.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    rules: Vec<(Applies, Arc<dyn MergeStrategy>)>,
}

impl ConflictResolver {
    /// An empty registry: every conflict falls through to last-write-wins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Text merge for strings and deep merge for objects.
    pub fn standard() -> Self {
        Self::new()
            .with(Applies::Kind(ValueKind::String), TextMerge)
            .with(Applies::Kind(ValueKind::Object), DeepMerge)
    }

    /// Register a strategy. Rules are tried in registration order.
    pub fn register(&mut self, applies: Applies, strategy: impl MergeStrategy + 'static) -> &mut Self {
        self.rules.push((applies, Arc::new(strategy)));
        self
    }

    pub fn with(mut self, applies: Applies, strategy: impl MergeStrategy + 'static) -> Self {
        self.register(applies, strategy);
        self
    }

    fn unions_arrays(&self, field: &str) -> bool {
        self.rules.iter().any(|(applies, strategy)| {
            matches!(applies, Applies::Field(f) if f == field) && strategy.name() == ArrayUnion::NAME
        })
    }

    fn strategy_for(&self, input: &MergeInput<'_>) -> Option<&dyn MergeStrategy> {
        self.rules
            .iter()
            .find(|(applies, _)| applies.matches(input))
            .map(|(_, strategy)| strategy.as_ref())
    }

    /// Merge one value with the matching strategy. A failing strategy
    /// degrades to conflict markers for strings and last-write-wins
    /// otherwise.
    fn merge_value(&self, input: &MergeInput<'_>) -> (Value, String) {
        let Some(strategy) = self.strategy_for(input) else {
            return (LastWriteWins::pick(input), LastWriteWins::NAME.to_string());
        };
        match strategy.merge(input) {
            Ok(value) => (value, strategy.name().to_string()),
            Err(err) => {
                warn!(strategy = strategy.name(), field = ?input.field, error = %err, "merge strategy failed, falling back");
                match (input.local.as_str(), input.remote.as_str()) {
                    (Some(l), Some(r)) => (Value::String(conflict_markers(l, r)), "conflict-markers".to_string()),
                    _ => (LastWriteWins::pick(input), LastWriteWins::NAME.to_string()),
                }
            }
        }
    }

    /// Field-by-field merge of two objects against their base.
    fn merge_fields(&self, input: &MergeInput<'_>, local: &Map<String, Value>, remote: &Map<String, Value>) -> (Value, String) {
        let base = input.base.and_then(Value::as_object);
        let keys: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
        let mut out = Map::new();
        let mut used: BTreeSet<String> = BTreeSet::new();

        for key in keys {
            let l = local.get(key);
            let r = remote.get(key);
            let b = base.and_then(|b| b.get(key));
            let chosen = if l == r || r == b {
                l.cloned()
            } else if l == b {
                r.cloned()
            } else {
                let nested = input.nested(key, l.unwrap_or(&Value::Null), r.unwrap_or(&Value::Null), b);
                let (value, name) = self.merge_value(&nested);
                used.insert(name);
                // a field removed on one side stays removed if that side won
                if value.is_null() && (l.is_none() || r.is_none()) {
                    None
                } else {
                    Some(value)
                }
            };
            if let Some(value) = chosen {
                out.insert(key.clone(), value);
            }
        }

        let name = match used.len() {
            1 => used.into_iter().next().unwrap_or_default(),
            _ => "field-merge".to_string(),
        };
        (Value::Object(out), name)
    }

    /// Resolve a conflict. Never fails: every conflict gets a value.
    pub fn resolve(&self, conflict: &ConflictRecord) -> Resolved {
        let input = MergeInput {
            field: conflict.field.as_deref(),
            local: &conflict.local_value,
            remote: &conflict.remote_value,
            base: conflict.base_value.as_ref(),
            local_timestamp: conflict.local_timestamp,
            remote_timestamp: conflict.remote_timestamp,
            resolver: self,
        };
        let (value, strategy_name) = match (input.local, input.remote) {
            (Value::Object(l), Value::Object(r)) => self.merge_fields(&MergeInput { field: None, ..input }, l, r),
            _ => self.merge_value(&input),
        };
        let kind = if value == conflict.local_value {
            ResolutionKind::Local
        } else if value == conflict.remote_value {
            ResolutionKind::Remote
        } else {
            ResolutionKind::Merge
        };
        Resolved {
            value,
            kind,
            strategy_name,
        }
    }
}

// ── Three-way text merge ──

/// Longest text, in lines, that [`merge3`] will diff. The diff table grows
/// with the product of the line counts.
pub const MAX_MERGE_LINES: usize = 2_000;

/// Pairs `(i, j)` of a longest common subsequence of `a` and `b`.
fn lcs_pairs(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let (mut i, mut j) = (0, 0);
    let mut pairs = Vec::new();
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

/// Line-based diff3. `None` when both sides changed the same region
/// differently, or when a side that changed is longer than
/// [`MAX_MERGE_LINES`].
pub fn merge3(base: &str, local: &str, remote: &str) -> Option<String> {
    if local == base {
        return Some(remote.to_string());
    }
    if remote == base || local == remote {
        return Some(local.to_string());
    }
    let b: Vec<&str> = base.split('\n').collect();
    let l: Vec<&str> = local.split('\n').collect();
    let r: Vec<&str> = remote.split('\n').collect();
    if [b.len(), l.len(), r.len()].into_iter().any(|n| n > MAX_MERGE_LINES) {
        return None;
    }

    let mut to_local = vec![None; b.len()];
    for (i, j) in lcs_pairs(&b, &l) {
        to_local[i] = Some(j);
    }
    let mut to_remote = vec![None; b.len()];
    for (i, j) in lcs_pairs(&b, &r) {
        to_remote[i] = Some(j);
    }

    let mut out: Vec<&str> = Vec::new();
    let (mut ib, mut il, mut ir) = (0, 0, 0);
    loop {
        let stable = (ib..b.len()).find_map(|k| match (to_local[k], to_remote[k]) {
            (Some(lk), Some(rk)) => Some((k, lk, rk)),
            _ => None,
        });
        let (kb, kl, kr) = stable.unwrap_or((b.len(), l.len(), r.len()));

        let (cb, cl, cr) = (&b[ib..kb], &l[il..kl], &r[ir..kr]);
        if cl == cb {
            out.extend_from_slice(cr);
        } else if cr == cb || cl == cr {
            out.extend_from_slice(cl);
        } else {
            return None;
        }

        if stable.is_none() {
            break;
        }
        out.push(b[kb]);
        ib = kb + 1;
        il = kl + 1;
        ir = kr + 1;
    }
    Some(out.join("\n"))
}
