//! The logic-kernel seam.
//!
//! The kernel is the single source of truth for derived eligibility. The core
//! never reads it from module scope; every component receives an
//! `Arc<dyn Kernel>` and issues the narrow read-only queries listed in the
//! external-interface contract. Implementing the kernel's logic language is
//! out of scope; [`memory::MemoryKernel`] provides an in-memory backend whose
//! derivations are coded directly in Rust.

pub mod memory;

use crate::errors::KernelError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use memory::MemoryKernel;

/// A single argument of a fact tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Term {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Term {
    /// The string payload, if this term is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer payload, if this term is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Str(s) => write!(f, "{s}"),
            Term::Int(i) => write!(f, "{i}"),
            Term::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        Term::Str(s.to_string())
    }
}

impl From<String> for Term {
    fn from(s: String) -> Self {
        Term::Str(s)
    }
}

impl From<i64> for Term {
    fn from(i: i64) -> Self {
        Term::Int(i)
    }
}

impl From<u32> for Term {
    fn from(i: u32) -> Self {
        Term::Int(i as i64)
    }
}

impl From<u64> for Term {
    fn from(i: u64) -> Self {
        Term::Int(i as i64)
    }
}

impl From<usize> for Term {
    fn from(i: usize) -> Self {
        Term::Int(i as i64)
    }
}

impl From<f64> for Term {
    fn from(x: f64) -> Self {
        Term::Float(x)
    }
}

/// A typed tuple keyed by predicate name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub predicate: String,
    pub args: Vec<Term>,
}

impl Fact {
    pub fn new(predicate: &str, args: Vec<Term>) -> Self {
        Self {
            predicate: predicate.to_string(),
            args,
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

/// Build a fact tersely: `fact!("campaign_task", c, p, t, "pending")`.
#[macro_export]
macro_rules! fact {
    ($pred:expr $(, $arg:expr)* $(,)?) => {
        $crate::kernel::Fact::new($pred, vec![$($crate::kernel::Term::from($arg)),*])
    };
}

/// A query argument: either bound to a term or a wildcard.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Any,
    Eq(Term),
}

impl Pattern {
    pub fn matches(&self, term: &Term) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Eq(t) => t == term,
        }
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern::Eq(Term::from(s))
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::Eq(Term::from(s))
    }
}

impl From<i64> for Pattern {
    fn from(i: i64) -> Self {
        Pattern::Eq(Term::from(i))
    }
}

/// The narrow contract the core uses against the kernel.
///
/// The kernel is assumed thread-safe; the trait is synchronous and called
/// from async code directly. A batch assert is atomic: either all tuples are
/// visible to the next query or none are.
pub trait Kernel: Send + Sync {
    /// Assert a batch of facts atomically.
    fn assert_facts(&self, facts: &[Fact]) -> Result<(), KernelError>;

    /// Retract every fact of `predicate` whose leading arguments equal
    /// `prefix`. Returns the number of tuples removed.
    fn retract(&self, predicate: &str, prefix: &[Term]) -> Result<usize, KernelError>;

    /// Query a predicate (stored or derived) with positional patterns.
    /// A shorter pattern list leaves trailing arguments unconstrained.
    fn query(&self, predicate: &str, pattern: &[Pattern]) -> Result<Vec<Fact>, KernelError>;
}

/// Convenience extension methods shared by all kernel backends.
pub trait KernelExt: Kernel {
    /// Retract-then-assert for the same primary key, the only sanctioned way
    /// to mutate an existing tuple.
    fn replace(&self, predicate: &str, key: &[Term], facts: &[Fact]) -> Result<(), KernelError> {
        self.retract(predicate, key)?;
        self.assert_facts(facts)
    }

    /// First result of a query, if any.
    fn query_one(&self, predicate: &str, pattern: &[Pattern]) -> Result<Option<Fact>, KernelError> {
        Ok(self.query(predicate, pattern)?.into_iter().next())
    }

    /// Whether a query has at least one solution.
    fn holds(&self, predicate: &str, pattern: &[Pattern]) -> Result<bool, KernelError> {
        Ok(!self.query(predicate, pattern)?.is_empty())
    }
}

impl<K: Kernel + ?Sized> KernelExt for K {}
