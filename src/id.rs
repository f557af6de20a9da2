// Copyright 2020 Joyent, Inc.

//! Request identifiers and the generator for locally issued calls.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_derive::{Deserialize, Serialize};

/// A JSON-RPC request identifier: either an integer or a string.
///
/// Locally generated identifiers are always integers. Identifiers echoed
/// from a peer may take either form and are kept in tables separate from
/// the local ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(String::from(s))
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

/// Hands out request identifiers for outbound calls.
///
/// Identifiers start at 1 and increase by one per call. The counter is
/// atomic so concurrent callers never observe the same value.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator::starting_at(1)
    }

    pub fn starting_at(first: i64) -> Self {
        IdGenerator {
            next: AtomicI64::new(first),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::new()
    }
}
